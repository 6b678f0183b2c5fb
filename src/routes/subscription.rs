use mongodb::bson::{doc, DateTime};
use rocket::serde::json::Json;
use rocket::State;
use rocket_okapi::openapi;

use crate::db::DbConn;
use crate::guards::AuthGuard;
use crate::models::{Account, SubscriptionStatus};
use crate::routes::booking::{load_account, parse_object_id_field, ACCOUNTS};
use crate::utils::subscription::derive_status;
use crate::utils::{ApiError, ApiResponse};

fn status_str(status: SubscriptionStatus) -> &'static str {
    match status {
        SubscriptionStatus::Active => "active",
        SubscriptionStatus::Expired => "expired",
    }
}

#[derive(FromForm, serde::Deserialize, rocket_okapi::okapi::schemars::JsonSchema)]
pub struct SubscriptionStatusQuery {
    #[field(name = "userId")]
    pub user_id: String,
}

/// Read-only subscription check: derives the status from the expiry on record
/// without persisting anything.
#[openapi(tag = "Subscription")]
#[get("/subscription-status?<query..>")]
pub async fn get_subscription_status(
    query: SubscriptionStatusQuery,
    db: &State<DbConn>,
    _auth: AuthGuard,
) -> Result<Json<ApiResponse<serde_json::Value>>, ApiError> {
    let account_id = parse_object_id_field(&query.user_id, "userId")?;
    let account = load_account(db, account_id, "Account").await?;

    let derived = derive_status(
        account.subscription_expiry,
        account.role.is_privileged(),
        DateTime::now(),
    );

    Ok(Json(ApiResponse::success(serde_json::json!({
        "userId": account_id.to_hex(),
        "subscriptionStatus": status_str(derived),
        "storedStatus": status_str(account.subscription_status),
        "subscriptionExpiry": account
            .subscription_expiry
            .and_then(|e| e.try_to_rfc3339_string().ok()),
    }))))
}

#[derive(serde::Deserialize, rocket_okapi::okapi::schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileSubscriptionDto {
    pub user_id: Option<String>,
    pub user_ids: Option<Vec<String>>,
}

/// Reconciling subscription check: recomputes the status for each account and
/// persists it where the stored value disagrees. Only the accounts that
/// actually changed are returned.
#[openapi(tag = "Subscription")]
#[post("/subscription-status", data = "<dto>")]
pub async fn reconcile_subscription_status(
    dto: Json<ReconcileSubscriptionDto>,
    db: &State<DbConn>,
    _auth: AuthGuard,
) -> Result<Json<ApiResponse<serde_json::Value>>, ApiError> {
    let mut raw_ids = Vec::new();
    if let Some(id) = &dto.user_id {
        raw_ids.push(id.clone());
    }
    if let Some(ids) = &dto.user_ids {
        raw_ids.extend(ids.iter().cloned());
    }
    if raw_ids.is_empty() {
        return Err(ApiError::validation("userId or userIds is required"));
    }

    let now = DateTime::now();
    let mut updated = Vec::new();

    for raw in raw_ids {
        let account_id = parse_object_id_field(&raw, "userId")?;
        let account = load_account(db, account_id, "Account").await?;

        let derived = derive_status(
            account.subscription_expiry,
            account.role.is_privileged(),
            now,
        );
        if derived == account.subscription_status {
            continue;
        }

        db.collection::<Account>(ACCOUNTS)
            .update_one(
                doc! { "_id": account_id },
                doc! { "$set": {
                    "subscription_status": status_str(derived),
                    "updated_at": now
                }},
                None,
            )
            .await
            .map_err(|e| ApiError::internal_error(format!("Database error: {}", e)))?;

        updated.push(serde_json::json!({
            "userId": account_id.to_hex(),
            "subscriptionStatus": status_str(derived),
            "previousStatus": status_str(account.subscription_status),
        }));
    }

    Ok(Json(ApiResponse::success(serde_json::json!({
        "updated": updated,
        "total": updated.len()
    }))))
}
