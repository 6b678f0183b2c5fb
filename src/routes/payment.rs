use log::{error, info, warn};
use mongodb::bson::oid::ObjectId;
use mongodb::bson::{doc, DateTime};
use rocket::http::Status;
use rocket::request::{self, FromRequest, Request, Outcome};
use rocket::serde::json::Json;
use rocket::State;
use rocket_okapi::openapi;
use rocket_okapi::r#gen::OpenApiGenerator;
use rocket_okapi::request::{OpenApiFromRequest, RequestHeaderInput};

use crate::db::DbConn;
use crate::guards::AuthGuard;
use crate::models::{
    settle_precheck, Account, Booking, BookingStatus, PaymentRecord, SettleBlock,
    SubscriptionStatus,
};
use crate::routes::booking::{
    load_account, load_booking, load_listing, populate_booking, parse_object_id_field, ACCOUNTS,
    BOOKINGS,
};
use crate::services::stripe::{normalize_amount, StripeError, StripePaymentIntent, StripeService};
use crate::services::EmailService;
use crate::utils::validation::{redact_card_data, scan_for_card_data, CardDataViolation};
use crate::utils::{ApiError, ApiResponse};

/// Map a gateway failure onto the error taxonomy. Never leaks processor
/// secrets; the booking id gives the log line its context.
fn gateway_error(operation: &str, context: &str, err: StripeError) -> ApiError {
    error!("Stripe {} failed for {}: {}", operation, context, err);
    match err {
        StripeError::Timeout => ApiError::upstream_timeout("Payment processor timed out"),
        StripeError::NotConfigured => ApiError::upstream("Payment processing is not configured"),
        _ => ApiError::upstream("Payment processor request failed"),
    }
}

/// Reject any payload that could carry raw card data, logging only the
/// redacted form.
fn enforce_card_boundary(body: &serde_json::Value) -> Result<(), ApiError> {
    match scan_for_card_data(body) {
        Ok(()) => Ok(()),
        Err(violation) => {
            let redacted = redact_card_data(body);
            match &violation {
                CardDataViolation::ForbiddenField(field) => warn!(
                    "Card data boundary: forbidden field '{}' in payload {}",
                    field, redacted
                ),
                CardDataViolation::CardShapedValue => warn!(
                    "Card data boundary: card-shaped value in payload {}",
                    redacted
                ),
            }
            Err(ApiError::security_violation(
                "Request must not contain raw card data",
            ))
        }
    }
}

/* ----------------------------- payment intents ----------------------------- */

/// One-time charge intent for client-side confirmation. The body is inspected
/// as raw JSON first: card numbers and card-field keys never reach the gateway.
#[openapi(tag = "Payments")]
#[post("/payment-intents", data = "<body>")]
pub async fn create_payment_intent(
    body: Json<serde_json::Value>,
    _auth: AuthGuard,
) -> Result<Json<ApiResponse<serde_json::Value>>, ApiError> {
    enforce_card_boundary(&body)?;

    let amount = body
        .get("amount")
        .and_then(|v| v.as_f64())
        .ok_or_else(|| ApiError::validation("amount is required"))?;
    if amount < 0.0 {
        return Err(ApiError::validation("amount must not be negative"));
    }

    let currency = body
        .get("currency")
        .and_then(|v| v.as_str())
        .map(|c| c.to_lowercase())
        .unwrap_or_else(crate::config::Config::default_currency);

    let mut metadata: Vec<(&str, String)> = Vec::new();
    if let Some(map) = body.get("metadata").and_then(|v| v.as_object()) {
        for (key, value) in map {
            if let Some(value) = value.as_str() {
                metadata.push((key.as_str(), value.to_string()));
            }
        }
    }

    let amount_cents = normalize_amount(amount);
    let intent = StripeService::create_payment_intent(amount_cents, &currency, &metadata)
        .await
        .map_err(|e| gateway_error("create_payment_intent", "payment-intents", e))?;

    Ok(Json(ApiResponse::success(serde_json::json!({
        "clientSecret": intent.client_secret,
        "intentId": intent.id,
        "amount": intent.amount,
        "currency": intent.currency,
    }))))
}

/// Setup intent: lets the front end register a reusable payment method. The
/// customer is resolved from an explicit `customerId` or created for the given
/// account on first use.
#[openapi(tag = "Payments")]
#[post("/setup-intents", data = "<body>")]
pub async fn create_setup_intent(
    body: Json<serde_json::Value>,
    db: &State<DbConn>,
    _auth: AuthGuard,
) -> Result<Json<ApiResponse<serde_json::Value>>, ApiError> {
    enforce_card_boundary(&body)?;

    let customer_ref = match body.get("customerId").and_then(|v| v.as_str()) {
        Some(customer_ref) => customer_ref.to_string(),
        None => {
            let user_id = body
                .get("userId")
                .and_then(|v| v.as_str())
                .ok_or_else(|| ApiError::validation("customerId or userId is required"))?;
            let account_id = parse_object_id_field(user_id, "userId")?;
            let account = load_account(db, account_id, "Account").await?;

            let email = body
                .get("email")
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .or_else(|| account.email.clone());
            let name = body
                .get("name")
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .or_else(|| account.name.clone());

            let customer = StripeService::ensure_customer(
                account.stripe_customer_id.as_deref(),
                email.as_deref(),
                name.as_deref(),
                &account_id.to_hex(),
            )
            .await
            .map_err(|e| gateway_error("ensure_customer", &account_id.to_hex(), e))?;

            if account.stripe_customer_id.as_deref() != Some(customer.id.as_str()) {
                db.collection::<Account>(ACCOUNTS)
                    .update_one(
                        doc! { "_id": account_id },
                        doc! { "$set": {
                            "stripe_customer_id": &customer.id,
                            "updated_at": DateTime::now()
                        }},
                        None,
                    )
                    .await
                    .map_err(|e| ApiError::internal_error(format!("Database error: {}", e)))?;
            }
            customer.id
        }
    };

    let setup_intent = StripeService::create_setup_intent(&customer_ref)
        .await
        .map_err(|e| gateway_error("create_setup_intent", &customer_ref, e))?;

    Ok(Json(ApiResponse::success(serde_json::json!({
        "clientSecret": setup_intent.client_secret,
        "setupIntentId": setup_intent.id,
        "customerId": customer_ref,
    }))))
}

/* ----------------------------- settlement ----------------------------- */

#[derive(serde::Deserialize, rocket_okapi::okapi::schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ChargeSavedPaymentDto {
    pub booking_id: String,
}

/// Resolve the account whose ledger records this booking's settlement: the
/// booking's seller, or the listing's seller where the booking carries none.
async fn resolve_ledger_account(db: &DbConn, booking: &Booking) -> Result<Account, ApiError> {
    let seller_id = match booking.seller_id {
        Some(id) => id,
        None => load_listing(db, booking.listing_id).await?.seller_id,
    };
    load_account(db, seller_id, "Seller").await
}

/// Append a settlement record to an account's ledger, keyed by the charge
/// reference. A second call with the same reference matches nothing and the
/// ledger stays unchanged; entries are never overwritten.
pub async fn append_ledger_entry(
    db: &DbConn,
    account: &Account,
    entry: PaymentRecord,
) -> Result<bool, ApiError> {
    let account_id = account
        .id
        .ok_or_else(|| ApiError::internal_error("Account has no id"))?;

    let result = db
        .collection::<Account>(ACCOUNTS)
        .update_one(
            doc! {
                "_id": account_id,
                "payments.charge_ref": { "$ne": &entry.charge_ref }
            },
            doc! {
                "$push": { "payments": mongodb::bson::to_bson(&entry)
                    .map_err(|e| ApiError::internal_error(format!("Serialization error: {}", e)))? },
                "$set": { "updated_at": DateTime::now() }
            },
            None,
        )
        .await
        .map_err(|e| ApiError::internal_error(format!("Database error: {}", e)))?;

    Ok(result.modified_count > 0)
}

/// Commit a successful charge: ledger entry first (idempotent, audit trail),
/// then the booking's status and charge reference in a single document update.
async fn commit_settlement(
    db: &DbConn,
    booking: &Booking,
    intent: &StripePaymentIntent,
) -> Result<Booking, ApiError> {
    let booking_id = booking
        .id
        .ok_or_else(|| ApiError::internal_error("Booking has no id"))?;

    let ledger_account = resolve_ledger_account(db, booking).await?;
    let entry = PaymentRecord {
        charge_ref: intent.id.clone(),
        amount: intent.amount as f64 / 100.0,
        currency: intent.currency.clone(),
        status: intent.status.clone(),
        account_name: ledger_account.display_name(),
        account_email: ledger_account.email.clone().unwrap_or_default(),
        booking_id: Some(booking_id),
        recorded_at: DateTime::now(),
    };
    append_ledger_entry(db, &ledger_account, entry).await?;

    db.collection::<Booking>(BOOKINGS)
        .update_one(
            doc! { "_id": booking_id },
            doc! { "$set": {
                "status": BookingStatus::Confirmed.as_str(),
                "charge_ref": &intent.id,
                "updated_at": DateTime::now()
            }},
            None,
        )
        .await
        .map_err(|e| ApiError::internal_error(format!("Failed to confirm booking: {}", e)))?;

    load_booking(db, booking.kind, booking_id).await
}

async fn send_confirmation_email(db: &DbConn, booking: &Booking, currency: &str) {
    let Ok(buyer) = load_account(db, booking.buyer_id, "Buyer").await else {
        return;
    };
    let Some(email) = buyer.email else {
        return;
    };
    let listing_title = load_listing(db, booking.listing_id)
        .await
        .map(|l| l.title)
        .unwrap_or_else(|_| "your booking".to_string());
    let booking_id = booking.id.map(|id| id.to_hex()).unwrap_or_default();

    EmailService::send_booking_confirmation(
        &email,
        &listing_title,
        &booking_id,
        booking.total_price,
        currency,
    )
    .await;
}

/// Settle a pending booking by charging its stored payment method off-session.
///
/// Already-confirmed bookings are refused outright, and the charge itself
/// carries an idempotency key derived from the booking id, so neither a client
/// retry nor a crash-retry can charge the payer twice. Only `succeeded`
/// commits; any other processor status is returned to the caller unmodified as
/// an HTTP 200 with `success: false`.
#[openapi(tag = "Payments")]
#[post("/charge-saved-payment/<kind>", data = "<dto>")]
pub async fn charge_saved_payment(
    kind: String,
    dto: Json<ChargeSavedPaymentDto>,
    db: &State<DbConn>,
    _auth: AuthGuard,
) -> Result<Json<serde_json::Value>, ApiError> {
    let kind = crate::models::BookingKind::parse(&kind)
        .ok_or_else(|| ApiError::validation(format!("Unknown booking kind '{}'", kind)))?;
    let booking_id = parse_object_id_field(&dto.booking_id, "bookingId")?;

    let booking = load_booking(db, kind, booking_id).await?;

    let payment_method_ref = match settle_precheck(&booking) {
        Ok(pm) => pm.to_string(),
        Err(SettleBlock::AlreadyConfirmed) => {
            return Err(ApiError::invalid_state("Booking is already settled"));
        }
        Err(SettleBlock::NotPending) => {
            return Err(ApiError::invalid_state(format!(
                "Only pending bookings can be settled; this booking is {}",
                booking.status.as_str()
            )));
        }
        Err(SettleBlock::NoPaymentMethod) => {
            return Err(ApiError::invalid_state(
                "Booking has no stored payment method",
            ));
        }
    };

    let buyer = load_account(db, booking.buyer_id, "Buyer").await?;
    let customer = StripeService::ensure_customer(
        buyer.stripe_customer_id.as_deref(),
        buyer.email.as_deref(),
        buyer.name.as_deref(),
        &booking.buyer_id.to_hex(),
    )
    .await
    .map_err(|e| gateway_error("ensure_customer", &booking_id.to_hex(), e))?;

    if buyer.stripe_customer_id.as_deref() != Some(customer.id.as_str()) {
        db.collection::<Account>(ACCOUNTS)
            .update_one(
                doc! { "_id": booking.buyer_id },
                doc! { "$set": {
                    "stripe_customer_id": &customer.id,
                    "updated_at": DateTime::now()
                }},
                None,
            )
            .await
            .map_err(|e| ApiError::internal_error(format!("Database error: {}", e)))?;
    }

    let amount_cents = normalize_amount(booking.total_price);
    let currency = crate::config::Config::default_currency();
    let metadata = [
        ("booking_id", booking_id.to_hex()),
        ("booking_kind", kind.as_str().to_string()),
    ];
    let idempotency_key = format!("settle-{}", booking_id.to_hex());

    let intent = StripeService::charge_saved_method(
        &customer.id,
        &payment_method_ref,
        amount_cents,
        &currency,
        &metadata,
        &idempotency_key,
    )
    .await
    .map_err(|e| gateway_error("charge_saved_method", &booking_id.to_hex(), e))?;

    let intent_json = serde_json::json!({
        "id": intent.id,
        "status": intent.status,
        "amount": intent.amount,
        "currency": intent.currency,
        "clientSecret": intent.client_secret,
    });

    if !intent.succeeded() {
        // Not an error: the client may still complete 3-D Secure
        info!(
            "Charge for booking {} returned status '{}'",
            booking_id.to_hex(),
            intent.status
        );
        return Ok(Json(serde_json::json!({
            "success": false,
            "message": format!("Payment requires further action (status: {})", intent.status),
            "paymentIntent": intent_json,
        })));
    }

    let confirmed = commit_settlement(db, &booking, &intent).await?;
    send_confirmation_email(db, &confirmed, &currency).await;

    let populated = populate_booking(db, &confirmed).await;
    Ok(Json(serde_json::json!({
        "success": true,
        "paymentIntent": intent_json,
        "booking": populated,
    })))
}

/* ----------------------------- payment ledger ----------------------------- */

#[derive(serde::Deserialize, rocket_okapi::okapi::schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RecordPaymentDto {
    pub user_id: String,
    /// Processor charge reference; the ledger idempotency key.
    pub charge_ref: String,
    pub amount: f64,
    pub currency: Option<String>,
    pub status: Option<String>,
    pub booking_id: Option<String>,
    /// RFC 3339 timestamp.
    pub subscription_expiry: Option<String>,
    pub subscription_status: Option<String>,
}

/// Validate the optional subscription fields into a `$set` document. Must run
/// before the ledger append so a malformed field rejects the whole request
/// without persisting anything.
fn parse_subscription_update(
    expiry: Option<&str>,
    status: Option<&str>,
) -> Result<mongodb::bson::Document, ApiError> {
    let mut update = doc! {};
    if let Some(raw) = expiry {
        let expiry = chrono::DateTime::parse_from_rfc3339(raw)
            .map_err(|_| ApiError::validation("subscriptionExpiry must be RFC 3339"))?;
        update.insert(
            "subscription_expiry",
            DateTime::from_millis(expiry.timestamp_millis()),
        );
    }
    if let Some(raw) = status {
        let status = match raw.to_lowercase().as_str() {
            "active" => SubscriptionStatus::Active,
            "expired" => SubscriptionStatus::Expired,
            _ => {
                return Err(ApiError::validation(format!(
                    "Invalid subscriptionStatus '{}'",
                    raw
                )));
            }
        };
        update.insert(
            "subscription_status",
            match status {
                SubscriptionStatus::Active => "active",
                SubscriptionStatus::Expired => "expired",
            },
        );
    }
    Ok(update)
}

/// Idempotent ledger append. Re-sending a charge reference returns the
/// existing entry untouched. Accounts with an incomplete seller profile are
/// rejected instead of backfilled with placeholder values.
#[openapi(tag = "Payments")]
#[post("/payments", data = "<dto>")]
pub async fn record_payment(
    dto: Json<RecordPaymentDto>,
    db: &State<DbConn>,
    _auth: AuthGuard,
) -> Result<Json<ApiResponse<serde_json::Value>>, ApiError> {
    if dto.charge_ref.trim().is_empty() {
        return Err(ApiError::validation("chargeRef is required"));
    }
    if dto.amount < 0.0 {
        return Err(ApiError::validation("amount must not be negative"));
    }

    let account_id = parse_object_id_field(&dto.user_id, "userId")?;
    let account = load_account(db, account_id, "Account").await?;

    if account.payment_for(&dto.charge_ref).is_some() {
        // Idempotent replay: return what we already recorded
        let account = load_account(db, account_id, "Account").await?;
        return Ok(Json(ApiResponse::success_with_message(
            "Payment already recorded".to_string(),
            serde_json::to_value(crate::models::AccountResponse::from(account))
                .map_err(|e| ApiError::internal_error(format!("Serialization error: {}", e)))?,
        )));
    }

    let missing = account.missing_seller_fields();
    if !missing.is_empty() {
        return Err(ApiError::validation(format!(
            "Seller profile incomplete, missing: {}",
            missing.join(", ")
        )));
    }

    let booking_id = match &dto.booking_id {
        Some(raw) => Some(parse_object_id_field(raw, "bookingId")?),
        None => None,
    };

    // Every field must validate before the first write: a rejected request
    // must leave neither a ledger entry nor a half-applied subscription update
    let subscription_update = parse_subscription_update(
        dto.subscription_expiry.as_deref(),
        dto.subscription_status.as_deref(),
    )?;

    let entry = PaymentRecord {
        charge_ref: dto.charge_ref.clone(),
        amount: dto.amount,
        currency: dto
            .currency
            .clone()
            .unwrap_or_else(crate::config::Config::default_currency),
        status: dto.status.clone().unwrap_or_else(|| "succeeded".to_string()),
        account_name: account.display_name(),
        account_email: account.email.clone().unwrap_or_default(),
        booking_id,
        recorded_at: DateTime::now(),
    };
    append_ledger_entry(db, &account, entry).await?;

    if !subscription_update.is_empty() {
        db.collection::<Account>(ACCOUNTS)
            .update_one(
                doc! { "_id": account_id },
                doc! { "$set": subscription_update },
                None,
            )
            .await
            .map_err(|e| ApiError::internal_error(format!("Database error: {}", e)))?;
    }

    let updated = load_account(db, account_id, "Account").await?;
    Ok(Json(ApiResponse::success_with_message(
        "Payment recorded".to_string(),
        serde_json::to_value(crate::models::AccountResponse::from(updated))
            .map_err(|e| ApiError::internal_error(format!("Serialization error: {}", e)))?,
    )))
}

/* ----------------------------- webhook ----------------------------- */

/// The `Stripe-Signature` header, pulled off the request.
pub struct StripeSignature(pub String);

#[rocket::async_trait]
impl<'r> FromRequest<'r> for StripeSignature {
    type Error = ();

    async fn from_request(req: &'r Request<'_>) -> request::Outcome<Self, Self::Error> {
        match req.headers().get_one("Stripe-Signature") {
            Some(value) => Outcome::Success(StripeSignature(value.to_string())),
            None => Outcome::Error((Status::BadRequest, ())),
        }
    }
}

impl<'a> OpenApiFromRequest<'a> for StripeSignature {
    fn from_request_input(
        _gen: &mut OpenApiGenerator,
        _name: String,
        _required: bool,
    ) -> rocket_okapi::Result<RequestHeaderInput> {
        Ok(RequestHeaderInput::None)
    }
}

/// Processor webhook: the reconciliation sweep for the gap between a charge
/// succeeding and the booking being confirmed. A `payment_intent.succeeded`
/// event whose metadata names a still-pending booking commits it exactly as
/// the settle path would; everything else is acknowledged and ignored.
#[openapi(tag = "Payments")]
#[post("/stripe/webhook", data = "<payload>")]
pub async fn stripe_webhook(
    payload: String,
    signature: StripeSignature,
    db: &State<DbConn>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let secret = crate::config::Config::stripe_webhook_secret()
        .ok_or_else(|| ApiError::upstream("Webhook secret is not configured"))?;
    let tolerance = crate::config::Config::stripe_webhook_tolerance();

    StripeService::verify_webhook_signature(&payload, &signature.0, &secret, tolerance)
        .map_err(|_| ApiError::security_violation("Invalid webhook signature"))?;

    let event: serde_json::Value = serde_json::from_str(&payload)
        .map_err(|_| ApiError::validation("Malformed webhook payload"))?;

    let event_type = event.get("type").and_then(|v| v.as_str()).unwrap_or("");
    if event_type != "payment_intent.succeeded" {
        return Ok(Json(serde_json::json!({ "received": true })));
    }

    let object = event
        .pointer("/data/object")
        .cloned()
        .unwrap_or(serde_json::Value::Null);
    let intent: StripePaymentIntent = serde_json::from_value(object)
        .map_err(|_| ApiError::validation("Malformed payment intent in webhook"))?;

    let Some(raw_booking_id) = intent.metadata.get("booking_id") else {
        return Ok(Json(serde_json::json!({ "received": true })));
    };
    let Ok(booking_id) = ObjectId::parse_str(raw_booking_id) else {
        warn!("Webhook carried unparseable booking id {}", raw_booking_id);
        return Ok(Json(serde_json::json!({ "received": true })));
    };

    let booking = db
        .collection::<Booking>(BOOKINGS)
        .find_one(doc! { "_id": booking_id }, None)
        .await
        .map_err(|e| ApiError::internal_error(format!("Database error: {}", e)))?;

    match booking {
        Some(booking) if booking.status == BookingStatus::Pending => {
            info!(
                "Webhook reconciling orphaned charge {} for booking {}",
                intent.id,
                booking_id.to_hex()
            );
            commit_settlement(db, &booking, &intent).await?;
        }
        Some(_) => {} // already settled or closed, nothing to reconcile
        None => warn!(
            "Webhook charge {} references missing booking {}",
            intent.id,
            booking_id.to_hex()
        ),
    }

    Ok(Json(serde_json::json!({ "received": true })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscription_fields_validate_before_any_write() {
        // a malformed expiry must reject the request up front, so a ledger
        // entry is never persisted for it and a corrected retry is not
        // swallowed by the idempotent-replay branch
        assert!(parse_subscription_update(Some("not-a-date"), None).is_err());
        assert!(parse_subscription_update(None, Some("trialing")).is_err());

        let update = parse_subscription_update(Some("2026-01-01T00:00:00Z"), Some("active"))
            .expect("valid fields");
        assert!(update.contains_key("subscription_expiry"));
        assert_eq!(update.get_str("subscription_status").unwrap(), "active");

        let empty = parse_subscription_update(None, None).expect("absent fields are fine");
        assert!(empty.is_empty());
    }
}
