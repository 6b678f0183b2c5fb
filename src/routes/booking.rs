use std::collections::HashMap;

use mongodb::bson::oid::ObjectId;
use mongodb::bson::{doc, DateTime};
use mongodb::options::FindOptions;
use rocket::futures::TryStreamExt;
use rocket::response::status;
use rocket::serde::json::Json;
use rocket::State;
use rocket_okapi::openapi;

use crate::db::DbConn;
use crate::guards::AuthGuard;
use crate::models::{
    find_conflict, parse_time, Account, Booking, BookingKind, BookingStatus, CreateBookingDto,
    Listing, UpdateBookingDto,
};
use crate::utils::subscription::derive_status;
use crate::utils::validation::parse_date;
use crate::utils::{ApiError, ApiResponse};

pub const BOOKINGS: &str = "bookings";
pub const LISTINGS: &str = "listings";
pub const ACCOUNTS: &str = "accounts";

fn parse_kind(raw: &str) -> Result<BookingKind, ApiError> {
    BookingKind::parse(raw).ok_or_else(|| {
        ApiError::validation(format!(
            "Unknown booking kind '{}'. Expected stable, equipment, service or trainer",
            raw
        ))
    })
}

pub fn parse_object_id_field(raw: &str, field: &str) -> Result<ObjectId, ApiError> {
    ObjectId::parse_str(raw).map_err(|_| ApiError::validation(format!("Invalid {}", field)))
}

pub async fn load_booking(
    db: &DbConn,
    kind: BookingKind,
    id: ObjectId,
) -> Result<Booking, ApiError> {
    db.collection::<Booking>(BOOKINGS)
        .find_one(doc! { "_id": id, "kind": kind.as_str() }, None)
        .await
        .map_err(|e| ApiError::internal_error(format!("Database error: {}", e)))?
        .ok_or_else(|| ApiError::not_found("Booking not found"))
}

pub async fn load_account(db: &DbConn, id: ObjectId, what: &str) -> Result<Account, ApiError> {
    db.collection::<Account>(ACCOUNTS)
        .find_one(doc! { "_id": id }, None)
        .await
        .map_err(|e| ApiError::internal_error(format!("Database error: {}", e)))?
        .ok_or_else(|| ApiError::not_found(format!("{} not found", what)))
}

pub async fn load_listing(db: &DbConn, id: ObjectId) -> Result<Listing, ApiError> {
    db.collection::<Listing>(LISTINGS)
        .find_one(doc! { "_id": id }, None)
        .await
        .map_err(|e| ApiError::internal_error(format!("Database error: {}", e)))?
        .ok_or_else(|| ApiError::not_found("Listing not found"))
}

/// The wire shape of a booking, carrying the denormalized display fields and
/// the legacy single `paymentId`.
pub fn booking_json(
    booking: &Booking,
    listing_title: Option<&str>,
    buyer_name: Option<&str>,
    seller_name: Option<&str>,
) -> serde_json::Value {
    serde_json::json!({
        "id": booking.id.map(|id| id.to_hex()),
        "kind": booking.kind.as_str(),
        "listingId": booking.listing_id.to_hex(),
        "listingTitle": listing_title,
        "buyerId": booking.buyer_id.to_hex(),
        "buyerName": buyer_name,
        "sellerId": booking.seller_id.map(|id| id.to_hex()),
        "sellerName": seller_name,
        "date": booking.date,
        "startDate": booking.start_date,
        "endDate": booking.end_date,
        "startTime": booking.start_time,
        "endTime": booking.end_time,
        "unitPrice": booking.unit_price,
        "discount": booking.discount,
        "serviceCharge": booking.service_charge,
        "totalPrice": booking.total_price,
        "quantity": booking.quantity,
        "paymentId": booking.wire_payment_id(),
        "status": booking.status.as_str(),
        "reason": booking.reason,
        "createdAt": booking.created_at.try_to_rfc3339_string().ok(),
        "updatedAt": booking.updated_at.try_to_rfc3339_string().ok(),
    })
}

/// Populate a single booking with its listing/buyer/seller display fields.
pub async fn populate_booking(db: &DbConn, booking: &Booking) -> serde_json::Value {
    let listing_title = db
        .collection::<Listing>(LISTINGS)
        .find_one(doc! { "_id": booking.listing_id }, None)
        .await
        .ok()
        .flatten()
        .map(|l| l.title);

    let buyer_name = db
        .collection::<Account>(ACCOUNTS)
        .find_one(doc! { "_id": booking.buyer_id }, None)
        .await
        .ok()
        .flatten()
        .map(|a| a.display_name());

    let seller_name = match booking.seller_id {
        Some(seller_id) => db
            .collection::<Account>(ACCOUNTS)
            .find_one(doc! { "_id": seller_id }, None)
            .await
            .ok()
            .flatten()
            .map(|a| a.display_name()),
        None => None,
    };

    booking_json(
        booking,
        listing_title.as_deref(),
        buyer_name.as_deref(),
        seller_name.as_deref(),
    )
}

#[derive(FromForm, serde::Deserialize, rocket_okapi::okapi::schemars::JsonSchema)]
pub struct BookingListQuery {
    #[field(name = "listingId")]
    pub listing_id: Option<String>,
    #[field(name = "buyerId")]
    pub buyer_id: Option<String>,
    #[field(name = "sellerId")]
    pub seller_id: Option<String>,
}

/// List bookings of a kind, filtered by listing, buyer or seller, newest first.
#[openapi(tag = "Bookings")]
#[get("/bookings/<kind>?<query..>")]
pub async fn list_bookings(
    kind: String,
    query: BookingListQuery,
    db: &State<DbConn>,
    _auth: AuthGuard,
) -> Result<Json<ApiResponse<serde_json::Value>>, ApiError> {
    let kind = parse_kind(&kind)?;

    let mut filter = doc! { "kind": kind.as_str() };
    if let Some(raw) = &query.listing_id {
        filter.insert("listing_id", parse_object_id_field(raw, "listingId")?);
    }
    if let Some(raw) = &query.buyer_id {
        filter.insert("buyer_id", parse_object_id_field(raw, "buyerId")?);
    }
    if let Some(raw) = &query.seller_id {
        filter.insert("seller_id", parse_object_id_field(raw, "sellerId")?);
    }

    let find_options = FindOptions::builder()
        .sort(doc! { "created_at": -1 })
        .build();

    let bookings: Vec<Booking> = db
        .collection::<Booking>(BOOKINGS)
        .find(filter, find_options)
        .await
        .map_err(|e| ApiError::internal_error(format!("Database error: {}", e)))?
        .try_collect()
        .await
        .map_err(|e| ApiError::internal_error(format!("Cursor error: {}", e)))?;

    // Denormalize display fields, resolving each reference at most once
    let mut listing_titles: HashMap<ObjectId, Option<String>> = HashMap::new();
    let mut account_names: HashMap<ObjectId, Option<String>> = HashMap::new();
    let mut entries = Vec::with_capacity(bookings.len());

    for booking in &bookings {
        if !listing_titles.contains_key(&booking.listing_id) {
            let title = db
                .collection::<Listing>(LISTINGS)
                .find_one(doc! { "_id": booking.listing_id }, None)
                .await
                .ok()
                .flatten()
                .map(|l| l.title);
            listing_titles.insert(booking.listing_id, title);
        }

        for account_id in [Some(booking.buyer_id), booking.seller_id].into_iter().flatten() {
            if !account_names.contains_key(&account_id) {
                let name = db
                    .collection::<Account>(ACCOUNTS)
                    .find_one(doc! { "_id": account_id }, None)
                    .await
                    .ok()
                    .flatten()
                    .map(|a| a.display_name());
                account_names.insert(account_id, name);
            }
        }

        let listing_title = listing_titles.get(&booking.listing_id).and_then(|t| t.as_deref());
        let buyer_name = account_names.get(&booking.buyer_id).and_then(|n| n.as_deref());
        let seller_name = booking
            .seller_id
            .and_then(|id| account_names.get(&id).and_then(|n| n.as_deref().map(str::to_string)));

        entries.push(booking_json(booking, listing_title, buyer_name, seller_name.as_deref()));
    }

    Ok(Json(ApiResponse::success(serde_json::json!({
        "bookings": entries,
        "total": entries.len()
    }))))
}

/// Create a booking. Validation order is fixed: field checks, numeric sanity,
/// referential existence, then the overlap invariant for time-ranged kinds.
/// The record is created in `pending`; nothing is charged here.
#[openapi(tag = "Bookings")]
#[post("/bookings/<kind>", data = "<dto>")]
pub async fn create_booking(
    kind: String,
    dto: Json<CreateBookingDto>,
    db: &State<DbConn>,
    _auth: AuthGuard,
) -> Result<status::Created<Json<ApiResponse<serde_json::Value>>>, ApiError> {
    let kind = parse_kind(&kind)?;
    let rules = kind.rules();
    let today = chrono::Utc::now().date_naive();

    rules
        .validate(&dto, today)
        .map_err(ApiError::validation)?;

    let listing_id = parse_object_id_field(&dto.listing_id, "listingId")?;
    let buyer_id = parse_object_id_field(&dto.buyer_id, "buyerId")?;

    let listing = load_listing(db, listing_id).await?;
    let buyer = load_account(db, buyer_id, "Buyer").await?;

    // Service bookings take the seller from the listing; other kinds carry it
    let seller_id = match (kind, &dto.seller_id) {
        (BookingKind::Service, _) => Some(listing.seller_id),
        (_, Some(raw)) => Some(parse_object_id_field(raw, "sellerId")?),
        (_, None) => return Err(ApiError::validation("sellerId is required")),
    };

    let seller = match seller_id {
        Some(id) => Some(load_account(db, id, "Seller").await?),
        None => None,
    };

    // A listing is only bookable while its seller's subscription is active
    if let Some(seller) = &seller {
        let status = derive_status(
            seller.subscription_expiry,
            seller.role.is_privileged(),
            DateTime::now(),
        );
        if status == crate::models::SubscriptionStatus::Expired {
            return Err(ApiError::validation(
                "Listing is not bookable: seller subscription has expired",
            ));
        }
    }

    if rules.enforces_overlap() {
        let window = match kind {
            BookingKind::Service => {
                let start = dto.start_date.as_deref().and_then(parse_date);
                let end = dto.end_date.as_deref().and_then(parse_date).or(start);
                start.zip(end)
            }
            _ => dto
                .date
                .as_deref()
                .and_then(parse_date)
                .map(|day| (day, day)),
        };
        let times = dto
            .start_time
            .as_deref()
            .and_then(parse_time)
            .zip(dto.end_time.as_deref().and_then(parse_time));

        if let Some(window) = window {
            let existing: Vec<Booking> = db
                .collection::<Booking>(BOOKINGS)
                .find(
                    doc! {
                        "listing_id": listing_id,
                        "status": { "$in": ["pending", "confirmed"] }
                    },
                    None,
                )
                .await
                .map_err(|e| ApiError::internal_error(format!("Database error: {}", e)))?
                .try_collect()
                .await
                .map_err(|e| ApiError::internal_error(format!("Cursor error: {}", e)))?;

            if find_conflict(window, times, &existing).is_some() {
                return Err(ApiError::conflict(
                    "An active booking already covers this time window",
                ));
            }
        }
    }

    let total_price = match dto.total_price {
        Some(total) => total,
        None => rules.compute_total(&dto),
    };
    if total_price < 0.0 {
        return Err(ApiError::validation("totalPrice must not be negative"));
    }

    let now = DateTime::now();
    let booking = Booking {
        id: None,
        kind,
        listing_id,
        buyer_id: buyer.id.unwrap_or(buyer_id),
        seller_id,
        date: dto.date.clone(),
        start_date: dto.start_date.clone(),
        end_date: dto.end_date.clone(),
        start_time: dto.start_time.clone(),
        end_time: dto.end_time.clone(),
        unit_price: dto.unit_price.unwrap_or(listing.price),
        discount: dto.discount.unwrap_or(0.0),
        service_charge: dto.service_charge.unwrap_or(0.0),
        total_price,
        quantity: dto.quantity,
        payment_method_ref: dto.payment_id.clone(),
        charge_ref: None,
        status: BookingStatus::Pending,
        reason: None,
        created_at: now,
        updated_at: now,
    };

    let result = db
        .collection::<Booking>(BOOKINGS)
        .insert_one(&booking, None)
        .await
        .map_err(|e| ApiError::internal_error(format!("Failed to create booking: {}", e)))?;

    let booking_id = result
        .inserted_id
        .as_object_id()
        .ok_or_else(|| ApiError::internal_error("Invalid booking ID"))?;

    let created = load_booking(db, kind, booking_id).await?;
    let populated = populate_booking(db, &created).await;

    let location = format!("/api/v1/bookings/{}/{}", kind.as_str(), booking_id.to_hex());
    Ok(status::Created::new(location).body(Json(ApiResponse::success_with_message(
        "Booking created".to_string(),
        populated,
    ))))
}

/// Fetch a single booking, populated.
#[openapi(tag = "Bookings")]
#[get("/bookings/<kind>/<booking_id>")]
pub async fn get_booking(
    kind: String,
    booking_id: String,
    db: &State<DbConn>,
    _auth: AuthGuard,
) -> Result<Json<ApiResponse<serde_json::Value>>, ApiError> {
    let kind = parse_kind(&kind)?;
    let id = parse_object_id_field(&booking_id, "booking ID")?;

    let booking = load_booking(db, kind, id).await?;
    let populated = populate_booking(db, &booking).await;

    Ok(Json(ApiResponse::success(populated)))
}

/// Status transitions allowed through the manual edit path. Terminal states
/// cannot be edited again.
fn transition_allowed(from: BookingStatus, to: BookingStatus) -> bool {
    match from {
        BookingStatus::Pending => true,
        BookingStatus::Confirmed => {
            matches!(to, BookingStatus::Cancelled | BookingStatus::Completed)
        }
        BookingStatus::Cancelled | BookingStatus::Completed => false,
    }
}

/// Partial update: status and cancellation reason only. No other field is
/// mutable through this path.
#[openapi(tag = "Bookings")]
#[put("/bookings/<kind>/<booking_id>", data = "<dto>")]
pub async fn update_booking(
    kind: String,
    booking_id: String,
    dto: Json<UpdateBookingDto>,
    db: &State<DbConn>,
    _auth: AuthGuard,
) -> Result<Json<ApiResponse<serde_json::Value>>, ApiError> {
    let kind = parse_kind(&kind)?;
    let id = parse_object_id_field(&booking_id, "booking ID")?;

    let booking = load_booking(db, kind, id).await?;

    let mut update = doc! { "updated_at": DateTime::now() };

    if let Some(raw) = &dto.status {
        let new_status = BookingStatus::parse(raw)
            .ok_or_else(|| ApiError::validation(format!("Invalid status '{}'", raw)))?;
        if new_status != booking.status && !transition_allowed(booking.status, new_status) {
            return Err(ApiError::invalid_state(format!(
                "Cannot move a {} booking to {}",
                booking.status.as_str(),
                new_status.as_str()
            )));
        }
        update.insert("status", new_status.as_str());
    }

    if let Some(reason) = &dto.reason {
        update.insert("reason", reason);
    }

    db.collection::<Booking>(BOOKINGS)
        .update_one(doc! { "_id": id }, doc! { "$set": update }, None)
        .await
        .map_err(|e| ApiError::internal_error(format!("Failed to update booking: {}", e)))?;

    let updated = load_booking(db, kind, id).await?;
    let populated = populate_booking(db, &updated).await;

    Ok(Json(ApiResponse::success_with_message(
        "Booking updated".to_string(),
        populated,
    )))
}

/// Hard delete. Ledger entries on the seller's account are audit history and
/// are deliberately not cascaded.
#[openapi(tag = "Bookings")]
#[delete("/bookings/<kind>/<booking_id>")]
pub async fn delete_booking(
    kind: String,
    booking_id: String,
    db: &State<DbConn>,
    _auth: AuthGuard,
) -> Result<Json<ApiResponse<serde_json::Value>>, ApiError> {
    let kind = parse_kind(&kind)?;
    let id = parse_object_id_field(&booking_id, "booking ID")?;

    let result = db
        .collection::<Booking>(BOOKINGS)
        .delete_one(doc! { "_id": id, "kind": kind.as_str() }, None)
        .await
        .map_err(|e| ApiError::internal_error(format!("Failed to delete booking: {}", e)))?;

    if result.deleted_count == 0 {
        return Err(ApiError::not_found("Booking not found"));
    }

    Ok(Json(ApiResponse::success(serde_json::json!({
        "message": "Booking deleted"
    }))))
}
