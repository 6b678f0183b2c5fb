use mongodb::bson::{oid::ObjectId, DateTime};
use serde::{Deserialize, Serialize};

use super::booking::BookingKind;

/// A bookable item on the marketplace: a stable, a piece of equipment, a
/// professional service or a trainer. Only the fields the booking pipeline
/// reads are modeled here; listing CRUD lives outside this service.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Listing {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<ObjectId>,
    pub kind: BookingKind,
    pub title: String,
    pub description: Option<String>,
    pub seller_id: ObjectId,
    pub price: f64,
    pub is_active: bool,
    pub created_at: DateTime,
    pub updated_at: DateTime,
}
