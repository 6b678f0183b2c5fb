use chrono::{NaiveDate, NaiveTime};
use mongodb::bson::{oid::ObjectId, DateTime};
use serde::{Deserialize, Serialize};
use rocket_okapi::okapi::schemars;
use rocket_okapi::okapi::schemars::JsonSchema;

use crate::utils::validation::parse_date;

/// The four bookable kinds. They share one document shape, one collection and
/// one status machine; what differs is the per-kind validation strategy (see
/// [`KindRules`]).
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum BookingKind {
    Stable,
    Equipment,
    Service,
    Trainer,
}

impl BookingKind {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_lowercase().as_str() {
            "stable" => Some(BookingKind::Stable),
            "equipment" => Some(BookingKind::Equipment),
            "service" => Some(BookingKind::Service),
            "trainer" => Some(BookingKind::Trainer),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BookingKind::Stable => "stable",
            BookingKind::Equipment => "equipment",
            BookingKind::Service => "service",
            BookingKind::Trainer => "trainer",
        }
    }

    pub fn rules(&self) -> &'static dyn KindRules {
        match self {
            BookingKind::Stable => &StableRules,
            BookingKind::Equipment => &EquipmentRules,
            BookingKind::Service => &ServiceRules,
            BookingKind::Trainer => &TrainerRules,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Cancelled,
    Completed,
}

impl BookingStatus {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_lowercase().as_str() {
            "pending" => Some(BookingStatus::Pending),
            "confirmed" => Some(BookingStatus::Confirmed),
            "cancelled" => Some(BookingStatus::Cancelled),
            "completed" => Some(BookingStatus::Completed),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Cancelled => "cancelled",
            BookingStatus::Completed => "completed",
        }
    }
}

/// A buyer's reservation against a listing.
///
/// The legacy wire format carried a single `paymentId` whose meaning changed
/// over the lifecycle: a stored payment-method reference before settlement, the
/// processor's charge reference after. Internally those are two fields;
/// [`Booking::wire_payment_id`] reassembles the legacy view at the boundary.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Booking {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<ObjectId>,
    pub kind: BookingKind,
    pub listing_id: ObjectId,
    pub buyer_id: ObjectId,
    /// Service bookings do not carry a seller on the wire; it is resolved
    /// from the listing at creation time.
    pub seller_id: Option<ObjectId>,
    /// Single booking day (stable, equipment, trainer), `YYYY-MM-DD`.
    pub date: Option<String>,
    /// Range (service), `YYYY-MM-DD`.
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    /// Time of day, `HH:MM` (service, trainer).
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub unit_price: f64,
    /// Percentage, 0-100.
    pub discount: f64,
    pub service_charge: f64,
    pub total_price: f64,
    /// Equipment only, >= 1.
    pub quantity: Option<i64>,
    /// Stored payment-method reference, set at creation, consumed by settlement.
    pub payment_method_ref: Option<String>,
    /// Processor charge reference, set only when settlement succeeds.
    pub charge_ref: Option<String>,
    pub status: BookingStatus,
    pub reason: Option<String>,
    pub created_at: DateTime,
    pub updated_at: DateTime,
}

impl Booking {
    pub fn is_active(&self) -> bool {
        matches!(self.status, BookingStatus::Pending | BookingStatus::Confirmed)
    }

    /// The booking's day span as a closed interval. Single-day kinds span one
    /// day; a service booking without an end date spans its start day.
    pub fn window(&self) -> Option<(NaiveDate, NaiveDate)> {
        match self.kind {
            BookingKind::Service => {
                let start = parse_date(self.start_date.as_deref()?)?;
                let end = self
                    .end_date
                    .as_deref()
                    .and_then(parse_date)
                    .unwrap_or(start);
                Some((start, end))
            }
            _ => {
                let day = parse_date(self.date.as_deref()?)?;
                Some((day, day))
            }
        }
    }

    pub fn time_window(&self) -> Option<(NaiveTime, NaiveTime)> {
        let start = parse_time(self.start_time.as_deref()?)?;
        let end = parse_time(self.end_time.as_deref()?)?;
        Some((start, end))
    }

    /// Legacy single-field payment reference: the charge reference once
    /// settled, the stored payment-method reference before that.
    pub fn wire_payment_id(&self) -> Option<&str> {
        self.charge_ref
            .as_deref()
            .or(self.payment_method_ref.as_deref())
    }
}

pub fn parse_time(raw: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(raw.trim(), "%H:%M").ok()
}

/* ----------------------------- wire DTOs ----------------------------- */

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateBookingDto {
    pub listing_id: String,
    pub buyer_id: String,
    pub seller_id: Option<String>,
    pub date: Option<String>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub unit_price: Option<f64>,
    pub discount: Option<f64>,
    pub service_charge: Option<f64>,
    pub total_price: Option<f64>,
    pub quantity: Option<i64>,
    /// Stored payment-method reference collected client-side.
    pub payment_id: Option<String>,
}

/// PUT accepts only the status and a cancellation narrative; every other field
/// is immutable through this path.
#[derive(Debug, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct UpdateBookingDto {
    pub status: Option<String>,
    pub reason: Option<String>,
}

/* ----------------------------- kind rules ----------------------------- */

/// Per-kind validation and pricing strategy, selected via the kind tag.
pub trait KindRules: Sync {
    /// Field-level checks only (presence, formats, numeric sanity). First
    /// failure wins; referential and overlap checks belong to the caller.
    fn validate(&self, dto: &CreateBookingDto, today: NaiveDate) -> Result<(), String>;

    /// Price when the caller does not supply a precomputed total.
    fn compute_total(&self, dto: &CreateBookingDto) -> f64 {
        let quantity = dto.quantity.unwrap_or(1).max(1) as f64;
        let base = dto.unit_price.unwrap_or(0.0) * quantity;
        let discounted = base * (1.0 - dto.discount.unwrap_or(0.0) / 100.0);
        discounted + dto.service_charge.unwrap_or(0.0)
    }

    /// Whether the overlap invariant is enforced for this kind.
    fn enforces_overlap(&self) -> bool;
}

fn check_commercials(dto: &CreateBookingDto) -> Result<(), String> {
    if let Some(price) = dto.unit_price {
        if price < 0.0 {
            return Err("unitPrice must not be negative".to_string());
        }
    }
    if let Some(discount) = dto.discount {
        if !(0.0..=100.0).contains(&discount) {
            return Err("discount must be between 0 and 100".to_string());
        }
    }
    if let Some(charge) = dto.service_charge {
        if charge < 0.0 {
            return Err("serviceCharge must not be negative".to_string());
        }
    }
    if let Some(total) = dto.total_price {
        if total < 0.0 {
            return Err("totalPrice must not be negative".to_string());
        }
    }
    Ok(())
}

fn check_times(dto: &CreateBookingDto) -> Result<(), String> {
    let start = match dto.start_time.as_deref() {
        Some(raw) => Some(parse_time(raw).ok_or("startTime must be HH:MM")?),
        None => None,
    };
    let end = match dto.end_time.as_deref() {
        Some(raw) => Some(parse_time(raw).ok_or("endTime must be HH:MM")?),
        None => None,
    };
    if let (Some(start), Some(end)) = (start, end) {
        if end <= start {
            return Err("endTime must be after startTime".to_string());
        }
    }
    Ok(())
}

pub struct StableRules;

impl KindRules for StableRules {
    fn validate(&self, dto: &CreateBookingDto, _today: NaiveDate) -> Result<(), String> {
        // Past dates are allowed here; only service bookings forbid them.
        let raw = dto.date.as_deref().ok_or("date is required")?;
        parse_date(raw).ok_or("date must be a valid YYYY-MM-DD date")?;
        check_commercials(dto)
    }

    fn enforces_overlap(&self) -> bool {
        false
    }
}

pub struct EquipmentRules;

impl KindRules for EquipmentRules {
    fn validate(&self, dto: &CreateBookingDto, _today: NaiveDate) -> Result<(), String> {
        let raw = dto.date.as_deref().ok_or("date is required")?;
        parse_date(raw).ok_or("date must be a valid YYYY-MM-DD date")?;
        match dto.quantity {
            Some(q) if q >= 1 => {}
            Some(_) => return Err("quantity must be at least 1".to_string()),
            None => return Err("quantity is required".to_string()),
        }
        check_commercials(dto)
    }

    fn enforces_overlap(&self) -> bool {
        // Multiple units of the same equipment may be out on the same day.
        false
    }
}

pub struct ServiceRules;

impl KindRules for ServiceRules {
    fn validate(&self, dto: &CreateBookingDto, today: NaiveDate) -> Result<(), String> {
        let raw = dto.start_date.as_deref().ok_or("startDate is required")?;
        let start = parse_date(raw).ok_or("startDate must be a valid YYYY-MM-DD date")?;
        if start < today {
            return Err("startDate must not be in the past".to_string());
        }
        if let Some(raw_end) = dto.end_date.as_deref() {
            let end = parse_date(raw_end).ok_or("endDate must be a valid YYYY-MM-DD date")?;
            if end < start {
                return Err("endDate must not be before startDate".to_string());
            }
        }
        check_times(dto)?;
        check_commercials(dto)
    }

    fn enforces_overlap(&self) -> bool {
        true
    }
}

pub struct TrainerRules;

impl KindRules for TrainerRules {
    fn validate(&self, dto: &CreateBookingDto, _today: NaiveDate) -> Result<(), String> {
        let raw = dto.date.as_deref().ok_or("date is required")?;
        parse_date(raw).ok_or("date must be a valid YYYY-MM-DD date")?;
        check_times(dto)?;
        check_commercials(dto)
    }

    fn enforces_overlap(&self) -> bool {
        true
    }
}

/* ----------------------------- overlap check ----------------------------- */

/// Closed-interval intersection on day spans.
pub fn windows_overlap(a: (NaiveDate, NaiveDate), b: (NaiveDate, NaiveDate)) -> bool {
    b.0 <= a.1 && b.1 >= a.0
}

fn times_overlap(a: (NaiveTime, NaiveTime), b: (NaiveTime, NaiveTime)) -> bool {
    b.0 <= a.1 && b.1 >= a.0
}

/// Find an existing active booking whose window collides with the proposed
/// one. When both sides carry a time-of-day window, day overlap alone is not a
/// collision; the time intervals must intersect too.
pub fn find_conflict<'a>(
    window: (NaiveDate, NaiveDate),
    times: Option<(NaiveTime, NaiveTime)>,
    existing: &'a [Booking],
) -> Option<&'a Booking> {
    existing.iter().find(|candidate| {
        if !candidate.is_active() {
            return false;
        }
        let Some(candidate_window) = candidate.window() else {
            return false;
        };
        if !windows_overlap(window, candidate_window) {
            return false;
        }
        match (times, candidate.time_window()) {
            (Some(a), Some(b)) => times_overlap(a, b),
            _ => true,
        }
    })
}

/* ----------------------------- settlement ----------------------------- */

#[derive(Debug, PartialEq, Eq)]
pub enum SettleBlock {
    /// Re-settling a confirmed booking would charge the payer twice.
    AlreadyConfirmed,
    /// Cancelled and completed bookings are terminal; charging them would
    /// confirm a booking the state machine already closed.
    NotPending,
    /// No stored payment method to charge.
    NoPaymentMethod,
}

/// Decide whether a booking is chargeable, and with which stored payment
/// method. Only `pending` bookings pass; runs before any call to the payment
/// processor.
pub fn settle_precheck(booking: &Booking) -> Result<&str, SettleBlock> {
    match booking.status {
        BookingStatus::Pending => {}
        BookingStatus::Confirmed => return Err(SettleBlock::AlreadyConfirmed),
        BookingStatus::Cancelled | BookingStatus::Completed => {
            return Err(SettleBlock::NotPending);
        }
    }
    match booking.payment_method_ref.as_deref() {
        Some(pm) if !pm.trim().is_empty() => Ok(pm),
        _ => Err(SettleBlock::NoPaymentMethod),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn base_dto() -> CreateBookingDto {
        CreateBookingDto {
            listing_id: "656a1fceea9f4b0012345678".to_string(),
            buyer_id: "656a1fceea9f4b0087654321".to_string(),
            seller_id: None,
            date: None,
            start_date: None,
            end_date: None,
            start_time: None,
            end_time: None,
            unit_price: Some(50.0),
            discount: None,
            service_charge: None,
            total_price: Some(50.0),
            quantity: None,
            payment_id: Some("pm_123".to_string()),
        }
    }

    fn booking(kind: BookingKind, status: BookingStatus) -> Booking {
        Booking {
            id: Some(mongodb::bson::oid::ObjectId::new()),
            kind,
            listing_id: mongodb::bson::oid::ObjectId::new(),
            buyer_id: mongodb::bson::oid::ObjectId::new(),
            seller_id: None,
            date: None,
            start_date: None,
            end_date: None,
            start_time: None,
            end_time: None,
            unit_price: 50.0,
            discount: 0.0,
            service_charge: 0.0,
            total_price: 50.0,
            quantity: None,
            payment_method_ref: Some("pm_123".to_string()),
            charge_ref: None,
            status,
            reason: None,
            created_at: DateTime::now(),
            updated_at: DateTime::now(),
        }
    }

    #[test]
    fn equipment_requires_quantity() {
        let mut dto = base_dto();
        dto.date = Some("2023-06-01".to_string());
        assert!(EquipmentRules.validate(&dto, date("2024-01-01")).is_err());

        dto.quantity = Some(0);
        assert!(EquipmentRules.validate(&dto, date("2024-01-01")).is_err());

        // past dates are fine for equipment
        dto.quantity = Some(2);
        assert!(EquipmentRules.validate(&dto, date("2024-01-01")).is_ok());
    }

    #[test]
    fn service_start_must_not_be_past() {
        let mut dto = base_dto();
        dto.start_date = Some("2024-01-09".to_string());
        assert_eq!(
            ServiceRules.validate(&dto, date("2024-01-10")),
            Err("startDate must not be in the past".to_string())
        );

        dto.start_date = Some("2024-01-10".to_string());
        assert!(ServiceRules.validate(&dto, date("2024-01-10")).is_ok());
    }

    #[test]
    fn service_range_must_be_ordered() {
        let mut dto = base_dto();
        dto.start_date = Some("2024-01-12".to_string());
        dto.end_date = Some("2024-01-10".to_string());
        assert!(ServiceRules.validate(&dto, date("2024-01-01")).is_err());
    }

    #[test]
    fn negative_total_rejected() {
        let mut dto = base_dto();
        dto.date = Some("2024-03-01".to_string());
        dto.total_price = Some(-1.0);
        assert!(StableRules.validate(&dto, date("2024-01-01")).is_err());
    }

    #[test]
    fn computes_total_from_parts() {
        let mut dto = base_dto();
        dto.unit_price = Some(100.0);
        dto.quantity = Some(2);
        dto.discount = Some(10.0);
        dto.service_charge = Some(5.0);
        assert_eq!(EquipmentRules.compute_total(&dto), 185.0);
    }

    #[test]
    fn overlap_uses_closed_intervals() {
        let mut existing = booking(BookingKind::Service, BookingStatus::Confirmed);
        existing.start_date = Some("2024-01-10".to_string());
        existing.end_date = Some("2024-01-12".to_string());
        let existing = vec![existing];

        // intersecting range is rejected
        assert!(find_conflict((date("2024-01-11"), date("2024-01-13")), None, &existing).is_some());
        // touching endpoint counts as overlap (closed intervals)
        assert!(find_conflict((date("2024-01-12"), date("2024-01-14")), None, &existing).is_some());
        // disjoint range is accepted
        assert!(find_conflict((date("2024-01-13"), date("2024-01-15")), None, &existing).is_none());
    }

    #[test]
    fn cancelled_bookings_do_not_block() {
        let mut existing = booking(BookingKind::Service, BookingStatus::Cancelled);
        existing.start_date = Some("2024-01-10".to_string());
        existing.end_date = Some("2024-01-12".to_string());
        let existing = vec![existing];

        assert!(find_conflict((date("2024-01-11"), date("2024-01-13")), None, &existing).is_none());
    }

    #[test]
    fn same_day_sessions_with_disjoint_times_coexist() {
        let mut existing = booking(BookingKind::Trainer, BookingStatus::Pending);
        existing.date = Some("2024-01-10".to_string());
        existing.start_time = Some("09:00".to_string());
        existing.end_time = Some("10:00".to_string());
        let existing = vec![existing];

        let day = (date("2024-01-10"), date("2024-01-10"));
        let later = Some((parse_time("11:00").unwrap(), parse_time("12:00").unwrap()));
        assert!(find_conflict(day, later, &existing).is_none());

        let clashing = Some((parse_time("09:30").unwrap(), parse_time("11:00").unwrap()));
        assert!(find_conflict(day, clashing, &existing).is_some());

        // a request without times blocks the whole day
        assert!(find_conflict(day, None, &existing).is_some());
    }

    #[test]
    fn precheck_refuses_terminal_bookings() {
        // A cancelled booking with a stored payment method must never be
        // declared chargeable; same for completed
        let cancelled = booking(BookingKind::Stable, BookingStatus::Cancelled);
        assert_eq!(settle_precheck(&cancelled), Err(SettleBlock::NotPending));

        let completed = booking(BookingKind::Service, BookingStatus::Completed);
        assert_eq!(settle_precheck(&completed), Err(SettleBlock::NotPending));
    }

    #[test]
    fn precheck_blocks_confirmed_and_empty_payment_method() {
        let confirmed = booking(BookingKind::Stable, BookingStatus::Confirmed);
        assert_eq!(settle_precheck(&confirmed), Err(SettleBlock::AlreadyConfirmed));

        let mut no_method = booking(BookingKind::Stable, BookingStatus::Pending);
        no_method.payment_method_ref = None;
        assert_eq!(settle_precheck(&no_method), Err(SettleBlock::NoPaymentMethod));

        no_method.payment_method_ref = Some("  ".to_string());
        assert_eq!(settle_precheck(&no_method), Err(SettleBlock::NoPaymentMethod));

        let chargeable = booking(BookingKind::Stable, BookingStatus::Pending);
        assert_eq!(settle_precheck(&chargeable), Ok("pm_123"));
    }

    #[test]
    fn wire_payment_id_prefers_charge_ref() {
        let mut b = booking(BookingKind::Stable, BookingStatus::Pending);
        assert_eq!(b.wire_payment_id(), Some("pm_123"));
        b.charge_ref = Some("pi_456".to_string());
        assert_eq!(b.wire_payment_id(), Some("pi_456"));
    }
}
