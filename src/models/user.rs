use mongodb::bson::{oid::ObjectId, DateTime};
use serde::{Deserialize, Serialize};
use rocket_okapi::okapi::schemars;
use rocket_okapi::okapi::schemars::JsonSchema;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionStatus {
    Active,
    Expired,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub enum AccountRole {
    Buyer,
    Seller,
    SuperAdmin,
}

impl AccountRole {
    /// Super admins are treated as perpetually subscribed.
    pub fn is_privileged(&self) -> bool {
        matches!(self, AccountRole::SuperAdmin)
    }
}

/// One settlement record in an account's payment ledger. Entries are keyed by
/// the processor's charge reference and are append-only: they survive booking
/// deletion and are never overwritten.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PaymentRecord {
    /// Processor charge/intent reference; the ledger's idempotency key.
    pub charge_ref: String,
    pub amount: f64,
    pub currency: String,
    pub status: String,
    /// Point-in-time snapshot of the account's display fields, kept for
    /// historical display even if the account is later renamed.
    pub account_name: String,
    pub account_email: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub booking_id: Option<ObjectId>,
    pub recorded_at: DateTime,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Account {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<ObjectId>,
    pub name: Option<String>,
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password_hash: Option<String>,
    pub role: AccountRole,
    /// Reference to the payment processor's customer object, once created.
    pub stripe_customer_id: Option<String>,
    pub subscription_status: SubscriptionStatus,
    pub subscription_expiry: Option<DateTime>,
    #[serde(default)]
    pub payments: Vec<PaymentRecord>,
    pub is_active: bool,
    pub created_at: DateTime,
    pub updated_at: DateTime,
}

impl Account {
    pub fn display_name(&self) -> String {
        self.name.clone().unwrap_or_default()
    }

    pub fn payment_for(&self, charge_ref: &str) -> Option<&PaymentRecord> {
        self.payments.iter().find(|p| p.charge_ref == charge_ref)
    }

    /// Seller profile fields that must be present before a settlement can be
    /// recorded against this account. Returns the missing field names.
    pub fn missing_seller_fields(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.name.as_deref().map_or(true, |n| n.trim().is_empty()) {
            missing.push("name");
        }
        if self.email.as_deref().map_or(true, |e| e.trim().is_empty()) {
            missing.push("email");
        }
        missing
    }
}

/// Account as returned over the wire: never includes the password hash.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountResponse {
    pub id: String,
    pub name: Option<String>,
    pub email: Option<String>,
    pub role: AccountRole,
    pub subscription_status: SubscriptionStatus,
    pub subscription_expiry: Option<DateTime>,
    pub payments: Vec<PaymentRecord>,
}

impl From<Account> for AccountResponse {
    fn from(account: Account) -> Self {
        AccountResponse {
            id: account.id.map(|id| id.to_hex()).unwrap_or_default(),
            name: account.name,
            email: account.email,
            role: account.role,
            subscription_status: account.subscription_status,
            subscription_expiry: account.subscription_expiry,
            payments: account.payments,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account_with_ledger(charge_refs: &[&str]) -> Account {
        Account {
            id: Some(ObjectId::new()),
            name: Some("Willow Farm Stables".to_string()),
            email: Some("stables@example.com".to_string()),
            password_hash: None,
            role: AccountRole::Seller,
            stripe_customer_id: None,
            subscription_status: SubscriptionStatus::Active,
            subscription_expiry: None,
            payments: charge_refs
                .iter()
                .map(|charge_ref| PaymentRecord {
                    charge_ref: charge_ref.to_string(),
                    amount: 50.0,
                    currency: "usd".to_string(),
                    status: "succeeded".to_string(),
                    account_name: "Willow Farm Stables".to_string(),
                    account_email: "stables@example.com".to_string(),
                    booking_id: None,
                    recorded_at: DateTime::now(),
                })
                .collect(),
            is_active: true,
            created_at: DateTime::now(),
            updated_at: DateTime::now(),
        }
    }

    #[test]
    fn payment_lookup_is_keyed_by_charge_ref() {
        let account = account_with_ledger(&["pi_1", "pi_2"]);

        // a recorded charge ref resolves to its entry, an unknown one misses;
        // this lookup is what makes a replayed payment record a no-op
        assert_eq!(
            account.payment_for("pi_2").map(|p| p.charge_ref.as_str()),
            Some("pi_2")
        );
        assert!(account.payment_for("pi_3").is_none());
        assert!(account_with_ledger(&[]).payment_for("pi_1").is_none());
    }

    #[test]
    fn seller_fields_missing_when_blank_or_absent() {
        let complete = account_with_ledger(&[]);
        assert!(complete.missing_seller_fields().is_empty());

        let mut incomplete = account_with_ledger(&[]);
        incomplete.name = None;
        incomplete.email = Some("  ".to_string());
        assert_eq!(incomplete.missing_seller_fields(), vec!["name", "email"]);
    }
}
