use mongodb::bson::DateTime;

use crate::models::SubscriptionStatus;

/// Derive an account's subscription status from its expiry timestamp.
///
/// Privileged accounts (super admins) are always active. An account without an
/// expiry on record is expired; otherwise it is active strictly until the
/// expiry instant.
pub fn derive_status(
    expiry: Option<DateTime>,
    is_privileged: bool,
    now: DateTime,
) -> SubscriptionStatus {
    if is_privileged {
        return SubscriptionStatus::Active;
    }
    match expiry {
        Some(expiry) if now < expiry => SubscriptionStatus::Active,
        _ => SubscriptionStatus::Expired,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_from_expiry() {
        let now = DateTime::now();
        let hour = 60 * 60 * 1000;

        let future = DateTime::from_millis(now.timestamp_millis() + hour);
        assert_eq!(derive_status(Some(future), false, now), SubscriptionStatus::Active);

        let past = DateTime::from_millis(now.timestamp_millis() - 1000);
        assert_eq!(derive_status(Some(past), false, now), SubscriptionStatus::Expired);

        assert_eq!(derive_status(None, false, now), SubscriptionStatus::Expired);

        // expiry exactly now is already expired
        assert_eq!(derive_status(Some(now), false, now), SubscriptionStatus::Expired);
    }

    #[test]
    fn privileged_accounts_are_always_active() {
        let now = DateTime::now();
        let past = DateTime::from_millis(now.timestamp_millis() - 1000);

        assert_eq!(derive_status(Some(past), true, now), SubscriptionStatus::Active);
        assert_eq!(derive_status(None, true, now), SubscriptionStatus::Active);
    }
}
