use std::collections::HashMap;
use std::time::Duration;

use hmac::{Hmac, Mac};
use log::warn;
use reqwest::Client;
use serde::Deserialize;
use sha2::Sha256;
use thiserror::Error;

const STRIPE_API_BASE: &str = "https://api.stripe.com/v1";

/// Every outbound processor call carries this deadline.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum StripeError {
    #[error("Stripe is not configured")]
    NotConfigured,
    #[error("Stripe request timed out")]
    Timeout,
    #[error("Stripe request failed: {0}")]
    Http(String),
    #[error("Stripe error: {message}")]
    Api {
        message: String,
        code: Option<String>,
    },
    #[error("Invalid webhook signature")]
    BadSignature,
}

impl StripeError {
    pub fn is_missing_resource(&self) -> bool {
        matches!(
            self,
            StripeError::Api { code: Some(code), .. } if code == "resource_missing"
        )
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct StripeCustomer {
    pub id: String,
    pub email: Option<String>,
    pub name: Option<String>,
    #[serde(default)]
    pub deleted: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StripePaymentIntent {
    pub id: String,
    pub status: String,
    pub amount: i64,
    pub currency: String,
    pub client_secret: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl StripePaymentIntent {
    pub fn succeeded(&self) -> bool {
        self.status == "succeeded"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct StripeSetupIntent {
    pub id: String,
    pub status: String,
    pub client_secret: Option<String>,
    pub customer: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StripeErrorBody {
    error: StripeErrorDetail,
}

#[derive(Debug, Deserialize)]
struct StripeErrorDetail {
    message: Option<String>,
    code: Option<String>,
    /// On a declined off-session confirmation Stripe embeds the intent here,
    /// typically in `requires_action` awaiting 3-D Secure.
    payment_intent: Option<StripePaymentIntent>,
}

/// Upstream callers inconsistently pass major or minor currency units. Amounts
/// at or above 100 are taken as already being in minor units; anything smaller
/// is multiplied by 100. Legacy heuristic, kept for wire compatibility and
/// isolated here so it can be corrected in one place.
pub fn normalize_amount(raw: f64) -> i64 {
    if raw >= 100.0 {
        raw.round() as i64
    } else {
        (raw * 100.0).round() as i64
    }
}

pub struct StripeService;

impl StripeService {
    fn secret_key() -> Result<String, StripeError> {
        crate::config::Config::stripe_secret_key().ok_or(StripeError::NotConfigured)
    }

    fn http() -> Result<Client, StripeError> {
        Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| StripeError::Http(e.to_string()))
    }

    async fn send<T: for<'de> Deserialize<'de>>(
        request: reqwest::RequestBuilder,
    ) -> Result<T, StripeError> {
        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                StripeError::Timeout
            } else {
                StripeError::Http(e.to_string())
            }
        })?;

        if response.status().is_success() {
            return response
                .json::<T>()
                .await
                .map_err(|e| StripeError::Http(e.to_string()));
        }

        let body = response
            .json::<StripeErrorBody>()
            .await
            .map_err(|e| StripeError::Http(e.to_string()))?;
        Err(StripeError::Api {
            message: body
                .error
                .message
                .unwrap_or_else(|| "unknown Stripe error".to_string()),
            code: body.error.code,
        })
    }

    pub async fn retrieve_customer(customer_ref: &str) -> Result<StripeCustomer, StripeError> {
        let key = Self::secret_key()?;
        let request = Self::http()?
            .get(format!("{}/customers/{}", STRIPE_API_BASE, customer_ref))
            .bearer_auth(&key);
        Self::send(request).await
    }

    pub async fn create_customer(
        email: Option<&str>,
        name: Option<&str>,
        account_id: &str,
    ) -> Result<StripeCustomer, StripeError> {
        let key = Self::secret_key()?;
        let mut params: Vec<(String, String)> =
            vec![("metadata[account_id]".to_string(), account_id.to_string())];
        if let Some(email) = email {
            params.push(("email".to_string(), email.to_string()));
        }
        if let Some(name) = name {
            params.push(("name".to_string(), name.to_string()));
        }

        let request = Self::http()?
            .post(format!("{}/customers", STRIPE_API_BASE))
            .bearer_auth(&key)
            .form(&params);
        Self::send(request).await
    }

    /// Resolve a usable processor customer for an account: retrieve the stored
    /// reference if there is one, create otherwise. A create racing a
    /// concurrent retrieve is tolerated by re-retrieving on failure.
    pub async fn ensure_customer(
        stored_ref: Option<&str>,
        email: Option<&str>,
        name: Option<&str>,
        account_id: &str,
    ) -> Result<StripeCustomer, StripeError> {
        if let Some(customer_ref) = stored_ref {
            match Self::retrieve_customer(customer_ref).await {
                Ok(customer) if !customer.deleted => return Ok(customer),
                Ok(_) => {} // deleted on the processor side, recreate
                Err(e) if e.is_missing_resource() => {}
                Err(e) => return Err(e),
            }
        }

        match Self::create_customer(email, name, account_id).await {
            Ok(customer) => Ok(customer),
            Err(create_err) => {
                // Another request may have created the customer first.
                if let Some(customer_ref) = stored_ref {
                    if let Ok(customer) = Self::retrieve_customer(customer_ref).await {
                        if !customer.deleted {
                            warn!(
                                "customer create raced an existing record for account {}",
                                account_id
                            );
                            return Ok(customer);
                        }
                    }
                }
                Err(create_err)
            }
        }
    }

    /// One-time charge intent for client-side confirmation. `amount_cents`
    /// must already be normalized via [`normalize_amount`].
    pub async fn create_payment_intent(
        amount_cents: i64,
        currency: &str,
        metadata: &[(&str, String)],
    ) -> Result<StripePaymentIntent, StripeError> {
        let key = Self::secret_key()?;
        let mut params: Vec<(String, String)> = vec![
            ("amount".to_string(), amount_cents.to_string()),
            ("currency".to_string(), currency.to_string()),
            (
                "automatic_payment_methods[enabled]".to_string(),
                "true".to_string(),
            ),
        ];
        for (k, v) in metadata {
            params.push((format!("metadata[{}]", k), v.clone()));
        }

        let request = Self::http()?
            .post(format!("{}/payment_intents", STRIPE_API_BASE))
            .bearer_auth(&key)
            .form(&params);
        Self::send(request).await
    }

    /// Setup intent whose client secret lets the front end register a reusable
    /// payment method against the customer.
    pub async fn create_setup_intent(
        customer_ref: &str,
    ) -> Result<StripeSetupIntent, StripeError> {
        let key = Self::secret_key()?;
        let params = [
            ("customer", customer_ref),
            ("usage", "off_session"),
        ];

        let request = Self::http()?
            .post(format!("{}/setup_intents", STRIPE_API_BASE))
            .bearer_auth(&key)
            .form(&params);
        Self::send(request).await
    }

    /// Off-session charge against a stored payment method. The idempotency key
    /// makes a retried call return the original intent instead of charging
    /// again. A declined confirmation that left the intent in `requires_action`
    /// is returned as that intent, not as an error; the caller decides what a
    /// non-`succeeded` status means.
    pub async fn charge_saved_method(
        customer_ref: &str,
        payment_method_ref: &str,
        amount_cents: i64,
        currency: &str,
        metadata: &[(&str, String)],
        idempotency_key: &str,
    ) -> Result<StripePaymentIntent, StripeError> {
        let key = Self::secret_key()?;
        let mut params: Vec<(String, String)> = vec![
            ("amount".to_string(), amount_cents.to_string()),
            ("currency".to_string(), currency.to_string()),
            ("customer".to_string(), customer_ref.to_string()),
            ("payment_method".to_string(), payment_method_ref.to_string()),
            ("off_session".to_string(), "true".to_string()),
            ("confirm".to_string(), "true".to_string()),
        ];
        for (k, v) in metadata {
            params.push((format!("metadata[{}]", k), v.clone()));
        }

        let request = Self::http()?
            .post(format!("{}/payment_intents", STRIPE_API_BASE))
            .bearer_auth(&key)
            .header("Idempotency-Key", idempotency_key)
            .form(&params);

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                StripeError::Timeout
            } else {
                StripeError::Http(e.to_string())
            }
        })?;

        if response.status().is_success() {
            return response
                .json::<StripePaymentIntent>()
                .await
                .map_err(|e| StripeError::Http(e.to_string()));
        }

        let body = response
            .json::<StripeErrorBody>()
            .await
            .map_err(|e| StripeError::Http(e.to_string()))?;
        if let Some(intent) = body.error.payment_intent {
            // e.g. authentication_required: surface the intent unmodified
            return Ok(intent);
        }
        Err(StripeError::Api {
            message: body
                .error
                .message
                .unwrap_or_else(|| "unknown Stripe error".to_string()),
            code: body.error.code,
        })
    }

    /// Verify a `Stripe-Signature` header: HMAC-SHA256 over
    /// `<timestamp>.<payload>` with the webhook secret, within a replay
    /// tolerance window.
    pub fn verify_webhook_signature(
        payload: &str,
        signature_header: &str,
        secret: &str,
        tolerance_secs: i64,
    ) -> Result<(), StripeError> {
        let mut timestamp: Option<i64> = None;
        let mut signatures: Vec<&str> = Vec::new();
        for part in signature_header.split(',') {
            match part.trim().split_once('=') {
                Some(("t", value)) => timestamp = value.parse().ok(),
                Some(("v1", value)) => signatures.push(value),
                _ => {}
            }
        }

        let timestamp = timestamp.ok_or(StripeError::BadSignature)?;
        if signatures.is_empty() {
            return Err(StripeError::BadSignature);
        }

        let age = chrono::Utc::now().timestamp() - timestamp;
        if age.abs() > tolerance_secs {
            return Err(StripeError::BadSignature);
        }

        let signed_payload = format!("{}.{}", timestamp, payload);
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
            .map_err(|_| StripeError::BadSignature)?;
        mac.update(signed_payload.as_bytes());
        let expected = hex::encode(mac.finalize().into_bytes());

        if signatures.iter().any(|sig| *sig == expected) {
            Ok(())
        } else {
            Err(StripeError::BadSignature)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_boundary_at_one_hundred() {
        assert_eq!(normalize_amount(23.0), 2300);
        assert_eq!(normalize_amount(99.0), 9900);
        assert_eq!(normalize_amount(100.0), 100);
        assert_eq!(normalize_amount(2300.0), 2300);
    }

    #[test]
    fn normalize_rounds_fractional_major_units() {
        assert_eq!(normalize_amount(19.99), 1999);
        assert_eq!(normalize_amount(0.5), 50);
    }

    #[test]
    fn webhook_signature_roundtrip() {
        let secret = "whsec_test";
        let payload = r#"{"id":"evt_1"}"#;
        let timestamp = chrono::Utc::now().timestamp();

        let signed = format!("{}.{}", timestamp, payload);
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(signed.as_bytes());
        let sig = hex::encode(mac.finalize().into_bytes());

        let header = format!("t={},v1={}", timestamp, sig);
        assert!(
            StripeService::verify_webhook_signature(payload, &header, secret, 300).is_ok()
        );
        assert!(
            StripeService::verify_webhook_signature(payload, &header, "whsec_other", 300)
                .is_err()
        );

        let stale = format!("t={},v1={}", timestamp - 10_000, sig);
        assert!(
            StripeService::verify_webhook_signature(payload, &stale, secret, 300).is_err()
        );
    }
}
