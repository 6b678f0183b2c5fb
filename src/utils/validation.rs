use regex::Regex;
use serde_json::Value;

/// Field names that must never appear in a request body reaching the payment
/// routes. Compared against keys normalized to lowercase with separators
/// stripped, so `cardNumber`, `card_number` and `card-number` all match.
const CARD_FIELD_KEYWORDS: &[&str] = &[
    "cardnumber",
    "cardno",
    "cardnum",
    "pan",
    "cvc",
    "cvv",
    "cvv2",
    "securitycode",
    "expmonth",
    "expyear",
    "expirymonth",
    "expiryyear",
    "expdate",
    "expirydate",
    "cardexpiry",
];

/// Outcome of scanning a payload for raw card data.
#[derive(Debug, PartialEq)]
pub enum CardDataViolation {
    /// A key from the card-field keyword list was present.
    ForbiddenField(String),
    /// A string value contained a Luhn-valid 13-19 digit sequence.
    CardShapedValue,
}

fn normalize_key(key: &str) -> String {
    key.chars()
        .filter(|c| *c != '_' && *c != '-')
        .collect::<String>()
        .to_lowercase()
}

pub fn is_card_field(key: &str) -> bool {
    let normalized = normalize_key(key);
    CARD_FIELD_KEYWORDS.contains(&normalized.as_str())
}

/// Luhn checksum over a digits-only string.
pub fn luhn_valid(digits: &str) -> bool {
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return false;
    }
    let mut sum = 0u32;
    for (i, c) in digits.chars().rev().enumerate() {
        let mut d = c.to_digit(10).unwrap();
        if i % 2 == 1 {
            d *= 2;
            if d > 9 {
                d -= 9;
            }
        }
        sum += d;
    }
    sum % 10 == 0
}

fn card_run_regex() -> Regex {
    // 13-19 digits, optionally separated by single spaces or dashes
    Regex::new(r"\d(?:[ \-]?\d){12,18}").unwrap()
}

/// True if the text contains something shaped like a primary account number:
/// a 13-19 digit run (separators allowed) that passes the Luhn check.
pub fn contains_card_number(text: &str) -> bool {
    for m in card_run_regex().find_iter(text) {
        let digits: String = m.as_str().chars().filter(|c| c.is_ascii_digit()).collect();
        if (13..=19).contains(&digits.len()) && luhn_valid(&digits) {
            return true;
        }
    }
    false
}

/// Walk a JSON payload and reject it if raw card data could be in transit.
/// This runs before any amount or metadata reaches the payment gateway.
pub fn scan_for_card_data(value: &Value) -> Result<(), CardDataViolation> {
    match value {
        Value::Object(map) => {
            for (key, inner) in map {
                if is_card_field(key) {
                    return Err(CardDataViolation::ForbiddenField(key.clone()));
                }
                scan_for_card_data(inner)?;
            }
            Ok(())
        }
        Value::Array(items) => {
            for item in items {
                scan_for_card_data(item)?;
            }
            Ok(())
        }
        Value::String(s) => {
            if contains_card_number(s) {
                Err(CardDataViolation::CardShapedValue)
            } else {
                Ok(())
            }
        }
        Value::Number(n) => {
            // A bare numeric PAN deserializes as a number, not a string
            if contains_card_number(&n.to_string()) {
                Err(CardDataViolation::CardShapedValue)
            } else {
                Ok(())
            }
        }
        _ => Ok(()),
    }
}

/// Produce a copy of the payload safe for logging: values under card-keyword
/// fields and any card-shaped substrings are replaced with a marker.
pub fn redact_card_data(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = serde_json::Map::new();
            for (key, inner) in map {
                if is_card_field(key) {
                    out.insert(key.clone(), Value::String("[REDACTED]".to_string()));
                } else {
                    out.insert(key.clone(), redact_card_data(inner));
                }
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(redact_card_data).collect()),
        Value::String(s) => {
            if contains_card_number(s) {
                Value::String(card_run_regex().replace_all(s, "[REDACTED]").to_string())
            } else {
                Value::String(s.clone())
            }
        }
        Value::Number(n) => {
            if contains_card_number(&n.to_string()) {
                Value::String("[REDACTED]".to_string())
            } else {
                value.clone()
            }
        }
        other => other.clone(),
    }
}

/// Parse a calendar date off the wire. Accepts `YYYY-MM-DD` or a full RFC 3339
/// timestamp, since clients send both.
pub fn parse_date(raw: &str) -> Option<chrono::NaiveDate> {
    let trimmed = raw.trim();
    if let Ok(date) = chrono::NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
        return Some(date);
    }
    chrono::DateTime::parse_from_rfc3339(trimmed)
        .ok()
        .map(|dt| dt.date_naive())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn luhn_accepts_known_test_pans() {
        assert!(luhn_valid("4242424242424242"));
        assert!(luhn_valid("5555555555554444"));
        assert!(!luhn_valid("4242424242424241"));
        assert!(!luhn_valid(""));
    }

    #[test]
    fn detects_separated_card_numbers() {
        assert!(contains_card_number("4242 4242 4242 4242"));
        assert!(contains_card_number("card: 4242-4242-4242-4242 thanks"));
        // 16 digits but fails Luhn
        assert!(!contains_card_number("1234567890123456"));
        // too short to be a PAN
        assert!(!contains_card_number("424242424242"));
    }

    #[test]
    fn rejects_keyword_fields_regardless_of_value() {
        let body = json!({ "cardNumber": "not even digits", "amount": 50 });
        assert_eq!(
            scan_for_card_data(&body),
            Err(CardDataViolation::ForbiddenField("cardNumber".to_string()))
        );

        let body = json!({ "metadata": { "exp_month": 12 } });
        assert_eq!(
            scan_for_card_data(&body),
            Err(CardDataViolation::ForbiddenField("exp_month".to_string()))
        );
    }

    #[test]
    fn rejects_card_shaped_values_in_nested_payloads() {
        let body = json!({ "note": ["fine", "4242424242424242"] });
        assert_eq!(
            scan_for_card_data(&body),
            Err(CardDataViolation::CardShapedValue)
        );
    }

    #[test]
    fn accepts_payment_method_references() {
        let body = json!({ "paymentMethodId": "pm_123", "amount": 2300, "currency": "usd" });
        assert_eq!(scan_for_card_data(&body), Ok(()));
    }

    #[test]
    fn redaction_strips_pan_and_keyword_values() {
        let body = json!({ "cvc": "123", "note": "pan 4242424242424242 here" });
        let redacted = redact_card_data(&body);
        assert_eq!(redacted["cvc"], "[REDACTED]");
        assert_eq!(redacted["note"], "pan [REDACTED] here");
    }

    #[test]
    fn parses_both_date_formats() {
        assert!(parse_date("2024-01-10").is_some());
        assert!(parse_date("2024-01-10T12:00:00Z").is_some());
        assert!(parse_date("10/01/2024").is_none());
    }
}
