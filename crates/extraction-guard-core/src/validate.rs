//! Format validation for completion-service suggestions.
//!
//! A suggestion is only eligible for merge once its raw JSON value has been
//! converted into the [`FieldData`] shape its [`FieldKind`] demands. Anything
//! that fails is dropped individually; the rest of the group still merges.

use chrono::{Datelike, NaiveDate};
use serde_json::Value;
use thiserror::Error;

use crate::fields::{CanonicalField, FieldKind};
use crate::models::{Address, FieldData};

const MAX_TEXT_LEN: usize = 256;
const MAX_ABS_AMOUNT: f64 = 1_000_000_000.0;
const DATE_FORMATS: [&str; 2] = ["%Y-%m-%d", "%Y/%m/%d"];

/// Why a suggested value was refused.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("'{0}' is not a canonical field")]
    UnknownField(String),
    #[error("field {0} was not requested in this group")]
    OutsideGroup(CanonicalField),
    #[error("{field}: expected {expected}")]
    WrongType {
        field: CanonicalField,
        expected: &'static str,
    },
    #[error("{field}: {reason}")]
    BadFormat {
        field: CanonicalField,
        reason: String,
    },
    #[error("{field}: value {value} out of range")]
    OutOfRange { field: CanonicalField, value: f64 },
}

/// A suggestion that passed validation.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedSuggestion {
    pub field: CanonicalField,
    pub data: FieldData,
}

/// Result of screening one group's response payload.
#[derive(Debug, Clone, Default)]
pub struct ScreenedSuggestions {
    pub accepted: Vec<ValidatedSuggestion>,
    pub rejected: Vec<ValidationError>,
}

/// Screen a completion-service response for one group.
///
/// The payload must be a JSON object mapping field names to values. Unknown
/// names, names outside `requested`, and malformed values are rejected one
/// by one. `null` values mean "no suggestion" and are skipped silently.
/// Returns `None` when the payload is not an object at all.
pub fn screen_suggestions(
    requested: &[CanonicalField],
    payload: &Value,
) -> Option<ScreenedSuggestions> {
    let map = payload.as_object()?;
    let mut screened = ScreenedSuggestions::default();

    for (name, raw) in map {
        if raw.is_null() {
            continue;
        }
        let field = match name.parse::<CanonicalField>() {
            Ok(f) => f,
            Err(_) => {
                screened
                    .rejected
                    .push(ValidationError::UnknownField(name.clone()));
                continue;
            }
        };
        if !requested.contains(&field) {
            screened.rejected.push(ValidationError::OutsideGroup(field));
            continue;
        }
        match validate_value(field, raw) {
            Ok(data) => screened.accepted.push(ValidatedSuggestion { field, data }),
            Err(e) => screened.rejected.push(e),
        }
    }

    Some(screened)
}

/// Convert a raw JSON value into typed data for `field`.
pub fn validate_value(field: CanonicalField, raw: &Value) -> Result<FieldData, ValidationError> {
    match field.kind() {
        FieldKind::Text => validate_text(field, raw),
        FieldKind::Date => validate_date(field, raw),
        FieldKind::Amount => validate_amount(field, raw),
        FieldKind::CurrencyCode => validate_currency(field, raw),
        FieldKind::Address => validate_address(field, raw),
    }
}

fn validate_text(field: CanonicalField, raw: &Value) -> Result<FieldData, ValidationError> {
    let text = match raw {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => {
            return Err(ValidationError::WrongType {
                field,
                expected: "string",
            })
        }
    };
    if text.is_empty() {
        return Err(bad(field, "empty text"));
    }
    if text.chars().count() > MAX_TEXT_LEN {
        return Err(bad(field, format!("longer than {} characters", MAX_TEXT_LEN)));
    }
    if field == CanonicalField::VendorTaxId
        && !text
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == ' ' || c == '-')
    {
        return Err(bad(field, "tax id may only hold letters, digits, spaces and hyphens"));
    }
    Ok(FieldData::Text(text))
}

fn validate_date(field: CanonicalField, raw: &Value) -> Result<FieldData, ValidationError> {
    let s = raw.as_str().ok_or(ValidationError::WrongType {
        field,
        expected: "date string",
    })?;
    let date = DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(s.trim(), fmt).ok())
        .ok_or_else(|| bad(field, format!("'{}' is not YYYY-MM-DD", s)))?;
    if !(1990..=2100).contains(&date.year()) {
        return Err(bad(field, format!("year {} is implausible", date.year())));
    }
    Ok(FieldData::Date(date))
}

fn validate_amount(field: CanonicalField, raw: &Value) -> Result<FieldData, ValidationError> {
    let value = match raw {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => parse_money(s),
        _ => None,
    }
    .ok_or(ValidationError::WrongType {
        field,
        expected: "number",
    })?;

    if !value.is_finite() || value.abs() > MAX_ABS_AMOUNT {
        return Err(ValidationError::OutOfRange { field, value });
    }
    let non_negative = !matches!(
        field,
        CanonicalField::Subtotal | CanonicalField::InvoiceTotal
    );
    if non_negative && value < 0.0 {
        return Err(ValidationError::OutOfRange { field, value });
    }
    Ok(FieldData::Amount((value * 100.0).round() / 100.0))
}

fn parse_money(s: &str) -> Option<f64> {
    let cleaned: String = s
        .trim()
        .chars()
        .filter(|c| !matches!(c, '$' | ',' | ' '))
        .collect();
    cleaned.parse::<f64>().ok()
}

fn validate_currency(field: CanonicalField, raw: &Value) -> Result<FieldData, ValidationError> {
    let s = raw.as_str().ok_or(ValidationError::WrongType {
        field,
        expected: "ISO 4217 code",
    })?;
    let code = s.trim().to_ascii_uppercase();
    if code.len() != 3 || !code.chars().all(|c| c.is_ascii_uppercase()) {
        return Err(bad(field, format!("'{}' is not a three-letter currency code", s)));
    }
    Ok(FieldData::Text(code))
}

fn validate_address(field: CanonicalField, raw: &Value) -> Result<FieldData, ValidationError> {
    let address = match raw {
        Value::Object(_) => serde_json::from_value::<Address>(raw.clone()).map_err(|_| {
            ValidationError::WrongType {
                field,
                expected: "address object with street and city",
            }
        })?,
        Value::String(s) => address_from_line(s).ok_or_else(|| {
            bad(field, "address line needs at least street and city")
        })?,
        _ => {
            return Err(ValidationError::WrongType {
                field,
                expected: "address",
            })
        }
    };

    if address.street.trim().is_empty() || address.city.trim().is_empty() {
        return Err(bad(field, "street and city are required"));
    }
    if let Some(postal) = &address.postal_code {
        let ok = (3..=10).contains(&postal.trim().len())
            && postal
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == ' ' || c == '-');
        if !ok {
            return Err(bad(field, format!("malformed postal code '{}'", postal)));
        }
    }
    Ok(FieldData::Address(address))
}

/// Split `"street, city[, region[ postal]][, country]"`.
fn address_from_line(line: &str) -> Option<Address> {
    let parts: Vec<&str> = line
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect();
    if parts.len() < 2 {
        return None;
    }
    let (region, postal_code) = match parts.get(2) {
        Some(rest) => match rest.split_once(' ') {
            Some((region, postal)) => (Some(region.to_string()), Some(postal.trim().to_string())),
            None => (Some(rest.to_string()), None),
        },
        None => (None, None),
    };
    Some(Address {
        street: parts[0].to_string(),
        city: parts[1].to_string(),
        region,
        postal_code,
        country: parts.get(3).map(|c| c.to_string()),
    })
}

fn bad(field: CanonicalField, reason: impl Into<String>) -> ValidationError {
    ValidationError::BadFormat {
        field,
        reason: reason.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_date_formats() {
        let ok = validate_value(CanonicalField::InvoiceDate, &json!("2024-03-15")).unwrap();
        assert_eq!(
            ok,
            FieldData::Date(NaiveDate::from_ymd_opt(2024, 3, 15).unwrap())
        );
        assert!(validate_value(CanonicalField::InvoiceDate, &json!("15 March")).is_err());
        assert!(validate_value(CanonicalField::DueDate, &json!("1850-01-01")).is_err());
        assert!(validate_value(CanonicalField::DueDate, &json!(20240315)).is_err());
    }

    #[test]
    fn test_amount_parsing_and_range() {
        assert_eq!(
            validate_value(CanonicalField::InvoiceTotal, &json!("$1,234.50")).unwrap(),
            FieldData::Amount(1234.5)
        );
        assert!(matches!(
            validate_value(CanonicalField::GstAmount, &json!(-3.0)),
            Err(ValidationError::OutOfRange { .. })
        ));
        assert!(validate_value(CanonicalField::Subtotal, &json!(-3.0)).is_ok());
        assert!(validate_value(CanonicalField::Subtotal, &json!(1e12)).is_err());
        assert!(validate_value(CanonicalField::Subtotal, &json!("abc")).is_err());
    }

    #[test]
    fn test_currency_code() {
        assert_eq!(
            validate_value(CanonicalField::Currency, &json!("cad")).unwrap(),
            FieldData::Text("CAD".into())
        );
        assert!(validate_value(CanonicalField::Currency, &json!("dollars")).is_err());
    }

    #[test]
    fn test_address_shapes() {
        let from_obj = validate_value(
            CanonicalField::BillingAddress,
            &json!({"street": "1 Main St", "city": "Toronto", "postal_code": "M5V 1A1"}),
        )
        .unwrap();
        assert!(matches!(from_obj, FieldData::Address(ref a) if a.city == "Toronto"));

        let from_line = validate_value(
            CanonicalField::VendorAddress,
            &json!("12 King St, Ottawa, ON K1A0B1, Canada"),
        )
        .unwrap();
        match from_line {
            FieldData::Address(a) => {
                assert_eq!(a.street, "12 King St");
                assert_eq!(a.region.as_deref(), Some("ON"));
                assert_eq!(a.postal_code.as_deref(), Some("K1A0B1"));
                assert_eq!(a.country.as_deref(), Some("Canada"));
            }
            other => panic!("expected address, got {:?}", other),
        }

        assert!(validate_value(CanonicalField::VendorAddress, &json!("Ottawa")).is_err());
        assert!(validate_value(
            CanonicalField::VendorAddress,
            &json!({"street": "1 Main", "city": "X", "postal_code": "!!"})
        )
        .is_err());
    }

    #[test]
    fn test_screen_drops_bad_entries_keeps_good() {
        let requested = [CanonicalField::InvoiceNumber, CanonicalField::InvoiceDate];
        let payload = json!({
            "invoice_number": "INV-7",
            "invoice_date": "not a date",
            "password": "hunter2",
            "subtotal": 10.0,
            "due_date": null
        });
        let screened = screen_suggestions(&requested, &payload).unwrap();
        assert_eq!(screened.accepted.len(), 1);
        assert_eq!(screened.accepted[0].field, CanonicalField::InvoiceNumber);
        assert_eq!(screened.rejected.len(), 3);
        assert!(screened
            .rejected
            .contains(&ValidationError::UnknownField("password".into())));
        assert!(screened
            .rejected
            .contains(&ValidationError::OutsideGroup(CanonicalField::Subtotal)));
    }

    #[test]
    fn test_screen_rejects_non_object() {
        assert!(screen_suggestions(&[CanonicalField::Subtotal], &json!([1, 2])).is_none());
    }
}
