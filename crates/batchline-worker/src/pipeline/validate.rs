//! Row validation and classification
//!
//! Every check runs on every row: width first, then each schema field in
//! order. The first failure becomes the row's error code and all of them go
//! into the detail string as `"<field>: <message>"` joined by `"; "`.

use std::sync::LazyLock;

use batchline_common::RowErrorCode;
use chrono::NaiveDate;
use regex::Regex;
use serde_json::{Map, Value};

use super::normalize::synthesized_name;
use super::schema::{Field, FieldMapping};
use crate::batch::{Classification, StagedRow};

#[allow(clippy::unwrap_used)]
static EMAIL: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap());

#[allow(clippy::unwrap_used)]
static PHONE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\+?[0-9]{7,15}$").unwrap());

#[allow(clippy::unwrap_used)]
static ISO_DATE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[0-9]{4}-[0-9]{2}-[0-9]{2}$").unwrap());

#[allow(clippy::unwrap_used)]
static DECIMAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[+-]?([0-9]+(\.[0-9]*)?|\.[0-9]+)$").unwrap());

/// Label used in details for row-level checks.
const ROW_LABEL: &str = "row";

#[derive(Debug, Clone, PartialEq, Eq)]
struct Failure {
    code: RowErrorCode,
    field: &'static str,
    message: String,
}

impl Failure {
    fn new(code: RowErrorCode, field: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            field,
            message: message.into(),
        }
    }
}

fn rejection(failures: &[Failure]) -> Option<Classification> {
    let primary = failures.first()?;
    let detail = failures
        .iter()
        .map(|f| format!("{}: {}", f.field, f.message))
        .collect::<Vec<_>>()
        .join("; ");

    Some(Classification::Rejected {
        code: primary.code,
        detail,
    })
}

/// Classifies rows against a fixed header row.
#[derive(Debug, Clone)]
pub struct RowClassifier {
    headers: Vec<String>,
    mapping: FieldMapping,
}

impl RowClassifier {
    /// `headers` must already be normalized.
    pub fn new(headers: Vec<String>) -> Self {
        let mapping = FieldMapping::resolve(&headers);
        Self { headers, mapping }
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    pub fn mapping(&self) -> &FieldMapping {
        &self.mapping
    }

    pub fn classify(&self, row_index: i64, cells: &[&[u8]]) -> StagedRow {
        let decoded: Vec<Result<&str, std::str::Utf8Error>> =
            cells.iter().map(|c| std::str::from_utf8(c)).collect();

        let undecodable: Vec<Failure> = decoded
            .iter()
            .enumerate()
            .filter(|(_, cell)| cell.is_err())
            .map(|(i, _)| {
                Failure::new(
                    RowErrorCode::UnparsableRow,
                    ROW_LABEL,
                    format!("cell {} is not valid UTF-8", i + 1),
                )
            })
            .collect();

        if let Some(classification) = rejection(&undecodable) {
            return StagedRow {
                row_index,
                classification,
                raw: None,
            };
        }

        let values: Vec<&str> = decoded.into_iter().flatten().collect();
        let raw = self.raw_object(&values);

        let mut failures = Vec::new();
        if values.len() != self.headers.len() {
            failures.push(Failure::new(
                RowErrorCode::ColumnCountMismatch,
                ROW_LABEL,
                format!("expected {} columns, found {}", self.headers.len(), values.len()),
            ));
        }

        let mut payload = Map::new();
        for field in Field::ALL {
            let value = self
                .mapping
                .column_for(field)
                .and_then(|i| values.get(i))
                .map(|v| v.trim())
                .filter(|v| !v.is_empty());

            match check_field(field, value) {
                Ok(normalized) => {
                    payload.insert(field.name().to_string(), normalized);
                }
                Err(failure) => failures.push(failure),
            }
        }

        let classification = rejection(&failures).unwrap_or(Classification::Admissible {
            payload: Value::Object(payload),
        });

        StagedRow {
            row_index,
            classification,
            raw: Some(raw),
        }
    }

    /// Original cells keyed by header. Cells past the header row get
    /// positional names.
    fn raw_object(&self, values: &[&str]) -> Value {
        let mut raw = Map::new();
        for (i, value) in values.iter().enumerate() {
            let key = match self.headers.get(i) {
                Some(header) => header.clone(),
                None => {
                    let base = synthesized_name(i + 1);
                    let mut key = base.clone();
                    let mut n = 2;
                    while raw.contains_key(&key) || self.headers.contains(&key) {
                        key = format!("{base}_{n}");
                        n += 1;
                    }
                    key
                }
            };
            raw.insert(key, Value::String((*value).to_string()));
        }
        Value::Object(raw)
    }
}

fn check_field(field: Field, value: Option<&str>) -> Result<Value, Failure> {
    let name = field.name();

    let Some(value) = value else {
        return if field.is_required() {
            Err(Failure::new(
                RowErrorCode::MissingRequiredField,
                name,
                "required value is missing",
            ))
        } else {
            Ok(Value::Null)
        };
    };

    if let Some(max) = field.max_len() {
        if value.chars().count() > max {
            return Err(Failure::new(
                RowErrorCode::ValueTooLong,
                name,
                format!("value exceeds {max} characters"),
            ));
        }
    }

    match field {
        Field::ExternalId | Field::FullName => Ok(Value::String(value.to_string())),
        Field::Email => {
            if EMAIL.is_match(value) {
                Ok(Value::String(value.to_lowercase()))
            } else {
                Err(Failure::new(RowErrorCode::InvalidEmail, name, "not a valid email address"))
            }
        }
        Field::Phone => {
            let compact: String = value
                .chars()
                .filter(|c| !matches!(c, ' ' | '-' | '.' | '(' | ')'))
                .collect();
            if PHONE.is_match(&compact) {
                Ok(Value::String(compact))
            } else {
                Err(Failure::new(
                    RowErrorCode::InvalidPhone,
                    name,
                    "expected 7 to 15 digits with an optional leading +",
                ))
            }
        }
        Field::SignupDate => {
            let valid = ISO_DATE.is_match(value)
                && NaiveDate::parse_from_str(value, "%Y-%m-%d").is_ok();
            if valid {
                Ok(Value::String(value.to_string()))
            } else {
                Err(Failure::new(RowErrorCode::InvalidDate, name, "expected a YYYY-MM-DD date"))
            }
        }
        Field::LifetimeValue => DECIMAL
            .is_match(value)
            .then(|| value.parse::<f64>().ok())
            .flatten()
            .filter(|n| n.is_finite())
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .ok_or_else(|| {
                Failure::new(RowErrorCode::InvalidNumber, name, "not a finite decimal number")
            }),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::pipeline::normalize::normalize_headers;
    use serde_json::json;

    fn classifier(headers: &[&str]) -> RowClassifier {
        RowClassifier::new(normalize_headers(headers))
    }

    fn classify(c: &RowClassifier, cells: &[&str]) -> StagedRow {
        let bytes: Vec<&[u8]> = cells.iter().map(|c| c.as_bytes()).collect();
        c.classify(1, &bytes)
    }

    fn contacts() -> RowClassifier {
        classifier(&["id", "name", "email", "phone", "signup_date", "ltv"])
    }

    #[test]
    fn test_admissible_row_is_normalized() {
        let row = classify(
            &contacts(),
            &["c-1", " Ada Lovelace ", "Ada@Example.COM", "(555) 010-4477", "2024-02-29", "12.50"],
        );

        assert_eq!(
            row.payload().unwrap(),
            &json!({
                "external_id": "c-1",
                "full_name": "Ada Lovelace",
                "email": "ada@example.com",
                "phone": "5550104477",
                "signup_date": "2024-02-29",
                "lifetime_value": 12.5,
            })
        );
        assert_eq!(row.raw.as_ref().unwrap()["name"], " Ada Lovelace ");
    }

    #[test]
    fn test_optional_fields_may_be_blank() {
        let row = classify(&contacts(), &["c-1", "Ada", "", "", "", ""]);
        let payload = row.payload().unwrap();
        assert_eq!(payload["email"], Value::Null);
        assert_eq!(payload["lifetime_value"], Value::Null);
    }

    #[test]
    fn test_collects_every_failure_in_schema_order() {
        let row = classify(&contacts(), &["c-1", "", "not-an-email", "", "", ""]);
        let (code, detail) = row.error().unwrap();

        assert_eq!(code, RowErrorCode::MissingRequiredField);
        assert_eq!(
            detail,
            "full_name: required value is missing; email: not a valid email address"
        );
        assert!(row.raw.is_some());
    }

    #[test]
    fn test_width_mismatch_comes_first() {
        let row = classify(&contacts(), &["c-1", "Ada", "a@b.co", "", "", "", "extra"]);
        let (code, detail) = row.error().unwrap();

        assert_eq!(code, RowErrorCode::ColumnCountMismatch);
        assert_eq!(detail, "row: expected 6 columns, found 7");
        assert_eq!(row.raw.as_ref().unwrap()["column_7"], "extra");
    }

    #[test]
    fn test_short_row_reports_missing_fields_too() {
        let row = classify(&contacts(), &["c-1"]);
        let (code, detail) = row.error().unwrap();
        assert_eq!(code, RowErrorCode::ColumnCountMismatch);
        assert!(detail.contains("full_name: required value is missing"));
    }

    #[test]
    fn test_format_checks() {
        let c = contacts();
        let cases = [
            (["c", "A", "a@b", "", "", ""], RowErrorCode::InvalidEmail),
            (["c", "A", "", "12345", "", ""], RowErrorCode::InvalidPhone),
            (["c", "A", "", "", "2024-02-30", ""], RowErrorCode::InvalidDate),
            (["c", "A", "", "", "2024-2-3", ""], RowErrorCode::InvalidDate),
            (["c", "A", "", "", "", "1e400"], RowErrorCode::InvalidNumber),
            (["c", "A", "", "", "", "abc"], RowErrorCode::InvalidNumber),
        ];

        for (cells, expected) in cases {
            let row = classify(&c, &cells);
            assert_eq!(row.error().map(|(code, _)| code), Some(expected), "{cells:?}");
        }
    }

    #[test]
    fn test_value_too_long() {
        let long_id = "x".repeat(129);
        let row = classify(&contacts(), &[&long_id, "Ada", "", "", "", ""]);
        assert_eq!(row.error().unwrap().0, RowErrorCode::ValueTooLong);
    }

    #[test]
    fn test_invalid_utf8_is_unparsable_without_raw() {
        let c = classifier(&["id", "name"]);
        let cells: Vec<&[u8]> = vec![b"c-1", &[0xff, 0xfe]];
        let row = c.classify(9, &cells);

        assert_eq!(row.row_index, 9);
        assert_eq!(row.error().unwrap().0, RowErrorCode::UnparsableRow);
        assert_eq!(row.error().unwrap().1, "row: cell 2 is not valid UTF-8");
        assert!(row.raw.is_none());
    }

    #[test]
    fn test_unmapped_columns_only_reach_raw() {
        let c = classifier(&["tenant_id", "id", "name", "notes"]);
        let row = classify(&c, &["other-tenant", "c-1", "Ada", "vip"]);

        let payload = row.payload().unwrap();
        assert!(payload.get("tenant_id").is_none());
        assert!(payload.get("notes").is_none());
        let raw = row.raw.unwrap();
        assert_eq!(raw["tenant_id"], "other-tenant");
        assert_eq!(raw["notes"], "vip");
    }
}
