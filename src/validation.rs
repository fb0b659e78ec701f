//! Strict validation and lenient conversion of untyped payloads against a
//! collection's field definitions.
//!
//! Writes go through both passes: [`validate_record`] rejects anything that
//! does not fit the declared types and rules, then [`convert_record`] turns
//! the surviving values into their typed storage form and applies defaults.

use crate::catalog::schema::{Field, is_server_managed};
use crate::catalog::types::{DynamicValue, FieldType, Record};
use crate::query::operators::like_match;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use std::collections::HashMap;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("field '{field}' is required")]
    Required { field: String },
    #[error("field '{field}' expects a {expected} value")]
    TypeMismatch { field: String, expected: String },
    #[error("field '{field}' {rule}")]
    Rule { field: String, rule: String },
    #[error("unknown field '{field}'")]
    UnknownField { field: String },
}

impl ValidationError {
    pub fn field(&self) -> &str {
        match self {
            ValidationError::Required { field }
            | ValidationError::TypeMismatch { field, .. }
            | ValidationError::Rule { field, .. }
            | ValidationError::UnknownField { field } => field,
        }
    }
}

/// Handling of payload keys that match no field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnknownKeys {
    Reject,
    Drop,
}

/// Whether the payload describes a whole new row or a partial update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationMode {
    /// Every required field must be present; defaults fill absent fields.
    Create,
    /// Only keys present are checked; no defaults.
    Patch,
}

fn mismatch(field: &Field) -> ValidationError {
    ValidationError::TypeMismatch {
        field: field.name.clone(),
        expected: field.field_type.as_str().to_string(),
    }
}

fn rule(field: &Field, rule: impl Into<String>) -> ValidationError {
    ValidationError::Rule {
        field: field.name.clone(),
        rule: rule.into(),
    }
}

fn parse_number(raw: &str) -> Option<f64> {
    raw.trim().parse::<f64>().ok().filter(|f| f.is_finite())
}

fn parse_integer(raw: &str) -> Option<i64> {
    let raw = raw.trim();
    raw.parse::<i64>()
        .ok()
        .or_else(|| parse_number(raw).and_then(truncate))
}

fn truncate(f: f64) -> Option<i64> {
    let t = f.trunc();
    (t.is_finite() && t >= i64::MIN as f64 && t <= i64::MAX as f64).then_some(t as i64)
}

const BOOL_TRUE_STRICT: [&str; 2] = ["true", "1"];
const BOOL_FALSE_STRICT: [&str; 2] = ["false", "0"];
const BOOL_TRUE_LENIENT: [&str; 4] = ["true", "1", "yes", "on"];
const BOOL_FALSE_LENIENT: [&str; 4] = ["false", "0", "no", "off"];

/// Accepted date/time layouts, tried in order.
pub fn parse_datetime(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return date.and_hms_opt(0, 0, 0).map(|dt| dt.and_utc());
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|dt| dt.and_utc())
}

/// Checks that a non-null value fits the field's declared type.
fn validate_type(field: &Field, value: &DynamicValue) -> Result<(), ValidationError> {
    let ok = match (&field.field_type, value) {
        (_, DynamicValue::Null) => true,
        (FieldType::Other(_), _) => true,
        (FieldType::String | FieldType::Text, DynamicValue::Text(_)) => true,
        (FieldType::Integer | FieldType::Decimal, DynamicValue::Integer(_)) => true,
        (FieldType::Integer | FieldType::Decimal, DynamicValue::Decimal(f)) => f.is_finite(),
        (FieldType::Integer, DynamicValue::Text(s)) => parse_integer(s).is_some(),
        (FieldType::Decimal, DynamicValue::Text(s)) => parse_number(s).is_some(),
        (FieldType::Boolean, DynamicValue::Boolean(_)) => true,
        (FieldType::Boolean, DynamicValue::Text(s)) => {
            let s = s.trim().to_ascii_lowercase();
            BOOL_TRUE_STRICT.contains(&s.as_str()) || BOOL_FALSE_STRICT.contains(&s.as_str())
        }
        (FieldType::Json, DynamicValue::Json(_)) => true,
        (FieldType::Json, DynamicValue::Text(s)) => serde_json::from_str::<serde_json::Value>(s).is_ok(),
        (FieldType::DateTime, DynamicValue::Timestamp(_)) => true,
        (FieldType::DateTime, DynamicValue::Text(s)) => parse_datetime(s).is_some(),
        (FieldType::Uuid | FieldType::Relation, DynamicValue::Text(s)) => Uuid::parse_str(s).is_ok(),
        _ => false,
    };
    if ok { Ok(()) } else { Err(mismatch(field)) }
}

/// Applies declarative rules to a value that already passed type validation.
fn validate_rules(field: &Field, value: &DynamicValue) -> Result<(), ValidationError> {
    let rules = &field.validation;
    if rules.is_empty() || value.is_empty() {
        return Ok(());
    }
    match field.field_type {
        FieldType::String | FieldType::Text => {
            let text = value.to_text();
            let len = text.chars().count();
            if let Some(min) = rules.min_length
                && len < min
            {
                return Err(rule(field, format!("must be at least {min} characters")));
            }
            if let Some(max) = rules.max_length
                && len > max
            {
                return Err(rule(field, format!("must be at most {max} characters")));
            }
            if let Some(pattern) = &rules.pattern
                && !like_match(&text, pattern)
            {
                return Err(rule(field, format!("must match '{pattern}'")));
            }
        }
        FieldType::Integer | FieldType::Decimal => {
            let number = match value {
                DynamicValue::Text(s) => parse_number(s),
                other => other.as_f64(),
            };
            let Some(number) = number else {
                return Ok(());
            };
            if let Some(min) = rules.min
                && number < min
            {
                return Err(rule(field, format!("must be at least {min}")));
            }
            if let Some(max) = rules.max
                && number > max
            {
                return Err(rule(field, format!("must be at most {max}")));
            }
        }
        _ => {}
    }
    Ok(())
}

/// Strict check of one value: type first, then rules.
pub fn validate_value(field: &Field, value: &DynamicValue) -> Result<(), ValidationError> {
    validate_type(field, value)?;
    validate_rules(field, value)
}

/// Lenient conversion of one value into its typed storage form.
pub fn convert_value(field: &Field, value: &DynamicValue) -> Result<DynamicValue, ValidationError> {
    if value.is_null() {
        return Ok(DynamicValue::Null);
    }
    let converted = match (&field.field_type, value) {
        (FieldType::Other(_), v) => Some(v.clone()),
        (FieldType::String | FieldType::Text, DynamicValue::Text(s)) => Some(DynamicValue::Text(s.clone())),
        (FieldType::String | FieldType::Text, v) => Some(DynamicValue::text(v.to_text())),
        (FieldType::Integer, DynamicValue::Integer(i)) => Some(DynamicValue::Integer(*i)),
        (FieldType::Integer, DynamicValue::Decimal(f)) => truncate(*f).map(DynamicValue::Integer),
        (FieldType::Integer, DynamicValue::Text(s)) => parse_integer(s).map(DynamicValue::Integer),
        (FieldType::Decimal, DynamicValue::Integer(i)) => Some(DynamicValue::Decimal(*i as f64)),
        (FieldType::Decimal, DynamicValue::Decimal(f)) => f.is_finite().then_some(DynamicValue::Decimal(*f)),
        (FieldType::Decimal, DynamicValue::Text(s)) => parse_number(s).map(DynamicValue::Decimal),
        (FieldType::Boolean, DynamicValue::Boolean(b)) => Some(DynamicValue::Boolean(*b)),
        (FieldType::Boolean, DynamicValue::Integer(i)) => Some(DynamicValue::Boolean(*i != 0)),
        (FieldType::Boolean, DynamicValue::Decimal(f)) => Some(DynamicValue::Boolean(*f != 0.0)),
        (FieldType::Boolean, DynamicValue::Text(s)) => {
            let s = s.trim().to_ascii_lowercase();
            if BOOL_TRUE_LENIENT.contains(&s.as_str()) {
                Some(DynamicValue::Boolean(true))
            } else if BOOL_FALSE_LENIENT.contains(&s.as_str()) {
                Some(DynamicValue::Boolean(false))
            } else {
                None
            }
        }
        (FieldType::Json, DynamicValue::Json(v)) => Some(DynamicValue::Json(v.clone())),
        (FieldType::Json, DynamicValue::Text(s)) => serde_json::from_str(s).ok().map(DynamicValue::Json),
        (FieldType::DateTime, DynamicValue::Timestamp(ts)) => Some(DynamicValue::Timestamp(*ts)),
        (FieldType::DateTime, DynamicValue::Text(s)) => parse_datetime(s).map(DynamicValue::Timestamp),
        (FieldType::Uuid | FieldType::Relation, DynamicValue::Text(s)) => {
            Uuid::parse_str(s).ok().map(DynamicValue::uuid)
        }
        _ => None,
    };
    converted.ok_or_else(|| mismatch(field))
}

/// The field's declared default in typed form.
pub fn default_value(field: &Field) -> Result<Option<DynamicValue>, ValidationError> {
    match &field.default_value {
        Some(raw) => convert_value(field, &DynamicValue::text(raw.as_str())).map(Some),
        None => Ok(None),
    }
}

fn index(fields: &[Field]) -> HashMap<&str, &Field> {
    fields.iter().map(|f| (f.name.as_str(), f)).collect()
}

/// Strict pass over a whole payload.
pub fn validate_record(
    fields: &[Field],
    record: &Record,
    mode: ValidationMode,
    unknown: UnknownKeys,
) -> Result<(), ValidationError> {
    let by_name = index(fields);
    for (key, value) in record.iter() {
        match by_name.get(key) {
            Some(field) => {
                if field.required && value.is_empty() {
                    return Err(ValidationError::Required {
                        field: field.name.clone(),
                    });
                }
                validate_value(field, value)?;
            }
            None if unknown == UnknownKeys::Reject => {
                return Err(ValidationError::UnknownField {
                    field: key.to_string(),
                });
            }
            None => {}
        }
    }
    if mode == ValidationMode::Create
        && let Some(missing) = fields
            .iter()
            .find(|f| f.required && !is_server_managed(&f.name) && !record.contains_key(&f.name))
    {
        return Err(ValidationError::Required {
            field: missing.name.clone(),
        });
    }
    Ok(())
}

/// Lenient pass: unknown keys are dropped, values converted, and on create
/// every absent field with a default receives it.
pub fn convert_record(
    fields: &[Field],
    record: Record,
    mode: ValidationMode,
) -> Result<Record, ValidationError> {
    let by_name = index(fields);
    let mut out = Record::new();
    for (key, value) in record {
        if let Some(field) = by_name.get(key.as_str()) {
            let converted = convert_value(field, &value)?;
            out.insert(key, converted);
        }
    }
    if mode == ValidationMode::Create {
        for field in fields {
            if out.contains_key(&field.name) || is_server_managed(&field.name) {
                continue;
            }
            if let Some(default) = default_value(field)? {
                out.insert(field.name.clone(), default);
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::schema::ValidationRules;
    use chrono::{Datelike, Timelike};
    use serde_json::json;

    fn field(name: &str, ty: FieldType) -> Field {
        Field::new(name, ty)
    }

    #[test]
    fn text_conversion_never_fails() {
        let f = field("note", FieldType::Text);
        assert_eq!(
            convert_value(&f, &DynamicValue::Integer(42)).expect("text"),
            DynamicValue::text("42")
        );
        assert_eq!(
            convert_value(&f, &DynamicValue::Boolean(true)).expect("text"),
            DynamicValue::text("true")
        );
        assert!(validate_value(&f, &DynamicValue::Integer(42)).is_err());
    }

    #[test]
    fn integers_truncate_floats_and_parse_strings() {
        let f = field("count", FieldType::Integer);
        assert_eq!(
            convert_value(&f, &DynamicValue::Decimal(3.9)).expect("int"),
            DynamicValue::Integer(3)
        );
        assert_eq!(
            convert_value(&f, &DynamicValue::Decimal(-3.9)).expect("int"),
            DynamicValue::Integer(-3)
        );
        assert_eq!(
            convert_value(&f, &DynamicValue::text("17")).expect("int"),
            DynamicValue::Integer(17)
        );
        assert!(validate_value(&f, &DynamicValue::text("seventeen")).is_err());
        assert!(convert_value(&f, &DynamicValue::text("seventeen")).is_err());
    }

    #[test]
    fn decimals_accept_numeric_strings() {
        let f = field("ratio", FieldType::Decimal);
        assert_eq!(
            convert_value(&f, &DynamicValue::text("0.25")).expect("dec"),
            DynamicValue::Decimal(0.25)
        );
        assert!(convert_value(&f, &DynamicValue::text("abc")).is_err());
    }

    #[test]
    fn boolean_validate_set_is_narrower_than_convert_set() {
        let f = field("done", FieldType::Boolean);
        assert!(validate_value(&f, &DynamicValue::text("TRUE")).is_ok());
        assert!(validate_value(&f, &DynamicValue::text("0")).is_ok());
        assert!(validate_value(&f, &DynamicValue::text("yes")).is_err());
        assert!(validate_value(&f, &DynamicValue::text(" false ")).is_ok());
        assert!(validate_value(&f, &DynamicValue::text(" yes ")).is_err());
        assert_eq!(
            convert_value(&f, &DynamicValue::text(" false ")).expect("bool"),
            DynamicValue::Boolean(false)
        );
        assert_eq!(
            convert_value(&f, &DynamicValue::text("Yes")).expect("bool"),
            DynamicValue::Boolean(true)
        );
        assert_eq!(
            convert_value(&f, &DynamicValue::text("off")).expect("bool"),
            DynamicValue::Boolean(false)
        );
        assert_eq!(
            convert_value(&f, &DynamicValue::Integer(-2)).expect("bool"),
            DynamicValue::Boolean(true)
        );
        assert_eq!(
            convert_value(&f, &DynamicValue::Integer(0)).expect("bool"),
            DynamicValue::Boolean(false)
        );
    }

    #[test]
    fn json_accepts_structures_and_parsable_strings() {
        let f = field("meta", FieldType::Json);
        let parsed = convert_value(&f, &DynamicValue::text("{\"a\":1}")).expect("json");
        assert_eq!(parsed, DynamicValue::Json(json!({"a": 1})));
        assert!(validate_value(&f, &DynamicValue::Json(json!([1, 2]))).is_ok());
        assert!(validate_value(&f, &DynamicValue::text("{not json")).is_err());
        assert!(validate_value(&f, &DynamicValue::Integer(1)).is_err());
    }

    #[test]
    fn datetimes_try_each_layout_in_order() {
        let f = field("due", FieldType::DateTime);
        for raw in [
            "2024-03-01",
            "2024-03-01T10:20:30Z",
            "2024-03-01T10:20:30+02:00",
            "2024-03-01T10:20:30",
            "2024-03-01 10:20:30",
        ] {
            assert!(validate_value(&f, &DynamicValue::text(raw)).is_ok(), "{raw}");
        }
        let DynamicValue::Timestamp(ts) =
            convert_value(&f, &DynamicValue::text("2024-03-01")).expect("date")
        else {
            panic!("expected timestamp");
        };
        assert_eq!((ts.year(), ts.month(), ts.day(), ts.hour()), (2024, 3, 1, 0));
        assert!(validate_value(&f, &DynamicValue::text("03/01/2024")).is_err());
    }

    #[test]
    fn unknown_types_pass_through() {
        let f = field("shape", FieldType::Other("geometry".into()));
        let v = DynamicValue::Json(json!({"type": "Point"}));
        assert!(validate_value(&f, &v).is_ok());
        assert_eq!(convert_value(&f, &v).expect("pass"), v);
    }

    #[test]
    fn relation_fields_hold_uuids() {
        let f = field("author", FieldType::Relation);
        let id = Uuid::new_v4();
        assert!(validate_value(&f, &DynamicValue::from(id)).is_ok());
        assert!(validate_value(&f, &DynamicValue::text("bob")).is_err());
    }

    #[test]
    fn required_is_distinct_from_type_mismatch() {
        let fields = vec![field("title", FieldType::String).required()];
        let missing = validate_record(&fields, &Record::new(), ValidationMode::Create, UnknownKeys::Reject);
        assert!(matches!(missing, Err(ValidationError::Required { .. })));
        let empty = validate_record(
            &fields,
            &Record::new().with("title", ""),
            ValidationMode::Create,
            UnknownKeys::Reject,
        );
        assert!(matches!(empty, Err(ValidationError::Required { .. })));
        let wrong = validate_record(
            &fields,
            &Record::new().with("title", 5i64),
            ValidationMode::Create,
            UnknownKeys::Reject,
        );
        assert!(matches!(wrong, Err(ValidationError::TypeMismatch { .. })));
        let patch = validate_record(&fields, &Record::new(), ValidationMode::Patch, UnknownKeys::Reject);
        assert!(patch.is_ok());
    }

    #[test]
    fn unknown_keys_are_rejected_strictly_and_dropped_leniently() {
        let fields = vec![field("title", FieldType::String)];
        let payload = Record::new().with("title", "a").with("extra", 1i64);
        let strict = validate_record(&fields, &payload, ValidationMode::Create, UnknownKeys::Reject);
        assert_eq!(
            strict,
            Err(ValidationError::UnknownField {
                field: "extra".into()
            })
        );
        assert!(validate_record(&fields, &payload, ValidationMode::Create, UnknownKeys::Drop).is_ok());
        let converted = convert_record(&fields, payload, ValidationMode::Create).expect("convert");
        assert!(!converted.contains_key("extra"));
    }

    #[test]
    fn rules_apply_only_after_type_and_to_non_empty_values() {
        let f = field("code", FieldType::String).with_rules(ValidationRules {
            min_length: Some(3),
            max_length: Some(5),
            pattern: Some("AB%".into()),
            ..ValidationRules::default()
        });
        assert!(validate_value(&f, &DynamicValue::text("")).is_ok());
        assert!(validate_value(&f, &DynamicValue::Null).is_ok());
        assert!(validate_value(&f, &DynamicValue::text("ABC")).is_ok());
        assert!(matches!(
            validate_value(&f, &DynamicValue::text("AB")),
            Err(ValidationError::Rule { .. })
        ));
        assert!(matches!(
            validate_value(&f, &DynamicValue::text("XYZ")),
            Err(ValidationError::Rule { .. })
        ));
        assert!(matches!(
            validate_value(&f, &DynamicValue::Integer(12345)),
            Err(ValidationError::TypeMismatch { .. })
        ));

        let n = field("rating", FieldType::Integer).with_rules(ValidationRules {
            min: Some(1.0),
            max: Some(5.0),
            ..ValidationRules::default()
        });
        assert!(validate_value(&n, &DynamicValue::Integer(5)).is_ok());
        assert!(validate_value(&n, &DynamicValue::text("6")).is_err());
        assert!(validate_value(&n, &DynamicValue::Integer(0)).is_err());
    }

    #[test]
    fn defaults_fill_absent_fields_on_create_only() {
        let fields = vec![
            field("status", FieldType::String).with_default("draft"),
            field("priority", FieldType::Integer).with_default("3"),
            field("title", FieldType::String),
        ];
        let created = convert_record(
            &fields,
            Record::new().with("title", "x"),
            ValidationMode::Create,
        )
        .expect("convert");
        assert_eq!(created.text("status"), Some("draft"));
        assert_eq!(created.i64("priority"), Some(3));

        let patched = convert_record(&fields, Record::new().with("title", "y"), ValidationMode::Patch)
            .expect("convert");
        assert!(!patched.contains_key("status"));
    }

    #[test]
    fn unconvertible_defaults_are_reported() {
        let f = field("priority", FieldType::Integer).with_default("high");
        assert!(default_value(&f).is_err());
    }
}
