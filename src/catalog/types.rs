use chrono::{DateTime, Utc};
use compact_str::CompactString;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Declared type of a [`Field`](crate::catalog::schema::Field).
///
/// Unrecognized names are kept as `Other` so catalogs written by newer
/// versions still load; values of those fields pass through untouched.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FieldType {
    String,
    Text,
    Integer,
    Decimal,
    Boolean,
    DateTime,
    Json,
    Uuid,
    Relation,
    Other(String),
}

impl FieldType {
    pub fn as_str(&self) -> &str {
        match self {
            FieldType::String => "string",
            FieldType::Text => "text",
            FieldType::Integer => "integer",
            FieldType::Decimal => "decimal",
            FieldType::Boolean => "boolean",
            FieldType::DateTime => "datetime",
            FieldType::Json => "json",
            FieldType::Uuid => "uuid",
            FieldType::Relation => "relation",
            FieldType::Other(name) => name,
        }
    }

    /// Storage column type a materializer should use for this field.
    pub fn storage_type(&self) -> &'static str {
        match self {
            FieldType::String => "VARCHAR(255)",
            FieldType::Text => "TEXT",
            FieldType::Integer => "BIGINT",
            FieldType::Decimal => "NUMERIC",
            FieldType::Boolean => "BOOLEAN",
            FieldType::DateTime => "TIMESTAMPTZ",
            FieldType::Json => "JSONB",
            FieldType::Uuid | FieldType::Relation => "UUID",
            FieldType::Other(_) => "TEXT",
        }
    }
}

impl From<&str> for FieldType {
    fn from(s: &str) -> Self {
        match s {
            "string" => FieldType::String,
            "text" => FieldType::Text,
            "integer" => FieldType::Integer,
            "decimal" => FieldType::Decimal,
            "boolean" => FieldType::Boolean,
            "datetime" => FieldType::DateTime,
            "json" => FieldType::Json,
            "uuid" => FieldType::Uuid,
            "relation" => FieldType::Relation,
            other => FieldType::Other(other.to_string()),
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for FieldType {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for FieldType {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(FieldType::from(raw.as_str()))
    }
}

/// A single dynamically typed column value.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged, from = "serde_json::Value")]
pub enum DynamicValue {
    Null,
    Text(CompactString),
    Integer(i64),
    Decimal(f64),
    Boolean(bool),
    Timestamp(DateTime<Utc>),
    Json(serde_json::Value),
}

impl DynamicValue {
    pub fn text(value: impl Into<CompactString>) -> Self {
        DynamicValue::Text(value.into())
    }

    pub fn uuid(value: Uuid) -> Self {
        DynamicValue::Text(CompactString::from(value.to_string()))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            DynamicValue::Null => "null",
            DynamicValue::Text(_) => "text",
            DynamicValue::Integer(_) => "integer",
            DynamicValue::Decimal(_) => "decimal",
            DynamicValue::Boolean(_) => "boolean",
            DynamicValue::Timestamp(_) => "timestamp",
            DynamicValue::Json(_) => "json",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, DynamicValue::Null)
    }

    /// Null, an empty string, or a JSON null.
    pub fn is_empty(&self) -> bool {
        match self {
            DynamicValue::Null => true,
            DynamicValue::Text(s) => s.is_empty(),
            DynamicValue::Json(v) => v.is_null(),
            _ => false,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            DynamicValue::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            DynamicValue::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            DynamicValue::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            DynamicValue::Integer(i) => Some(*i as f64),
            DynamicValue::Decimal(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_uuid(&self) -> Option<Uuid> {
        self.as_str().and_then(|s| Uuid::parse_str(s).ok())
    }

    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            DynamicValue::Timestamp(ts) => Some(*ts),
            DynamicValue::Text(s) => DateTime::parse_from_rfc3339(s)
                .ok()
                .map(|ts| ts.with_timezone(&Utc)),
            _ => None,
        }
    }

    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            DynamicValue::Json(v) => Some(v),
            _ => None,
        }
    }

    /// Renders the value the way text columns store it.
    pub fn to_text(&self) -> String {
        match self {
            DynamicValue::Null => String::new(),
            DynamicValue::Text(s) => s.to_string(),
            DynamicValue::Integer(i) => i.to_string(),
            DynamicValue::Decimal(f) => f.to_string(),
            DynamicValue::Boolean(b) => b.to_string(),
            DynamicValue::Timestamp(ts) => ts.to_rfc3339(),
            DynamicValue::Json(v) => v.to_string(),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            DynamicValue::Null => serde_json::Value::Null,
            DynamicValue::Text(s) => serde_json::Value::String(s.to_string()),
            DynamicValue::Integer(i) => serde_json::Value::from(*i),
            DynamicValue::Decimal(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            DynamicValue::Boolean(b) => serde_json::Value::Bool(*b),
            DynamicValue::Timestamp(ts) => serde_json::Value::String(ts.to_rfc3339()),
            DynamicValue::Json(v) => v.clone(),
        }
    }

    /// Ordering used by comparison predicates. Mixed numeric kinds compare by
    /// value; any other kind mismatch is incomparable.
    pub fn compare(&self, other: &DynamicValue) -> Option<Ordering> {
        match (self, other) {
            (DynamicValue::Null, _) | (_, DynamicValue::Null) => None,
            (DynamicValue::Integer(a), DynamicValue::Integer(b)) => Some(a.cmp(b)),
            (DynamicValue::Integer(_) | DynamicValue::Decimal(_), _)
            | (_, DynamicValue::Integer(_) | DynamicValue::Decimal(_)) => {
                self.as_f64()?.partial_cmp(&other.as_f64()?)
            }
            (DynamicValue::Text(a), DynamicValue::Text(b)) => Some(a.cmp(b)),
            (DynamicValue::Boolean(a), DynamicValue::Boolean(b)) => Some(a.cmp(b)),
            (DynamicValue::Timestamp(a), DynamicValue::Timestamp(b)) => Some(a.cmp(b)),
            (DynamicValue::Timestamp(a), DynamicValue::Text(_)) => Some(a.cmp(&other.as_timestamp()?)),
            (DynamicValue::Text(_), DynamicValue::Timestamp(b)) => Some(self.as_timestamp()?.cmp(b)),
            (DynamicValue::Json(a), DynamicValue::Json(b)) => (a == b).then_some(Ordering::Equal),
            _ => None,
        }
    }
}

impl PartialEq for DynamicValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (DynamicValue::Null, DynamicValue::Null) => true,
            _ => self.compare(other).is_some_and(|o| o.is_eq()),
        }
    }
}

impl From<serde_json::Value> for DynamicValue {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => DynamicValue::Null,
            serde_json::Value::Bool(b) => DynamicValue::Boolean(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => DynamicValue::Integer(i),
                None => DynamicValue::Decimal(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => DynamicValue::Text(s.into()),
            other @ (serde_json::Value::Array(_) | serde_json::Value::Object(_)) => {
                DynamicValue::Json(other)
            }
        }
    }
}

impl From<&str> for DynamicValue {
    fn from(value: &str) -> Self {
        DynamicValue::Text(value.into())
    }
}

impl From<String> for DynamicValue {
    fn from(value: String) -> Self {
        DynamicValue::Text(value.into())
    }
}

impl From<i64> for DynamicValue {
    fn from(value: i64) -> Self {
        DynamicValue::Integer(value)
    }
}

impl From<f64> for DynamicValue {
    fn from(value: f64) -> Self {
        DynamicValue::Decimal(value)
    }
}

impl From<bool> for DynamicValue {
    fn from(value: bool) -> Self {
        DynamicValue::Boolean(value)
    }
}

impl From<Uuid> for DynamicValue {
    fn from(value: Uuid) -> Self {
        DynamicValue::uuid(value)
    }
}

impl From<DateTime<Utc>> for DynamicValue {
    fn from(value: DateTime<Utc>) -> Self {
        DynamicValue::Timestamp(value)
    }
}

impl<T: Into<DynamicValue>> From<Option<T>> for DynamicValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(DynamicValue::Null)
    }
}

/// One row keyed by column name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record(BTreeMap<String, DynamicValue>);

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<DynamicValue>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<DynamicValue>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&DynamicValue> {
        self.0.get(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<DynamicValue> {
        self.0.remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &DynamicValue)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn retain(&mut self, mut keep: impl FnMut(&str, &DynamicValue) -> bool) {
        self.0.retain(|k, v| keep(k, v));
    }

    pub fn text(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(DynamicValue::as_str)
    }

    pub fn bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(DynamicValue::as_bool)
    }

    pub fn i64(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(DynamicValue::as_i64)
    }

    pub fn uuid(&self, key: &str) -> Option<Uuid> {
        self.get(key).and_then(DynamicValue::as_uuid)
    }

    pub fn timestamp(&self, key: &str) -> Option<DateTime<Utc>> {
        self.get(key).and_then(DynamicValue::as_timestamp)
    }

    pub fn json(&self, key: &str) -> Option<&serde_json::Value> {
        self.get(key).and_then(DynamicValue::as_json)
    }

    /// Text value if present and non-empty.
    pub fn non_empty_text(&self, key: &str) -> Option<&str> {
        self.text(key).filter(|s| !s.is_empty())
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::Value::Object(
            self.0
                .iter()
                .map(|(k, v)| (k.clone(), v.to_json()))
                .collect(),
        )
    }
}

impl FromIterator<(String, DynamicValue)> for Record {
    fn from_iter<I: IntoIterator<Item = (String, DynamicValue)>>(iter: I) -> Self {
        Record(iter.into_iter().collect())
    }
}

impl IntoIterator for Record {
    type Item = (String, DynamicValue);
    type IntoIter = std::collections::btree_map::IntoIter<String, DynamicValue>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl TryFrom<serde_json::Value> for Record {
    type Error = serde_json::Value;

    /// Accepts a JSON object; anything else is handed back unchanged.
    fn try_from(value: serde_json::Value) -> Result<Self, Self::Error> {
        match value {
            serde_json::Value::Object(map) => Ok(map
                .into_iter()
                .map(|(k, v)| (k, DynamicValue::from(v)))
                .collect()),
            other => Err(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{DynamicValue, FieldType, Record};
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    #[test]
    fn json_payloads_map_onto_closed_value_set() {
        let record = Record::try_from(json!({
            "title": "hi",
            "count": 3,
            "ratio": 0.5,
            "done": false,
            "tags": ["a"],
            "meta": {"k": 1},
            "gone": null
        }))
        .expect("object payload");

        assert_eq!(record.get("title"), Some(&DynamicValue::text("hi")));
        assert_eq!(record.i64("count"), Some(3));
        assert!(matches!(record.get("ratio"), Some(DynamicValue::Decimal(_))));
        assert_eq!(record.bool("done"), Some(false));
        assert!(record.json("tags").is_some_and(|v| v.is_array()));
        assert!(record.json("meta").is_some_and(|v| v.is_object()));
        assert!(record.get("gone").is_some_and(DynamicValue::is_null));
    }

    #[test]
    fn non_object_payloads_are_rejected() {
        assert!(Record::try_from(json!([1, 2])).is_err());
    }

    #[test]
    fn numeric_kinds_compare_by_value() {
        assert_eq!(DynamicValue::Integer(5), DynamicValue::Decimal(5.0));
        assert_ne!(DynamicValue::Integer(5), DynamicValue::text("5"));
        assert_ne!(DynamicValue::Null, DynamicValue::text(""));
    }

    #[test]
    fn timestamps_serialize_as_rfc3339() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).single().expect("ts");
        let value = DynamicValue::Timestamp(ts);
        assert_eq!(value.to_json(), json!("2024-03-01T12:00:00+00:00"));
        assert_eq!(DynamicValue::text("2024-03-01T12:00:00Z").as_timestamp(), Some(ts));
    }

    #[test]
    fn unknown_field_types_are_preserved() {
        let ty = FieldType::from("geometry");
        assert_eq!(ty, FieldType::Other("geometry".into()));
        assert_eq!(ty.as_str(), "geometry");
        assert_eq!(FieldType::Relation.storage_type(), "UUID");
    }
}
