//! Field trimming and row-level predicates applied to result sets.

use crate::catalog::types::{DynamicValue, Record};
use crate::error::EngineError;
use crate::permission::AllowedFields;
use crate::query::plan::Expr;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Placeholder in row filters that resolves to the acting user's id.
pub const CURRENT_USER: &str = "$user";

/// Keeps only the keys of `record` that `allowed` grants. Never adds keys.
pub fn filter_fields(record: &Record, allowed: &AllowedFields) -> Record {
    match allowed {
        AllowedFields::All => record.clone(),
        AllowedFields::Only(names) => record
            .iter()
            .filter(|(k, _)| names.contains(*k))
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect(),
    }
}

/// Applies the row scope and then the field set to every row independently.
pub fn filter_rows(rows: Vec<Record>, allowed: &AllowedFields, scope: &RowScope) -> Vec<Record> {
    rows.into_iter()
        .filter(|row| scope.matches(row))
        .map(|row| filter_fields(&row, allowed))
        .collect()
}

/// One condition on one column.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Equals(DynamicValue),
    /// Inclusive bounds; a missing bound is open.
    Range {
        min: Option<DynamicValue>,
        max: Option<DynamicValue>,
    },
    OneOf(Vec<DynamicValue>),
}

impl Predicate {
    fn matches(&self, value: &DynamicValue) -> bool {
        match self {
            Predicate::Equals(expected) => value == expected,
            Predicate::Range { min, max } => {
                (min.is_some() || max.is_some())
                    && min
                        .as_ref()
                        .is_none_or(|m| value.compare(m).is_some_and(|o| o.is_ge()))
                    && max
                        .as_ref()
                        .is_none_or(|m| value.compare(m).is_some_and(|o| o.is_le()))
            }
            Predicate::OneOf(options) => options.iter().any(|o| value == o),
        }
    }

    fn to_expr(&self, column: &str) -> Expr {
        match self {
            Predicate::Equals(v) => Expr::Eq(column.to_string(), v.clone()),
            Predicate::Range { min, max } => {
                let lower = min.clone().map(|m| Expr::Gte(column.to_string(), m));
                let upper = max.clone().map(|m| Expr::Lte(column.to_string(), m));
                // A range with no bounds matches nothing.
                Expr::all(lower.into_iter().chain(upper))
                    .unwrap_or_else(|| Expr::In(column.to_string(), Vec::new()))
            }
            Predicate::OneOf(options) => Expr::In(column.to_string(), options.clone()),
        }
    }

    fn resolve_user(&mut self, user_id: Uuid) {
        let swap = |v: &mut DynamicValue| {
            if v.as_str() == Some(CURRENT_USER) {
                *v = DynamicValue::from(user_id);
            }
        };
        match self {
            Predicate::Equals(v) => swap(v),
            Predicate::Range { min, max } => {
                min.iter_mut().chain(max.iter_mut()).for_each(swap);
            }
            Predicate::OneOf(options) => options.iter_mut().for_each(swap),
        }
    }

    fn parse(column: &str, raw: &serde_json::Value) -> Result<Predicate, EngineError> {
        let invalid = |what: &str| EngineError::invalid(format!("row filter on '{column}': {what}"));
        let serde_json::Value::Object(map) = raw else {
            return Ok(Predicate::Equals(DynamicValue::from(raw.clone())));
        };
        if map.len() != 1 {
            return Err(invalid("expected one of equals, range, one_of"));
        }
        let Some((tag, body)) = map.iter().next() else {
            return Err(invalid("empty predicate"));
        };
        match tag.as_str() {
            "equals" => Ok(Predicate::Equals(DynamicValue::from(body.clone()))),
            "range" => {
                let serde_json::Value::Object(bounds) = body else {
                    return Err(invalid("range expects an object"));
                };
                let bound = |key: &str| {
                    bounds
                        .get(key)
                        .filter(|v| !v.is_null())
                        .map(|v| DynamicValue::from(v.clone()))
                };
                let (min, max) = (bound("min"), bound("max"));
                if min.is_none() && max.is_none() {
                    return Err(invalid("range needs min or max"));
                }
                Ok(Predicate::Range { min, max })
            }
            "one_of" => {
                let serde_json::Value::Array(items) = body else {
                    return Err(invalid("one_of expects a list"));
                };
                Ok(Predicate::OneOf(
                    items.iter().cloned().map(DynamicValue::from).collect(),
                ))
            }
            other => Err(invalid(&format!("unknown predicate '{other}'"))),
        }
    }

    fn to_json(&self) -> serde_json::Value {
        match self {
            Predicate::Equals(v) => serde_json::json!({ "equals": v.to_json() }),
            Predicate::Range { min, max } => serde_json::json!({
                "range": {
                    "min": min.as_ref().map(DynamicValue::to_json),
                    "max": max.as_ref().map(DynamicValue::to_json),
                }
            }),
            Predicate::OneOf(options) => serde_json::json!({
                "one_of": options.iter().map(DynamicValue::to_json).collect::<Vec<_>>()
            }),
        }
    }
}

/// Conjunction of per-column predicates attached to a permission rule.
///
/// Stored as a JSON object `{column: predicate}` where a predicate is
/// `{"equals": v}`, `{"range": {"min": a, "max": b}}`, `{"one_of": [..]}` or a
/// bare value meaning equality.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowFilter {
    predicates: BTreeMap<String, Predicate>,
}

impl RowFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, column: impl Into<String>, predicate: Predicate) -> Self {
        self.predicates.insert(column.into(), predicate);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.predicates.is_empty()
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.predicates.keys().map(String::as_str)
    }

    /// True when every predicate holds. A missing column never matches.
    pub fn matches(&self, record: &Record) -> bool {
        self.predicates
            .iter()
            .all(|(col, p)| record.get(col).is_some_and(|v| p.matches(v)))
    }

    /// Copy with every `$user` placeholder replaced by `user_id`.
    pub fn resolve(&self, user_id: Uuid) -> RowFilter {
        let mut out = self.clone();
        for predicate in out.predicates.values_mut() {
            predicate.resolve_user(user_id);
        }
        out
    }

    pub fn to_expr(&self) -> Option<Expr> {
        Expr::all(self.predicates.iter().map(|(c, p)| p.to_expr(c)))
    }

    pub fn from_json(raw: &serde_json::Value) -> Result<RowFilter, EngineError> {
        let serde_json::Value::Object(map) = raw else {
            return Err(EngineError::invalid("row filter must be an object"));
        };
        let predicates = map
            .iter()
            .map(|(col, v)| Ok((col.clone(), Predicate::parse(col, v)?)))
            .collect::<Result<BTreeMap<_, _>, EngineError>>()?;
        Ok(RowFilter { predicates })
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::Value::Object(
            self.predicates
                .iter()
                .map(|(c, p)| (c.clone(), p.to_json()))
                .collect(),
        )
    }
}

/// Rows a decision grants: everything, or rows matching at least one filter.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum RowScope {
    #[default]
    Unrestricted,
    AnyOf(Vec<RowFilter>),
}

impl RowScope {
    pub fn is_unrestricted(&self) -> bool {
        matches!(self, RowScope::Unrestricted)
    }

    pub fn matches(&self, record: &Record) -> bool {
        match self {
            RowScope::Unrestricted => true,
            RowScope::AnyOf(filters) => filters.iter().any(|f| f.matches(record)),
        }
    }

    /// Predicate pushed down to storage. `None` when every row qualifies.
    pub fn to_expr(&self) -> Option<Expr> {
        match self {
            RowScope::Unrestricted => None,
            RowScope::AnyOf(filters) if filters.iter().any(RowFilter::is_empty) => None,
            RowScope::AnyOf(filters) => Some(
                Expr::any(filters.iter().filter_map(RowFilter::to_expr))
                    .unwrap_or_else(|| Expr::In("id".to_string(), Vec::new())),
            ),
        }
    }

    pub fn columns(&self) -> Vec<&str> {
        let mut out: Vec<&str> = Vec::new();
        if let RowScope::AnyOf(filters) = self {
            for col in filters.iter().flat_map(RowFilter::columns) {
                if !out.contains(&col) {
                    out.push(col);
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::operators::eval_expr;
    use proptest::prelude::*;
    use serde_json::json;
    use std::collections::BTreeSet;

    fn only(names: &[&str]) -> AllowedFields {
        AllowedFields::Only(names.iter().map(|s| s.to_string()).collect())
    }

    #[test]
    fn wildcard_is_identity() {
        let row = Record::new().with("a", 1i64).with("b", "x");
        assert_eq!(filter_fields(&row, &AllowedFields::All), row);
    }

    #[test]
    fn restricted_sets_never_fabricate_keys() {
        let row = Record::new().with("a", 1i64);
        let out = filter_fields(&row, &only(&["a", "missing"]));
        assert_eq!(out, Record::new().with("a", 1i64));
    }

    #[test]
    fn every_row_is_trimmed_independently() {
        let rows = vec![
            Record::new().with("a", 1i64).with("secret", "s1"),
            Record::new().with("secret", "s2").with("b", 2i64),
        ];
        let out = filter_rows(rows, &only(&["a", "b"]), &RowScope::Unrestricted);
        assert!(out.iter().all(|r| !r.contains_key("secret")));
        assert_eq!(out[1].i64("b"), Some(2));
    }

    #[test]
    fn row_filters_parse_tagged_and_bare_predicates() {
        let filter = RowFilter::from_json(&json!({
            "owner": "$user",
            "score": {"range": {"min": 1, "max": 5}},
            "status": {"one_of": ["open", "pending"]}
        }))
        .expect("filter");
        let user = Uuid::new_v4();
        let resolved = filter.resolve(user);

        let visible = Record::new()
            .with("owner", user)
            .with("score", 3i64)
            .with("status", "open");
        assert!(resolved.matches(&visible));
        assert!(eval_expr(&resolved.to_expr().expect("expr"), &visible));

        let other_owner = visible.clone().with("owner", Uuid::new_v4());
        assert!(!resolved.matches(&other_owner));
        let out_of_range = visible.clone().with("score", 9i64);
        assert!(!resolved.matches(&out_of_range));
        let missing = Record::new().with("score", 3i64).with("status", "open");
        assert!(!resolved.matches(&missing));

        assert_eq!(RowFilter::from_json(&filter.to_json()).expect("reparse"), filter);
    }

    #[test]
    fn malformed_filters_are_invalid_input() {
        assert!(RowFilter::from_json(&json!(["owner"])).is_err());
        assert!(RowFilter::from_json(&json!({"a": {"like": "x"}})).is_err());
        assert!(RowFilter::from_json(&json!({"a": {"range": 5}})).is_err());
        assert!(RowFilter::from_json(&json!({"a": {"range": {}}})).is_err());
    }

    #[test]
    fn scopes_match_any_filter() {
        let scope = RowScope::AnyOf(vec![
            RowFilter::new().with("team", Predicate::Equals(DynamicValue::text("red"))),
            RowFilter::new().with("team", Predicate::Equals(DynamicValue::text("blue"))),
        ]);
        let red = Record::new().with("team", "red");
        let green = Record::new().with("team", "green");
        assert!(scope.matches(&red));
        assert!(!scope.matches(&green));
        let expr = scope.to_expr().expect("expr");
        assert!(eval_expr(&expr, &red));
        assert!(!eval_expr(&expr, &green));
        assert_eq!(scope.columns(), vec!["team"]);
    }

    fn arb_record() -> impl Strategy<Value = Record> {
        prop::collection::btree_map("[a-e]{1,2}", any::<i64>(), 0..8).prop_map(|m| {
            m.into_iter()
                .map(|(k, v)| (k, DynamicValue::Integer(v)))
                .collect()
        })
    }

    proptest! {
        #[test]
        fn filtered_keys_are_the_intersection(
            record in arb_record(),
            allowed in prop::collection::btree_set("[a-e]{1,2}", 0..6),
        ) {
            let out = filter_fields(&record, &AllowedFields::Only(allowed.clone()));
            let expected: BTreeSet<&str> = record
                .keys()
                .filter(|k| allowed.contains(*k))
                .collect();
            let actual: BTreeSet<&str> = out.keys().collect();
            prop_assert_eq!(actual, expected);
            for (k, v) in out.iter() {
                prop_assert_eq!(record.get(k), Some(v));
            }
        }

        #[test]
        fn wildcard_never_changes_a_record(record in arb_record()) {
            prop_assert_eq!(filter_fields(&record, &AllowedFields::All), record);
        }
    }
}
