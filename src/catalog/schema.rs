use crate::catalog::system::SystemTable;
use crate::catalog::types::{DynamicValue, FieldType, Record};
use crate::catalog::{SystemRow, require};
use crate::error::EngineError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const ID_COLUMN: &str = "id";
pub const TENANT_COLUMN: &str = "tenant_id";
pub const CREATED_AT: &str = "created_at";
pub const UPDATED_AT: &str = "updated_at";
pub const CREATED_BY: &str = "created_by";
pub const UPDATED_BY: &str = "updated_by";

/// Columns whose values are always chosen by the engine, never by callers.
pub const SERVER_MANAGED_COLUMNS: [&str; 6] = [
    ID_COLUMN,
    TENANT_COLUMN,
    CREATED_AT,
    UPDATED_AT,
    CREATED_BY,
    UPDATED_BY,
];

pub fn is_server_managed(column: &str) -> bool {
    SERVER_MANAGED_COLUMNS.contains(&column)
}

/// Logical table definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Collection {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    pub display_name: Option<String>,
    pub description: Option<String>,
    pub icon: Option<String>,
    pub system: bool,
    pub created_by: Option<Uuid>,
    pub updated_by: Option<Uuid>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl SystemRow for Collection {
    const TABLE: SystemTable = SystemTable::Collections;

    fn id(&self) -> Uuid {
        self.id
    }

    fn to_record(&self) -> Record {
        Record::new()
            .with(ID_COLUMN, self.id)
            .with(TENANT_COLUMN, self.tenant_id)
            .with("name", self.name.as_str())
            .with("display_name", self.display_name.clone())
            .with("description", self.description.clone())
            .with("icon", self.icon.clone())
            .with("system", self.system)
            .with(CREATED_BY, self.created_by)
            .with(UPDATED_BY, self.updated_by)
            .with(CREATED_AT, self.created_at)
            .with(UPDATED_AT, self.updated_at)
    }

    fn from_record(record: &Record) -> Result<Self, EngineError> {
        Ok(Self {
            id: require::<Self, _>(record.uuid(ID_COLUMN), ID_COLUMN)?,
            tenant_id: require::<Self, _>(record.uuid(TENANT_COLUMN), TENANT_COLUMN)?,
            name: require::<Self, _>(record.text("name"), "name")?.to_string(),
            display_name: record.non_empty_text("display_name").map(str::to_string),
            description: record.non_empty_text("description").map(str::to_string),
            icon: record.non_empty_text("icon").map(str::to_string),
            system: record.bool("system").unwrap_or(false),
            created_by: record.uuid(CREATED_BY),
            updated_by: record.uuid(UPDATED_BY),
            created_at: record.timestamp(CREATED_AT),
            updated_at: record.timestamp(UPDATED_AT),
        })
    }
}

/// Attributes for a new collection.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CollectionDraft {
    pub id: Option<Uuid>,
    pub name: String,
    pub display_name: Option<String>,
    pub description: Option<String>,
    pub icon: Option<String>,
    pub system: bool,
}

impl CollectionDraft {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn from_record(record: &Record) -> Self {
        Self {
            id: record.uuid(ID_COLUMN),
            name: record.text("name").unwrap_or_default().to_string(),
            display_name: record.non_empty_text("display_name").map(str::to_string),
            description: record.non_empty_text("description").map(str::to_string),
            icon: record.non_empty_text("icon").map(str::to_string),
            system: record.bool("system").unwrap_or(false),
        }
    }
}

/// Metadata-only changes to a collection. `None` leaves a value unchanged.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CollectionPatch {
    pub name: Option<String>,
    pub display_name: Option<String>,
    pub description: Option<String>,
    pub icon: Option<String>,
}

impl CollectionPatch {
    pub fn from_record(record: &Record) -> Self {
        Self {
            name: record.text("name").map(str::to_string),
            display_name: record.text("display_name").map(str::to_string),
            description: record.text("description").map(str::to_string),
            icon: record.text("icon").map(str::to_string),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cardinality {
    OneToOne,
    ManyToOne,
    OneToMany,
    ManyToMany,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationConfig {
    pub target_collection: String,
    pub cardinality: Cardinality,
}

/// Declarative value constraints checked after type validation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationRules {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_length: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_length: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    /// SQL `LIKE` pattern (`%` any run, `_` one character).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
}

impl ValidationRules {
    pub fn is_empty(&self) -> bool {
        *self == ValidationRules::default()
    }
}

/// Logical column definition owned by one collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub collection_id: Uuid,
    pub name: String,
    pub display_name: Option<String>,
    pub field_type: FieldType,
    pub primary: bool,
    pub required: bool,
    pub unique: bool,
    /// Raw default, coerced to `field_type` when applied.
    pub default_value: Option<String>,
    pub validation: ValidationRules,
    pub sort_order: i64,
    pub relation: Option<RelationConfig>,
}

impl Field {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            id: Uuid::nil(),
            tenant_id: Uuid::nil(),
            collection_id: Uuid::nil(),
            name: name.into(),
            display_name: None,
            field_type,
            primary: false,
            required: false,
            unique: false,
            default_value: None,
            validation: ValidationRules::default(),
            sort_order: 0,
            relation: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_default(mut self, raw: impl Into<String>) -> Self {
        self.default_value = Some(raw.into());
        self
    }

    pub fn with_rules(mut self, rules: ValidationRules) -> Self {
        self.validation = rules;
        self
    }

    /// The engine-maintained fields every new collection starts with.
    pub fn server_defaults(tenant_id: Uuid, collection_id: Uuid) -> Vec<Field> {
        [
            (ID_COLUMN, FieldType::Uuid, true),
            (CREATED_AT, FieldType::DateTime, false),
            (UPDATED_AT, FieldType::DateTime, false),
            (CREATED_BY, FieldType::Uuid, false),
            (UPDATED_BY, FieldType::Uuid, false),
        ]
        .into_iter()
        .enumerate()
        .map(|(i, (name, field_type, primary))| Field {
            id: Uuid::new_v4(),
            tenant_id,
            collection_id,
            primary,
            sort_order: i as i64 - 100,
            ..Field::new(name, field_type)
        })
        .collect()
    }
}

impl SystemRow for Field {
    const TABLE: SystemTable = SystemTable::Fields;

    fn id(&self) -> Uuid {
        self.id
    }

    fn to_record(&self) -> Record {
        let validation = if self.validation.is_empty() {
            DynamicValue::Null
        } else {
            DynamicValue::Json(serde_json::to_value(&self.validation).unwrap_or_default())
        };
        let relation = self
            .relation
            .as_ref()
            .and_then(|r| serde_json::to_value(r).ok())
            .map(DynamicValue::Json)
            .unwrap_or(DynamicValue::Null);
        Record::new()
            .with(ID_COLUMN, self.id)
            .with(TENANT_COLUMN, self.tenant_id)
            .with("collection_id", self.collection_id)
            .with("name", self.name.as_str())
            .with("display_name", self.display_name.clone())
            .with("field_type", self.field_type.as_str())
            .with("primary", self.primary)
            .with("required", self.required)
            .with("unique", self.unique)
            .with("default_value", self.default_value.clone())
            .with("validation", validation)
            .with("sort_order", self.sort_order)
            .with("relation", relation)
    }

    fn from_record(record: &Record) -> Result<Self, EngineError> {
        let validation = match record.json("validation") {
            Some(raw) => serde_json::from_value(raw.clone())
                .map_err(|e| EngineError::internal(format!("corrupt validation rules: {e}")))?,
            None => ValidationRules::default(),
        };
        let relation = match record.json("relation") {
            Some(raw) => Some(
                serde_json::from_value(raw.clone())
                    .map_err(|e| EngineError::internal(format!("corrupt relation config: {e}")))?,
            ),
            None => None,
        };
        let field_type = FieldType::from(require::<Self, _>(record.text("field_type"), "field_type")?);
        Ok(Self {
            id: require::<Self, _>(record.uuid(ID_COLUMN), ID_COLUMN)?,
            tenant_id: require::<Self, _>(record.uuid(TENANT_COLUMN), TENANT_COLUMN)?,
            collection_id: require::<Self, _>(record.uuid("collection_id"), "collection_id")?,
            name: require::<Self, _>(record.text("name"), "name")?.to_string(),
            display_name: record.non_empty_text("display_name").map(str::to_string),
            field_type,
            primary: record.bool("primary").unwrap_or(false),
            required: record.bool("required").unwrap_or(false),
            unique: record.bool("unique").unwrap_or(false),
            default_value: record.text("default_value").map(str::to_string),
            validation,
            sort_order: record.i64("sort_order").unwrap_or(0),
            relation,
        })
    }
}

/// Attributes for a new field.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldDraft {
    pub collection_id: Uuid,
    pub name: String,
    pub display_name: Option<String>,
    pub field_type: FieldType,
    pub primary: bool,
    pub required: bool,
    pub unique: bool,
    pub default_value: Option<String>,
    pub validation: ValidationRules,
    pub sort_order: i64,
    pub relation: Option<RelationConfig>,
}

impl FieldDraft {
    pub fn new(collection_id: Uuid, name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            collection_id,
            name: name.into(),
            display_name: None,
            field_type,
            primary: false,
            required: false,
            unique: false,
            default_value: None,
            validation: ValidationRules::default(),
            sort_order: 0,
            relation: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_default(mut self, raw: impl Into<String>) -> Self {
        self.default_value = Some(raw.into());
        self
    }

    pub fn with_rules(mut self, rules: ValidationRules) -> Self {
        self.validation = rules;
        self
    }

    pub fn with_relation(mut self, relation: RelationConfig) -> Self {
        self.relation = Some(relation);
        self
    }

    pub fn from_record(record: &Record) -> Result<Self, EngineError> {
        let collection_id = record
            .uuid("collection_id")
            .ok_or_else(|| EngineError::invalid("collection_id must be a uuid"))?;
        let field_type = record
            .text("field_type")
            .map(FieldType::from)
            .ok_or_else(|| EngineError::invalid("field_type is required"))?;
        Ok(Self {
            collection_id,
            name: record.text("name").unwrap_or_default().to_string(),
            display_name: record.non_empty_text("display_name").map(str::to_string),
            field_type,
            primary: record.bool("primary").unwrap_or(false),
            required: record.bool("required").unwrap_or(false),
            unique: record.bool("unique").unwrap_or(false),
            default_value: record.text("default_value").map(str::to_string),
            validation: parse_json_column(record, "validation")?.unwrap_or_default(),
            sort_order: record.i64("sort_order").unwrap_or(0),
            relation: parse_json_column(record, "relation")?,
        })
    }
}

/// Metadata-only changes to a field. `None` leaves a value unchanged.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldPatch {
    pub name: Option<String>,
    pub display_name: Option<String>,
    pub field_type: Option<FieldType>,
    pub required: Option<bool>,
    pub unique: Option<bool>,
    pub default_value: Option<Option<String>>,
    pub validation: Option<ValidationRules>,
    pub sort_order: Option<i64>,
    pub relation: Option<Option<RelationConfig>>,
}

impl FieldPatch {
    pub fn from_record(record: &Record) -> Result<Self, EngineError> {
        Ok(Self {
            name: record.text("name").map(str::to_string),
            display_name: record.text("display_name").map(str::to_string),
            field_type: record.text("field_type").map(FieldType::from),
            required: record.bool("required"),
            unique: record.bool("unique"),
            default_value: record
                .get("default_value")
                .map(|v| v.as_str().map(str::to_string)),
            validation: parse_json_column(record, "validation")?,
            sort_order: record.i64("sort_order"),
            relation: match record.get("relation") {
                Some(DynamicValue::Null) => Some(None),
                Some(_) => Some(parse_json_column(record, "relation")?),
                None => None,
            },
        })
    }
}

fn parse_json_column<T: serde::de::DeserializeOwned>(
    record: &Record,
    column: &str,
) -> Result<Option<T>, EngineError> {
    match record.json(column) {
        Some(raw) => serde_json::from_value(raw.clone())
            .map(Some)
            .map_err(|e| EngineError::invalid(format!("{column}: {e}"))),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::{
        Cardinality, Collection, Field, FieldDraft, RelationConfig, ValidationRules,
        is_server_managed,
    };
    use crate::catalog::SystemRow;
    use crate::catalog::types::{FieldType, Record};
    use serde_json::json;
    use uuid::Uuid;

    #[test]
    fn field_rows_round_trip_through_records() {
        let field = Field {
            id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            collection_id: Uuid::new_v4(),
            relation: Some(RelationConfig {
                target_collection: "authors".into(),
                cardinality: Cardinality::ManyToOne,
            }),
            ..Field::new("author", FieldType::Relation).with_rules(ValidationRules {
                max_length: Some(36),
                ..ValidationRules::default()
            })
        };
        let decoded = Field::from_record(&field.to_record()).expect("decode");
        assert_eq!(decoded, field);
    }

    #[test]
    fn collection_rows_require_identity_columns() {
        let err = Collection::from_record(&Record::new().with("name", "notes"))
            .expect_err("missing id");
        assert_eq!(err.code_str(), "internal");
    }

    #[test]
    fn field_draft_reads_structured_columns() {
        let collection_id = Uuid::new_v4();
        let record = Record::try_from(json!({
            "collection_id": collection_id.to_string(),
            "name": "rating",
            "field_type": "integer",
            "validation": {"min": 1, "max": 5}
        }))
        .expect("record");
        let draft = FieldDraft::from_record(&record).expect("draft");
        assert_eq!(draft.collection_id, collection_id);
        assert_eq!(draft.field_type, FieldType::Integer);
        assert_eq!(draft.validation.min, Some(1.0));
        assert_eq!(draft.validation.max, Some(5.0));
    }

    #[test]
    fn new_collections_start_with_server_fields() {
        let fields = Field::server_defaults(Uuid::new_v4(), Uuid::new_v4());
        assert!(fields.iter().all(|f| is_server_managed(&f.name)));
        assert!(fields.iter().any(|f| f.primary && f.name == "id"));
        assert!(fields.iter().all(|f| !f.required));
    }
}
