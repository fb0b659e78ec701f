use crate::catalog::schema::{ID_COLUMN, TENANT_COLUMN};
use crate::catalog::system::SystemTable;
use crate::catalog::types::Record;
use crate::catalog::{SystemRow, require};
use crate::error::EngineError;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Names that cannot be used as a physical namespace as-is.
const RESERVED_NAMESPACES: &[&str] = &[
    "public",
    "information_schema",
    "default",
    "system",
    "user",
    "select",
    "insert",
    "update",
    "delete",
    "table",
    "schema",
    "from",
    "where",
    "order",
    "group",
    "grant",
    "all",
];

const RESERVED_PREFIXES: &[&str] = &["pg_", "sql_"];
const REMAP_PREFIX: &str = "t_";

/// Turns a requested slug into a namespace-safe identifier.
///
/// Lowercases, replaces anything outside `[a-z0-9_]` with `_`, and prefixes
/// slugs that start with a digit or collide with a reserved name.
pub fn normalize_slug(raw: &str) -> Result<String, EngineError> {
    let mut slug: String = raw
        .trim()
        .chars()
        .map(|c| {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_alphanumeric() || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if slug.is_empty() || slug.chars().all(|c| c == '_') {
        return Err(EngineError::invalid("tenant slug must contain a letter or digit"));
    }
    let reserved = RESERVED_NAMESPACES.contains(&slug.as_str())
        || RESERVED_PREFIXES.iter().any(|p| slug.starts_with(p));
    if reserved || slug.starts_with(|c: char| c.is_ascii_digit()) {
        slug.insert_str(0, REMAP_PREFIX);
    }
    Ok(slug)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tenant {
    pub id: Uuid,
    pub name: String,
    /// Also the tenant's physical namespace name.
    pub slug: String,
    pub active: bool,
}

impl SystemRow for Tenant {
    const TABLE: SystemTable = SystemTable::Tenants;

    fn id(&self) -> Uuid {
        self.id
    }

    fn to_record(&self) -> Record {
        Record::new()
            .with(ID_COLUMN, self.id)
            .with("name", self.name.as_str())
            .with("slug", self.slug.as_str())
            .with("active", self.active)
    }

    fn from_record(record: &Record) -> Result<Self, EngineError> {
        Ok(Self {
            id: require::<Self, _>(record.uuid(ID_COLUMN), ID_COLUMN)?,
            name: require::<Self, _>(record.text("name"), "name")?.to_string(),
            slug: require::<Self, _>(record.text("slug"), "slug")?.to_string(),
            active: record.bool("active").unwrap_or(true),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub email: String,
    pub name: Option<String>,
    pub active: bool,
}

impl SystemRow for User {
    const TABLE: SystemTable = SystemTable::Users;

    fn id(&self) -> Uuid {
        self.id
    }

    fn to_record(&self) -> Record {
        Record::new()
            .with(ID_COLUMN, self.id)
            .with(TENANT_COLUMN, self.tenant_id)
            .with("email", self.email.as_str())
            .with("name", self.name.clone())
            .with("active", self.active)
    }

    fn from_record(record: &Record) -> Result<Self, EngineError> {
        Ok(Self {
            id: require::<Self, _>(record.uuid(ID_COLUMN), ID_COLUMN)?,
            tenant_id: require::<Self, _>(record.uuid(TENANT_COLUMN), TENANT_COLUMN)?,
            email: require::<Self, _>(record.text("email"), "email")?.to_string(),
            name: record.non_empty_text("name").map(str::to_string),
            active: record.bool("active").unwrap_or(true),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    pub description: Option<String>,
}

impl SystemRow for Role {
    const TABLE: SystemTable = SystemTable::Roles;

    fn id(&self) -> Uuid {
        self.id
    }

    fn to_record(&self) -> Record {
        Record::new()
            .with(ID_COLUMN, self.id)
            .with(TENANT_COLUMN, self.tenant_id)
            .with("name", self.name.as_str())
            .with("description", self.description.clone())
    }

    fn from_record(record: &Record) -> Result<Self, EngineError> {
        Ok(Self {
            id: require::<Self, _>(record.uuid(ID_COLUMN), ID_COLUMN)?,
            tenant_id: require::<Self, _>(record.uuid(TENANT_COLUMN), TENANT_COLUMN)?,
            name: require::<Self, _>(record.text("name"), "name")?.to_string(),
            description: record.non_empty_text("description").map(str::to_string),
        })
    }
}

/// A user holding a role within one tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleAssignment {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub user_id: Uuid,
    pub role_id: Uuid,
}

impl SystemRow for RoleAssignment {
    const TABLE: SystemTable = SystemTable::UserRoles;

    fn id(&self) -> Uuid {
        self.id
    }

    fn to_record(&self) -> Record {
        Record::new()
            .with(ID_COLUMN, self.id)
            .with(TENANT_COLUMN, self.tenant_id)
            .with("user_id", self.user_id)
            .with("role_id", self.role_id)
    }

    fn from_record(record: &Record) -> Result<Self, EngineError> {
        Ok(Self {
            id: require::<Self, _>(record.uuid(ID_COLUMN), ID_COLUMN)?,
            tenant_id: require::<Self, _>(record.uuid(TENANT_COLUMN), TENANT_COLUMN)?,
            user_id: require::<Self, _>(record.uuid("user_id"), "user_id")?,
            role_id: require::<Self, _>(record.uuid("role_id"), "role_id")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::normalize_slug;

    #[test]
    fn slugs_are_lowercased_and_sanitized() {
        assert_eq!(normalize_slug("Acme Corp").expect("slug"), "acme_corp");
        assert_eq!(normalize_slug("acme-eu.1").expect("slug"), "acme_eu_1");
    }

    #[test]
    fn reserved_and_numeric_slugs_are_remapped() {
        assert_eq!(normalize_slug("public").expect("slug"), "t_public");
        assert_eq!(normalize_slug("pg_stats").expect("slug"), "t_pg_stats");
        assert_eq!(normalize_slug("42labs").expect("slug"), "t_42labs");
    }

    #[test]
    fn punctuation_only_slugs_are_rejected() {
        assert!(normalize_slug("--").is_err());
        assert!(normalize_slug("").is_err());
    }
}
