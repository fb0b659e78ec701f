//! Metadata tables shared structurally by every tenant.
//!
//! System tables live outside tenant namespaces and are row-scoped by
//! `tenant_id` (the `tenants` table is scoped by its own `id`). Each tenant
//! also gets one system [`Collection`](super::schema::Collection) per table so
//! that generic CRUD over metadata is validated like any other collection.

use crate::catalog::types::FieldType;
use SystemFieldType as T;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SystemTable {
    Tenants,
    Users,
    Roles,
    UserRoles,
    Permissions,
    Collections,
    Fields,
    ApiKeys,
}

/// Column that scopes a system table's rows to one tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TenantScope {
    pub column: &'static str,
}

/// Rows of `child` referencing a deleted parent row through `column`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cascade {
    pub child: SystemTable,
    pub column: &'static str,
}

#[derive(Debug, Clone, Copy)]
pub struct SystemFieldDef {
    pub name: &'static str,
    pub field_type: SystemFieldType,
    pub required: bool,
}

/// Field types available to system collections; a `Copy` subset of
/// [`FieldType`] so the definitions can live in consts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemFieldType {
    String,
    Text,
    Integer,
    Boolean,
    DateTime,
    Json,
    Uuid,
}

impl From<SystemFieldType> for FieldType {
    fn from(value: SystemFieldType) -> Self {
        match value {
            SystemFieldType::String => FieldType::String,
            SystemFieldType::Text => FieldType::Text,
            SystemFieldType::Integer => FieldType::Integer,
            SystemFieldType::Boolean => FieldType::Boolean,
            SystemFieldType::DateTime => FieldType::DateTime,
            SystemFieldType::Json => FieldType::Json,
            SystemFieldType::Uuid => FieldType::Uuid,
        }
    }
}

const fn def(name: &'static str, field_type: SystemFieldType, required: bool) -> SystemFieldDef {
    SystemFieldDef {
        name,
        field_type,
        required,
    }
}

const TENANT_FIELDS: &[SystemFieldDef] = &[
    def("name", T::String, true),
    def("slug", T::String, true),
    def("active", T::Boolean, false),
];

const USER_FIELDS: &[SystemFieldDef] = &[
    def("email", T::String, true),
    def("name", T::String, false),
    def("active", T::Boolean, false),
];

const ROLE_FIELDS: &[SystemFieldDef] = &[
    def("name", T::String, true),
    def("description", T::Text, false),
];

const USER_ROLE_FIELDS: &[SystemFieldDef] = &[
    def("user_id", T::Uuid, true),
    def("role_id", T::Uuid, true),
];

const PERMISSION_FIELDS: &[SystemFieldDef] = &[
    def("role_id", T::Uuid, true),
    def("table_name", T::String, true),
    def("action", T::String, true),
    def("allowed_fields", T::Json, false),
    def("row_filter", T::Json, false),
];

const COLLECTION_FIELDS: &[SystemFieldDef] = &[
    def("name", T::String, true),
    def("display_name", T::String, false),
    def("description", T::Text, false),
    def("icon", T::String, false),
    def("system", T::Boolean, false),
];

const FIELD_FIELDS: &[SystemFieldDef] = &[
    def("collection_id", T::Uuid, true),
    def("name", T::String, true),
    def("display_name", T::String, false),
    def("field_type", T::String, true),
    def("primary", T::Boolean, false),
    def("required", T::Boolean, false),
    def("unique", T::Boolean, false),
    def("default_value", T::Text, false),
    def("validation", T::Json, false),
    def("sort_order", T::Integer, false),
    def("relation", T::Json, false),
];

const API_KEY_FIELDS: &[SystemFieldDef] = &[
    def("user_id", T::Uuid, true),
    def("name", T::String, true),
    def("key_prefix", T::String, false),
    def("expires_at", T::DateTime, false),
    def("active", T::Boolean, false),
];

impl SystemTable {
    pub const ALL: [SystemTable; 8] = [
        SystemTable::Tenants,
        SystemTable::Users,
        SystemTable::Roles,
        SystemTable::UserRoles,
        SystemTable::Permissions,
        SystemTable::Collections,
        SystemTable::Fields,
        SystemTable::ApiKeys,
    ];

    pub fn name(self) -> &'static str {
        match self {
            SystemTable::Tenants => "tenants",
            SystemTable::Users => "users",
            SystemTable::Roles => "roles",
            SystemTable::UserRoles => "user_roles",
            SystemTable::Permissions => "permissions",
            SystemTable::Collections => "collections",
            SystemTable::Fields => "fields",
            SystemTable::ApiKeys => "api_keys",
        }
    }

    pub fn from_name(name: &str) -> Option<SystemTable> {
        SystemTable::ALL.into_iter().find(|t| t.name() == name)
    }

    pub fn tenant_scope(self) -> TenantScope {
        match self {
            SystemTable::Tenants => TenantScope { column: "id" },
            _ => TenantScope {
                column: "tenant_id",
            },
        }
    }

    /// Tables whose rows cannot be written through generic CRUD.
    pub fn read_only(self) -> bool {
        matches!(self, SystemTable::Tenants)
    }

    /// Column sets that must be unique across the table.
    pub fn unique_keys(self) -> &'static [&'static [&'static str]] {
        match self {
            SystemTable::Tenants => &[&["slug"]],
            SystemTable::Users => &[&["tenant_id", "email"]],
            SystemTable::Roles => &[&["tenant_id", "name"]],
            SystemTable::UserRoles => &[&["user_id", "role_id"]],
            SystemTable::Permissions => &[&["tenant_id", "role_id", "table_name", "action"]],
            SystemTable::Collections => &[&["tenant_id", "name"]],
            SystemTable::Fields => &[&["collection_id", "name"]],
            SystemTable::ApiKeys => &[&["tenant_id", "name"]],
        }
    }

    pub fn cascades(self) -> &'static [Cascade] {
        match self {
            SystemTable::Roles => &[
                Cascade {
                    child: SystemTable::Permissions,
                    column: "role_id",
                },
                Cascade {
                    child: SystemTable::UserRoles,
                    column: "role_id",
                },
            ],
            SystemTable::Users => &[
                Cascade {
                    child: SystemTable::UserRoles,
                    column: "user_id",
                },
                Cascade {
                    child: SystemTable::ApiKeys,
                    column: "user_id",
                },
            ],
            _ => &[],
        }
    }

    /// Caller-writable field definitions registered for the table's system
    /// collection.
    pub fn fields(self) -> &'static [SystemFieldDef] {
        match self {
            SystemTable::Tenants => TENANT_FIELDS,
            SystemTable::Users => USER_FIELDS,
            SystemTable::Roles => ROLE_FIELDS,
            SystemTable::UserRoles => USER_ROLE_FIELDS,
            SystemTable::Permissions => PERMISSION_FIELDS,
            SystemTable::Collections => COLLECTION_FIELDS,
            SystemTable::Fields => FIELD_FIELDS,
            SystemTable::ApiKeys => API_KEY_FIELDS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::SystemTable;

    #[test]
    fn names_round_trip() {
        for table in SystemTable::ALL {
            assert_eq!(SystemTable::from_name(table.name()), Some(table));
        }
        assert_eq!(SystemTable::from_name("notes"), None);
    }

    #[test]
    fn field_uniqueness_is_scoped_to_its_collection() {
        assert_eq!(
            SystemTable::Fields.unique_keys(),
            &[&["collection_id", "name"][..]]
        );
    }

    #[test]
    fn role_deletion_cascades_to_rules_and_assignments() {
        let children: Vec<_> = SystemTable::Roles
            .cascades()
            .iter()
            .map(|c| c.child)
            .collect();
        assert_eq!(
            children,
            vec![SystemTable::Permissions, SystemTable::UserRoles]
        );
    }
}
