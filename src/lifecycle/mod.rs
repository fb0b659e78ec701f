//! Collection and field definitions together with their physical tables and
//! columns.
//!
//! Metadata rows and physical schema live in places no single transaction
//! spans, so every creation runs as a [`Saga`]: each completed step records
//! its undo, and a failed later step replays them before the error is
//! returned.

pub mod saga;

use crate::catalog::SchemaCatalog;
use crate::catalog::schema::{
    Collection, CollectionDraft, CollectionPatch, Field, FieldDraft, FieldPatch, TENANT_COLUMN,
    is_server_managed,
};
use crate::catalog::system::SystemTable;
use crate::catalog::types::FieldType;
use crate::config::EngineConfig;
use crate::context::Deadline;
use crate::error::{EngineError, ResourceType};
use crate::lifecycle::saga::{Compensation, Saga};
use crate::query::builder::{PhysicalTable, validate_identifier};
use crate::query::plan::Expr;
use crate::storage::{MaterializerHandle, StorageHandle};
use crate::tenancy::TenantResolver;
use crate::validation::default_value;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// System collections have a fixed shape owned by the engine.
fn reject_system(collection: &Collection) -> Result<(), EngineError> {
    if collection.system {
        return Err(EngineError::invalid(format!(
            "fields of system collection '{}' cannot be changed",
            collection.name
        )));
    }
    Ok(())
}

#[derive(Clone)]
pub struct LifecycleManager {
    storage: StorageHandle,
    materializer: MaterializerHandle,
    catalog: SchemaCatalog,
    tenants: TenantResolver,
    config: Arc<EngineConfig>,
}

impl LifecycleManager {
    pub fn new(
        storage: StorageHandle,
        materializer: MaterializerHandle,
        tenants: TenantResolver,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self {
            catalog: SchemaCatalog::new(storage.clone()),
            storage,
            materializer,
            tenants,
            config,
        }
    }

    pub fn catalog(&self) -> &SchemaCatalog {
        &self.catalog
    }

    /// Physical table backing a non-system collection.
    pub async fn physical_table(
        &self,
        deadline: Deadline,
        collection: &Collection,
    ) -> Result<PhysicalTable, EngineError> {
        let namespace = self
            .tenants
            .resolve_namespace(deadline, collection.tenant_id)
            .await?;
        PhysicalTable::dynamic(&namespace, &collection.name, &self.config.dynamic_table_prefix)
    }

    pub async fn create_collection(
        &self,
        deadline: Deadline,
        tenant_id: Uuid,
        actor: Uuid,
        draft: CollectionDraft,
    ) -> Result<Collection, EngineError> {
        if draft.system {
            return Err(EngineError::invalid("system collections are managed by the engine"));
        }
        validate_identifier(&draft.name, self.config.max_identifier_len)?;
        if SystemTable::from_name(&draft.name).is_some() {
            return Err(EngineError::conflict(ResourceType::Collection));
        }
        let collection = Collection {
            id: draft.id.unwrap_or_else(Uuid::new_v4),
            tenant_id,
            name: draft.name,
            display_name: draft.display_name,
            description: draft.description,
            icon: draft.icon,
            system: false,
            created_by: Some(actor),
            updated_by: Some(actor),
            created_at: None,
            updated_at: None,
        };
        let table = self.physical_table(deadline, &collection).await?;

        let stored = self
            .storage
            .insert_row(deadline, &collection, Some(actor))
            .await?;
        let mut saga = Saga::new("create_collection", &self.storage, &self.materializer);
        saga.record(Compensation::DeleteRow {
            table: SystemTable::Collections,
            id: stored.id,
        });
        saga.record(Compensation::DeleteRowsWhere {
            table: SystemTable::Fields,
            filter: Expr::eq("collection_id", stored.id),
        });
        let fields = saga
            .check(self.insert_fields(deadline, Field::server_defaults(tenant_id, stored.id), Some(actor)).await)
            .await?;
        saga.record(Compensation::DropCollectionTable {
            collection_id: stored.id,
            table: table.clone(),
        });
        saga.check(
            self.materializer
                .materialize_collection(deadline, stored.id, &table, &fields)
                .await,
        )
        .await?;
        saga.complete();
        info!(
            %tenant_id,
            collection_id = %stored.id,
            table = %table.qualified(),
            "collection created"
        );
        Ok(stored)
    }

    /// Registers the metadata collection for a system table. Never
    /// materialized.
    pub(crate) async fn register_system_collection(
        &self,
        deadline: Deadline,
        tenant_id: Uuid,
        table: SystemTable,
    ) -> Result<Collection, EngineError> {
        let collection = Collection {
            id: Uuid::new_v4(),
            tenant_id,
            name: table.name().to_string(),
            display_name: None,
            description: None,
            icon: None,
            system: true,
            created_by: None,
            updated_by: None,
            created_at: None,
            updated_at: None,
        };
        let stored = self.storage.insert_row(deadline, &collection, None).await?;
        let mut fields = Field::server_defaults(tenant_id, stored.id);
        fields.extend(table.fields().iter().enumerate().map(|(i, def)| Field {
            id: Uuid::new_v4(),
            tenant_id,
            collection_id: stored.id,
            required: def.required,
            sort_order: i as i64,
            ..Field::new(def.name, FieldType::from(def.field_type))
        }));
        self.insert_fields(deadline, fields, None).await?;
        Ok(stored)
    }

    async fn insert_fields(
        &self,
        deadline: Deadline,
        fields: Vec<Field>,
        actor: Option<Uuid>,
    ) -> Result<Vec<Field>, EngineError> {
        let mut stored = Vec::with_capacity(fields.len());
        for field in &fields {
            stored.push(self.storage.insert_row(deadline, field, actor).await?);
        }
        Ok(stored)
    }

    /// Changes display metadata. Renames are rejected: no collaborator can
    /// rename a physical table.
    pub async fn update_collection(
        &self,
        deadline: Deadline,
        tenant_id: Uuid,
        actor: Uuid,
        collection_id: Uuid,
        patch: CollectionPatch,
    ) -> Result<Collection, EngineError> {
        let mut collection = self
            .catalog
            .get_collection_by_id(deadline, tenant_id, collection_id)
            .await?;
        if collection.system {
            return Err(EngineError::invalid("system collections cannot be modified"));
        }
        if let Some(name) = &patch.name
            && *name != collection.name
        {
            return Err(EngineError::invalid("collections cannot be renamed"));
        }
        if let Some(display_name) = patch.display_name {
            collection.display_name = Some(display_name).filter(|s| !s.is_empty());
        }
        if let Some(description) = patch.description {
            collection.description = Some(description).filter(|s| !s.is_empty());
        }
        if let Some(icon) = patch.icon {
            collection.icon = Some(icon).filter(|s| !s.is_empty());
        }
        self.storage
            .update_row(deadline, &collection, Some(actor))
            .await
    }

    /// Drops the physical table, then the field definitions, the permission
    /// rules naming the collection, and finally the collection row. Refused
    /// while relation fields elsewhere still target the collection.
    pub async fn delete_collection(
        &self,
        deadline: Deadline,
        tenant_id: Uuid,
        collection_id: Uuid,
    ) -> Result<(), EngineError> {
        let collection = self
            .catalog
            .get_collection_by_id(deadline, tenant_id, collection_id)
            .await?;
        if collection.system {
            return Err(EngineError::invalid("system collections cannot be deleted"));
        }
        let referencing: Vec<Field> = self
            .storage
            .fetch_all::<Field>(deadline, Some(Expr::eq(TENANT_COLUMN, tenant_id)))
            .await?
            .into_iter()
            .filter(|f| {
                f.collection_id != collection.id
                    && f.relation
                        .as_ref()
                        .is_some_and(|r| r.target_collection == collection.name)
            })
            .collect();
        if !referencing.is_empty() {
            let fields: Vec<&str> = referencing.iter().map(|f| f.name.as_str()).collect();
            warn!(
                %tenant_id,
                %collection_id,
                ?fields,
                "collection is still the target of relation fields"
            );
            return Err(EngineError::conflict(ResourceType::Field));
        }
        let table = self.physical_table(deadline, &collection).await?;
        self.materializer
            .drop_collection_table(deadline, collection.id, &table)
            .await?;
        self.storage
            .delete_where(
                deadline,
                SystemTable::Fields,
                Expr::eq("collection_id", collection.id),
            )
            .await?;
        self.storage
            .delete_where(
                deadline,
                SystemTable::Permissions,
                Expr::eq(TENANT_COLUMN, tenant_id).and(Expr::eq("table_name", collection.name.as_str())),
            )
            .await?;
        self.storage
            .delete_where(
                deadline,
                SystemTable::Collections,
                Expr::eq("id", collection.id),
            )
            .await?;
        info!(%tenant_id, %collection_id, table = %table.qualified(), "collection deleted");
        Ok(())
    }

    fn check_field_name(&self, name: &str) -> Result<(), EngineError> {
        if name.trim().is_empty() {
            return Err(EngineError::invalid("field name must not be empty"));
        }
        if name.len() > self.config.max_identifier_len {
            return Err(EngineError::invalid(format!(
                "field name exceeds {} characters",
                self.config.max_identifier_len
            )));
        }
        if name.chars().any(char::is_control) {
            return Err(EngineError::invalid("field name contains control characters"));
        }
        if is_server_managed(name) {
            return Err(EngineError::invalid(format!("'{name}' is managed by the engine")));
        }
        Ok(())
    }

    async fn check_relation(
        &self,
        deadline: Deadline,
        tenant_id: Uuid,
        field: &Field,
    ) -> Result<(), EngineError> {
        match (&field.field_type, &field.relation) {
            (FieldType::Relation, None) => Err(EngineError::invalid(
                "relation fields need a target collection",
            )),
            (_, Some(relation)) => match self
                .catalog
                .get_collection(deadline, tenant_id, &relation.target_collection)
                .await
            {
                Ok(_) => Ok(()),
                Err(EngineError::NotFound { .. }) => Err(EngineError::invalid(format!(
                    "unknown relation target '{}'",
                    relation.target_collection
                ))),
                Err(other) => Err(other),
            },
            _ => Ok(()),
        }
    }

    pub async fn create_field(
        &self,
        deadline: Deadline,
        tenant_id: Uuid,
        actor: Uuid,
        draft: FieldDraft,
    ) -> Result<Field, EngineError> {
        let collection = self
            .catalog
            .get_collection_by_id(deadline, tenant_id, draft.collection_id)
            .await?;
        reject_system(&collection)?;
        self.check_field_name(&draft.name)?;
        let field = Field {
            id: Uuid::new_v4(),
            tenant_id,
            collection_id: collection.id,
            name: draft.name,
            display_name: draft.display_name,
            field_type: draft.field_type,
            primary: draft.primary,
            required: draft.required,
            unique: draft.unique,
            default_value: draft.default_value,
            validation: draft.validation,
            sort_order: draft.sort_order,
            relation: draft.relation,
        };
        default_value(&field)?;
        self.check_relation(deadline, tenant_id, &field).await?;

        let table = self.physical_table(deadline, &collection).await?;
        let stored = self.storage.insert_row(deadline, &field, Some(actor)).await?;
        let mut saga = Saga::new("create_field", &self.storage, &self.materializer);
        saga.record(Compensation::DeleteRow {
            table: SystemTable::Fields,
            id: stored.id,
        });
        saga.check(
            self.materializer
                .add_physical_column(deadline, tenant_id, &table, &stored)
                .await,
        )
        .await?;
        saga.complete();
        info!(
            %tenant_id,
            collection_id = %collection.id,
            field = %stored.name,
            "field created"
        );
        Ok(stored)
    }

    /// Metadata-only changes. Name and type are fixed once the column exists.
    pub async fn update_field(
        &self,
        deadline: Deadline,
        tenant_id: Uuid,
        actor: Uuid,
        field_id: Uuid,
        patch: FieldPatch,
    ) -> Result<Field, EngineError> {
        let mut field = self.catalog.get_field(deadline, tenant_id, field_id).await?;
        if is_server_managed(&field.name) {
            return Err(EngineError::invalid(format!(
                "'{}' is managed by the engine",
                field.name
            )));
        }
        let collection = self
            .catalog
            .get_collection_by_id(deadline, tenant_id, field.collection_id)
            .await?;
        reject_system(&collection)?;
        if let Some(name) = &patch.name
            && *name != field.name
        {
            return Err(EngineError::invalid("fields cannot be renamed"));
        }
        if let Some(field_type) = &patch.field_type
            && *field_type != field.field_type
        {
            return Err(EngineError::invalid("field type cannot be changed"));
        }
        if let Some(display_name) = patch.display_name {
            field.display_name = Some(display_name).filter(|s| !s.is_empty());
        }
        if let Some(required) = patch.required {
            field.required = required;
        }
        if let Some(unique) = patch.unique {
            field.unique = unique;
        }
        if let Some(default) = patch.default_value {
            field.default_value = default;
        }
        if let Some(rules) = patch.validation {
            field.validation = rules;
        }
        if let Some(order) = patch.sort_order {
            field.sort_order = order;
        }
        if let Some(relation) = patch.relation {
            field.relation = relation;
        }
        default_value(&field)?;
        self.check_relation(deadline, tenant_id, &field).await?;
        self.storage.update_row(deadline, &field, Some(actor)).await
    }

    /// Drops the physical column, then the definition.
    pub async fn delete_field(
        &self,
        deadline: Deadline,
        tenant_id: Uuid,
        field_id: Uuid,
    ) -> Result<(), EngineError> {
        let field = self.catalog.get_field(deadline, tenant_id, field_id).await?;
        if is_server_managed(&field.name) {
            return Err(EngineError::invalid(format!(
                "'{}' is managed by the engine",
                field.name
            )));
        }
        let collection = self
            .catalog
            .get_collection_by_id(deadline, tenant_id, field.collection_id)
            .await?;
        reject_system(&collection)?;
        let table = self.physical_table(deadline, &collection).await?;
        self.materializer
            .drop_physical_column(deadline, tenant_id, &table, &field.name)
            .await?;
        self.storage
            .delete_where(deadline, SystemTable::Fields, Expr::eq("id", field.id))
            .await?;
        info!(%tenant_id, %field_id, field = %field.name, "field deleted");
        Ok(())
    }
}
