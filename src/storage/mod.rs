//! Storage seams and the deadline-aware handle the engine talks through.
//!
//! Backends report [`StorageError`]s that may name physical tables and
//! columns. The handle translates them into [`EngineError`]s at the call site
//! and logs the raw detail; nothing physical leaks past it.

pub mod memory;

use crate::catalog::SystemRow;
use crate::catalog::schema::{Field, ID_COLUMN};
use crate::catalog::system::SystemTable;
use crate::catalog::types::{DynamicValue, Record};
use crate::context::Deadline;
use crate::error::{EngineError, ResourceType, StorageError};
use crate::query::builder::{
    PhysicalTable, Projection, Select, Statement, build_delete_where, build_insert, build_select,
    build_update,
};
use crate::query::plan::Expr;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, error};
use uuid::Uuid;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecOutcome {
    pub rows_affected: u64,
    /// Rows produced by a select, or returned by an insert/update.
    pub rows: Vec<Record>,
}

/// Executes data statements against physical tables.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn table_exists(&self, table: &PhysicalTable) -> Result<bool, StorageError>;

    async fn execute(&self, statement: &Statement) -> Result<ExecOutcome, StorageError>;
}

/// Applies physical schema changes for collections and fields.
#[async_trait]
pub trait SchemaMaterializer: Send + Sync {
    async fn materialize_collection(
        &self,
        collection_id: Uuid,
        table: &PhysicalTable,
        fields: &[Field],
    ) -> Result<(), StorageError>;

    /// Drops the table if it exists.
    async fn drop_collection_table(
        &self,
        collection_id: Uuid,
        table: &PhysicalTable,
    ) -> Result<(), StorageError>;

    async fn add_physical_column(
        &self,
        tenant_id: Uuid,
        table: &PhysicalTable,
        field: &Field,
    ) -> Result<(), StorageError>;

    /// Drops the column if it exists.
    async fn drop_physical_column(
        &self,
        tenant_id: Uuid,
        table: &PhysicalTable,
        column: &str,
    ) -> Result<(), StorageError>;
}

pub(crate) fn resource_for(table: &PhysicalTable) -> ResourceType {
    match table.system_table() {
        Some(SystemTable::Tenants) => ResourceType::Tenant,
        Some(SystemTable::Users | SystemTable::UserRoles | SystemTable::ApiKeys) => {
            ResourceType::User
        }
        Some(SystemTable::Roles) => ResourceType::Role,
        Some(SystemTable::Permissions) => ResourceType::Permission,
        Some(SystemTable::Collections) => ResourceType::Collection,
        Some(SystemTable::Fields) => ResourceType::Field,
        None => ResourceType::Row,
    }
}

/// Maps a backend fault to the caller-facing error. Unique violations become
/// conflicts; everything else is internal and logged with its detail.
pub(crate) fn translate(err: StorageError, table: &PhysicalTable) -> EngineError {
    match err {
        StorageError::UniqueViolation { .. } => {
            debug!(table = %table.qualified(), error = %err, "unique key violation");
            EngineError::conflict(resource_for(table))
        }
        other => {
            error!(table = %table.qualified(), error = %other, "storage fault");
            EngineError::internal(other.to_string())
        }
    }
}

/// Shared, cloneable access to a [`Storage`] backend.
#[derive(Clone)]
pub struct StorageHandle {
    storage: Arc<dyn Storage>,
}

impl StorageHandle {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    pub async fn execute(
        &self,
        deadline: Deadline,
        statement: &Statement,
    ) -> Result<ExecOutcome, EngineError> {
        deadline
            .run(async {
                self.storage
                    .execute(statement)
                    .await
                    .map_err(|e| translate(e, statement.table()))
            })
            .await
    }

    pub async fn table_exists(
        &self,
        deadline: Deadline,
        table: &PhysicalTable,
    ) -> Result<bool, EngineError> {
        deadline
            .run(async {
                self.storage
                    .table_exists(table)
                    .await
                    .map_err(|e| translate(e, table))
            })
            .await
    }

    pub async fn select(&self, deadline: Deadline, select: Select) -> Result<Vec<Record>, EngineError> {
        Ok(self.execute(deadline, &Statement::Select(select)).await?.rows)
    }

    pub async fn fetch_all<R: SystemRow>(
        &self,
        deadline: Deadline,
        filter: Option<Expr>,
    ) -> Result<Vec<R>, EngineError> {
        let select = build_select(PhysicalTable::system(R::TABLE), Projection::All, filter);
        self.select(deadline, select)
            .await?
            .iter()
            .map(R::from_record)
            .collect()
    }

    pub async fn fetch_one<R: SystemRow>(
        &self,
        deadline: Deadline,
        filter: Expr,
    ) -> Result<Option<R>, EngineError> {
        let select =
            build_select(PhysicalTable::system(R::TABLE), Projection::All, Some(filter)).limit(1);
        match self.select(deadline, select).await?.first() {
            Some(record) => R::from_record(record).map(Some),
            None => Ok(None),
        }
    }

    /// Inserts a typed system row under its own id and returns the stored row.
    pub async fn insert_row<R: SystemRow>(
        &self,
        deadline: Deadline,
        row: &R,
        actor: Option<Uuid>,
    ) -> Result<R, EngineError> {
        let insert = build_insert(PhysicalTable::system(R::TABLE), row.to_record(), actor)?
            .with_id(row.id());
        let outcome = self.execute(deadline, &Statement::Insert(insert)).await?;
        let stored = outcome
            .rows
            .first()
            .ok_or_else(|| EngineError::internal(format!("insert into {} returned no row", R::TABLE.name())))?;
        R::from_record(stored)
    }

    pub async fn update_row<R: SystemRow>(
        &self,
        deadline: Deadline,
        row: &R,
        actor: Option<Uuid>,
    ) -> Result<R, EngineError> {
        let update = build_update(PhysicalTable::system(R::TABLE), row.id(), row.to_record(), actor)?;
        let outcome = self.execute(deadline, &Statement::Update(update)).await?;
        match outcome.rows.first() {
            Some(stored) => R::from_record(stored),
            None => Err(EngineError::not_found(resource_for(&PhysicalTable::system(R::TABLE)))),
        }
    }

    pub async fn delete_where(
        &self,
        deadline: Deadline,
        table: SystemTable,
        filter: Expr,
    ) -> Result<u64, EngineError> {
        let delete = build_delete_where(PhysicalTable::system(table), filter);
        Ok(self
            .execute(deadline, &Statement::Delete(delete))
            .await?
            .rows_affected)
    }

    /// Deletes rows matching `filter` from `table` after removing the rows that
    /// reference them through the table's declared cascades.
    pub async fn delete_with_cascades(
        &self,
        deadline: Deadline,
        table: SystemTable,
        filter: Expr,
    ) -> Result<u64, EngineError> {
        if !table.cascades().is_empty() {
            let select = build_select(
                PhysicalTable::system(table),
                Projection::Columns(vec![ID_COLUMN.to_string()]),
                Some(filter.clone()),
            );
            let ids: Vec<DynamicValue> = self
                .select(deadline, select)
                .await?
                .into_iter()
                .filter_map(|mut r| r.remove(ID_COLUMN))
                .collect();
            if ids.is_empty() {
                return Ok(0);
            }
            for cascade in table.cascades() {
                let removed = self
                    .delete_where(
                        deadline,
                        cascade.child,
                        Expr::In(cascade.column.to_string(), ids.clone()),
                    )
                    .await?;
                debug!(
                    parent = table.name(),
                    child = cascade.child.name(),
                    removed,
                    "cascaded delete"
                );
            }
        }
        self.delete_where(deadline, table, filter).await
    }
}

/// Deadline-aware access to a [`SchemaMaterializer`].
#[derive(Clone)]
pub struct MaterializerHandle {
    inner: Arc<dyn SchemaMaterializer>,
}

impl MaterializerHandle {
    pub fn new(inner: Arc<dyn SchemaMaterializer>) -> Self {
        Self { inner }
    }

    pub async fn materialize_collection(
        &self,
        deadline: Deadline,
        collection_id: Uuid,
        table: &PhysicalTable,
        fields: &[Field],
    ) -> Result<(), EngineError> {
        deadline
            .run(async {
                self.inner
                    .materialize_collection(collection_id, table, fields)
                    .await
                    .map_err(|e| translate(e, table))
            })
            .await
    }

    pub async fn drop_collection_table(
        &self,
        deadline: Deadline,
        collection_id: Uuid,
        table: &PhysicalTable,
    ) -> Result<(), EngineError> {
        deadline
            .run(async {
                self.inner
                    .drop_collection_table(collection_id, table)
                    .await
                    .map_err(|e| translate(e, table))
            })
            .await
    }

    pub async fn add_physical_column(
        &self,
        deadline: Deadline,
        tenant_id: Uuid,
        table: &PhysicalTable,
        field: &Field,
    ) -> Result<(), EngineError> {
        deadline
            .run(async {
                self.inner
                    .add_physical_column(tenant_id, table, field)
                    .await
                    .map_err(|e| translate(e, table))
            })
            .await
    }

    pub async fn drop_physical_column(
        &self,
        deadline: Deadline,
        tenant_id: Uuid,
        table: &PhysicalTable,
        column: &str,
    ) -> Result<(), EngineError> {
        deadline
            .run(async {
                self.inner
                    .drop_physical_column(tenant_id, table, column)
                    .await
                    .map_err(|e| translate(e, table))
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::{resource_for, translate};
    use crate::catalog::system::SystemTable;
    use crate::error::{EngineErrorCode, StorageError};
    use crate::query::builder::PhysicalTable;

    #[test]
    fn unique_violations_become_conflicts_on_the_owning_resource() {
        let table = PhysicalTable::system(SystemTable::Fields);
        let err = translate(
            StorageError::UniqueViolation {
                table: "fields".into(),
                columns: "collection_id, name".into(),
            },
            &table,
        );
        assert_eq!(err.code(), EngineErrorCode::Conflict);
        assert_eq!(err.to_string(), "field already exists");
    }

    #[test]
    fn other_faults_are_opaque() {
        let table = PhysicalTable::dynamic("acme", "notes", "data_").expect("table");
        let err = translate(
            StorageError::UnknownColumn {
                table: table.qualified(),
                column: "secret_col".into(),
            },
            &table,
        );
        assert_eq!(err.code(), EngineErrorCode::Internal);
        assert!(!err.to_string().contains("secret_col"));
        assert!(!err.to_string().contains("data_notes"));
        assert_eq!(resource_for(&table).to_string(), "row");
    }
}
