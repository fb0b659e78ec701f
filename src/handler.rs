//! Per-table execution strategies.
//!
//! The engine authorizes, validates and trims; a [`TableHandler`] only turns
//! an already-approved request into statements. Dynamic collections, the
//! tenant-scoped system tables and the two schema tables (whose writes go
//! through the lifecycle manager) each get their own handler.

use crate::catalog::SystemRow;
use crate::catalog::schema::{
    Collection, CollectionDraft, CollectionPatch, FieldDraft, FieldPatch, ID_COLUMN,
};
use crate::catalog::system::SystemTable;
use crate::catalog::types::Record;
use crate::config::EngineConfig;
use crate::context::Deadline;
use crate::error::{EngineError, ResourceType};
use crate::filter::RowFilter;
use crate::lifecycle::LifecycleManager;
use crate::permission::{Action, decode_allowed_fields};
use crate::query::builder::{
    PhysicalTable, Projection, Statement, build_delete, build_insert,
    build_select, build_update,
};
use crate::query::plan::{Expr, Order};
use crate::storage::{StorageHandle, resource_for};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Request-scoped inputs shared by every handler call.
#[derive(Debug, Clone, Copy)]
pub struct HandlerContext<'a> {
    pub deadline: Deadline,
    pub tenant_id: Uuid,
    pub actor: Uuid,
    pub collection: &'a Collection,
    /// Row restriction from the caller's permission rules.
    pub scope: Option<&'a Expr>,
}

impl HandlerContext<'_> {
    fn scoped(&self, filter: Expr) -> Expr {
        match self.scope {
            Some(scope) => filter.and(scope.clone()),
            None => filter,
        }
    }
}

/// Options for a list read.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListQuery {
    pub filter: Option<Expr>,
    pub order_by: Vec<(String, Order)>,
    pub limit: Option<usize>,
}

impl ListQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, expr: Expr) -> Self {
        self.filter = Some(match self.filter {
            Some(existing) => existing.and(expr),
            None => expr,
        });
        self
    }

    pub fn order_by(mut self, column: impl Into<String>, order: Order) -> Self {
        self.order_by.push((column.into(), order));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Columns the query reads, for permission checks.
    pub fn columns(&self) -> Vec<&str> {
        let mut columns: Vec<&str> = self
            .filter
            .as_ref()
            .map(Expr::columns)
            .unwrap_or_default();
        columns.extend(self.order_by.iter().map(|(c, _)| c.as_str()));
        columns
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReadOutcome {
    Rows(Vec<Record>),
    /// The collection exists but its physical table does not.
    NotMaterialized,
}

impl ReadOutcome {
    pub fn into_rows(self) -> Vec<Record> {
        match self {
            ReadOutcome::Rows(rows) => rows,
            ReadOutcome::NotMaterialized => Vec::new(),
        }
    }
}

#[async_trait]
pub trait TableHandler: Send + Sync {
    async fn list(
        &self,
        cx: &HandlerContext<'_>,
        projection: Projection,
        query: ListQuery,
    ) -> Result<ReadOutcome, EngineError>;

    async fn get(
        &self,
        cx: &HandlerContext<'_>,
        id: Uuid,
        projection: Projection,
    ) -> Result<Option<Record>, EngineError>;

    async fn create(&self, cx: &HandlerContext<'_>, values: Record) -> Result<Record, EngineError>;

    async fn update(
        &self,
        cx: &HandlerContext<'_>,
        id: Uuid,
        values: Record,
    ) -> Result<Record, EngineError>;

    async fn delete(&self, cx: &HandlerContext<'_>, id: Uuid) -> Result<(), EngineError>;
}

/// Rows of a tenant's materialized collections.
pub struct DynamicTableHandler {
    storage: StorageHandle,
    lifecycle: LifecycleManager,
}

impl DynamicTableHandler {
    pub fn new(storage: StorageHandle, lifecycle: LifecycleManager) -> Self {
        Self { storage, lifecycle }
    }

    async fn table(&self, cx: &HandlerContext<'_>) -> Result<Option<PhysicalTable>, EngineError> {
        let table = self.lifecycle.physical_table(cx.deadline, cx.collection).await?;
        if self.storage.table_exists(cx.deadline, &table).await? {
            Ok(Some(table))
        } else {
            debug!(
                collection_id = %cx.collection.id,
                table = %table.qualified(),
                "collection has no physical table"
            );
            Ok(None)
        }
    }

    async fn writable_table(&self, cx: &HandlerContext<'_>) -> Result<PhysicalTable, EngineError> {
        self.table(cx)
            .await?
            .ok_or(EngineError::not_found(ResourceType::Collection))
    }
}

#[async_trait]
impl TableHandler for DynamicTableHandler {
    async fn list(
        &self,
        cx: &HandlerContext<'_>,
        projection: Projection,
        query: ListQuery,
    ) -> Result<ReadOutcome, EngineError> {
        let Some(table) = self.table(cx).await? else {
            return Ok(ReadOutcome::NotMaterialized);
        };
        let filter = match (query.filter, cx.scope) {
            (Some(f), _) => Some(cx.scoped(f)),
            (None, Some(scope)) => Some(scope.clone()),
            (None, None) => None,
        };
        let mut select = build_select(table, projection, filter);
        for (column, order) in query.order_by {
            select = select.order_by(column, order);
        }
        if let Some(limit) = query.limit {
            select = select.limit(limit);
        }
        Ok(ReadOutcome::Rows(self.storage.select(cx.deadline, select).await?))
    }

    async fn get(
        &self,
        cx: &HandlerContext<'_>,
        id: Uuid,
        projection: Projection,
    ) -> Result<Option<Record>, EngineError> {
        let Some(table) = self.table(cx).await? else {
            return Ok(None);
        };
        let select = build_select(table, projection, Some(cx.scoped(Expr::eq(ID_COLUMN, id)))).limit(1);
        Ok(self.storage.select(cx.deadline, select).await?.into_iter().next())
    }

    async fn create(&self, cx: &HandlerContext<'_>, values: Record) -> Result<Record, EngineError> {
        let table = self.writable_table(cx).await?;
        let insert = build_insert(table, values, Some(cx.actor))?;
        let outcome = self.storage.execute(cx.deadline, &Statement::Insert(insert)).await?;
        outcome
            .rows
            .into_iter()
            .next()
            .ok_or_else(|| EngineError::internal("insert returned no row"))
    }

    async fn update(
        &self,
        cx: &HandlerContext<'_>,
        id: Uuid,
        values: Record,
    ) -> Result<Record, EngineError> {
        let table = self.writable_table(cx).await?;
        let mut update = build_update(table, id, values, Some(cx.actor))?;
        if let Some(scope) = cx.scope {
            update = update.and_where(scope.clone());
        }
        let outcome = self.storage.execute(cx.deadline, &Statement::Update(update)).await?;
        outcome
            .rows
            .into_iter()
            .next()
            .ok_or(EngineError::not_found(ResourceType::Row))
    }

    async fn delete(&self, cx: &HandlerContext<'_>, id: Uuid) -> Result<(), EngineError> {
        let table = self.writable_table(cx).await?;
        let mut delete = build_delete(table, id);
        if let Some(scope) = cx.scope {
            delete = delete.and_where(scope.clone());
        }
        let outcome = self.storage.execute(cx.deadline, &Statement::Delete(delete)).await?;
        if outcome.rows_affected == 0 {
            return Err(EngineError::not_found(ResourceType::Row));
        }
        Ok(())
    }
}

/// Rows of one system table, confined to the caller's tenant.
pub struct ScopedSystemHandler {
    table: SystemTable,
    storage: StorageHandle,
    config: Arc<EngineConfig>,
}

impl ScopedSystemHandler {
    pub fn new(table: SystemTable, storage: StorageHandle, config: Arc<EngineConfig>) -> Self {
        Self {
            table,
            storage,
            config,
        }
    }

    fn physical(&self) -> PhysicalTable {
        PhysicalTable::system(self.table)
    }

    fn tenant_filter(&self, cx: &HandlerContext<'_>) -> Expr {
        Expr::eq(self.table.tenant_scope().column, cx.tenant_id)
    }

    fn row_filter(&self, cx: &HandlerContext<'_>, id: Uuid) -> Expr {
        cx.scoped(self.tenant_filter(cx).and(Expr::eq(ID_COLUMN, id)))
    }

    fn not_found(&self) -> EngineError {
        EngineError::not_found(resource_for(&self.physical()))
    }

    fn check_writable(&self) -> Result<(), EngineError> {
        if self.table.read_only() {
            debug!(table = self.table.name(), "write to read-only system table");
            return Err(EngineError::Forbidden);
        }
        Ok(())
    }

    /// Rejects rows that point at users or roles of another tenant and
    /// permission rows that would not parse back.
    async fn check_references(&self, cx: &HandlerContext<'_>, row: &Record) -> Result<(), EngineError> {
        for (column, table, resource) in [
            ("user_id", SystemTable::Users, ResourceType::User),
            ("role_id", SystemTable::Roles, ResourceType::Role),
        ] {
            let Some(value) = row.get(column).filter(|v| !v.is_null()) else {
                continue;
            };
            let Some(id) = value.as_uuid() else {
                return Err(EngineError::invalid(format!("{column} must be a uuid")));
            };
            let select = build_select(
                PhysicalTable::system(table),
                Projection::Columns(vec![ID_COLUMN.to_string()]),
                Some(Expr::eq(ID_COLUMN, id).and(Expr::eq("tenant_id", cx.tenant_id))),
            )
            .limit(1);
            if self.storage.select(cx.deadline, select).await?.is_empty() {
                return Err(EngineError::not_found(resource));
            }
        }
        if self.table == SystemTable::Permissions {
            if let Some(raw) = row.text("action")
                && Action::parse(raw).is_none()
            {
                return Err(EngineError::invalid(format!("unknown action '{raw}'")));
            }
            if let Some(raw) = row.json("row_filter") {
                RowFilter::from_json(raw)?;
            }
            decode_allowed_fields(row.get("allowed_fields"))
                .map_err(|e| EngineError::invalid(format!("allowed_fields: {e}")))?;
        }
        Ok(())
    }
}

#[async_trait]
impl TableHandler for ScopedSystemHandler {
    async fn list(
        &self,
        cx: &HandlerContext<'_>,
        projection: Projection,
        query: ListQuery,
    ) -> Result<ReadOutcome, EngineError> {
        let mut filter = cx.scoped(self.tenant_filter(cx));
        if let Some(extra) = query.filter {
            filter = filter.and(extra);
        }
        let mut select = build_select(self.physical(), projection, Some(filter));
        for (column, order) in query.order_by {
            select = select.order_by(column, order);
        }
        if let Some(limit) = query.limit {
            select = select.limit(limit);
        }
        Ok(ReadOutcome::Rows(self.storage.select(cx.deadline, select).await?))
    }

    async fn get(
        &self,
        cx: &HandlerContext<'_>,
        id: Uuid,
        projection: Projection,
    ) -> Result<Option<Record>, EngineError> {
        let select = build_select(self.physical(), projection, Some(self.row_filter(cx, id))).limit(1);
        Ok(self.storage.select(cx.deadline, select).await?.into_iter().next())
    }

    async fn create(&self, cx: &HandlerContext<'_>, values: Record) -> Result<Record, EngineError> {
        self.check_writable()?;
        self.check_references(cx, &values).await?;
        let insert = build_insert(self.physical(), values, Some(cx.actor))?
            .set(self.table.tenant_scope().column, cx.tenant_id);
        let outcome = self.storage.execute(cx.deadline, &Statement::Insert(insert)).await?;
        outcome
            .rows
            .into_iter()
            .next()
            .ok_or_else(|| EngineError::internal("insert returned no row"))
    }

    async fn update(
        &self,
        cx: &HandlerContext<'_>,
        id: Uuid,
        values: Record,
    ) -> Result<Record, EngineError> {
        self.check_writable()?;
        self.check_references(cx, &values).await?;
        let update = build_update(self.physical(), id, values, Some(cx.actor))?
            .and_where(self.row_filter(cx, id));
        let outcome = self.storage.execute(cx.deadline, &Statement::Update(update)).await?;
        outcome.rows.into_iter().next().ok_or_else(|| self.not_found())
    }

    async fn delete(&self, cx: &HandlerContext<'_>, id: Uuid) -> Result<(), EngineError> {
        self.check_writable()?;
        let filter = self.row_filter(cx, id);
        if self.table == SystemTable::Roles {
            let select = build_select(self.physical(), Projection::All, Some(filter.clone())).limit(1);
            let rows = self.storage.select(cx.deadline, select).await?;
            if rows
                .first()
                .and_then(|r| r.text("name"))
                .is_some_and(|name| name == self.config.admin_role_name)
            {
                return Err(EngineError::invalid("the admin role cannot be deleted"));
            }
        }
        let removed = self
            .storage
            .delete_with_cascades(cx.deadline, self.table, filter)
            .await?;
        if removed == 0 {
            return Err(self.not_found());
        }
        Ok(())
    }
}

/// `collections` rows. Reads are plain scoped reads; writes go through the
/// lifecycle manager so physical tables follow.
pub struct CollectionsHandler {
    rows: ScopedSystemHandler,
    lifecycle: LifecycleManager,
}

impl CollectionsHandler {
    pub fn new(storage: StorageHandle, lifecycle: LifecycleManager, config: Arc<EngineConfig>) -> Self {
        Self {
            rows: ScopedSystemHandler::new(SystemTable::Collections, storage, config),
            lifecycle,
        }
    }
}

/// Fails with `NotFound` unless the row is visible under the caller's
/// tenant and row scope.
async fn ensure_visible(
    rows: &ScopedSystemHandler,
    cx: &HandlerContext<'_>,
    id: Uuid,
) -> Result<(), EngineError> {
    let projection = Projection::Columns(vec![ID_COLUMN.to_string()]);
    match rows.get(cx, id, projection).await? {
        Some(_) => Ok(()),
        None => Err(rows.not_found()),
    }
}

#[async_trait]
impl TableHandler for CollectionsHandler {
    async fn list(
        &self,
        cx: &HandlerContext<'_>,
        projection: Projection,
        query: ListQuery,
    ) -> Result<ReadOutcome, EngineError> {
        self.rows.list(cx, projection, query).await
    }

    async fn get(
        &self,
        cx: &HandlerContext<'_>,
        id: Uuid,
        projection: Projection,
    ) -> Result<Option<Record>, EngineError> {
        self.rows.get(cx, id, projection).await
    }

    async fn create(&self, cx: &HandlerContext<'_>, values: Record) -> Result<Record, EngineError> {
        let draft = CollectionDraft::from_record(&values);
        let created = self
            .lifecycle
            .create_collection(cx.deadline, cx.tenant_id, cx.actor, draft)
            .await?;
        Ok(created.to_record())
    }

    async fn update(
        &self,
        cx: &HandlerContext<'_>,
        id: Uuid,
        values: Record,
    ) -> Result<Record, EngineError> {
        ensure_visible(&self.rows, cx, id).await?;
        let updated = self
            .lifecycle
            .update_collection(
                cx.deadline,
                cx.tenant_id,
                cx.actor,
                id,
                CollectionPatch::from_record(&values),
            )
            .await?;
        Ok(updated.to_record())
    }

    async fn delete(&self, cx: &HandlerContext<'_>, id: Uuid) -> Result<(), EngineError> {
        ensure_visible(&self.rows, cx, id).await?;
        self.lifecycle
            .delete_collection(cx.deadline, cx.tenant_id, id)
            .await
    }
}

/// `fields` rows, with writes routed like [`CollectionsHandler`].
pub struct FieldsHandler {
    rows: ScopedSystemHandler,
    lifecycle: LifecycleManager,
}

impl FieldsHandler {
    pub fn new(storage: StorageHandle, lifecycle: LifecycleManager, config: Arc<EngineConfig>) -> Self {
        Self {
            rows: ScopedSystemHandler::new(SystemTable::Fields, storage, config),
            lifecycle,
        }
    }
}

#[async_trait]
impl TableHandler for FieldsHandler {
    async fn list(
        &self,
        cx: &HandlerContext<'_>,
        projection: Projection,
        query: ListQuery,
    ) -> Result<ReadOutcome, EngineError> {
        self.rows.list(cx, projection, query).await
    }

    async fn get(
        &self,
        cx: &HandlerContext<'_>,
        id: Uuid,
        projection: Projection,
    ) -> Result<Option<Record>, EngineError> {
        self.rows.get(cx, id, projection).await
    }

    async fn create(&self, cx: &HandlerContext<'_>, values: Record) -> Result<Record, EngineError> {
        let draft = FieldDraft::from_record(&values)?;
        let created = self
            .lifecycle
            .create_field(cx.deadline, cx.tenant_id, cx.actor, draft)
            .await?;
        Ok(created.to_record())
    }

    async fn update(
        &self,
        cx: &HandlerContext<'_>,
        id: Uuid,
        values: Record,
    ) -> Result<Record, EngineError> {
        ensure_visible(&self.rows, cx, id).await?;
        let updated = self
            .lifecycle
            .update_field(
                cx.deadline,
                cx.tenant_id,
                cx.actor,
                id,
                FieldPatch::from_record(&values)?,
            )
            .await?;
        Ok(updated.to_record())
    }

    async fn delete(&self, cx: &HandlerContext<'_>, id: Uuid) -> Result<(), EngineError> {
        ensure_visible(&self.rows, cx, id).await?;
        self.lifecycle
            .delete_field(cx.deadline, cx.tenant_id, id)
            .await
    }
}

/// Picks the handler for a collection: the registered one for system
/// collections, the dynamic handler otherwise.
pub struct HandlerRegistry {
    dynamic: Arc<dyn TableHandler>,
    system: HashMap<SystemTable, Arc<dyn TableHandler>>,
}

impl HandlerRegistry {
    pub fn new(storage: StorageHandle, lifecycle: LifecycleManager, config: Arc<EngineConfig>) -> Self {
        let mut system: HashMap<SystemTable, Arc<dyn TableHandler>> = HashMap::new();
        for table in SystemTable::ALL {
            let handler: Arc<dyn TableHandler> = match table {
                SystemTable::Collections => Arc::new(CollectionsHandler::new(
                    storage.clone(),
                    lifecycle.clone(),
                    config.clone(),
                )),
                SystemTable::Fields => Arc::new(FieldsHandler::new(
                    storage.clone(),
                    lifecycle.clone(),
                    config.clone(),
                )),
                other => Arc::new(ScopedSystemHandler::new(other, storage.clone(), config.clone())),
            };
            system.insert(table, handler);
        }
        Self {
            dynamic: Arc::new(DynamicTableHandler::new(storage, lifecycle)),
            system,
        }
    }

    /// Replaces the handler for one system table.
    pub fn register(&mut self, table: SystemTable, handler: Arc<dyn TableHandler>) {
        self.system.insert(table, handler);
    }

    pub fn handler_for(&self, collection: &Collection) -> Result<Arc<dyn TableHandler>, EngineError> {
        if !collection.system {
            return Ok(self.dynamic.clone());
        }
        SystemTable::from_name(&collection.name)
            .and_then(|table| self.system.get(&table).cloned())
            .ok_or_else(|| {
                EngineError::internal(format!(
                    "no handler for system collection {}",
                    collection.name
                ))
            })
    }
}
