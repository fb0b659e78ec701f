//! Multi-tenant, schema-driven data access.
//!
//! Collections and fields are metadata rows; each non-system collection is
//! backed by one physical table in its tenant's namespace. Every generic
//! operation runs the same pipeline: authenticate, authorize against the
//! caller's role rules, resolve the collection, validate and convert the
//! payload, execute through the collection's [`TableHandler`], and trim the
//! result to the fields the caller may see.

pub mod catalog;
pub mod config;
pub mod context;
pub mod error;
pub mod filter;
pub mod handler;
pub mod lifecycle;
pub mod permission;
pub mod query;
pub mod storage;
pub mod tenancy;
pub mod validation;

use crate::catalog::SchemaCatalog;
use crate::catalog::schema::{Collection, Field, SERVER_MANAGED_COLUMNS, is_server_managed};
use crate::catalog::system::SystemTable;
use crate::catalog::types::Record;
use crate::config::EngineConfig;
use crate::context::{AuthContext, Deadline, OperationContext};
use crate::error::{EngineError, ResourceType};
use crate::filter::filter_fields;
use crate::handler::{HandlerContext, HandlerRegistry, ListQuery, ReadOutcome, TableHandler};
use crate::lifecycle::LifecycleManager;
use crate::permission::{AccessDecision, Action, AllowedFields, PermissionResolver};
use crate::query::builder::{Projection, validate_table_name};
use crate::query::plan::Expr;
use crate::storage::memory::MemoryStorage;
use crate::storage::{MaterializerHandle, SchemaMaterializer, Storage, StorageHandle};
use crate::tenancy::{Provisioner, TenantResolver};
use crate::validation::{UnknownKeys, ValidationMode, convert_record, validate_record};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

pub use crate::catalog::types::{DynamicValue, FieldType};
pub use crate::error::EngineErrorCode;

fn json_record(payload: serde_json::Value) -> Result<Record, EngineError> {
    Record::try_from(payload).map_err(|_| EngineError::invalid("payload must be a JSON object"))
}

/// Everything one operation needs after authorization succeeded.
struct Authorized {
    auth: AuthContext,
    deadline: Deadline,
    decision: AccessDecision,
    collection: Collection,
    fields: Vec<Field>,
    scope: Option<Expr>,
    handler: Arc<dyn TableHandler>,
}

impl Authorized {
    fn handler_context(&self) -> HandlerContext<'_> {
        HandlerContext {
            deadline: self.deadline,
            tenant_id: self.auth.tenant_id,
            actor: self.auth.user_id,
            collection: &self.collection,
            scope: self.scope.as_ref(),
        }
    }

    /// Granted fields plus the engine-managed columns.
    fn visible(&self) -> AllowedFields {
        self.decision
            .allowed_fields
            .clone()
            .with_columns(SERVER_MANAGED_COLUMNS)
    }

    /// Columns to read: visible fields plus whatever the row scope needs to
    /// be re-checked after the read.
    fn projection(&self) -> Projection {
        let visible = self.visible();
        if visible.is_all() {
            return Projection::All;
        }
        let scope_columns = self.decision.row_scope.columns();
        Projection::Columns(
            self.fields
                .iter()
                .map(|f| f.name.as_str())
                .filter(|name| visible.allows(name) || scope_columns.contains(name))
                .map(str::to_string)
                .collect(),
        )
    }

    fn knows_column(&self, column: &str) -> bool {
        is_server_managed(column) || self.fields.iter().any(|f| f.name == column)
    }

    fn trim(&self, row: &Record) -> Record {
        filter_fields(row, &self.visible())
    }

    /// Strips engine-managed keys and anything the caller may not write.
    fn writable(&self, mut values: Record) -> Record {
        values.retain(|key, _| !is_server_managed(key));
        filter_fields(&values, &self.decision.allowed_fields)
    }
}

/// Entry point for generic CRUD over collections and system tables.
pub struct Engine {
    config: Arc<EngineConfig>,
    storage: StorageHandle,
    permissions: PermissionResolver,
    tenants: TenantResolver,
    lifecycle: LifecycleManager,
    provisioner: Provisioner,
    handlers: HandlerRegistry,
}

impl Engine {
    pub fn new(
        storage: Arc<dyn Storage>,
        materializer: Arc<dyn SchemaMaterializer>,
        config: EngineConfig,
    ) -> Self {
        let config = Arc::new(config);
        let storage = StorageHandle::new(storage);
        let materializer = MaterializerHandle::new(materializer);
        let tenants = TenantResolver::new(storage.clone(), config.clone());
        let lifecycle = LifecycleManager::new(
            storage.clone(),
            materializer.clone(),
            tenants.clone(),
            config.clone(),
        );
        let provisioner = Provisioner::new(
            storage.clone(),
            materializer,
            lifecycle.clone(),
            tenants.clone(),
            config.clone(),
        );
        Self {
            permissions: PermissionResolver::new(storage.clone(), config.clone()),
            handlers: HandlerRegistry::new(storage.clone(), lifecycle.clone(), config.clone()),
            config,
            storage,
            tenants,
            lifecycle,
            provisioner,
        }
    }

    /// An engine over a fresh [`MemoryStorage`], which is also returned for
    /// inspection.
    pub fn in_memory(config: EngineConfig) -> (Self, Arc<MemoryStorage>) {
        let backend = Arc::new(MemoryStorage::new());
        (Self::new(backend.clone(), backend.clone(), config), backend)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn storage(&self) -> &StorageHandle {
        &self.storage
    }

    pub fn catalog(&self) -> &SchemaCatalog {
        self.lifecycle.catalog()
    }

    pub fn lifecycle(&self) -> &LifecycleManager {
        &self.lifecycle
    }

    pub fn provisioner(&self) -> &Provisioner {
        &self.provisioner
    }

    pub fn permissions(&self) -> &PermissionResolver {
        &self.permissions
    }

    pub fn tenants(&self) -> &TenantResolver {
        &self.tenants
    }

    /// Replaces the handler serving one system table.
    pub fn register_handler(&mut self, table: SystemTable, handler: Arc<dyn TableHandler>) {
        self.handlers.register(table, handler);
    }

    /// The context's deadline, or the configured default when it has none.
    pub fn deadline_for(&self, ctx: &OperationContext) -> Deadline {
        if ctx.deadline.instant().is_some() {
            return ctx.deadline;
        }
        self.config
            .default_timeout()
            .map(Deadline::after)
            .unwrap_or(Deadline::NONE)
    }

    async fn authorize(
        &self,
        ctx: &OperationContext,
        table: &str,
        action: Action,
    ) -> Result<Authorized, EngineError> {
        let auth = *ctx.require_auth()?;
        validate_table_name(table)?;
        let deadline = self.deadline_for(ctx);

        let decision = self
            .permissions
            .authorize(deadline, &auth, table, action)
            .await?;
        if !decision.allowed {
            debug!(user_id = %auth.user_id, table, %action, "request denied");
            return Err(EngineError::Forbidden);
        }
        if decision.tenant_id != Some(auth.tenant_id) {
            debug!(
                user_id = %auth.user_id,
                tenant_id = %auth.tenant_id,
                table,
                "request tenant does not match the user's tenant"
            );
            return Err(EngineError::Forbidden);
        }
        let scope = decision.row_scope.to_expr();
        if let Some(expr) = &scope {
            expr.validate_depth()?;
        }

        let catalog = self.lifecycle.catalog();
        let collection = catalog.get_collection(deadline, auth.tenant_id, table).await?;
        let fields = catalog.get_fields(deadline, collection.id).await?;
        let handler = self.handlers.handler_for(&collection)?;
        Ok(Authorized {
            auth,
            deadline,
            decision,
            collection,
            fields,
            scope,
            handler,
        })
    }

    /// Every row of `table` the caller may read.
    pub async fn list(&self, ctx: &OperationContext, table: &str) -> Result<Vec<Record>, EngineError> {
        self.query(ctx, table, ListQuery::new()).await
    }

    /// Filtered, ordered read. Filter and order columns must be readable.
    pub async fn query(
        &self,
        ctx: &OperationContext,
        table: &str,
        query: ListQuery,
    ) -> Result<Vec<Record>, EngineError> {
        let op = self.authorize(ctx, table, Action::Read).await?;
        let visible = op.visible();
        if let Some(column) = query.columns().into_iter().find(|c| !visible.allows(c)) {
            debug!(table, column, "query references a column the caller cannot read");
            return Err(EngineError::Forbidden);
        }
        if let Some(column) = query.columns().into_iter().find(|c| !op.knows_column(c)) {
            return Err(EngineError::invalid(format!("unknown column '{column}'")));
        }
        if let Some(filter) = &query.filter {
            filter.validate_depth()?;
        }
        let cx = op.handler_context();
        let rows = match op.handler.list(&cx, op.projection(), query).await? {
            ReadOutcome::Rows(rows) => rows,
            ReadOutcome::NotMaterialized => {
                debug!(table, collection_id = %op.collection.id, "listing unmaterialized collection");
                return Ok(Vec::new());
            }
        };
        Ok(rows
            .iter()
            .filter(|row| op.decision.row_scope.matches(row))
            .map(|row| op.trim(row))
            .collect())
    }

    pub async fn get(
        &self,
        ctx: &OperationContext,
        table: &str,
        id: Uuid,
    ) -> Result<Record, EngineError> {
        let op = self.authorize(ctx, table, Action::Read).await?;
        let cx = op.handler_context();
        match op.handler.get(&cx, id, op.projection()).await? {
            Some(row) if op.decision.row_scope.matches(&row) => Ok(op.trim(&row)),
            _ => Err(EngineError::not_found(ResourceType::Row)),
        }
    }

    /// Inserts a row. Engine-managed and non-writable keys are dropped, the
    /// rest is validated strictly and then converted with defaults applied.
    pub async fn create(
        &self,
        ctx: &OperationContext,
        table: &str,
        values: Record,
    ) -> Result<Record, EngineError> {
        let op = self.authorize(ctx, table, Action::Create).await?;
        let values = op.writable(values);
        validate_record(&op.fields, &values, ValidationMode::Create, UnknownKeys::Reject)?;
        let values = convert_record(&op.fields, values, ValidationMode::Create)?;
        let cx = op.handler_context();
        let row = op.handler.create(&cx, values).await?;
        Ok(op.trim(&row))
    }

    /// Applies a partial update to a row inside the caller's row scope.
    pub async fn update(
        &self,
        ctx: &OperationContext,
        table: &str,
        id: Uuid,
        values: Record,
    ) -> Result<Record, EngineError> {
        let op = self.authorize(ctx, table, Action::Update).await?;
        let values = op.writable(values);
        validate_record(&op.fields, &values, ValidationMode::Patch, UnknownKeys::Reject)?;
        let values = convert_record(&op.fields, values, ValidationMode::Patch)?;
        let cx = op.handler_context();
        let row = op.handler.update(&cx, id, values).await?;
        Ok(op.trim(&row))
    }

    pub async fn delete(&self, ctx: &OperationContext, table: &str, id: Uuid) -> Result<(), EngineError> {
        let op = self.authorize(ctx, table, Action::Delete).await?;
        let cx = op.handler_context();
        op.handler.delete(&cx, id).await
    }

    /// Accepts a JSON object payload for [`create`](Self::create).
    pub async fn create_json(
        &self,
        ctx: &OperationContext,
        table: &str,
        payload: serde_json::Value,
    ) -> Result<serde_json::Value, EngineError> {
        let record = json_record(payload)?;
        Ok(self.create(ctx, table, record).await?.to_json())
    }

    /// Accepts a JSON object payload for [`update`](Self::update).
    pub async fn update_json(
        &self,
        ctx: &OperationContext,
        table: &str,
        id: Uuid,
        payload: serde_json::Value,
    ) -> Result<serde_json::Value, EngineError> {
        let record = json_record(payload)?;
        Ok(self.update(ctx, table, id, record).await?.to_json())
    }
}
