#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tabula::Engine;
use tabula::catalog::schema::{Collection, CollectionDraft, Field, FieldDraft, ValidationRules};
use tabula::catalog::tenant::{Role, Tenant, User};
use tabula::catalog::types::FieldType;
use tabula::config::EngineConfig;
use tabula::context::{AuthContext, Deadline, OperationContext};
use tabula::error::StorageError;
use tabula::query::builder::PhysicalTable;
use tabula::storage::SchemaMaterializer;
use tabula::storage::memory::MemoryStorage;
use uuid::Uuid;

pub const D: Deadline = Deadline::NONE;

pub struct Fixture {
    pub engine: Engine,
    pub backend: Arc<MemoryStorage>,
    pub tenant: Tenant,
    pub admin: User,
}

impl Fixture {
    pub fn admin_ctx(&self) -> OperationContext {
        OperationContext::new(AuthContext::new(self.admin.id, self.tenant.id))
    }

    pub fn ctx(&self, user: &User) -> OperationContext {
        OperationContext::new(AuthContext::new(user.id, self.tenant.id))
    }

    /// A user holding a fresh role named `role_name`.
    pub async fn user_with_role(&self, email: &str, role_name: &str) -> (User, Role) {
        let provisioner = self.engine.provisioner();
        let user = provisioner
            .create_user(D, self.tenant.id, email, None)
            .await
            .expect("create user");
        let role = provisioner
            .create_role(D, self.tenant.id, role_name, None)
            .await
            .expect("create role");
        provisioner
            .assign_role(D, self.tenant.id, user.id, role.id)
            .await
            .expect("assign role");
        (user, role)
    }

    /// `notes`: title (required), body, status (default "draft"), owner,
    /// priority (1..=5).
    pub async fn notes(&self) -> Collection {
        let lifecycle = self.engine.lifecycle();
        let notes = lifecycle
            .create_collection(D, self.tenant.id, self.admin.id, CollectionDraft::new("notes"))
            .await
            .expect("create notes");
        let drafts = [
            FieldDraft::new(notes.id, "title", FieldType::String).required(),
            FieldDraft::new(notes.id, "body", FieldType::Text),
            FieldDraft::new(notes.id, "status", FieldType::String).with_default("draft"),
            FieldDraft::new(notes.id, "owner", FieldType::Uuid),
            FieldDraft::new(notes.id, "priority", FieldType::Integer).with_rules(ValidationRules {
                min: Some(1.0),
                max: Some(5.0),
                ..ValidationRules::default()
            }),
        ];
        for draft in drafts {
            lifecycle
                .create_field(D, self.tenant.id, self.admin.id, draft)
                .await
                .expect("create field");
        }
        notes
    }
}

pub async fn fixture() -> Fixture {
    fixture_with(EngineConfig::default()).await
}

pub async fn fixture_with(config: EngineConfig) -> Fixture {
    let (engine, backend) = Engine::in_memory(config);
    provisioned(engine, backend).await
}

pub async fn provisioned(engine: Engine, backend: Arc<MemoryStorage>) -> Fixture {
    let provisioner = engine.provisioner();
    let tenant = provisioner
        .provision_tenant(D, "Acme", None)
        .await
        .expect("provision tenant");
    let admin = provisioner
        .create_user(D, tenant.id, "root@acme.test", Some("Root"))
        .await
        .expect("admin user");
    let admin_role = provisioner
        .find_role(D, tenant.id, "admin")
        .await
        .expect("admin role");
    provisioner
        .assign_role(D, tenant.id, admin.id, admin_role.id)
        .await
        .expect("assign admin");
    Fixture {
        engine,
        backend,
        tenant,
        admin,
    }
}

/// Memory materializer with switchable failures and an optional delay.
pub struct FlakyMaterializer {
    pub inner: Arc<MemoryStorage>,
    pub fail_materialize: AtomicBool,
    pub fail_add_column: AtomicBool,
    pub delay: Option<Duration>,
}

impl FlakyMaterializer {
    pub fn new(inner: Arc<MemoryStorage>) -> Self {
        Self {
            inner,
            fail_materialize: AtomicBool::new(false),
            fail_add_column: AtomicBool::new(false),
            delay: None,
        }
    }

    pub fn slow(inner: Arc<MemoryStorage>, delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::new(inner)
        }
    }

    async fn pause(&self) {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl SchemaMaterializer for FlakyMaterializer {
    async fn materialize_collection(
        &self,
        collection_id: Uuid,
        table: &PhysicalTable,
        fields: &[Field],
    ) -> Result<(), StorageError> {
        self.pause().await;
        if self.fail_materialize.load(Ordering::SeqCst) {
            return Err(StorageError::Backend(format!(
                "permission denied to create {}",
                table.qualified()
            )));
        }
        self.inner
            .materialize_collection(collection_id, table, fields)
            .await
    }

    async fn drop_collection_table(
        &self,
        collection_id: Uuid,
        table: &PhysicalTable,
    ) -> Result<(), StorageError> {
        self.inner.drop_collection_table(collection_id, table).await
    }

    async fn add_physical_column(
        &self,
        tenant_id: Uuid,
        table: &PhysicalTable,
        field: &Field,
    ) -> Result<(), StorageError> {
        self.pause().await;
        if self.fail_add_column.load(Ordering::SeqCst) {
            return Err(StorageError::Backend(format!(
                "lock timeout altering {}",
                table.qualified()
            )));
        }
        self.inner.add_physical_column(tenant_id, table, field).await
    }

    async fn drop_physical_column(
        &self,
        tenant_id: Uuid,
        table: &PhysicalTable,
        column: &str,
    ) -> Result<(), StorageError> {
        self.inner
            .drop_physical_column(tenant_id, table, column)
            .await
    }
}
