//! Tenant resolution and provisioning of tenants, users, roles and
//! permission rules.

use crate::catalog::schema::{Collection, ID_COLUMN, TENANT_COLUMN};
use crate::catalog::system::SystemTable;
use crate::catalog::tenant::{Role, RoleAssignment, Tenant, User, normalize_slug};
use crate::config::{EngineConfig, NamespacePolicy};
use crate::context::Deadline;
use crate::error::{EngineError, ResourceType};
use crate::lifecycle::LifecycleManager;
use crate::lifecycle::saga::{Compensation, Saga};
use crate::permission::{Action, PermissionRule};
use crate::query::builder::validate_table_name;
use crate::query::plan::Expr;
use crate::storage::{MaterializerHandle, StorageHandle};
use std::sync::Arc;
use tracing::{error, info};
use uuid::Uuid;

/// Maps tenants and users to the namespace their data lives in.
#[derive(Clone)]
pub struct TenantResolver {
    storage: StorageHandle,
    config: Arc<EngineConfig>,
}

impl TenantResolver {
    pub fn new(storage: StorageHandle, config: Arc<EngineConfig>) -> Self {
        Self { storage, config }
    }

    pub async fn get_tenant(&self, deadline: Deadline, tenant_id: Uuid) -> Result<Tenant, EngineError> {
        self.storage
            .fetch_one::<Tenant>(deadline, Expr::eq(ID_COLUMN, tenant_id))
            .await?
            .ok_or(EngineError::not_found(ResourceType::Tenant))
    }

    /// The tenant's namespace (its slug).
    ///
    /// With [`NamespacePolicy::Fallback`] a failed lookup routes to the
    /// fallback namespace instead of failing; both outcomes are logged.
    pub async fn resolve_namespace(
        &self,
        deadline: Deadline,
        tenant_id: Uuid,
    ) -> Result<String, EngineError> {
        let err = match self.get_tenant(deadline, tenant_id).await {
            Ok(tenant) => return Ok(tenant.slug),
            Err(EngineError::Timeout) => return Err(EngineError::Timeout),
            Err(err) => err,
        };
        match &self.config.namespace_policy {
            NamespacePolicy::FailClosed => {
                error!(%tenant_id, error = ?err, "namespace lookup failed");
                Err(EngineError::internal(format!(
                    "namespace lookup failed for tenant {tenant_id}"
                )))
            }
            NamespacePolicy::Fallback(namespace) => {
                error!(
                    %tenant_id,
                    fallback = %namespace,
                    error = ?err,
                    "namespace lookup failed, using fallback namespace"
                );
                Ok(namespace.clone())
            }
        }
    }

    pub async fn resolve_user_tenant(
        &self,
        deadline: Deadline,
        user_id: Uuid,
    ) -> Result<Uuid, EngineError> {
        self.storage
            .fetch_one::<User>(deadline, Expr::eq(ID_COLUMN, user_id))
            .await?
            .map(|u| u.tenant_id)
            .ok_or(EngineError::not_found(ResourceType::User))
    }
}

/// Creates and removes tenants and the identity rows inside them.
#[derive(Clone)]
pub struct Provisioner {
    storage: StorageHandle,
    materializer: MaterializerHandle,
    lifecycle: LifecycleManager,
    resolver: TenantResolver,
    config: Arc<EngineConfig>,
}

impl Provisioner {
    pub fn new(
        storage: StorageHandle,
        materializer: MaterializerHandle,
        lifecycle: LifecycleManager,
        resolver: TenantResolver,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self {
            storage,
            materializer,
            lifecycle,
            resolver,
            config,
        }
    }

    /// Creates a tenant with its default roles and one system collection per
    /// system table. `slug` defaults to the name; either way it is
    /// normalized.
    pub async fn provision_tenant(
        &self,
        deadline: Deadline,
        name: &str,
        slug: Option<&str>,
    ) -> Result<Tenant, EngineError> {
        if name.trim().is_empty() {
            return Err(EngineError::invalid("tenant name must not be empty"));
        }
        let slug = normalize_slug(slug.unwrap_or(name))?;
        if slug.len() > self.config.max_identifier_len {
            return Err(EngineError::invalid(format!(
                "tenant slug exceeds {} characters",
                self.config.max_identifier_len
            )));
        }
        let tenant = Tenant {
            id: Uuid::new_v4(),
            name: name.trim().to_string(),
            slug,
            active: true,
        };
        let tenant = self.storage.insert_row(deadline, &tenant, None).await?;

        let mut saga = Saga::new("provision_tenant", &self.storage, &self.materializer);
        saga.record(Compensation::DeleteRow {
            table: SystemTable::Tenants,
            id: tenant.id,
        });
        let scoped = |table| Compensation::DeleteRowsWhere {
            table,
            filter: Expr::eq(TENANT_COLUMN, tenant.id),
        };
        saga.record(scoped(SystemTable::Roles));
        for role_name in [&self.config.admin_role_name, &self.config.default_member_role_name] {
            let role = Role {
                id: Uuid::new_v4(),
                tenant_id: tenant.id,
                name: role_name.clone(),
                description: None,
            };
            saga.check(self.storage.insert_row(deadline, &role, None).await)
                .await?;
        }
        saga.record(scoped(SystemTable::Collections));
        saga.record(scoped(SystemTable::Fields));
        for table in SystemTable::ALL {
            saga.check(
                self.lifecycle
                    .register_system_collection(deadline, tenant.id, table)
                    .await,
            )
            .await?;
        }
        saga.complete();
        info!(tenant_id = %tenant.id, slug = %tenant.slug, "tenant provisioned");
        Ok(tenant)
    }

    /// Renames or (de)activates a tenant. The slug is fixed.
    pub async fn update_tenant(
        &self,
        deadline: Deadline,
        tenant_id: Uuid,
        name: Option<String>,
        active: Option<bool>,
    ) -> Result<Tenant, EngineError> {
        let mut tenant = self.resolver.get_tenant(deadline, tenant_id).await?;
        if let Some(name) = name {
            if name.trim().is_empty() {
                return Err(EngineError::invalid("tenant name must not be empty"));
            }
            tenant.name = name.trim().to_string();
        }
        if let Some(active) = active {
            tenant.active = active;
        }
        self.storage.update_row(deadline, &tenant, None).await
    }

    /// Removes a tenant and every metadata row it owns. Refused while the
    /// tenant still has data collections.
    pub async fn delete_tenant(&self, deadline: Deadline, tenant_id: Uuid) -> Result<(), EngineError> {
        self.resolver.get_tenant(deadline, tenant_id).await?;
        let collections = self
            .storage
            .fetch_all::<Collection>(deadline, Some(Expr::eq(TENANT_COLUMN, tenant_id)))
            .await?;
        if collections.iter().any(|c| !c.system) {
            return Err(EngineError::conflict(ResourceType::Collection));
        }
        for table in SystemTable::ALL {
            if table == SystemTable::Tenants {
                continue;
            }
            self.storage
                .delete_where(deadline, table, Expr::eq(TENANT_COLUMN, tenant_id))
                .await?;
        }
        self.storage
            .delete_where(deadline, SystemTable::Tenants, Expr::eq(ID_COLUMN, tenant_id))
            .await?;
        info!(%tenant_id, "tenant deleted");
        Ok(())
    }

    pub async fn create_user(
        &self,
        deadline: Deadline,
        tenant_id: Uuid,
        email: &str,
        name: Option<&str>,
    ) -> Result<User, EngineError> {
        let email = email.trim();
        if email.is_empty() {
            return Err(EngineError::invalid("email must not be empty"));
        }
        self.resolver.get_tenant(deadline, tenant_id).await?;
        let user = User {
            id: Uuid::new_v4(),
            tenant_id,
            email: email.to_string(),
            name: name.map(str::to_string).filter(|n| !n.is_empty()),
            active: true,
        };
        self.storage.insert_row(deadline, &user, None).await
    }

    /// Deletes the user together with their role assignments and API keys.
    pub async fn delete_user(
        &self,
        deadline: Deadline,
        tenant_id: Uuid,
        user_id: Uuid,
    ) -> Result<(), EngineError> {
        let removed = self
            .storage
            .delete_with_cascades(
                deadline,
                SystemTable::Users,
                Expr::eq(ID_COLUMN, user_id).and(Expr::eq(TENANT_COLUMN, tenant_id)),
            )
            .await?;
        if removed == 0 {
            return Err(EngineError::not_found(ResourceType::User));
        }
        Ok(())
    }

    pub async fn create_role(
        &self,
        deadline: Deadline,
        tenant_id: Uuid,
        name: &str,
        description: Option<&str>,
    ) -> Result<Role, EngineError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(EngineError::invalid("role name must not be empty"));
        }
        self.resolver.get_tenant(deadline, tenant_id).await?;
        let role = Role {
            id: Uuid::new_v4(),
            tenant_id,
            name: name.to_string(),
            description: description.map(str::to_string).filter(|d| !d.is_empty()),
        };
        self.storage.insert_row(deadline, &role, None).await
    }

    /// Deletes a role with its permission rules and assignments. The admin
    /// role cannot be deleted.
    pub async fn delete_role(
        &self,
        deadline: Deadline,
        tenant_id: Uuid,
        role_id: Uuid,
    ) -> Result<(), EngineError> {
        let role = self.tenant_role(deadline, tenant_id, role_id).await?;
        if role.name == self.config.admin_role_name {
            return Err(EngineError::invalid("the admin role cannot be deleted"));
        }
        self.storage
            .delete_with_cascades(deadline, SystemTable::Roles, Expr::eq(ID_COLUMN, role.id))
            .await?;
        info!(%tenant_id, %role_id, role = %role.name, "role deleted");
        Ok(())
    }

    async fn tenant_role(
        &self,
        deadline: Deadline,
        tenant_id: Uuid,
        role_id: Uuid,
    ) -> Result<Role, EngineError> {
        self.storage
            .fetch_one::<Role>(
                deadline,
                Expr::eq(ID_COLUMN, role_id).and(Expr::eq(TENANT_COLUMN, tenant_id)),
            )
            .await?
            .ok_or(EngineError::not_found(ResourceType::Role))
    }

    /// Role named `name` within the tenant.
    pub async fn find_role(
        &self,
        deadline: Deadline,
        tenant_id: Uuid,
        name: &str,
    ) -> Result<Role, EngineError> {
        self.storage
            .fetch_one::<Role>(
                deadline,
                Expr::eq(TENANT_COLUMN, tenant_id).and(Expr::eq("name", name)),
            )
            .await?
            .ok_or(EngineError::not_found(ResourceType::Role))
    }

    pub async fn assign_role(
        &self,
        deadline: Deadline,
        tenant_id: Uuid,
        user_id: Uuid,
        role_id: Uuid,
    ) -> Result<RoleAssignment, EngineError> {
        let user_tenant = self.resolver.resolve_user_tenant(deadline, user_id).await?;
        if user_tenant != tenant_id {
            return Err(EngineError::not_found(ResourceType::User));
        }
        self.tenant_role(deadline, tenant_id, role_id).await?;
        let assignment = RoleAssignment {
            id: Uuid::new_v4(),
            tenant_id,
            user_id,
            role_id,
        };
        self.storage.insert_row(deadline, &assignment, None).await
    }

    pub async fn revoke_role(
        &self,
        deadline: Deadline,
        tenant_id: Uuid,
        user_id: Uuid,
        role_id: Uuid,
    ) -> Result<(), EngineError> {
        let removed = self
            .storage
            .delete_where(
                deadline,
                SystemTable::UserRoles,
                Expr::eq(TENANT_COLUMN, tenant_id)
                    .and(Expr::eq("user_id", user_id))
                    .and(Expr::eq("role_id", role_id)),
            )
            .await?;
        if removed == 0 {
            return Err(EngineError::not_found(ResourceType::Role));
        }
        Ok(())
    }

    /// Stores an allow-rule. A second rule for the same role, table and
    /// action is a conflict.
    pub async fn grant_permission(
        &self,
        deadline: Deadline,
        rule: PermissionRule,
    ) -> Result<PermissionRule, EngineError> {
        validate_table_name(&rule.table_name)?;
        if let Some(filter) = &rule.row_filter
            && let Some(expr) = filter.to_expr()
        {
            expr.validate_depth()?;
        }
        self.tenant_role(deadline, rule.tenant_id, rule.role_id).await?;
        let stored = self.storage.insert_row(deadline, &rule, None).await?;
        info!(
            tenant_id = %stored.tenant_id,
            role_id = %stored.role_id,
            table = %stored.table_name,
            action = %stored.action,
            "permission granted"
        );
        Ok(stored)
    }

    pub async fn revoke_permission(
        &self,
        deadline: Deadline,
        tenant_id: Uuid,
        role_id: Uuid,
        table_name: &str,
        action: Action,
    ) -> Result<(), EngineError> {
        let removed = self
            .storage
            .delete_where(
                deadline,
                SystemTable::Permissions,
                Expr::eq(TENANT_COLUMN, tenant_id)
                    .and(Expr::eq("role_id", role_id))
                    .and(Expr::eq("table_name", table_name))
                    .and(Expr::eq("action", action.as_str())),
            )
            .await?;
        if removed == 0 {
            return Err(EngineError::not_found(ResourceType::Permission));
        }
        Ok(())
    }

    /// Rules stored for a role, in table then action order.
    pub async fn list_permissions(
        &self,
        deadline: Deadline,
        tenant_id: Uuid,
        role_id: Uuid,
    ) -> Result<Vec<PermissionRule>, EngineError> {
        let mut rules = self
            .storage
            .fetch_all::<PermissionRule>(
                deadline,
                Some(Expr::eq(TENANT_COLUMN, tenant_id).and(Expr::eq("role_id", role_id))),
            )
            .await?;
        rules.sort_by(|a, b| {
            a.table_name
                .cmp(&b.table_name)
                .then_with(|| a.action.cmp(&b.action))
        });
        Ok(rules)
    }
}
