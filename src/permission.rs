use crate::catalog::schema::{ID_COLUMN, TENANT_COLUMN};
use crate::catalog::system::SystemTable;
use crate::catalog::tenant::{Role, RoleAssignment, User};
use crate::catalog::types::{DynamicValue, Record};
use crate::catalog::{SystemRow, require};
use crate::config::{EmptyFieldsPolicy, EngineConfig};
use crate::context::{AuthContext, Deadline};
use crate::error::EngineError;
use crate::filter::{RowFilter, RowScope};
use crate::query::plan::Expr;
use crate::storage::StorageHandle;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Wildcard entry in a stored allowed-field list.
pub const WILDCARD: &str = "*";

/// Operation a permission rule grants on one table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Read,
    Create,
    Update,
    Delete,
}

impl Action {
    pub const ALL: [Action; 4] = [Action::Read, Action::Create, Action::Update, Action::Delete];

    pub fn as_str(self) -> &'static str {
        match self {
            Action::Read => "read",
            Action::Create => "create",
            Action::Update => "update",
            Action::Delete => "delete",
        }
    }

    pub fn parse(raw: &str) -> Option<Action> {
        Action::ALL.into_iter().find(|a| a.as_str() == raw)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Columns a decision exposes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllowedFields {
    All,
    Only(BTreeSet<String>),
}

impl AllowedFields {
    pub fn none() -> Self {
        AllowedFields::Only(BTreeSet::new())
    }

    /// Interprets a stored list: a wildcard entry absorbs everything, an empty
    /// list follows `policy`.
    pub fn from_list(list: &[String], policy: EmptyFieldsPolicy) -> Self {
        if list.iter().any(|f| f == WILDCARD) {
            return AllowedFields::All;
        }
        if list.is_empty() {
            return match policy {
                EmptyFieldsPolicy::Unrestricted => AllowedFields::All,
                EmptyFieldsPolicy::Deny => AllowedFields::none(),
            };
        }
        AllowedFields::Only(list.iter().cloned().collect())
    }

    pub fn is_all(&self) -> bool {
        matches!(self, AllowedFields::All)
    }

    pub fn allows(&self, field: &str) -> bool {
        match self {
            AllowedFields::All => true,
            AllowedFields::Only(names) => names.contains(field),
        }
    }

    pub fn union(self, other: AllowedFields) -> AllowedFields {
        match (self, other) {
            (AllowedFields::All, _) | (_, AllowedFields::All) => AllowedFields::All,
            (AllowedFields::Only(mut a), AllowedFields::Only(b)) => {
                a.extend(b);
                AllowedFields::Only(a)
            }
        }
    }

    /// Same set with extra names granted. No-op for `All`.
    pub fn with_columns<'a>(self, extra: impl IntoIterator<Item = &'a str>) -> AllowedFields {
        match self {
            AllowedFields::All => AllowedFields::All,
            AllowedFields::Only(mut names) => {
                names.extend(extra.into_iter().map(str::to_string));
                AllowedFields::Only(names)
            }
        }
    }

    /// List form where `["*"]` means unrestricted.
    pub fn to_list(&self) -> Vec<String> {
        match self {
            AllowedFields::All => vec![WILDCARD.to_string()],
            AllowedFields::Only(names) => names.iter().cloned().collect(),
        }
    }
}

/// Allow-rule granting one role one action on one table.
#[derive(Debug, Clone, PartialEq)]
pub struct PermissionRule {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub role_id: Uuid,
    pub table_name: String,
    pub action: Action,
    /// Empty means every field unless the engine runs with
    /// [`EmptyFieldsPolicy::Deny`].
    pub allowed_fields: Vec<String>,
    pub row_filter: Option<RowFilter>,
}

impl PermissionRule {
    pub fn new(tenant_id: Uuid, role_id: Uuid, table_name: impl Into<String>, action: Action) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            role_id,
            table_name: table_name.into(),
            action,
            allowed_fields: Vec::new(),
            row_filter: None,
        }
    }

    pub fn with_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_fields = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_row_filter(mut self, filter: RowFilter) -> Self {
        self.row_filter = Some(filter);
        self
    }
}

impl SystemRow for PermissionRule {
    const TABLE: SystemTable = SystemTable::Permissions;

    fn id(&self) -> Uuid {
        self.id
    }

    fn to_record(&self) -> Record {
        let fields = serde_json::Value::Array(
            self.allowed_fields
                .iter()
                .cloned()
                .map(serde_json::Value::String)
                .collect(),
        );
        let filter = match &self.row_filter {
            Some(f) if !f.is_empty() => DynamicValue::Json(f.to_json()),
            _ => DynamicValue::Null,
        };
        Record::new()
            .with(ID_COLUMN, self.id)
            .with(TENANT_COLUMN, self.tenant_id)
            .with("role_id", self.role_id)
            .with("table_name", self.table_name.as_str())
            .with("action", self.action.as_str())
            .with("allowed_fields", DynamicValue::Json(fields))
            .with("row_filter", filter)
    }

    fn from_record(record: &Record) -> Result<Self, EngineError> {
        let action = record.text("action").and_then(Action::parse);
        let allowed_fields = decode_allowed_fields(record.get("allowed_fields"))
            .map_err(|e| EngineError::internal(format!("corrupt allowed fields: {e}")))?;
        let row_filter = match record.get("row_filter") {
            Some(DynamicValue::Json(raw)) => Some(
                RowFilter::from_json(raw)
                    .map_err(|e| EngineError::internal(format!("corrupt row filter: {e}")))?,
            ),
            _ => None,
        };
        Ok(Self {
            id: require::<Self, _>(record.uuid(ID_COLUMN), ID_COLUMN)?,
            tenant_id: require::<Self, _>(record.uuid(TENANT_COLUMN), TENANT_COLUMN)?,
            role_id: require::<Self, _>(record.uuid("role_id"), "role_id")?,
            table_name: require::<Self, _>(record.text("table_name"), "table_name")?.to_string(),
            action: require::<Self, _>(action, "action")?,
            allowed_fields,
            row_filter: row_filter.filter(|f| !f.is_empty()),
        })
    }
}

/// Reads a stored `allowed_fields` value. Only null or an array of strings
/// (as JSON or JSON text) is accepted; anything else must not widen a grant.
pub(crate) fn decode_allowed_fields(value: Option<&DynamicValue>) -> Result<Vec<String>, String> {
    let parsed;
    let json = match value {
        None | Some(DynamicValue::Null) => return Ok(Vec::new()),
        Some(DynamicValue::Json(json)) => json,
        Some(DynamicValue::Text(raw)) => {
            parsed = serde_json::from_str::<serde_json::Value>(raw.as_str())
                .map_err(|e| format!("not JSON: {e}"))?;
            &parsed
        }
        Some(other) => return Err(format!("expected a list, got {}", other.kind())),
    };
    match json {
        serde_json::Value::Null => Ok(Vec::new()),
        serde_json::Value::Array(items) => items
            .iter()
            .map(|item| {
                item.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| "list entries must be field names".to_string())
            })
            .collect(),
        _ => Err("expected a list of field names".to_string()),
    }
}

/// Outcome of a permission check.
#[derive(Debug, Clone, PartialEq)]
pub struct AccessDecision {
    pub allowed: bool,
    pub allowed_fields: AllowedFields,
    pub row_scope: RowScope,
    /// Tenant of the acting user, when known.
    pub tenant_id: Option<Uuid>,
}

impl AccessDecision {
    pub fn deny() -> Self {
        Self {
            allowed: false,
            allowed_fields: AllowedFields::none(),
            row_scope: RowScope::Unrestricted,
            tenant_id: None,
        }
    }

    pub fn unrestricted(tenant_id: Uuid) -> Self {
        Self {
            allowed: true,
            allowed_fields: AllowedFields::All,
            row_scope: RowScope::Unrestricted,
            tenant_id: Some(tenant_id),
        }
    }

    /// `(allowed, fields)` where `fields == ["*"]` means unrestricted.
    pub fn as_tuple(&self) -> (bool, Vec<String>) {
        if !self.allowed {
            return (false, Vec::new());
        }
        (true, self.allowed_fields.to_list())
    }
}

/// Resolves what a user may do to a table from the roles they hold.
///
/// Rules are allow-only: with no matching rule the answer is a plain deny,
/// never an error. The admin role is recognised by name and bypasses rules.
#[derive(Clone)]
pub struct PermissionResolver {
    storage: StorageHandle,
    config: Arc<EngineConfig>,
}

impl PermissionResolver {
    pub fn new(storage: StorageHandle, config: Arc<EngineConfig>) -> Self {
        Self { storage, config }
    }

    /// Roles held by the user within `tenant_id`.
    pub async fn roles_for_user(
        &self,
        deadline: Deadline,
        tenant_id: Uuid,
        user_id: Uuid,
    ) -> Result<Vec<Role>, EngineError> {
        let assignments = self
            .storage
            .fetch_all::<RoleAssignment>(
                deadline,
                Some(Expr::eq("user_id", user_id).and(Expr::eq(TENANT_COLUMN, tenant_id))),
            )
            .await?;
        if assignments.is_empty() {
            return Ok(Vec::new());
        }
        let role_ids = assignments
            .iter()
            .map(|a| DynamicValue::from(a.role_id))
            .collect();
        let mut roles = self
            .storage
            .fetch_all::<Role>(
                deadline,
                Some(Expr::In(ID_COLUMN.to_string(), role_ids).and(Expr::eq(TENANT_COLUMN, tenant_id))),
            )
            .await?;
        roles.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(roles)
    }

    pub async fn check_permission(
        &self,
        deadline: Deadline,
        user_id: Uuid,
        table: &str,
        action: Action,
    ) -> Result<AccessDecision, EngineError> {
        let Some(user) = self
            .storage
            .fetch_one::<User>(deadline, Expr::eq(ID_COLUMN, user_id))
            .await?
        else {
            debug!(%user_id, table, %action, "permission denied: unknown user");
            return Ok(AccessDecision::deny());
        };
        if !user.active {
            debug!(%user_id, table, %action, "permission denied: inactive user");
            return Ok(AccessDecision::deny());
        }
        let tenant_id = user.tenant_id;
        let roles = self.roles_for_user(deadline, tenant_id, user_id).await?;

        if roles.iter().any(|r| r.name == self.config.admin_role_name) {
            warn!(
                %user_id,
                %tenant_id,
                table,
                %action,
                "admin role bypassed permission rules"
            );
            return Ok(AccessDecision::unrestricted(tenant_id));
        }
        if roles.is_empty() {
            debug!(%user_id, table, %action, "permission denied: no roles");
            return Ok(AccessDecision::deny());
        }

        let role_ids = roles.iter().map(|r| DynamicValue::from(r.id)).collect();
        let filter = Expr::eq(TENANT_COLUMN, tenant_id)
            .and(Expr::In("role_id".to_string(), role_ids))
            .and(Expr::eq("table_name", table))
            .and(Expr::eq("action", action.as_str()));
        let rules = self
            .storage
            .fetch_all::<PermissionRule>(deadline, Some(filter))
            .await?;
        if rules.is_empty() {
            debug!(%user_id, table, %action, "permission denied: no matching rule");
            return Ok(AccessDecision::deny());
        }

        let allowed_fields = rules
            .iter()
            .map(|r| AllowedFields::from_list(&r.allowed_fields, self.config.empty_fields_policy))
            .reduce(AllowedFields::union)
            .unwrap_or_else(AllowedFields::none);
        let row_scope = if rules.iter().any(|r| r.row_filter.is_none()) {
            RowScope::Unrestricted
        } else {
            RowScope::AnyOf(
                rules
                    .iter()
                    .filter_map(|r| r.row_filter.as_ref())
                    .map(|f| f.resolve(user_id))
                    .collect(),
            )
        };
        Ok(AccessDecision {
            allowed: true,
            allowed_fields,
            row_scope,
            tenant_id: Some(tenant_id),
        })
    }

    /// Tuple form of [`check_permission`](Self::check_permission).
    pub async fn check(
        &self,
        deadline: Deadline,
        user_id: Uuid,
        table: &str,
        action: Action,
    ) -> Result<(bool, Vec<String>), EngineError> {
        Ok(self
            .check_permission(deadline, user_id, table, action)
            .await?
            .as_tuple())
    }

    /// Check for an authenticated caller. An `is_admin` context bypasses rules
    /// within its own tenant.
    pub async fn authorize(
        &self,
        deadline: Deadline,
        auth: &AuthContext,
        table: &str,
        action: Action,
    ) -> Result<AccessDecision, EngineError> {
        if auth.is_admin {
            warn!(
                user_id = %auth.user_id,
                tenant_id = %auth.tenant_id,
                table,
                %action,
                "admin context bypassed permission rules"
            );
            return Ok(AccessDecision::unrestricted(auth.tenant_id));
        }
        self.check_permission(deadline, auth.user_id, table, action)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::{AccessDecision, Action, AllowedFields, PermissionRule, decode_allowed_fields};
    use crate::catalog::SystemRow;
    use crate::config::EmptyFieldsPolicy;
    use crate::filter::{Predicate, RowFilter};
    use crate::catalog::types::DynamicValue;
    use crate::error::EngineErrorCode;
    use serde_json::json;
    use uuid::Uuid;

    fn list(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn empty_lists_follow_policy() {
        assert_eq!(
            AllowedFields::from_list(&[], EmptyFieldsPolicy::Unrestricted),
            AllowedFields::All
        );
        assert_eq!(
            AllowedFields::from_list(&[], EmptyFieldsPolicy::Deny),
            AllowedFields::none()
        );
        assert_eq!(
            AllowedFields::from_list(&list(&["a", "*"]), EmptyFieldsPolicy::Deny),
            AllowedFields::All
        );
    }

    #[test]
    fn union_absorbs_into_wildcard() {
        let a = AllowedFields::from_list(&list(&["a"]), EmptyFieldsPolicy::Deny);
        let b = AllowedFields::from_list(&list(&["b"]), EmptyFieldsPolicy::Deny);
        assert_eq!(a.clone().union(b).to_list(), list(&["a", "b"]));
        assert_eq!(a.union(AllowedFields::All), AllowedFields::All);
    }

    #[test]
    fn denial_tuple_carries_no_fields() {
        assert_eq!(AccessDecision::deny().as_tuple(), (false, vec![]));
        assert_eq!(
            AccessDecision::unrestricted(Uuid::new_v4()).as_tuple(),
            (true, list(&["*"]))
        );
    }

    #[test]
    fn rules_round_trip_through_records() {
        let rule = PermissionRule::new(Uuid::new_v4(), Uuid::new_v4(), "notes", Action::Update)
            .with_fields(["title", "body"])
            .with_row_filter(
                RowFilter::new().with("owner", Predicate::Equals(DynamicValue::text("$user"))),
            );
        let decoded = PermissionRule::from_record(&rule.to_record()).expect("decode");
        assert_eq!(decoded, rule);
    }

    #[test]
    fn malformed_field_lists_never_decode_as_empty() {
        let rule = PermissionRule::new(Uuid::new_v4(), Uuid::new_v4(), "notes", Action::Read);
        for bad in [
            DynamicValue::Json(json!({"title": true})),
            DynamicValue::Json(json!("title")),
            DynamicValue::Json(json!(["title", 1])),
            DynamicValue::text("title"),
            DynamicValue::Integer(3),
        ] {
            let mut record = rule.to_record();
            record.insert("allowed_fields", bad);
            let err = PermissionRule::from_record(&record).expect_err("corrupt list");
            assert_eq!(err.code(), EngineErrorCode::Internal);
        }
        assert_eq!(
            decode_allowed_fields(Some(&DynamicValue::text(r#"["title"]"#))),
            Ok(list(&["title"]))
        );
        assert_eq!(decode_allowed_fields(Some(&DynamicValue::Null)), Ok(vec![]));
        assert_eq!(decode_allowed_fields(None), Ok(vec![]));
    }

    #[test]
    fn actions_parse_from_their_names() {
        for action in Action::ALL {
            assert_eq!(Action::parse(action.as_str()), Some(action));
        }
        assert_eq!(Action::parse("truncate"), None);
    }
}
