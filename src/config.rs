use std::time::Duration;

/// What to do when a tenant's namespace cannot be looked up.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum NamespacePolicy {
    /// Fail the operation with an internal error.
    #[default]
    FailClosed,
    /// Route the operation to a shared namespace and log the failure.
    Fallback(String),
}

/// Meaning of a permission rule whose allowed-field list is empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EmptyFieldsPolicy {
    /// Empty list grants every field.
    #[default]
    Unrestricted,
    /// Empty list grants nothing; rules must name their fields.
    Deny,
}

/// Runtime configuration for an [`Engine`](crate::Engine).
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub namespace_policy: NamespacePolicy,
    pub empty_fields_policy: EmptyFieldsPolicy,
    /// Role name that bypasses permission rules within its tenant.
    pub admin_role_name: String,
    /// Role created alongside `admin` for every new tenant.
    pub default_member_role_name: String,
    pub dynamic_table_prefix: String,
    /// Deadline applied to operations whose context carries none. Zero
    /// disables it.
    pub default_timeout_ms: u64,
    pub max_identifier_len: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            namespace_policy: NamespacePolicy::FailClosed,
            empty_fields_policy: EmptyFieldsPolicy::Unrestricted,
            admin_role_name: "admin".to_string(),
            default_member_role_name: "member".to_string(),
            dynamic_table_prefix: "data_".to_string(),
            default_timeout_ms: 5_000,
            max_identifier_len: 63,
        }
    }
}

impl EngineConfig {
    /// Every permissive default turned off: empty field lists deny and
    /// namespace lookups fail closed.
    pub fn hardened() -> Self {
        Self {
            namespace_policy: NamespacePolicy::FailClosed,
            empty_fields_policy: EmptyFieldsPolicy::Deny,
            default_timeout_ms: 2_000,
            ..Self::default()
        }
    }

    /// Behaves like deployments that route unresolvable tenants to `public`
    /// and treat empty field lists as wildcards.
    pub fn compatible() -> Self {
        Self {
            namespace_policy: NamespacePolicy::Fallback("public".to_string()),
            empty_fields_policy: EmptyFieldsPolicy::Unrestricted,
            ..Self::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn default_timeout(&self) -> Option<Duration> {
        (self.default_timeout_ms > 0).then(|| Duration::from_millis(self.default_timeout_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::{EmptyFieldsPolicy, EngineConfig, NamespacePolicy};
    use std::time::Duration;

    #[test]
    fn defaults_fail_closed() {
        let config = EngineConfig::default();
        assert_eq!(config.namespace_policy, NamespacePolicy::FailClosed);
        assert_eq!(config.dynamic_table_prefix, "data_");
        assert_eq!(config.default_timeout(), Some(Duration::from_secs(5)));
    }

    #[test]
    fn profiles_differ_only_where_documented() {
        assert_eq!(
            EngineConfig::hardened().empty_fields_policy,
            EmptyFieldsPolicy::Deny
        );
        assert_eq!(
            EngineConfig::compatible().namespace_policy,
            NamespacePolicy::Fallback("public".into())
        );
        assert_eq!(EngineConfig::default().with_timeout(Duration::ZERO).default_timeout(), None);
    }
}
