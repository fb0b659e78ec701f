use crate::error::EngineError;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

/// Identity established by an authentication layer. Trusted as given.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthContext {
    pub user_id: Uuid,
    pub tenant_id: Uuid,
    pub is_admin: bool,
}

impl AuthContext {
    pub fn new(user_id: Uuid, tenant_id: Uuid) -> Self {
        Self {
            user_id,
            tenant_id,
            is_admin: false,
        }
    }

    pub fn admin(user_id: Uuid, tenant_id: Uuid) -> Self {
        Self {
            user_id,
            tenant_id,
            is_admin: true,
        }
    }
}

/// Point in time after which storage calls give up with
/// [`EngineError::Timeout`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Deadline(Option<Instant>);

impl Deadline {
    pub const NONE: Deadline = Deadline(None);

    pub fn at(instant: Instant) -> Self {
        Deadline(Some(instant))
    }

    pub fn after(timeout: Duration) -> Self {
        Deadline(Some(Instant::now() + timeout))
    }

    pub fn instant(&self) -> Option<Instant> {
        self.0
    }

    pub fn expired(&self) -> bool {
        self.0.is_some_and(|at| Instant::now() >= at)
    }

    /// Runs `fut` until it completes or the deadline passes.
    pub async fn run<F, T>(self, fut: F) -> Result<T, EngineError>
    where
        F: Future<Output = Result<T, EngineError>>,
    {
        match self.0 {
            Some(at) => tokio::time::timeout_at(at, fut)
                .await
                .map_err(|_| EngineError::Timeout)?,
            None => fut.await,
        }
    }
}

/// Per-operation inputs threaded through every component.
#[derive(Debug, Clone, Copy, Default)]
pub struct OperationContext {
    pub auth: Option<AuthContext>,
    pub deadline: Deadline,
}

impl OperationContext {
    pub fn new(auth: AuthContext) -> Self {
        Self {
            auth: Some(auth),
            deadline: Deadline::NONE,
        }
    }

    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn with_deadline(mut self, deadline: Deadline) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Deadline::after(timeout))
    }

    pub fn require_auth(&self) -> Result<&AuthContext, EngineError> {
        self.auth.as_ref().ok_or(EngineError::Unauthorized)
    }
}
