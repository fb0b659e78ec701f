use crate::validation::ValidationError;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceType {
    Tenant,
    User,
    Role,
    Permission,
    Collection,
    Field,
    Row,
}

impl std::fmt::Display for ResourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceType::Tenant => write!(f, "tenant"),
            ResourceType::User => write!(f, "user"),
            ResourceType::Role => write!(f, "role"),
            ResourceType::Permission => write!(f, "permission"),
            ResourceType::Collection => write!(f, "collection"),
            ResourceType::Field => write!(f, "field"),
            ResourceType::Row => write!(f, "row"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineErrorCode {
    Unauthorized,
    Forbidden,
    InvalidInput,
    NotFound,
    Conflict,
    Timeout,
    Internal,
}

impl EngineErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            EngineErrorCode::Unauthorized => "unauthorized",
            EngineErrorCode::Forbidden => "forbidden",
            EngineErrorCode::InvalidInput => "invalid_input",
            EngineErrorCode::NotFound => "not_found",
            EngineErrorCode::Conflict => "conflict",
            EngineErrorCode::Timeout => "timeout",
            EngineErrorCode::Internal => "internal",
        }
    }
}

/// Errors returned to callers of the engine.
///
/// Messages are safe to hand to an external client: storage faults carry
/// their detail for logging only and display as a generic message.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("authentication required")]
    Unauthorized,
    #[error("access denied")]
    Forbidden,
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("{resource_type} not found")]
    NotFound { resource_type: ResourceType },
    #[error("{resource_type} already exists")]
    Conflict { resource_type: ResourceType },
    #[error("operation timed out")]
    Timeout,
    #[error("internal error")]
    Internal { detail: String },
}

impl EngineError {
    pub fn not_found(resource_type: ResourceType) -> Self {
        EngineError::NotFound { resource_type }
    }

    pub fn conflict(resource_type: ResourceType) -> Self {
        EngineError::Conflict { resource_type }
    }

    pub fn internal(detail: impl Into<String>) -> Self {
        EngineError::Internal {
            detail: detail.into(),
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        EngineError::InvalidInput(message.into())
    }

    pub fn code(&self) -> EngineErrorCode {
        match self {
            EngineError::Unauthorized => EngineErrorCode::Unauthorized,
            EngineError::Forbidden => EngineErrorCode::Forbidden,
            EngineError::InvalidInput(_) | EngineError::Validation(_) => {
                EngineErrorCode::InvalidInput
            }
            EngineError::NotFound { .. } => EngineErrorCode::NotFound,
            EngineError::Conflict { .. } => EngineErrorCode::Conflict,
            EngineError::Timeout => EngineErrorCode::Timeout,
            EngineError::Internal { .. } => EngineErrorCode::Internal,
        }
    }

    pub fn code_str(&self) -> &'static str {
        self.code().as_str()
    }
}

/// Faults raised by a [`Storage`](crate::storage::Storage) backend.
///
/// These carry physical table and column names and must be translated into an
/// [`EngineError`] before they cross the engine boundary.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("relation {table} does not exist")]
    MissingRelation { table: String },
    #[error("relation {table} already exists")]
    RelationExists { table: String },
    #[error("column {column} does not exist on {table}")]
    UnknownColumn { table: String, column: String },
    #[error("column {column} already exists on {table}")]
    ColumnExists { table: String, column: String },
    #[error("null value in column {column} of {table} violates not-null constraint")]
    NotNullViolation { table: String, column: String },
    #[error("duplicate key on {table} ({columns})")]
    UniqueViolation { table: String, columns: String },
    #[error("storage backend error: {0}")]
    Backend(String),
}
