pub mod schema;
pub mod system;
pub mod tenant;
pub mod types;

use crate::catalog::schema::{Collection, Field, ID_COLUMN, TENANT_COLUMN};
use crate::catalog::system::SystemTable;
use crate::catalog::types::Record;
use crate::context::Deadline;
use crate::error::{EngineError, ResourceType};
use crate::query::plan::Expr;
use crate::storage::StorageHandle;
use uuid::Uuid;

/// A typed row of one system table.
pub trait SystemRow: Sized {
    const TABLE: SystemTable;

    fn id(&self) -> Uuid;

    fn to_record(&self) -> Record;

    fn from_record(record: &Record) -> Result<Self, EngineError>;
}

/// Unwraps a column every stored row of `R` must carry.
pub(crate) fn require<R: SystemRow, T>(value: Option<T>, column: &str) -> Result<T, EngineError> {
    value.ok_or_else(|| {
        EngineError::internal(format!(
            "corrupt {} row: missing or malformed {column}",
            R::TABLE.name()
        ))
    })
}

/// Read access to collection and field definitions.
///
/// Every lookup goes to storage; nothing is cached, so definitions written by
/// the lifecycle manager are visible to the next operation.
#[derive(Clone)]
pub struct SchemaCatalog {
    storage: StorageHandle,
}

impl SchemaCatalog {
    pub fn new(storage: StorageHandle) -> Self {
        Self { storage }
    }

    pub async fn get_collection(
        &self,
        deadline: Deadline,
        tenant_id: Uuid,
        name: &str,
    ) -> Result<Collection, EngineError> {
        let filter = Expr::eq(TENANT_COLUMN, tenant_id).and(Expr::eq("name", name));
        self.storage
            .fetch_one::<Collection>(deadline, filter)
            .await?
            .ok_or(EngineError::not_found(ResourceType::Collection))
    }

    /// Collection by id. One owned by another tenant is `Unauthorized`.
    pub async fn get_collection_by_id(
        &self,
        deadline: Deadline,
        tenant_id: Uuid,
        collection_id: Uuid,
    ) -> Result<Collection, EngineError> {
        let collection = self
            .storage
            .fetch_one::<Collection>(deadline, Expr::eq(ID_COLUMN, collection_id))
            .await?
            .ok_or(EngineError::not_found(ResourceType::Collection))?;
        if collection.tenant_id != tenant_id {
            return Err(EngineError::Unauthorized);
        }
        Ok(collection)
    }

    pub async fn list_collections(
        &self,
        deadline: Deadline,
        tenant_id: Uuid,
    ) -> Result<Vec<Collection>, EngineError> {
        let mut collections = self
            .storage
            .fetch_all::<Collection>(deadline, Some(Expr::eq(TENANT_COLUMN, tenant_id)))
            .await?;
        collections.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(collections)
    }

    /// Fields of a collection ordered by `sort_order`, then name.
    pub async fn get_fields(
        &self,
        deadline: Deadline,
        collection_id: Uuid,
    ) -> Result<Vec<Field>, EngineError> {
        let mut fields = self
            .storage
            .fetch_all::<Field>(deadline, Some(Expr::eq("collection_id", collection_id)))
            .await?;
        fields.sort_by(|a, b| a.sort_order.cmp(&b.sort_order).then_with(|| a.name.cmp(&b.name)));
        Ok(fields)
    }

    /// Field by id. One owned by another tenant is `Unauthorized`.
    pub async fn get_field(
        &self,
        deadline: Deadline,
        tenant_id: Uuid,
        field_id: Uuid,
    ) -> Result<Field, EngineError> {
        let field = self
            .storage
            .fetch_one::<Field>(deadline, Expr::eq(ID_COLUMN, field_id))
            .await?
            .ok_or(EngineError::not_found(ResourceType::Field))?;
        if field.tenant_id != tenant_id {
            return Err(EngineError::Unauthorized);
        }
        Ok(field)
    }
}
