use crate::catalog::system::SystemTable;
use crate::context::Deadline;
use crate::error::EngineError;
use crate::query::builder::PhysicalTable;
use crate::query::plan::Expr;
use crate::storage::{MaterializerHandle, StorageHandle};
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Undo action for one completed step of a multi-step change.
#[derive(Debug, Clone, PartialEq)]
pub enum Compensation {
    DeleteRow { table: SystemTable, id: Uuid },
    DeleteRowsWhere { table: SystemTable, filter: Expr },
    DropCollectionTable { collection_id: Uuid, table: PhysicalTable },
}

impl Compensation {
    fn describe(&self) -> String {
        match self {
            Compensation::DeleteRow { table, id } => format!("delete {} row {id}", table.name()),
            Compensation::DeleteRowsWhere { table, .. } => format!("delete {} rows", table.name()),
            Compensation::DropCollectionTable { collection_id, .. } => {
                format!("drop table of collection {collection_id}")
            }
        }
    }
}

/// Records compensations as steps of a change succeed and replays them in
/// reverse when a later step fails.
///
/// Compensations ignore the operation deadline: a change that timed out half
/// way is still rolled back.
pub struct Saga<'a> {
    name: &'static str,
    storage: &'a StorageHandle,
    materializer: &'a MaterializerHandle,
    steps: Vec<Compensation>,
}

impl<'a> Saga<'a> {
    pub fn new(
        name: &'static str,
        storage: &'a StorageHandle,
        materializer: &'a MaterializerHandle,
    ) -> Self {
        Self {
            name,
            storage,
            materializer,
            steps: Vec::new(),
        }
    }

    pub fn record(&mut self, compensation: Compensation) {
        self.steps.push(compensation);
    }

    pub fn pending(&self) -> &[Compensation] {
        &self.steps
    }

    /// Passes `result` through, compensating everything recorded so far when
    /// it is an error.
    pub async fn check<T>(&mut self, result: Result<T, EngineError>) -> Result<T, EngineError> {
        match result {
            Ok(value) => Ok(value),
            Err(err) => {
                warn!(saga = self.name, error = ?err, "step failed, compensating");
                self.compensate().await;
                Err(err)
            }
        }
    }

    pub fn complete(self) {
        debug!(saga = self.name, steps = self.steps.len(), "saga completed");
    }

    async fn compensate(&mut self) {
        while let Some(step) = self.steps.pop() {
            let what = step.describe();
            warn!(saga = self.name, step = %what, "running compensation");
            if let Err(err) = self.run(step).await {
                error!(
                    saga = self.name,
                    step = %what,
                    error = ?err,
                    "compensation failed; manual cleanup required"
                );
            }
        }
    }

    async fn run(&self, step: Compensation) -> Result<(), EngineError> {
        let deadline = Deadline::NONE;
        match step {
            Compensation::DeleteRow { table, id } => {
                self.storage
                    .delete_where(deadline, table, Expr::eq("id", id))
                    .await?;
            }
            Compensation::DeleteRowsWhere { table, filter } => {
                self.storage.delete_where(deadline, table, filter).await?;
            }
            Compensation::DropCollectionTable {
                collection_id,
                table,
            } => {
                self.materializer
                    .drop_collection_table(deadline, collection_id, &table)
                    .await?;
            }
        }
        Ok(())
    }
}
