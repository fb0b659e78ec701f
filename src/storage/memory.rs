use crate::catalog::schema::{
    CREATED_AT, CREATED_BY, Field, ID_COLUMN, UPDATED_AT, UPDATED_BY,
};
use crate::catalog::system::SystemTable;
use crate::catalog::types::{DynamicValue, Record};
use crate::error::StorageError;
use crate::query::builder::{Delete, Insert, PhysicalTable, Projection, Select, Statement, Update};
use crate::query::operators::{eval_expr, sort_records};
use crate::storage::{ExecOutcome, SchemaMaterializer, Storage};
use crate::validation::default_value;
use async_trait::async_trait;
use chrono::Utc;
use im::{HashMap, Vector};
use parking_lot::RwLock;
use uuid::Uuid;

const SERVER_COLUMNS: [&str; 5] = [ID_COLUMN, CREATED_AT, UPDATED_AT, CREATED_BY, UPDATED_BY];

#[derive(Debug, Clone, PartialEq)]
struct ColumnSpec {
    name: String,
    not_null: bool,
    default: Option<DynamicValue>,
}

#[derive(Debug, Clone, Default)]
struct MemTable {
    /// `None` accepts any column.
    columns: Option<Vec<ColumnSpec>>,
    unique: Vec<Vec<String>>,
    rows: Vector<Record>,
}

impl MemTable {
    fn system(table: SystemTable) -> Self {
        let mut unique = vec![vec![ID_COLUMN.to_string()]];
        unique.extend(
            table
                .unique_keys()
                .iter()
                .map(|key| key.iter().map(|c| c.to_string()).collect()),
        );
        Self {
            columns: None,
            unique,
            rows: Vector::new(),
        }
    }

    fn has_column(&self, column: &str) -> bool {
        match &self.columns {
            Some(cols) => cols.iter().any(|c| c.name == column),
            None => true,
        }
    }

    fn check_columns<'a>(
        &self,
        qualified: &str,
        columns: impl IntoIterator<Item = &'a str>,
    ) -> Result<(), StorageError> {
        for column in columns {
            if !self.has_column(column) {
                return Err(StorageError::UnknownColumn {
                    table: qualified.to_string(),
                    column: column.to_string(),
                });
            }
        }
        Ok(())
    }

    fn check_not_null(&self, qualified: &str, row: &Record) -> Result<(), StorageError> {
        let Some(cols) = &self.columns else {
            return Ok(());
        };
        for spec in cols.iter().filter(|c| c.not_null) {
            if row.get(&spec.name).is_none_or(DynamicValue::is_null) {
                return Err(StorageError::NotNullViolation {
                    table: qualified.to_string(),
                    column: spec.name.clone(),
                });
            }
        }
        Ok(())
    }

    /// Nulls never collide, as in SQL.
    fn check_unique(&self, qualified: &str, row: &Record, skip: Option<usize>) -> Result<(), StorageError> {
        for key in &self.unique {
            let values: Option<Vec<&DynamicValue>> = key
                .iter()
                .map(|c| row.get(c).filter(|v| !v.is_null()))
                .collect();
            let Some(values) = values else {
                continue;
            };
            let clash = self.rows.iter().enumerate().any(|(idx, other)| {
                Some(idx) != skip
                    && key
                        .iter()
                        .zip(&values)
                        .all(|(c, v)| other.get(c).is_some_and(|ov| ov == *v))
            });
            if clash {
                return Err(StorageError::UniqueViolation {
                    table: qualified.to_string(),
                    columns: key.join(", "),
                });
            }
        }
        Ok(())
    }
}

/// In-process backend holding every table in persistent maps.
///
/// Each statement runs against a copy of the target table that replaces the
/// original only on success, so a failing statement changes nothing.
#[derive(Debug)]
pub struct MemoryStorage {
    tables: RwLock<HashMap<String, MemTable>>,
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStorage {
    /// A backend with every system table created.
    pub fn new() -> Self {
        let tables = SystemTable::ALL
            .into_iter()
            .map(|t| (t.name().to_string(), MemTable::system(t)))
            .collect();
        Self {
            tables: RwLock::new(tables),
        }
    }

    /// Qualified names of every physical table, sorted.
    pub fn table_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tables.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Declared columns of a dynamic table, `None` if it does not exist or
    /// accepts any column.
    pub fn column_names(&self, table: &PhysicalTable) -> Option<Vec<String>> {
        let tables = self.tables.read();
        let cols = tables.get(&table.qualified())?.columns.as_ref()?;
        Some(cols.iter().map(|c| c.name.clone()).collect())
    }

    pub fn row_count(&self, table: &PhysicalTable) -> Option<usize> {
        self.tables
            .read()
            .get(&table.qualified())
            .map(|t| t.rows.len())
    }

    fn with_table<T>(
        &self,
        table: &PhysicalTable,
        apply: impl FnOnce(&mut MemTable, &str) -> Result<T, StorageError>,
    ) -> Result<T, StorageError> {
        let qualified = table.qualified();
        let mut tables = self.tables.write();
        let mut working = tables
            .get(&qualified)
            .cloned()
            .ok_or_else(|| StorageError::MissingRelation {
                table: qualified.clone(),
            })?;
        let out = apply(&mut working, &qualified)?;
        tables.insert(qualified, working);
        Ok(out)
    }

    fn run_select(&self, select: &Select) -> Result<ExecOutcome, StorageError> {
        let qualified = select.table.qualified();
        let tables = self.tables.read();
        let table = tables
            .get(&qualified)
            .ok_or_else(|| StorageError::MissingRelation {
                table: qualified.clone(),
            })?;
        if let Some(filter) = &select.filter {
            table.check_columns(&qualified, filter.columns())?;
        }
        if let Projection::Columns(cols) = &select.projection {
            table.check_columns(&qualified, cols.iter().map(String::as_str))?;
        }
        let mut rows: Vec<Record> = table
            .rows
            .iter()
            .filter(|r| select.filter.as_ref().is_none_or(|f| eval_expr(f, r)))
            .cloned()
            .collect();
        sort_records(&mut rows, &select.order_by);
        if let Some(limit) = select.limit {
            rows.truncate(limit);
        }
        if let Projection::Columns(cols) = &select.projection {
            for row in &mut rows {
                row.retain(|k, _| cols.iter().any(|c| c == k));
            }
        }
        Ok(ExecOutcome {
            rows_affected: 0,
            rows,
        })
    }

    fn run_insert(&self, insert: &Insert) -> Result<ExecOutcome, StorageError> {
        self.with_table(&insert.table, |table, qualified| {
            table.check_columns(qualified, insert.values.iter().map(|(c, _)| c.as_str()))?;
            let mut row: Record = insert.values.iter().cloned().collect();
            if row.get(ID_COLUMN).is_none_or(DynamicValue::is_null) {
                row.insert(ID_COLUMN, Uuid::new_v4());
            }
            let now = Utc::now();
            for column in [CREATED_AT, UPDATED_AT] {
                if row.get(column).is_none_or(DynamicValue::is_null) {
                    row.insert(column, now);
                }
            }
            if let Some(cols) = &table.columns {
                for spec in cols {
                    if !row.contains_key(&spec.name) {
                        row.insert(spec.name.clone(), spec.default.clone().unwrap_or(DynamicValue::Null));
                    }
                }
            }
            table.check_not_null(qualified, &row)?;
            table.check_unique(qualified, &row, None)?;
            table.rows.push_back(row.clone());
            Ok(ExecOutcome {
                rows_affected: 1,
                rows: vec![row],
            })
        })
    }

    fn run_update(&self, update: &Update) -> Result<ExecOutcome, StorageError> {
        self.with_table(&update.table, |table, qualified| {
            table.check_columns(qualified, update.assignments.iter().map(|(c, _)| c.as_str()))?;
            table.check_columns(qualified, update.filter.columns())?;
            let targets: Vec<usize> = table
                .rows
                .iter()
                .enumerate()
                .filter(|(_, r)| eval_expr(&update.filter, r))
                .map(|(idx, _)| idx)
                .collect();
            let mut updated = Vec::with_capacity(targets.len());
            for idx in targets {
                let mut row = table.rows[idx].clone();
                for (column, value) in &update.assignments {
                    row.insert(column.clone(), value.clone());
                }
                table.check_not_null(qualified, &row)?;
                table.check_unique(qualified, &row, Some(idx))?;
                table.rows.set(idx, row.clone());
                updated.push(row);
            }
            Ok(ExecOutcome {
                rows_affected: updated.len() as u64,
                rows: updated,
            })
        })
    }

    fn run_delete(&self, delete: &Delete) -> Result<ExecOutcome, StorageError> {
        self.with_table(&delete.table, |table, qualified| {
            table.check_columns(qualified, delete.filter.columns())?;
            let before = table.rows.len();
            table.rows.retain(|r| !eval_expr(&delete.filter, r));
            Ok(ExecOutcome {
                rows_affected: (before - table.rows.len()) as u64,
                rows: Vec::new(),
            })
        })
    }
}

fn column_spec(field: &Field) -> ColumnSpec {
    ColumnSpec {
        name: field.name.clone(),
        not_null: field.required,
        default: default_value(field).ok().flatten(),
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn table_exists(&self, table: &PhysicalTable) -> Result<bool, StorageError> {
        Ok(self.tables.read().contains_key(&table.qualified()))
    }

    async fn execute(&self, statement: &Statement) -> Result<ExecOutcome, StorageError> {
        match statement {
            Statement::Select(select) => self.run_select(select),
            Statement::Insert(insert) => self.run_insert(insert),
            Statement::Update(update) => self.run_update(update),
            Statement::Delete(delete) => self.run_delete(delete),
        }
    }
}

#[async_trait]
impl SchemaMaterializer for MemoryStorage {
    async fn materialize_collection(
        &self,
        _collection_id: Uuid,
        table: &PhysicalTable,
        fields: &[Field],
    ) -> Result<(), StorageError> {
        let qualified = table.qualified();
        let mut tables = self.tables.write();
        if tables.contains_key(&qualified) {
            return Ok(());
        }
        let mut columns: Vec<ColumnSpec> = SERVER_COLUMNS
            .iter()
            .map(|name| ColumnSpec {
                name: name.to_string(),
                not_null: false,
                default: None,
            })
            .collect();
        let mut unique = vec![vec![ID_COLUMN.to_string()]];
        for field in fields {
            if SERVER_COLUMNS.contains(&field.name.as_str()) {
                continue;
            }
            columns.push(column_spec(field));
            if field.unique {
                unique.push(vec![field.name.clone()]);
            }
        }
        tables.insert(
            qualified,
            MemTable {
                columns: Some(columns),
                unique,
                rows: Vector::new(),
            },
        );
        Ok(())
    }

    async fn drop_collection_table(
        &self,
        _collection_id: Uuid,
        table: &PhysicalTable,
    ) -> Result<(), StorageError> {
        self.tables.write().remove(&table.qualified());
        Ok(())
    }

    async fn add_physical_column(
        &self,
        _tenant_id: Uuid,
        table: &PhysicalTable,
        field: &Field,
    ) -> Result<(), StorageError> {
        self.with_table(table, |mem, qualified| {
            let spec = column_spec(field);
            let Some(columns) = mem.columns.as_mut() else {
                return Err(StorageError::Backend(format!(
                    "{qualified} does not accept column changes"
                )));
            };
            if columns.iter().any(|c| c.name == spec.name) {
                return Err(StorageError::ColumnExists {
                    table: qualified.to_string(),
                    column: spec.name,
                });
            }
            let fill = spec.default.clone().unwrap_or(DynamicValue::Null);
            if spec.not_null && fill.is_null() && !mem.rows.is_empty() {
                return Err(StorageError::NotNullViolation {
                    table: qualified.to_string(),
                    column: spec.name,
                });
            }
            if field.unique && !fill.is_null() && mem.rows.len() > 1 {
                return Err(StorageError::UniqueViolation {
                    table: qualified.to_string(),
                    columns: spec.name,
                });
            }
            for row in mem.rows.iter_mut() {
                row.insert(spec.name.clone(), fill.clone());
            }
            if field.unique {
                mem.unique.push(vec![spec.name.clone()]);
            }
            columns.push(spec);
            Ok(())
        })
    }

    async fn drop_physical_column(
        &self,
        _tenant_id: Uuid,
        table: &PhysicalTable,
        column: &str,
    ) -> Result<(), StorageError> {
        self.with_table(table, |mem, _| {
            if let Some(columns) = mem.columns.as_mut() {
                columns.retain(|c| c.name != column);
            }
            mem.unique.retain(|key| !key.iter().any(|c| c == column));
            for row in mem.rows.iter_mut() {
                row.remove(column);
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::MemoryStorage;
    use crate::catalog::schema::Field;
    use crate::catalog::system::SystemTable;
    use crate::catalog::types::{DynamicValue, FieldType, Record};
    use crate::error::StorageError;
    use crate::query::builder::{
        PhysicalTable, Projection, Statement, build_delete, build_insert, build_select, build_update,
    };
    use crate::query::plan::Expr;
    use crate::storage::{SchemaMaterializer, Storage};
    use uuid::Uuid;

    fn notes() -> PhysicalTable {
        PhysicalTable::dynamic("acme", "notes", "data_").expect("table")
    }

    async fn materialized() -> MemoryStorage {
        let storage = MemoryStorage::new();
        let fields = vec![
            Field::new("title", FieldType::String).required(),
            Field::new("status", FieldType::String).with_default("open"),
            Field {
                unique: true,
                ..Field::new("slug", FieldType::String)
            },
        ];
        storage
            .materialize_collection(Uuid::new_v4(), &notes(), &fields)
            .await
            .expect("materialize");
        storage
    }

    async fn insert(storage: &MemoryStorage, payload: Record) -> Result<Record, StorageError> {
        let insert = build_insert(notes(), payload, Some(Uuid::new_v4())).expect("insert");
        let mut out = storage.execute(&Statement::Insert(insert)).await?;
        Ok(out.rows.remove(0))
    }

    #[tokio::test]
    async fn inserts_fill_server_columns_and_defaults() {
        let storage = materialized().await;
        let row = insert(&storage, Record::new().with("title", "a")).await.expect("row");
        assert!(row.uuid("id").is_some());
        assert!(row.timestamp("created_at").is_some());
        assert_eq!(row.text("status"), Some("open"));
        assert!(row.uuid("created_by").is_some());
    }

    #[tokio::test]
    async fn declared_tables_reject_unknown_and_null_columns() {
        let storage = materialized().await;
        let err = insert(&storage, Record::new().with("title", "a").with("bogus", 1i64))
            .await
            .expect_err("unknown column");
        assert!(matches!(err, StorageError::UnknownColumn { .. }));
        let err = insert(&storage, Record::new().with("status", "x"))
            .await
            .expect_err("not null");
        assert!(matches!(err, StorageError::NotNullViolation { .. }));
        assert_eq!(storage.row_count(&notes()), Some(0));
    }

    #[tokio::test]
    async fn unique_columns_ignore_nulls() {
        let storage = materialized().await;
        insert(&storage, Record::new().with("title", "a")).await.expect("first");
        insert(&storage, Record::new().with("title", "b")).await.expect("null slug twice");
        insert(&storage, Record::new().with("title", "c").with("slug", "s"))
            .await
            .expect("slug");
        let err = insert(&storage, Record::new().with("title", "d").with("slug", "s"))
            .await
            .expect_err("dup");
        assert!(matches!(err, StorageError::UniqueViolation { .. }));
    }

    #[tokio::test]
    async fn update_and_delete_report_affected_rows() {
        let storage = materialized().await;
        let row = insert(&storage, Record::new().with("title", "a")).await.expect("row");
        let id = row.uuid("id").expect("id");
        let update = build_update(notes(), id, Record::new().with("title", "b"), None).expect("update");
        let out = storage.execute(&Statement::Update(update)).await.expect("update");
        assert_eq!(out.rows_affected, 1);
        assert_eq!(out.rows[0].text("title"), Some("b"));

        let missing = build_update(notes(), Uuid::new_v4(), Record::new(), None).expect("update");
        let out = storage.execute(&Statement::Update(missing)).await.expect("update");
        assert_eq!(out.rows_affected, 0);

        let out = storage
            .execute(&Statement::Delete(build_delete(notes(), id)))
            .await
            .expect("delete");
        assert_eq!(out.rows_affected, 1);
    }

    #[tokio::test]
    async fn select_projects_and_filters() {
        let storage = materialized().await;
        insert(&storage, Record::new().with("title", "a").with("status", "done"))
            .await
            .expect("row");
        insert(&storage, Record::new().with("title", "b")).await.expect("row");
        let select = build_select(
            notes(),
            Projection::Columns(vec!["title".into()]),
            Some(Expr::eq("status", "open")),
        );
        let out = storage.execute(&Statement::Select(select)).await.expect("select");
        assert_eq!(out.rows.len(), 1);
        assert_eq!(out.rows[0].len(), 1);
        assert_eq!(out.rows[0].get("title"), Some(&DynamicValue::text("b")));
    }

    #[tokio::test]
    async fn missing_tables_are_reported() {
        let storage = MemoryStorage::new();
        assert!(!storage.table_exists(&notes()).await.expect("exists"));
        let err = storage
            .execute(&Statement::Select(build_select(notes(), Projection::All, None)))
            .await
            .expect_err("missing");
        assert!(matches!(err, StorageError::MissingRelation { .. }));
        assert!(
            storage
                .table_exists(&PhysicalTable::system(SystemTable::Roles))
                .await
                .expect("exists")
        );
    }

    #[tokio::test]
    async fn columns_can_be_added_and_dropped() {
        let storage = materialized().await;
        insert(&storage, Record::new().with("title", "a")).await.expect("row");
        let tenant = Uuid::new_v4();
        storage
            .add_physical_column(tenant, &notes(), &Field::new("pinned", FieldType::Boolean).with_default("false"))
            .await
            .expect("add");
        let err = storage
            .add_physical_column(tenant, &notes(), &Field::new("owner", FieldType::Uuid).required())
            .await
            .expect_err("required column without default on populated table");
        assert!(matches!(err, StorageError::NotNullViolation { .. }));
        let rows = storage
            .execute(&Statement::Select(build_select(notes(), Projection::All, None)))
            .await
            .expect("select")
            .rows;
        assert_eq!(rows[0].bool("pinned"), Some(false));

        storage
            .drop_physical_column(tenant, &notes(), "pinned")
            .await
            .expect("drop");
        let cols = storage.column_names(&notes()).expect("columns");
        assert!(!cols.iter().any(|c| c == "pinned"));
    }

    #[tokio::test]
    async fn materialization_is_idempotent() {
        let storage = materialized().await;
        insert(&storage, Record::new().with("title", "a")).await.expect("row");
        storage
            .materialize_collection(Uuid::new_v4(), &notes(), &[])
            .await
            .expect("again");
        assert_eq!(storage.row_count(&notes()), Some(1));
        storage
            .drop_collection_table(Uuid::new_v4(), &notes())
            .await
            .expect("drop");
        assert_eq!(storage.row_count(&notes()), None);
    }
}
