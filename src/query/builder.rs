//! Dynamic data-manipulation statements.
//!
//! Statements are typed values. Identifiers that name a schema or table are
//! validated before they are accepted; column identifiers are always quoted;
//! every value is carried as a bound parameter. [`Statement::to_sql`] renders
//! the `$n`-parameterized text a SQL backend would execute.

use crate::catalog::schema::{CREATED_AT, CREATED_BY, ID_COLUMN, UPDATED_AT, UPDATED_BY};
use crate::catalog::system::SystemTable;
use crate::catalog::types::{DynamicValue, Record};
use crate::error::EngineError;
use crate::query::plan::{Expr, Order};
use chrono::Utc;
use std::fmt::Write as _;
use uuid::Uuid;

pub const DEFAULT_MAX_IDENTIFIER_LEN: usize = 63;

/// Accepts names made of ASCII letters, digits and underscores that do not
/// start with a digit.
pub fn validate_table_name(name: &str) -> Result<(), EngineError> {
    validate_identifier(name, DEFAULT_MAX_IDENTIFIER_LEN)
}

pub fn validate_identifier(name: &str, max_len: usize) -> Result<(), EngineError> {
    if name.is_empty() {
        return Err(EngineError::invalid("identifier must not be empty"));
    }
    if name.len() > max_len {
        return Err(EngineError::invalid(format!(
            "identifier exceeds {max_len} characters"
        )));
    }
    if name.starts_with(|c: char| c.is_ascii_digit()) {
        return Err(EngineError::invalid("identifier must not start with a digit"));
    }
    if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(EngineError::invalid(
            "identifier may contain only letters, digits and underscores",
        ));
    }
    Ok(())
}

/// Double-quotes an identifier, doubling embedded quotes.
pub fn quote_ident(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 2);
    out.push('"');
    for c in name.chars() {
        if c == '"' {
            out.push('"');
        }
        out.push(c);
    }
    out.push('"');
    out
}

/// Column identifiers accepted in payload keys. Anything printable goes; the
/// name is always quoted when rendered.
fn check_column(name: &str) -> Result<(), EngineError> {
    if name.is_empty() || name.chars().any(char::is_control) {
        return Err(EngineError::invalid("invalid column name"));
    }
    Ok(())
}

/// Physical location of a collection's rows.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PhysicalTable {
    namespace: Option<String>,
    name: String,
    system: Option<SystemTable>,
}

impl PhysicalTable {
    /// `<namespace>.<prefix><collection>` for a tenant's dynamic collection.
    pub fn dynamic(namespace: &str, collection: &str, prefix: &str) -> Result<Self, EngineError> {
        validate_identifier(namespace, DEFAULT_MAX_IDENTIFIER_LEN)?;
        validate_table_name(collection)?;
        let name = format!("{prefix}{collection}");
        validate_identifier(&name, DEFAULT_MAX_IDENTIFIER_LEN)?;
        Ok(Self {
            namespace: Some(namespace.to_string()),
            name,
            system: None,
        })
    }

    pub fn system(table: SystemTable) -> Self {
        Self {
            namespace: None,
            name: table.name().to_string(),
            system: Some(table),
        }
    }

    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn system_table(&self) -> Option<SystemTable> {
        self.system
    }

    /// Unquoted `ns.name`, used as a storage key and in logs.
    pub fn qualified(&self) -> String {
        match &self.namespace {
            Some(ns) => format!("{ns}.{}", self.name),
            None => self.name.clone(),
        }
    }

    fn render(&self) -> String {
        match &self.namespace {
            Some(ns) => format!("{}.{}", quote_ident(ns), quote_ident(&self.name)),
            None => quote_ident(&self.name),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Projection {
    All,
    Columns(Vec<String>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Select {
    pub table: PhysicalTable,
    pub projection: Projection,
    pub filter: Option<Expr>,
    pub order_by: Vec<(String, Order)>,
    pub limit: Option<usize>,
}

impl Select {
    pub fn order_by(mut self, column: impl Into<String>, order: Order) -> Self {
        self.order_by.push((column.into(), order));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn and_where(mut self, expr: Expr) -> Self {
        self.filter = Some(match self.filter.take() {
            Some(existing) => existing.and(expr),
            None => expr,
        });
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Insert {
    pub table: PhysicalTable,
    pub values: Vec<(String, DynamicValue)>,
}

impl Insert {
    /// Sets a server-chosen column, replacing any value already present.
    pub fn set(mut self, column: &str, value: impl Into<DynamicValue>) -> Self {
        let value = value.into();
        match self.values.iter_mut().find(|(c, _)| c == column) {
            Some(slot) => slot.1 = value,
            None => self.values.push((column.to_string(), value)),
        }
        self
    }

    /// Inserts with an id chosen by the engine instead of the backend.
    pub fn with_id(self, id: Uuid) -> Self {
        self.set(ID_COLUMN, id)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Update {
    pub table: PhysicalTable,
    pub assignments: Vec<(String, DynamicValue)>,
    pub filter: Expr,
}

impl Update {
    pub fn and_where(mut self, expr: Expr) -> Self {
        self.filter = self.filter.and(expr);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Delete {
    pub table: PhysicalTable,
    pub filter: Expr,
}

impl Delete {
    pub fn and_where(mut self, expr: Expr) -> Self {
        self.filter = self.filter.and(expr);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    Select(Select),
    Insert(Insert),
    Update(Update),
    Delete(Delete),
}

/// Parameterized statement text plus its bound values in `$n` order.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedSql {
    pub sql: String,
    pub params: Vec<DynamicValue>,
}

impl Statement {
    pub fn table(&self) -> &PhysicalTable {
        match self {
            Statement::Select(s) => &s.table,
            Statement::Insert(s) => &s.table,
            Statement::Update(s) => &s.table,
            Statement::Delete(s) => &s.table,
        }
    }

    pub fn to_sql(&self) -> RenderedSql {
        let mut params = Vec::new();
        let mut sql = String::new();
        match self {
            Statement::Select(select) => {
                let columns = match &select.projection {
                    Projection::All => "*".to_string(),
                    Projection::Columns(cols) => cols
                        .iter()
                        .map(|c| quote_ident(c))
                        .collect::<Vec<_>>()
                        .join(", "),
                };
                let _ = write!(sql, "SELECT {columns} FROM {}", select.table.render());
                if let Some(filter) = &select.filter {
                    sql.push_str(" WHERE ");
                    render_expr(filter, &mut sql, &mut params);
                }
                if !select.order_by.is_empty() {
                    let order = select
                        .order_by
                        .iter()
                        .map(|(c, o)| {
                            let dir = match o {
                                Order::Asc => "ASC",
                                Order::Desc => "DESC",
                            };
                            format!("{} {dir}", quote_ident(c))
                        })
                        .collect::<Vec<_>>()
                        .join(", ");
                    let _ = write!(sql, " ORDER BY {order}");
                }
                if let Some(limit) = select.limit {
                    let _ = write!(sql, " LIMIT {limit}");
                }
            }
            Statement::Insert(insert) => {
                let columns = insert
                    .values
                    .iter()
                    .map(|(c, _)| quote_ident(c))
                    .collect::<Vec<_>>()
                    .join(", ");
                let placeholders = insert
                    .values
                    .iter()
                    .map(|(_, v)| bind(v, &mut params))
                    .collect::<Vec<_>>()
                    .join(", ");
                let _ = write!(
                    sql,
                    "INSERT INTO {} ({columns}) VALUES ({placeholders}) RETURNING *",
                    insert.table.render()
                );
            }
            Statement::Update(update) => {
                let assignments = update
                    .assignments
                    .iter()
                    .map(|(c, v)| format!("{} = {}", quote_ident(c), bind(v, &mut params)))
                    .collect::<Vec<_>>()
                    .join(", ");
                let _ = write!(sql, "UPDATE {} SET {assignments} WHERE ", update.table.render());
                render_expr(&update.filter, &mut sql, &mut params);
                sql.push_str(" RETURNING *");
            }
            Statement::Delete(delete) => {
                let _ = write!(sql, "DELETE FROM {} WHERE ", delete.table.render());
                render_expr(&delete.filter, &mut sql, &mut params);
            }
        }
        RenderedSql { sql, params }
    }
}

fn bind(value: &DynamicValue, params: &mut Vec<DynamicValue>) -> String {
    params.push(value.clone());
    format!("${}", params.len())
}

fn render_expr(expr: &Expr, sql: &mut String, params: &mut Vec<DynamicValue>) {
    match expr {
        Expr::Eq(c, v) => {
            let p = bind(v, params);
            let _ = write!(sql, "{} = {p}", quote_ident(c));
        }
        Expr::Gte(c, v) => {
            let p = bind(v, params);
            let _ = write!(sql, "{} >= {p}", quote_ident(c));
        }
        Expr::Lte(c, v) => {
            let p = bind(v, params);
            let _ = write!(sql, "{} <= {p}", quote_ident(c));
        }
        Expr::In(c, values) => {
            if values.is_empty() {
                sql.push_str("FALSE");
                return;
            }
            let list = values
                .iter()
                .map(|v| bind(v, params))
                .collect::<Vec<_>>()
                .join(", ");
            let _ = write!(sql, "{} IN ({list})", quote_ident(c));
        }
        Expr::And(a, b) => {
            sql.push('(');
            render_expr(a, sql, params);
            sql.push_str(" AND ");
            render_expr(b, sql, params);
            sql.push(')');
        }
        Expr::Or(a, b) => {
            sql.push('(');
            render_expr(a, sql, params);
            sql.push_str(" OR ");
            render_expr(b, sql, params);
            sql.push(')');
        }
    }
}

pub fn build_select(table: PhysicalTable, projection: Projection, filter: Option<Expr>) -> Select {
    Select {
        table,
        projection,
        filter,
        order_by: Vec::new(),
        limit: None,
    }
}

/// Insert of a caller payload. `id`, `created_at` and `updated_at` are left to
/// the backend; `created_by`/`updated_by` are stamped with the actor.
pub fn build_insert(
    table: PhysicalTable,
    payload: Record,
    actor: Option<Uuid>,
) -> Result<Insert, EngineError> {
    let mut values = Vec::with_capacity(payload.len() + 2);
    for (column, value) in payload {
        if matches!(
            column.as_str(),
            ID_COLUMN | CREATED_AT | UPDATED_AT | CREATED_BY | UPDATED_BY
        ) {
            continue;
        }
        check_column(&column)?;
        values.push((column, value));
    }
    values.push((CREATED_BY.to_string(), DynamicValue::from(actor)));
    values.push((UPDATED_BY.to_string(), DynamicValue::from(actor)));
    Ok(Insert { table, values })
}

/// Update of one row by id. `id`, `created_at` and `created_by` are never
/// assigned; `updated_at`/`updated_by` are always stamped.
pub fn build_update(
    table: PhysicalTable,
    id: Uuid,
    payload: Record,
    actor: Option<Uuid>,
) -> Result<Update, EngineError> {
    let mut assignments = Vec::with_capacity(payload.len() + 2);
    for (column, value) in payload {
        if matches!(
            column.as_str(),
            ID_COLUMN | CREATED_AT | CREATED_BY | UPDATED_AT | UPDATED_BY
        ) {
            continue;
        }
        check_column(&column)?;
        assignments.push((column, value));
    }
    assignments.push((UPDATED_AT.to_string(), DynamicValue::Timestamp(Utc::now())));
    assignments.push((UPDATED_BY.to_string(), DynamicValue::from(actor)));
    Ok(Update {
        table,
        assignments,
        filter: Expr::eq(ID_COLUMN, id),
    })
}

pub fn build_delete(table: PhysicalTable, id: Uuid) -> Delete {
    Delete {
        table,
        filter: Expr::eq(ID_COLUMN, id),
    }
}

/// Delete of every row matching `filter`; used for cascades and cleanup.
pub fn build_delete_where(table: PhysicalTable, filter: Expr) -> Delete {
    Delete { table, filter }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn notes() -> PhysicalTable {
        PhysicalTable::dynamic("acme", "notes", "data_").expect("table")
    }

    #[test]
    fn table_names_are_validated() {
        assert!(validate_table_name("notes_2024").is_ok());
        assert!(validate_table_name("notes; DROP TABLE x").is_err());
        assert!(validate_table_name("").is_err());
        assert!(validate_table_name("1notes").is_err());
        assert!(validate_table_name(&"n".repeat(64)).is_err());
        assert!(PhysicalTable::dynamic("acme\"", "notes", "data_").is_err());
    }

    #[test]
    fn dynamic_and_system_tables_qualify_differently() {
        assert_eq!(notes().qualified(), "acme.data_notes");
        assert_eq!(PhysicalTable::system(SystemTable::Roles).qualified(), "roles");
    }

    #[test]
    fn insert_excludes_server_columns_and_stamps_actor() {
        let actor = Uuid::new_v4();
        let payload = Record::new()
            .with("id", Uuid::new_v4())
            .with("created_at", "2020-01-01")
            .with("updated_at", "2020-01-01")
            .with("created_by", Uuid::new_v4())
            .with("title", "hi");
        let insert = build_insert(notes(), payload, Some(actor)).expect("insert");
        let rendered = Statement::Insert(insert).to_sql();
        assert_eq!(
            rendered.sql,
            "INSERT INTO \"acme\".\"data_notes\" (\"title\", \"created_by\", \"updated_by\") \
             VALUES ($1, $2, $3) RETURNING *"
        );
        assert_eq!(rendered.params[0], DynamicValue::text("hi"));
        assert_eq!(rendered.params[1], DynamicValue::from(actor));
        assert_eq!(rendered.params[2], DynamicValue::from(actor));
    }

    #[test]
    fn update_stamps_modification_and_filters_by_id() {
        let actor = Uuid::new_v4();
        let id = Uuid::new_v4();
        let payload = Record::new()
            .with("created_by", Uuid::new_v4())
            .with("created_at", "2020-01-01")
            .with("title", "new");
        let update = build_update(notes(), id, payload, Some(actor)).expect("update");
        let columns: Vec<_> = update.assignments.iter().map(|(c, _)| c.as_str()).collect();
        assert_eq!(columns, vec!["title", "updated_at", "updated_by"]);
        let rendered = Statement::Update(update).to_sql();
        assert_eq!(
            rendered.sql,
            "UPDATE \"acme\".\"data_notes\" SET \"title\" = $1, \"updated_at\" = $2, \
             \"updated_by\" = $3 WHERE \"id\" = $4 RETURNING *"
        );
        assert_eq!(rendered.params[3], DynamicValue::from(id));
    }

    #[test]
    fn hostile_column_names_stay_quoted() {
        let payload = Record::new().with("x\" = 1; --", "v");
        let insert = build_insert(notes(), payload, None).expect("insert");
        let rendered = Statement::Insert(insert).to_sql();
        assert!(rendered.sql.contains("\"x\"\" = 1; --\""));
        assert_eq!(rendered.params[0], DynamicValue::text("v"));
    }

    #[test]
    fn select_renders_filters_as_parameters() {
        let select = build_select(
            notes(),
            Projection::Columns(vec!["id".into(), "title".into()]),
            Some(Expr::eq("owner", "o'brien").or(Expr::In("status".into(), vec![]))),
        )
        .order_by("created_at", Order::Desc)
        .limit(10);
        let rendered = Statement::Select(select).to_sql();
        assert_eq!(
            rendered.sql,
            "SELECT \"id\", \"title\" FROM \"acme\".\"data_notes\" \
             WHERE (\"owner\" = $1 OR FALSE) ORDER BY \"created_at\" DESC LIMIT 10"
        );
        assert_eq!(rendered.params, vec![DynamicValue::text("o'brien")]);
    }

    #[test]
    fn delete_targets_one_id() {
        let id = Uuid::new_v4();
        let rendered = Statement::Delete(build_delete(notes(), id)).to_sql();
        assert_eq!(rendered.sql, "DELETE FROM \"acme\".\"data_notes\" WHERE \"id\" = $1");
        assert_eq!(rendered.params, vec![DynamicValue::from(id)]);
    }
}
