pub mod builder;
pub mod operators;
pub mod plan;

pub use builder::{PhysicalTable, Projection, RenderedSql, Statement, validate_table_name};
pub use plan::{Expr, Order};
