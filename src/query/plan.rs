use crate::catalog::types::DynamicValue;
use crate::error::EngineError;
use serde::{Deserialize, Serialize};

/// Maximum nesting depth for expressions to prevent stack overflow
const MAX_EXPR_DEPTH: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    Asc,
    Desc,
}

/// Filter predicate over named columns. Values are always bound as
/// parameters, never interpolated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    Eq(String, DynamicValue),
    Gte(String, DynamicValue),
    Lte(String, DynamicValue),
    In(String, Vec<DynamicValue>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
}

impl Expr {
    pub fn eq(column: impl Into<String>, value: impl Into<DynamicValue>) -> Expr {
        Expr::Eq(column.into(), value.into())
    }

    pub fn and(self, rhs: Expr) -> Expr {
        Expr::And(Box::new(self), Box::new(rhs))
    }

    pub fn or(self, rhs: Expr) -> Expr {
        Expr::Or(Box::new(self), Box::new(rhs))
    }

    /// Conjunction of all expressions, `None` when empty.
    pub fn all(exprs: impl IntoIterator<Item = Expr>) -> Option<Expr> {
        exprs.into_iter().reduce(Expr::and)
    }

    /// Disjunction of all expressions, `None` when empty.
    pub fn any(exprs: impl IntoIterator<Item = Expr>) -> Option<Expr> {
        exprs.into_iter().reduce(Expr::or)
    }

    pub fn depth(&self) -> usize {
        match self {
            Expr::Eq(..) | Expr::Gte(..) | Expr::Lte(..) | Expr::In(..) => 1,
            Expr::And(left, right) | Expr::Or(left, right) => 1 + left.depth().max(right.depth()),
        }
    }

    pub fn validate_depth(&self) -> Result<(), EngineError> {
        let depth = self.depth();
        if depth > MAX_EXPR_DEPTH {
            return Err(EngineError::invalid(format!(
                "expression depth {depth} exceeds maximum allowed depth of {MAX_EXPR_DEPTH}"
            )));
        }
        Ok(())
    }

    /// Every column the expression reads, in first-seen order.
    pub fn columns(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_columns(&mut out);
        out
    }

    fn collect_columns<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Expr::Eq(c, _) | Expr::Gte(c, _) | Expr::Lte(c, _) | Expr::In(c, _) => {
                if !out.contains(&c.as_str()) {
                    out.push(c);
                }
            }
            Expr::And(l, r) | Expr::Or(l, r) => {
                l.collect_columns(out);
                r.collect_columns(out);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Expr;

    #[test]
    fn conjunction_of_nothing_is_none() {
        assert_eq!(Expr::all(Vec::new()), None);
    }

    #[test]
    fn columns_are_deduplicated() {
        let expr = Expr::eq("owner", "u1")
            .and(Expr::eq("id", "x"))
            .or(Expr::eq("owner", "u2"));
        assert_eq!(expr.columns(), vec!["owner", "id"]);
        assert_eq!(expr.depth(), 3);
    }

    #[test]
    fn deep_expressions_are_rejected() {
        let mut expr = Expr::eq("a", 1i64);
        for _ in 0..40 {
            expr = expr.and(Expr::eq("a", 1i64));
        }
        assert!(expr.validate_depth().is_err());
    }
}
