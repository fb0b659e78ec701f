use crate::catalog::types::{DynamicValue, Record};
use crate::query::plan::{Expr, Order};
use std::cmp::Ordering;

/// Evaluates a predicate against one record. Missing columns never match.
pub fn eval_expr(expr: &Expr, record: &Record) -> bool {
    match expr {
        Expr::Eq(col, v) => {
            get_col(record, col).is_some_and(|rv| rv.compare(v).is_some_and(|o| o.is_eq()))
        }
        Expr::Gte(col, v) => {
            get_col(record, col).is_some_and(|rv| rv.compare(v).is_some_and(|o| o.is_ge()))
        }
        Expr::Lte(col, v) => {
            get_col(record, col).is_some_and(|rv| rv.compare(v).is_some_and(|o| o.is_le()))
        }
        Expr::In(col, values) => get_col(record, col).is_some_and(|rv| {
            values
                .iter()
                .any(|v| rv.compare(v).is_some_and(|o| o.is_eq()))
        }),
        Expr::And(a, b) => eval_expr(a, record) && eval_expr(b, record),
        Expr::Or(a, b) => eval_expr(a, record) || eval_expr(b, record),
    }
}

/// Stable sort by the given keys. Nulls and incomparable values sort last.
pub fn sort_records(rows: &mut [Record], order_by: &[(String, Order)]) {
    if order_by.is_empty() {
        return;
    }
    rows.sort_by(|a, b| {
        for (col, order) in order_by {
            let ord = compare_for_sort(a.get(col), b.get(col));
            let ord = match order {
                Order::Asc => ord,
                Order::Desc => ord.reverse(),
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    });
}

fn compare_for_sort(left: Option<&DynamicValue>, right: Option<&DynamicValue>) -> Ordering {
    let left = left.filter(|v| !v.is_null());
    let right = right.filter(|v| !v.is_null());
    match (left, right) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(l), Some(r)) => l.compare(r).unwrap_or(Ordering::Equal),
    }
}

/// SQL `LIKE` matching: `%` matches any run of characters, `_` exactly one.
pub fn like_match(value: &str, pattern: &str) -> bool {
    let text: Vec<char> = value.chars().collect();
    let pat: Vec<char> = pattern.chars().collect();
    let mut ti = 0usize;
    let mut pi = 0usize;
    let mut star_pi: Option<usize> = None;
    let mut star_ti = 0usize;

    while ti < text.len() {
        if pi < pat.len() && (pat[pi] == '_' || pat[pi] == text[ti]) {
            ti += 1;
            pi += 1;
            continue;
        }
        if pi < pat.len() && pat[pi] == '%' {
            star_pi = Some(pi);
            pi += 1;
            star_ti = ti;
            continue;
        }
        if let Some(saved_pi) = star_pi {
            pi = saved_pi + 1;
            star_ti += 1;
            ti = star_ti;
            continue;
        }
        return false;
    }

    while pi < pat.len() && pat[pi] == '%' {
        pi += 1;
    }

    pi == pat.len()
}

fn get_col<'a>(record: &'a Record, col: &str) -> Option<&'a DynamicValue> {
    record.get(col)
}
