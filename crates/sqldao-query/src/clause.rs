//! ORDER BY, LIMIT and OFFSET clauses.

use crate::expr::Expr;
use sqldao_core::{Dialect, Value};

/// Sort direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OrderDirection {
    #[default]
    Asc,
    Desc,
}

/// ORDER BY item.
#[derive(Debug, Clone)]
pub struct OrderBy {
    pub expr: Expr,
    pub direction: OrderDirection,
}

impl OrderBy {
    pub fn asc(expr: impl Into<Expr>) -> Self {
        Self {
            expr: expr.into(),
            direction: OrderDirection::Asc,
        }
    }

    pub fn desc(expr: impl Into<Expr>) -> Self {
        Self {
            expr: expr.into(),
            direction: OrderDirection::Desc,
        }
    }

    /// Generate SQL for this ORDER BY item.
    pub fn build(&self, dialect: Dialect, params: &mut Vec<Value>) -> String {
        let expr_sql = self.expr.build_with_dialect(dialect, params);
        match self.direction {
            OrderDirection::Asc => format!("{expr_sql} ASC"),
            OrderDirection::Desc => format!("{expr_sql} DESC"),
        }
    }
}

/// LIMIT clause.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limit(pub u64);

/// OFFSET clause.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Offset(pub u64);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_by_direction() {
        let mut params = Vec::new();
        assert_eq!(
            OrderBy::desc(Expr::qualified("school", "name")).build(Dialect::Sqlite, &mut params),
            "\"school\".\"name\" DESC"
        );
        assert_eq!(
            OrderBy::asc(Expr::col("id")).build(Dialect::Sqlite, &mut params),
            "\"id\" ASC"
        );
    }
}
