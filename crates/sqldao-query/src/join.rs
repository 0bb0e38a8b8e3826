//! JOIN clause types.

use crate::expr::Expr;
use sqldao_core::{Dialect, Value};

/// A JOIN clause.
#[derive(Debug, Clone)]
pub struct Join {
    pub join_type: JoinType,
    /// Table to join
    pub table: String,
    /// Optional table alias
    pub alias: Option<String>,
    /// ON condition
    pub on: Expr,
}

/// Types of SQL joins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinType {
    Inner,
    Left,
}

impl JoinType {
    /// Get the SQL keyword for this join type.
    pub const fn as_str(&self) -> &'static str {
        match self {
            JoinType::Inner => "INNER JOIN",
            JoinType::Left => "LEFT JOIN",
        }
    }
}

impl Join {
    /// Create an INNER JOIN.
    pub fn inner(table: impl Into<String>, on: Expr) -> Self {
        Self {
            join_type: JoinType::Inner,
            table: table.into(),
            alias: None,
            on,
        }
    }

    /// Create a LEFT JOIN.
    pub fn left(table: impl Into<String>, on: Expr) -> Self {
        Self {
            join_type: JoinType::Left,
            table: table.into(),
            alias: None,
            on,
        }
    }

    /// Set an alias for the joined table.
    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    /// The name other clauses use to refer to the joined table.
    pub fn reference_name(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.table)
    }

    /// Generate SQL and collect parameters.
    pub fn build_with_dialect(&self, dialect: Dialect, params: &mut Vec<Value>) -> String {
        let mut sql = format!(
            " {} {}",
            self.join_type.as_str(),
            dialect.quote_identifier(&self.table)
        );
        if let Some(alias) = &self.alias {
            sql.push_str(" AS ");
            sql.push_str(&dialect.quote_identifier(alias));
        }
        let on_sql = self.on.build_with_dialect(dialect, params);
        sql.push_str(" ON ");
        sql.push_str(&on_sql);
        sql
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aliased_left_join() {
        let join = Join::left(
            "country",
            Expr::qualified("country_id_country", "id").eq(Expr::qualified("region", "country_id")),
        )
        .alias("country_id_country");
        let mut params = Vec::new();
        assert_eq!(
            join.build_with_dialect(Dialect::Sqlite, &mut params),
            " LEFT JOIN \"country\" AS \"country_id_country\" ON \"country_id_country\".\"id\" = \"region\".\"country_id\""
        );
        assert_eq!(join.reference_name(), "country_id_country");
    }

    #[test]
    fn test_unaliased_reference_name() {
        let join = Join::inner("school", Expr::raw("1 = 1"));
        assert_eq!(join.reference_name(), "school");
        assert_eq!(join.join_type, JoinType::Inner);
    }
}
