//! SELECT query builder.

use crate::clause::{Limit, Offset, OrderBy};
use crate::expr::Expr;
use crate::join::Join;
use sqldao_core::{Dialect, Value};

/// One projected item.
#[derive(Debug, Clone)]
pub struct SelectItem {
    pub expr: Expr,
    pub alias: Option<String>,
}

/// A SELECT query builder.
///
/// The builder only renders; executing the statement is the caller's job.
#[derive(Debug, Clone)]
pub struct Select {
    table: String,
    columns: Vec<SelectItem>,
    where_clause: Option<Expr>,
    joins: Vec<Join>,
    order_by: Vec<OrderBy>,
    limit: Option<Limit>,
    offset: Option<Offset>,
    group_by: Vec<Expr>,
    having: Option<Expr>,
    distinct: bool,
    for_update: bool,
}

impl Select {
    /// Create a new SELECT over `table`. With no columns added the projection
    /// is `table.*`.
    pub fn from(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            columns: Vec::new(),
            where_clause: None,
            joins: Vec::new(),
            order_by: Vec::new(),
            limit: None,
            offset: None,
            group_by: Vec::new(),
            having: None,
            distinct: false,
            for_update: false,
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Add a projected expression.
    pub fn column(mut self, expr: Expr) -> Self {
        self.columns.push(SelectItem { expr, alias: None });
        self
    }

    /// Add a projected expression under an alias.
    pub fn column_as(mut self, expr: Expr, alias: impl Into<String>) -> Self {
        self.columns.push(SelectItem {
            expr,
            alias: Some(alias.into()),
        });
        self
    }

    /// Replace the projection.
    pub fn columns(mut self, items: Vec<SelectItem>) -> Self {
        self.columns = items;
        self
    }

    /// Add a WHERE condition (AND with existing).
    pub fn filter(mut self, expr: Expr) -> Self {
        self.where_clause = Some(match self.where_clause {
            Some(existing) => existing.and(expr),
            None => expr,
        });
        self
    }

    pub fn join(mut self, join: Join) -> Self {
        self.joins.push(join);
        self
    }

    pub fn order_by(mut self, order: OrderBy) -> Self {
        self.order_by.push(order);
        self
    }

    pub fn limit(mut self, n: u64) -> Self {
        self.limit = Some(Limit(n));
        self
    }

    pub fn offset(mut self, n: u64) -> Self {
        self.offset = Some(Offset(n));
        self
    }

    pub fn group_by(mut self, exprs: Vec<Expr>) -> Self {
        self.group_by.extend(exprs);
        self
    }

    /// Add a HAVING condition (AND with existing).
    pub fn having(mut self, expr: Expr) -> Self {
        self.having = Some(match self.having {
            Some(existing) => existing.and(expr),
            None => expr,
        });
        self
    }

    pub fn distinct(mut self) -> Self {
        self.distinct = true;
        self
    }

    /// Add FOR UPDATE lock. Dialects without row locks ignore it.
    pub fn for_update(mut self) -> Self {
        self.for_update = true;
        self
    }

    /// Build the SQL query and parameters.
    pub fn build_with_dialect(&self, dialect: Dialect) -> (String, Vec<Value>) {
        let mut params = Vec::new();
        let sql = self.build_into(dialect, &mut params);
        (sql, params)
    }

    /// Render into a shared parameter list, for use as a subquery.
    pub fn build_into(&self, dialect: Dialect, params: &mut Vec<Value>) -> String {
        let mut sql = String::from("SELECT ");
        if self.distinct {
            sql.push_str("DISTINCT ");
        }

        if self.columns.is_empty() {
            sql.push_str(&dialect.quote_identifier(&self.table));
            sql.push_str(".*");
        } else {
            let items: Vec<_> = self
                .columns
                .iter()
                .map(|item| {
                    let expr_sql = item.expr.build_with_dialect(dialect, params);
                    match &item.alias {
                        Some(alias) => {
                            format!("{expr_sql} AS {}", dialect.quote_identifier(alias))
                        }
                        None => expr_sql,
                    }
                })
                .collect();
            sql.push_str(&items.join(", "));
        }

        sql.push_str(" FROM ");
        sql.push_str(&dialect.quote_identifier(&self.table));

        for join in &self.joins {
            sql.push_str(&join.build_with_dialect(dialect, params));
        }

        if let Some(where_clause) = &self.where_clause {
            sql.push_str(" WHERE ");
            sql.push_str(&where_clause.build_with_dialect(dialect, params));
        }

        if !self.group_by.is_empty() {
            let groups: Vec<_> = self
                .group_by
                .iter()
                .map(|e| e.build_with_dialect(dialect, params))
                .collect();
            sql.push_str(" GROUP BY ");
            sql.push_str(&groups.join(", "));
        }

        if let Some(having) = &self.having {
            sql.push_str(" HAVING ");
            sql.push_str(&having.build_with_dialect(dialect, params));
        }

        if !self.order_by.is_empty() {
            let order_strs: Vec<_> = self
                .order_by
                .iter()
                .map(|o| o.build(dialect, params))
                .collect();
            sql.push_str(" ORDER BY ");
            sql.push_str(&order_strs.join(", "));
        }

        match (self.limit, self.offset) {
            (Some(Limit(n)), _) => sql.push_str(&format!(" LIMIT {}", n)),
            // SQLite and MySQL reject OFFSET without LIMIT
            (None, Some(_)) if dialect != Dialect::Postgres => sql.push_str(" LIMIT -1"),
            _ => {}
        }
        if let Some(Offset(n)) = self.offset {
            sql.push_str(&format!(" OFFSET {}", n));
        }

        if self.for_update {
            if dialect.supports_for_update() {
                sql.push_str(" FOR UPDATE");
            } else {
                tracing::warn!(
                    table = %self.table,
                    ?dialect,
                    "FOR UPDATE is not supported by this dialect; rendering without row locks"
                );
            }
        }

        sql
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_projection_is_table_star() {
        let (sql, params) = Select::from("region").build_with_dialect(Dialect::Sqlite);
        assert_eq!(sql, "SELECT \"region\".* FROM \"region\"");
        assert!(params.is_empty());
    }

    #[test]
    fn test_collects_params_across_joins_where_having() {
        let select = Select::from("region")
            .column(Expr::qualified("region", "country_id"))
            .column_as(Expr::count_star(), "n")
            .join(
                Join::inner(
                    "country",
                    Expr::qualified("country_id_country", "id")
                        .eq(Expr::qualified("region", "country_id")),
                )
                .alias("country_id_country"),
            )
            .filter(Expr::qualified("country_id_country", "name").eq("Peru"))
            .group_by(vec![Expr::qualified("region", "country_id")])
            .having(Expr::count_star().gt(1));
        let (sql, params) = select.build_with_dialect(Dialect::Sqlite);
        assert_eq!(
            sql,
            "SELECT \"region\".\"country_id\", COUNT(*) AS \"n\" FROM \"region\" \
             INNER JOIN \"country\" AS \"country_id_country\" ON \"country_id_country\".\"id\" = \"region\".\"country_id\" \
             WHERE \"country_id_country\".\"name\" = ?1 \
             GROUP BY \"region\".\"country_id\" HAVING COUNT(*) > ?2"
        );
        assert_eq!(params, vec![Value::Text("Peru".to_string()), Value::Int(1)]);
    }

    #[test]
    fn test_order_limit_offset() {
        let (sql, _) = Select::from("school")
            .order_by(OrderBy::desc(Expr::qualified("school", "name")))
            .limit(10)
            .offset(20)
            .build_with_dialect(Dialect::Sqlite);
        assert!(sql.ends_with("ORDER BY \"school\".\"name\" DESC LIMIT 10 OFFSET 20"));
    }

    #[test]
    fn test_offset_without_limit_on_sqlite() {
        let (sql, _) = Select::from("school").offset(5).build_with_dialect(Dialect::Sqlite);
        assert!(sql.ends_with(" LIMIT -1 OFFSET 5"));
        let (sql, _) = Select::from("school").offset(5).build_with_dialect(Dialect::Postgres);
        assert!(sql.ends_with("\"school\" OFFSET 5"));
    }

    #[test]
    fn test_for_update_dropped_on_sqlite() {
        let select = Select::from("school").for_update();
        let (sqlite, _) = select.build_with_dialect(Dialect::Sqlite);
        assert!(!sqlite.contains("FOR UPDATE"));
        let (pg, _) = select.build_with_dialect(Dialect::Postgres);
        assert!(pg.ends_with(" FOR UPDATE"));
    }

    #[test]
    fn test_subquery_shares_numbering() {
        let inner = Select::from("region")
            .column(Expr::qualified("region", "id"))
            .filter(Expr::qualified("region", "name").eq("North"));
        let outer = Select::from("region")
            .filter(Expr::qualified("region", "id").gt(0))
            .filter(Expr::qualified("region", "id").in_select(inner));
        let (sql, params) = outer.build_with_dialect(Dialect::Sqlite);
        assert!(sql.contains("> ?1 AND \"region\".\"id\" IN (SELECT \"region\".\"id\" FROM \"region\" WHERE \"region\".\"name\" = ?2)"));
        assert_eq!(params.len(), 2);
    }

    #[test]
    fn test_distinct() {
        let (sql, _) = Select::from("t").distinct().build_with_dialect(Dialect::Sqlite);
        assert!(sql.starts_with("SELECT DISTINCT \"t\".*"));
    }
}
