//! Statement builders for INSERT, UPDATE and DELETE.

use crate::expr::Expr;
use sqldao_core::{Dialect, Value};

/// A single-row INSERT whose SQL is reused for every row of a batch.
///
/// Parameters are supplied per row by the caller, in column order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsertStatement {
    table: String,
    columns: Vec<String>,
}

impl InsertStatement {
    pub fn new(table: impl Into<String>, columns: Vec<String>) -> Self {
        Self {
            table: table.into(),
            columns,
        }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Build the INSERT SQL.
    pub fn build_with_dialect(&self, dialect: Dialect) -> String {
        let table = dialect.quote_identifier(&self.table);
        if self.columns.is_empty() {
            return match dialect {
                Dialect::Mysql => format!("INSERT INTO {table} () VALUES ()"),
                Dialect::Postgres | Dialect::Sqlite => {
                    format!("INSERT INTO {table} DEFAULT VALUES")
                }
            };
        }
        let columns: Vec<_> = self
            .columns
            .iter()
            .map(|c| dialect.quote_identifier(c))
            .collect();
        let placeholders: Vec<_> = (1..=self.columns.len())
            .map(|i| dialect.placeholder(i))
            .collect();
        format!(
            "INSERT INTO {table} ({}) VALUES ({})",
            columns.join(", "),
            placeholders.join(", ")
        )
    }
}

/// `UPDATE t SET a = ?, b = ? WHERE key = ?`, run once per row of a batch.
///
/// The key value is the last parameter of each row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowUpdateStatement {
    table: String,
    columns: Vec<String>,
    key_column: String,
}

impl RowUpdateStatement {
    pub fn new(
        table: impl Into<String>,
        columns: Vec<String>,
        key_column: impl Into<String>,
    ) -> Self {
        Self {
            table: table.into(),
            columns,
            key_column: key_column.into(),
        }
    }

    pub fn build_with_dialect(&self, dialect: Dialect) -> String {
        let sets: Vec<_> = self
            .columns
            .iter()
            .enumerate()
            .map(|(i, c)| {
                format!(
                    "{} = {}",
                    dialect.quote_identifier(c),
                    dialect.placeholder(i + 1)
                )
            })
            .collect();
        format!(
            "UPDATE {} SET {} WHERE {} = {}",
            dialect.quote_identifier(&self.table),
            sets.join(", "),
            dialect.quote_identifier(&self.key_column),
            dialect.placeholder(self.columns.len() + 1)
        )
    }
}

/// A SET clause for bulk UPDATE.
#[derive(Debug, Clone)]
pub struct SetClause {
    pub column: String,
    pub value: Expr,
}

/// Bulk UPDATE with arbitrary assignments and WHERE.
#[derive(Debug, Clone)]
pub struct UpdateBuilder {
    table: String,
    sets: Vec<SetClause>,
    where_clause: Option<Expr>,
}

impl UpdateBuilder {
    pub fn table(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            sets: Vec::new(),
            where_clause: None,
        }
    }

    /// Assign `column = value`.
    pub fn set(mut self, column: impl Into<String>, value: impl Into<Expr>) -> Self {
        self.sets.push(SetClause {
            column: column.into(),
            value: value.into(),
        });
        self
    }

    pub fn sets(&self) -> &[SetClause] {
        &self.sets
    }

    /// Add a WHERE condition (AND with existing).
    pub fn filter(mut self, expr: Expr) -> Self {
        self.where_clause = Some(match self.where_clause {
            Some(existing) => existing.and(expr),
            None => expr,
        });
        self
    }

    /// Build the UPDATE SQL and parameters. Returns `None` when nothing is assigned.
    pub fn build_with_dialect(&self, dialect: Dialect) -> Option<(String, Vec<Value>)> {
        if self.sets.is_empty() {
            return None;
        }
        let mut params = Vec::new();
        let sets: Vec<_> = self
            .sets
            .iter()
            .map(|s| {
                let value_sql = s.value.build_with_dialect(dialect, &mut params);
                format!("{} = {}", dialect.quote_identifier(&s.column), value_sql)
            })
            .collect();
        let mut sql = format!(
            "UPDATE {} SET {}",
            dialect.quote_identifier(&self.table),
            sets.join(", ")
        );
        if let Some(where_clause) = &self.where_clause {
            sql.push_str(" WHERE ");
            sql.push_str(&where_clause.build_with_dialect(dialect, &mut params));
        }
        Some((sql, params))
    }
}

/// DELETE query builder.
#[derive(Debug, Clone)]
pub struct DeleteBuilder {
    table: String,
    where_clause: Option<Expr>,
}

impl DeleteBuilder {
    pub fn from(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            where_clause: None,
        }
    }

    /// Add a WHERE condition (AND with existing).
    pub fn filter(mut self, expr: Expr) -> Self {
        self.where_clause = Some(match self.where_clause {
            Some(existing) => existing.and(expr),
            None => expr,
        });
        self
    }

    pub fn build_with_dialect(&self, dialect: Dialect) -> (String, Vec<Value>) {
        let mut params = Vec::new();
        let mut sql = format!("DELETE FROM {}", dialect.quote_identifier(&self.table));
        if let Some(where_clause) = &self.where_clause {
            sql.push_str(" WHERE ");
            sql.push_str(&where_clause.build_with_dialect(dialect, &mut params));
        }
        (sql, params)
    }
}
