//! Database connection trait.
//!
//! - [`Connection`] - blocking, object-safe statement execution and transaction control
//! - [`IsolationLevel`] - SQL transaction isolation levels
//! - [`Dialect`] - placeholder and quoting rules the renderers follow
//!
//! The entity layer holds its connection as `Box<dyn Connection>` and calls it
//! on the session's own thread. Every method blocks until the database answers.

use crate::error::Result;
use crate::row::Row;
use crate::value::Value;

/// Transaction isolation level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationLevel {
    /// Read uncommitted: dirty reads possible.
    ReadUncommitted,

    /// Read committed: only committed changes from others are visible.
    #[default]
    ReadCommitted,

    /// Repeatable read: a consistent snapshot for the whole transaction.
    RepeatableRead,

    /// Serializable: transactions appear to run one after another.
    Serializable,
}

impl IsolationLevel {
    /// Get the SQL syntax for this isolation level.
    #[must_use]
    pub const fn as_sql(&self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => "READ UNCOMMITTED",
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }
}

/// SQL dialect for generating database-specific SQL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Dialect {
    /// PostgreSQL dialect (uses $1, $2 placeholders)
    Postgres,
    /// SQLite dialect (uses ?1, ?2 placeholders)
    #[default]
    Sqlite,
    /// MySQL dialect (uses ? placeholders)
    Mysql,
}

impl Dialect {
    /// Generate a placeholder for the given parameter index (1-based).
    pub fn placeholder(self, index: usize) -> String {
        match self {
            Dialect::Postgres => format!("${index}"),
            Dialect::Sqlite => format!("?{index}"),
            Dialect::Mysql => "?".to_string(),
        }
    }

    /// Quote an identifier for this dialect.
    ///
    /// Embedded quote characters are doubled.
    pub fn quote_identifier(self, name: &str) -> String {
        match self {
            Dialect::Postgres | Dialect::Sqlite => crate::identifiers::quote_ident(name),
            Dialect::Mysql => crate::identifiers::quote_ident_mysql(name),
        }
    }

    /// Quote `qualifier.name`, or just `name` when unqualified.
    pub fn quote_column(self, qualifier: Option<&str>, name: &str) -> String {
        match qualifier {
            Some(q) => format!("{}.{}", self.quote_identifier(q), self.quote_identifier(name)),
            None => self.quote_identifier(name),
        }
    }

    /// Whether `SELECT ... FOR UPDATE` is understood.
    pub const fn supports_for_update(self) -> bool {
        !matches!(self, Dialect::Sqlite)
    }
}

/// A blocking database connection.
///
/// The trait is object safe so a session can own `Box<dyn Connection>` and
/// tests can wrap a real driver to count or record statements.
///
/// # Example
///
/// ```rust,ignore
/// let rows = conn.query("SELECT * FROM region WHERE id = ?1", &[Value::Int(1)])?;
/// conn.begin(IsolationLevel::default())?;
/// conn.execute("UPDATE region SET name = ?1 WHERE id = ?2", &[Value::from("North"), Value::Int(1)])?;
/// conn.commit()?;
/// ```
pub trait Connection {
    /// The dialect used to render statements for this connection.
    fn dialect(&self) -> Dialect;

    /// Execute a query and return all rows.
    fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>>;

    /// Execute a statement (UPDATE, DELETE, DDL) and return rows affected.
    fn execute(&self, sql: &str, params: &[Value]) -> Result<u64>;

    /// Execute an INSERT and return the generated identity, if the database
    /// produced one.
    fn insert(&self, sql: &str, params: &[Value]) -> Result<Option<Value>>;

    /// Run one INSERT statement once per parameter row.
    ///
    /// Returns the generated identity of each row, in input order. The default
    /// implementation calls [`insert`](Connection::insert) per row; drivers
    /// prepare the statement once.
    fn insert_batch(&self, sql: &str, rows: &[Vec<Value>]) -> Result<Vec<Option<Value>>> {
        rows.iter().map(|params| self.insert(sql, params)).collect()
    }

    /// Run one statement once per parameter row and return total rows affected.
    fn execute_batch(&self, sql: &str, rows: &[Vec<Value>]) -> Result<u64> {
        let mut total = 0;
        for params in rows {
            total += self.execute(sql, params)?;
        }
        Ok(total)
    }

    /// Begin a transaction.
    fn begin(&self, isolation: IsolationLevel) -> Result<()>;

    /// Commit the current transaction.
    fn commit(&self) -> Result<()>;

    /// Roll back the current transaction.
    fn rollback(&self) -> Result<()>;
}

impl<C: Connection + ?Sized> Connection for Box<C> {
    fn dialect(&self) -> Dialect {
        (**self).dialect()
    }

    fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        (**self).query(sql, params)
    }

    fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        (**self).execute(sql, params)
    }

    fn insert(&self, sql: &str, params: &[Value]) -> Result<Option<Value>> {
        (**self).insert(sql, params)
    }

    fn insert_batch(&self, sql: &str, rows: &[Vec<Value>]) -> Result<Vec<Option<Value>>> {
        (**self).insert_batch(sql, rows)
    }

    fn execute_batch(&self, sql: &str, rows: &[Vec<Value>]) -> Result<u64> {
        (**self).execute_batch(sql, rows)
    }

    fn begin(&self, isolation: IsolationLevel) -> Result<()> {
        (**self).begin(isolation)
    }

    fn commit(&self) -> Result<()> {
        (**self).commit()
    }

    fn rollback(&self) -> Result<()> {
        (**self).rollback()
    }
}
