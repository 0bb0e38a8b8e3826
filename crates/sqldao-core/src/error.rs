//! Error types for sqldao operations.

use crate::identity::EntityId;
use std::fmt;

/// The primary error type for all sqldao operations.
#[derive(Debug)]
pub enum Error {
    /// Connection-related errors (open, close, invalid configuration)
    Connection(ConnectionError),
    /// Statement preparation or execution errors
    Query(QueryError),
    /// Value conversion errors
    Type(TypeError),
    /// Transaction state errors
    Transaction(TransactionError),
    /// Entity, cache and flush errors
    Orm(OrmError),
    /// Custom error with message
    Custom(String),
}

#[derive(Debug)]
pub struct ConnectionError {
    pub kind: ConnectionErrorKind,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionErrorKind {
    /// Failed to open the database
    Connect,
    /// The handle was already closed
    Closed,
}

#[derive(Debug)]
pub struct QueryError {
    pub kind: QueryErrorKind,
    pub sql: Option<String>,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryErrorKind {
    /// Syntax error in SQL
    Syntax,
    /// Constraint violation (unique, foreign key, not null)
    Constraint,
    /// Table or column not found
    NotFound,
    /// Permission denied
    Permission,
    /// Database busy or locked
    Busy,
    /// Other database error
    Database,
}

#[derive(Debug)]
pub struct TypeError {
    pub expected: &'static str,
    pub actual: String,
    pub column: Option<String>,
}

#[derive(Debug)]
pub struct TransactionError {
    pub kind: TransactionErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionErrorKind {
    /// No transaction is active
    NotActive,
    /// A transaction is already active
    AlreadyActive,
    /// The owning session was dropped
    SessionClosed,
}

/// Failures raised by the entity layer.
///
/// Every variant carries enough context (table, column, identity) to
/// diagnose a persistence failure from the message alone.
#[derive(Debug, Clone, PartialEq)]
pub enum OrmError {
    /// A required column has no value on an INSERT row.
    NotNull { table: String, column: String },
    /// Two distinct row objects claim the same identity in one cache.
    IdentityCollision { table: String, id: EntityId },
    /// A second identity was assigned to a row that already has one.
    IdentityReassigned {
        table: String,
        current: EntityId,
        attempted: EntityId,
    },
    /// A fetch by identity returned nothing.
    EntityNotFound { table: String, id: Option<EntityId> },
    /// A single-row lookup matched more than one row.
    AmbiguousGet { table: String, count: usize },
    /// Delete was requested on a grouped query.
    UnsupportedDeleteShape { table: String },
    /// An entity from a different database was assigned to a column.
    CrossDatabaseReference { table: String, column: String },
    /// Pending inserts reference each other and cannot be ordered.
    SelfReferencingDeadlock {
        tables: Vec<String>,
        columns: Vec<String>,
    },
    /// The column is not declared on the table.
    UnknownColumn { table: String, column: String },
    /// The relation is not declared on the table.
    UnknownRelation { table: String, relation: String },
    /// The table is not registered.
    UnknownTable { table: String },
    /// An identifier failed validation.
    InvalidIdentifier { name: String },
    /// The operation needs an open transaction and auto-begin is off.
    NoTransaction,
}

impl Error {
    /// Get the SQL that caused this error, if available
    pub fn sql(&self) -> Option<&str> {
        match self {
            Error::Query(q) => q.sql.as_deref(),
            _ => None,
        }
    }

    /// The entity-layer error, if this is one.
    pub fn as_orm(&self) -> Option<&OrmError> {
        match self {
            Error::Orm(e) => Some(e),
            _ => None,
        }
    }

    /// Is this a constraint violation reported by the database?
    pub fn is_constraint_violation(&self) -> bool {
        matches!(self, Error::Query(q) if q.kind == QueryErrorKind::Constraint)
    }

    /// Build a query error for a statement.
    pub fn query(kind: QueryErrorKind, sql: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Query(QueryError {
            kind,
            sql: Some(sql.into()),
            message: message.into(),
            source: None,
        })
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Connection(e) => write!(f, "Connection error: {}", e.message),
            Error::Query(e) => match &e.sql {
                Some(sql) => write!(f, "Query error: {} (sql: {})", e.message, sql),
                None => write!(f, "Query error: {}", e.message),
            },
            Error::Type(e) => write!(f, "Type error: {}", e),
            Error::Transaction(e) => write!(f, "Transaction error: {}", e.message),
            Error::Orm(e) => write!(f, "{}", e),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Connection(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Query(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Orm(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for TypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(col) = &self.column {
            write!(
                f,
                "expected {} for column '{}', found {}",
                self.expected, col, self.actual
            )
        } else {
            write!(f, "expected {}, found {}", self.expected, self.actual)
        }
    }
}

impl fmt::Display for TransactionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for OrmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrmError::NotNull { table, column } => {
                write!(f, "{}.{} column not allow nulls", table, column)
            }
            OrmError::IdentityCollision { table, id } => write!(
                f,
                "Collision error: another row of {} is already cached with id={}",
                table, id
            ),
            OrmError::IdentityReassigned {
                table,
                current,
                attempted,
            } => write!(
                f,
                "Row of {} already has id={}, cannot reassign it to {}",
                table, current, attempted
            ),
            OrmError::EntityNotFound { table, id } => match id {
                Some(id) => write!(f, "Entity {}, id={} not found in the database", table, id),
                None => write!(f, "Entity {} not found in the database", table),
            },
            OrmError::AmbiguousGet { table, count } => write!(
                f,
                "get() on {} expected at most one row, found {}",
                table, count
            ),
            OrmError::UnsupportedDeleteShape { table } => {
                write!(f, "Cannot delete from {} with group by or having", table)
            }
            OrmError::CrossDatabaseReference { table, column } => write!(
                f,
                "Cannot link {}.{} to an entity from a different database",
                table, column
            ),
            OrmError::SelfReferencingDeadlock { tables, columns } => write!(
                f,
                "Pending inserts into [{}] reference each other through [{}] and cannot be ordered",
                tables.join(", "),
                columns.join(", ")
            ),
            OrmError::UnknownColumn { table, column } => {
                write!(f, "Column {}.{} is not declared", table, column)
            }
            OrmError::UnknownRelation { table, relation } => {
                write!(f, "Relation {}.{} is not declared", table, relation)
            }
            OrmError::UnknownTable { table } => write!(f, "Table {} is not registered", table),
            OrmError::InvalidIdentifier { name } => {
                write!(f, "'{}' is not a valid SQL identifier", name)
            }
            OrmError::NoTransaction => {
                write!(f, "No active transaction and auto-begin is disabled")
            }
        }
    }
}

impl std::error::Error for OrmError {}

impl From<ConnectionError> for Error {
    fn from(err: ConnectionError) -> Self {
        Error::Connection(err)
    }
}

impl From<QueryError> for Error {
    fn from(err: QueryError) -> Self {
        Error::Query(err)
    }
}

impl From<TypeError> for Error {
    fn from(err: TypeError) -> Self {
        Error::Type(err)
    }
}

impl From<TransactionError> for Error {
    fn from(err: TransactionError) -> Self {
        Error::Transaction(err)
    }
}

impl From<OrmError> for Error {
    fn from(err: OrmError) -> Self {
        Error::Orm(err)
    }
}

/// Result type alias for sqldao operations.
pub type Result<T> = std::result::Result<T, Error>;
