//! Core types and traits for sqldao.
//!
//! This crate provides the foundations the entity layer builds on:
//!
//! - [`Value`] and [`Row`] for parameters and result rows
//! - [`EntityId`] and [`IdKind`] for normalized row identities
//! - [`ColumnDef`] for column schema description
//! - [`Connection`] for blocking statement execution
//! - [`Error`] with the [`OrmError`] taxonomy

pub mod column;
pub mod connection;
pub mod error;
pub mod identifiers;
pub mod identity;
pub mod row;
pub mod types;
pub mod validate;
pub mod value;

pub use column::{ColumnDef, ColumnDefault, ForeignKey, ReferentialAction};
pub use connection::{Connection, Dialect, IsolationLevel};
pub use error::{
    ConnectionError, ConnectionErrorKind, Error, OrmError, QueryError, QueryErrorKind, Result,
    TransactionError, TransactionErrorKind, TypeError,
};
pub use identifiers::{quote_ident, quote_ident_mysql};
pub use identity::{EntityId, IdKind};
pub use row::{ColumnInfo, Row};
pub use types::SqlType;
pub use validate::{parse_order_spec, validate_identifier};
pub use value::Value;
