//! SQL rendering for sqldao.
//!
//! `sqldao-query` turns expression trees and statement descriptions into SQL
//! text plus bound parameters. It never executes anything: the entity layer
//! hands the rendered statements to a [`sqldao_core::Connection`].
//!
//! - [`Expr`] builds WHERE/HAVING/ON/SET expressions
//! - [`Select`] with [`Join`], [`OrderBy`], grouping and paging
//! - [`InsertStatement`] and [`RowUpdateStatement`] render one statement reused per batch row
//! - [`UpdateBuilder`] and [`DeleteBuilder`] for bulk statements
//! - [`CreateTable`] renders DDL from [`sqldao_core::ColumnDef`]s

pub mod builder;
pub mod clause;
pub mod create;
pub mod expr;
pub mod join;
pub mod select;

pub use builder::{DeleteBuilder, InsertStatement, RowUpdateStatement, SetClause, UpdateBuilder};
pub use clause::{Limit, Offset, OrderBy, OrderDirection};
pub use create::CreateTable;
pub use expr::{BinaryOp, Expr};
pub use join::{Join, JoinType};
pub use select::{Select, SelectItem};
pub use sqldao_core::Dialect;
