//! Entity sessions for sqldao.
//!
//! `sqldao-session` is the **entity layer**. It owns the transaction-scoped
//! identity cache, defers writes until a flush, resolves relations lazily and
//! turns relation paths in filters into SQL joins.
//!
//! # Role In The Architecture
//!
//! - **Transaction cache**: one row object per `(table, identity)` for the
//!   lifetime of a transaction. Torn down on commit and rollback.
//! - **Flush scheduler**: batched inserts in dependency order, then updates
//!   grouped by column set.
//! - **Relations**: many-to-one links resolve through the cache; reverse
//!   relations are entity queries scoped to the owner.
//! - **Entity queries**: clone-on-modify queries with join rewriting,
//!   `select_related` and `prefetch_related`.
//! - **Change events**: buffered per transaction and delivered on commit.
//!
//! # Example
//!
//! ```ignore
//! let session = Session::builder().register::<Country>().build(conn)?;
//!
//! let peru = session.create::<Country>(|c| c.handle().set("name", "Peru"))?;
//! let regions = session
//!     .query("region")?
//!     .filter(|r| r.rel("country").col("name").eq("Peru"))
//!     .count()?;
//!
//! session.commit()?;
//! ```

#![allow(clippy::result_large_err)]

pub mod cache;
pub mod config;
pub mod entity;
pub mod events;
pub mod join_context;
pub mod query;
pub mod row;
pub mod session;
pub mod table;

#[cfg(test)]
mod test_support;

pub use cache::{FlushStats, TableCache, TransactionCache};
pub use config::SessionConfig;
pub use entity::{Entity, EntityHandle, Model};
pub use events::{ChangeEvent, ChangeKind, EventBus, SubscriptionId};
pub use join_context::{ColumnRef, Condition, JoinContext, JoinHop};
pub use query::{Assignments, EntityQuery};
pub use row::{FieldValue, FlushAction, MutableRow, RowRef, WriteSet};
pub use session::{Session, SessionBuilder};
pub use table::{Registry, Relation, RelationKind, TableDef};
