//! sqldao - identity-mapped entities over SQL databases.
//!
//! sqldao adds an entity layer on top of a blocking [`Connection`]:
//!
//! - One row object per identity for the lifetime of a transaction
//! - Lazy forward and reverse relations
//! - Writes buffered until flush, then batched inserts in dependency order and
//!   updates grouped by column set
//! - Entity queries that turn relation paths into joins
//! - Change events delivered to subscribers on commit
//!
//! # Quick Start
//!
//! ```ignore
//! use sqldao::prelude::*;
//!
//! struct Country(EntityHandle);
//!
//! impl Entity for Country {
//!     fn from_handle(handle: EntityHandle) -> Self { Country(handle) }
//!     fn handle(&self) -> &EntityHandle { &self.0 }
//! }
//!
//! impl Model for Country {
//!     const TABLE: &'static str = "country";
//!     fn table() -> TableDef {
//!         TableDef::new("country").column(ColumnDef::new("name", SqlType::Text))
//!     }
//! }
//!
//! let session = Session::builder()
//!     .register::<Country>()
//!     .build(SqliteConnection::open_memory()?)?;
//! session.create_tables()?;
//!
//! let peru = session.create::<Country>(|c| c.handle().set("name", "Peru"))?;
//! session.commit()?;
//!
//! let found = session
//!     .objects::<Country>()?
//!     .get(|c| c.col("name").eq("Peru"))?;
//! ```
//!
//! # Features
//!
//! - **sqlite** (default): re-exports the bundled SQLite driver.

pub use sqldao_core::{
    ColumnDef, ColumnDefault, Connection, Dialect, EntityId, Error, ForeignKey, IdKind,
    IsolationLevel, OrmError, ReferentialAction, Result, Row, SqlType, Value,
};

pub use sqldao_query::{Expr, Join, JoinType, OrderBy, Select};

pub use sqldao_session::{
    Assignments, ChangeEvent, ChangeKind, ColumnRef, Condition, Entity, EntityHandle, EntityQuery,
    EventBus, FlushStats, JoinContext, Model, Registry, Relation, RelationKind, Session,
    SessionBuilder, SessionConfig, SubscriptionId, TableDef,
};

#[cfg(feature = "sqlite")]
pub use sqldao_sqlite::{OpenFlags, SqliteConfig, SqliteConnection};

/// Prelude module for convenient imports.
///
/// ```ignore
/// use sqldao::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{
        ChangeEvent, ChangeKind, ColumnDef, Condition, Connection, Entity, EntityHandle,
        EntityId, EntityQuery, Error, EventBus, Expr, JoinContext, Model, OrmError, Result,
        Session, SessionBuilder, SessionConfig, SqlType, TableDef, Value,
    };

    #[cfg(feature = "sqlite")]
    pub use crate::SqliteConnection;
}
