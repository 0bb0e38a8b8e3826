//! The session: connection, table registry, event bus and the open
//! transaction scope.
//!
//! A [`Session`] is a cheap `Rc` handle and is `!Send`. Entity handles keep a
//! `Weak` back-reference, so dropping the last `Session` clone closes the
//! connection and makes every outstanding handle fail with
//! `TransactionErrorKind::SessionClosed`.

use crate::cache::{FlushContext, FlushStats, TransactionCache};
use crate::config::SessionConfig;
use crate::entity::{EntityHandle, Model};
use crate::events::{ChangeEvent, ChangeKind, EventBuffer, EventBus};
use crate::query::EntityQuery;
use crate::row::{Loader, MutableRow, RowRef, values_from_row};
use crate::table::{Registry, TableDef};
use sqldao_core::{
    Connection, EntityId, Error, OrmError, Result, Row, TransactionError, TransactionErrorKind,
    Value,
};
use sqldao_query::{CreateTable, Expr, Select};
use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_TRANSACTION_ID: AtomicU64 = AtomicU64::new(1);

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

pub(crate) fn session_closed() -> Error {
    Error::Transaction(TransactionError {
        kind: TransactionErrorKind::SessionClosed,
        message: "the session owning this entity was dropped".to_string(),
    })
}

/// State of one open transaction.
pub(crate) struct TransactionScope {
    pub id: u64,
    pub cache: TransactionCache,
    pub events: EventBuffer,
    flushing: Cell<bool>,
}

impl TransactionScope {
    fn new() -> Self {
        Self {
            id: NEXT_TRANSACTION_ID.fetch_add(1, Ordering::Relaxed),
            cache: TransactionCache::new(),
            events: EventBuffer::new(),
            flushing: Cell::new(false),
        }
    }

    pub fn emit(&self, table: &str, id: EntityId, kind: ChangeKind) {
        self.events.push(ChangeEvent {
            table: table.to_string(),
            id,
            kind,
            transaction_id: self.id,
        });
    }
}

pub(crate) struct SessionInner {
    id: u64,
    conn: Box<dyn Connection>,
    registry: Arc<Registry>,
    bus: EventBus,
    config: SessionConfig,
    scope: RefCell<Option<Rc<TransactionScope>>>,
    self_ref: Weak<SessionInner>,
}

impl SessionInner {
    pub fn conn(&self) -> &dyn Connection {
        self.conn.as_ref()
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn weak(&self) -> Weak<SessionInner> {
        self.self_ref.clone()
    }

    pub fn current_scope(&self) -> Option<Rc<TransactionScope>> {
        self.scope.borrow().clone()
    }

    /// The open transaction, beginning one when auto-begin is enabled.
    pub fn scope(&self) -> Result<Rc<TransactionScope>> {
        if let Some(scope) = self.current_scope() {
            return Ok(scope);
        }
        if !self.config.auto_begin {
            return Err(Error::Orm(OrmError::NoTransaction));
        }
        self.begin()
    }

    /// Like [`scope`](Self::scope), but `None` instead of `NoTransaction`.
    fn scope_if_available(&self) -> Result<Option<Rc<TransactionScope>>> {
        if self.config.auto_begin {
            self.scope().map(Some)
        } else {
            Ok(self.current_scope())
        }
    }

    // ========================================================================
    // Transaction Management
    // ========================================================================

    pub fn begin(&self) -> Result<Rc<TransactionScope>> {
        if let Some(scope) = self.current_scope() {
            return Ok(scope);
        }
        self.conn.begin(self.config.isolation)?;
        let scope = Rc::new(TransactionScope::new());
        tracing::debug!(session = self.id, transaction = scope.id, "Transaction started");
        *self.scope.borrow_mut() = Some(Rc::clone(&scope));
        Ok(scope)
    }

    /// Flush, deliver buffered events, flush what subscribers wrote, then
    /// COMMIT and tear the cache down.
    #[tracing::instrument(level = "debug", skip(self), fields(session = self.id))]
    pub fn commit(&self) -> Result<()> {
        let Some(scope) = self.current_scope() else {
            return Ok(());
        };
        self.flush_scope(&scope, None)?;
        let events = scope.events.take();
        self.bus.publish(&events);
        self.flush_scope(&scope, None)?;
        self.conn.commit()?;
        *self.scope.borrow_mut() = None;
        scope
            .cache
            .teardown(&self.weak(), self.config.expire_on_commit, false);
        tracing::debug!(
            transaction = scope.id,
            events = events.len(),
            "Transaction committed"
        );
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self), fields(session = self.id))]
    pub fn rollback(&self) -> Result<()> {
        let Some(scope) = self.scope.borrow_mut().take() else {
            return Ok(());
        };
        let result = self.conn.rollback();
        let dropped = scope.events.take();
        scope.cache.teardown(&self.weak(), true, true);
        tracing::debug!(
            transaction = scope.id,
            dropped_events = dropped.len(),
            "Transaction rolled back"
        );
        result
    }

    // ========================================================================
    // Flush
    // ========================================================================

    fn flush_scope(&self, scope: &TransactionScope, tables: Option<&[String]>) -> Result<FlushStats> {
        if scope.flushing.replace(true) {
            tracing::trace!(transaction = scope.id, "Re-entrant flush skipped");
            return Ok(FlushStats::default());
        }
        let ctx = FlushContext {
            conn: self.conn(),
            events: &scope.events,
            transaction_id: scope.id,
        };
        let result = scope.cache.flush(&ctx, tables);
        scope.flushing.set(false);
        result
    }

    pub fn flush(&self, tables: Option<&[String]>) -> Result<FlushStats> {
        match self.current_scope() {
            Some(scope) => self.flush_scope(&scope, tables),
            None => Ok(FlushStats::default()),
        }
    }

    /// Flush the tables a statement is about to read.
    pub fn flush_before_query(&self, tables: &[String]) -> Result<()> {
        if self.config.flush_before_query {
            self.flush(Some(tables))?;
        }
        Ok(())
    }

    // ========================================================================
    // Statements
    // ========================================================================

    pub fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        let started = Instant::now();
        let rows = self.conn.query(sql, params)?;
        tracing::debug!(
            sql = %sql,
            params = params.len(),
            rows = rows.len(),
            elapsed_ms = elapsed_ms(started),
            "Query executed"
        );
        Ok(rows)
    }

    pub fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        let started = Instant::now();
        let affected = self.conn.execute(sql, params)?;
        tracing::debug!(
            sql = %sql,
            params = params.len(),
            rows = affected,
            elapsed_ms = elapsed_ms(started),
            "Statement executed"
        );
        Ok(affected)
    }

    /// `SELECT` every column of one row by identity.
    pub fn fetch_by_id(&self, table: &TableDef, id: &EntityId) -> Result<Option<Row>> {
        self.flush_before_query(&[table.name().to_string()])?;
        let mut select = Select::from(table.name());
        for column in table.columns() {
            select = select.column(Expr::qualified(table.name(), column.name.as_str()));
        }
        let select = select
            .filter(Expr::qualified(table.name(), table.id_column()).eq(Expr::lit(id.to_value())));
        let (sql, params) = select.build_with_dialect(self.conn.dialect());
        tracing::trace!(table = %table.name(), id = %id, "Fetching row by identity");
        Ok(self.query(&sql, &params)?.into_iter().next())
    }

    // ========================================================================
    // Identity Map
    // ========================================================================

    /// The cached row for `id`, or a new unloaded shell stored in the cache.
    pub fn lazy_wrap(&self, table: &Arc<TableDef>, id: EntityId) -> Result<RowRef> {
        let scope = self.scope()?;
        if let Some(row) = scope.cache.get(table.name(), &id) {
            return Ok(row);
        }
        let row = MutableRow::shell(Arc::clone(table), self.id, Loader::new(self.weak(), id)).into_ref();
        scope.cache.store(&row)?;
        Ok(row)
    }

    /// Wrap a fetched row, reusing the cached row object for its identity.
    ///
    /// A cached row that was still unloaded takes the fetched values; a
    /// loaded one keeps its own. Returns `None` when the identity column is
    /// NULL, which is how a missing optional hop looks.
    pub fn wrap(&self, table: &Arc<TableDef>, row: &Row, prefix: Option<&str>) -> Result<Option<RowRef>> {
        let id_value = match prefix {
            Some(prefix) => row.get_by_name(&format!("{prefix}__{}", table.id_column())),
            None => row.get_by_name(table.id_column()),
        };
        let Some(id) = id_value.and_then(EntityId::from_value) else {
            return Ok(None);
        };
        let scope = self.scope()?;
        if let Some(cached) = scope.cache.get(table.name(), &id) {
            let unloaded = !cached.borrow().is_loaded();
            if unloaded {
                cached.borrow_mut().load(values_from_row(table, row, prefix));
            }
            return Ok(Some(cached));
        }
        let values = values_from_row(table, row, prefix);
        let created = MutableRow::loaded(Arc::clone(table), self.id, id, values).into_ref();
        scope.cache.store(&created)?;
        Ok(Some(created))
    }

    /// Put a row loaded outside any cache back into the identity map, unless
    /// the identity is already taken.
    pub fn attach(&self, row: &RowRef) -> Result<()> {
        if let Some(scope) = self.scope_if_available()? {
            scope.cache.attach(row);
        }
        Ok(())
    }

    pub fn handle(&self, row: RowRef) -> EntityHandle {
        EntityHandle::new(row, self.weak())
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        if let Some(scope) = self.scope.get_mut().take() {
            tracing::warn!(
                session = self.id,
                transaction = scope.id,
                pending = scope.cache.pending_inserts(),
                "Session dropped with an open transaction; rolling back"
            );
            if let Err(e) = self.conn.rollback() {
                tracing::warn!(error = %e, "Rollback on drop failed");
            }
            scope.cache.teardown(&Weak::new(), false, true);
        }
    }
}

/// Entry point for entity work against one connection.
///
/// # Example
///
/// ```ignore
/// let session = Session::builder().register::<Country>().build(conn)?;
/// let peru = session.create::<Country>(|c| c.set_name("Peru"))?;
/// assert_eq!(session.objects::<Country>()?.count()?, 1);
/// session.commit()?;
/// ```
#[derive(Clone)]
pub struct Session {
    inner: Rc<SessionInner>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("in_transaction", &self.in_transaction())
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// A session with default configuration, its own registry and event bus.
    pub fn new(conn: impl Connection + 'static) -> Self {
        Self::from_parts(
            Box::new(conn),
            Arc::new(Registry::new()),
            EventBus::new(),
            SessionConfig::default(),
        )
    }

    pub fn builder() -> SessionBuilder {
        SessionBuilder::new()
    }

    fn from_parts(
        conn: Box<dyn Connection>,
        registry: Arc<Registry>,
        bus: EventBus,
        config: SessionConfig,
    ) -> Self {
        let inner = Rc::new_cyclic(|self_ref| SessionInner {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            conn,
            registry,
            bus,
            config,
            scope: RefCell::new(None),
            self_ref: self_ref.clone(),
        });
        Self { inner }
    }

    #[cfg(test)]
    pub(crate) fn inner(&self) -> &Rc<SessionInner> {
        &self.inner
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn config(&self) -> SessionConfig {
        self.inner.config
    }

    pub fn connection(&self) -> &dyn Connection {
        self.inner.conn()
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.inner.registry
    }

    // ========================================================================
    // Tables
    // ========================================================================

    /// Register the descriptor of `M`.
    pub fn register<M: Model>(&self) -> Result<Arc<TableDef>> {
        self.register_table(M::table())
    }

    pub fn register_table(&self, table: TableDef) -> Result<Arc<TableDef>> {
        self.inner.registry.register(table)
    }

    /// The registered descriptor for `name`.
    pub fn table(&self, name: &str) -> Result<Arc<TableDef>> {
        self.inner.registry.get(name)
    }

    fn model_table<M: Model>(&self) -> Result<Arc<TableDef>> {
        match self.inner.registry.get(M::TABLE) {
            Ok(table) => Ok(table),
            Err(_) => self.register::<M>(),
        }
    }

    /// `CREATE TABLE IF NOT EXISTS` for every registered table, in
    /// registration order.
    pub fn create_tables(&self) -> Result<()> {
        let dialect = self.inner.conn.dialect();
        for table in self.inner.registry.tables() {
            let sql = CreateTable::new(table.name(), table.columns())
                .if_not_exists()
                .build_with_dialect(dialect);
            self.inner.execute(&sql, &[])?;
        }
        Ok(())
    }

    // ========================================================================
    // Entities
    // ========================================================================

    /// A new, unsaved entity of `M`.
    pub fn new_entity<M: Model>(&self) -> Result<M> {
        let table = self.model_table::<M>()?;
        let row = MutableRow::new(table, self.inner.id).into_ref();
        Ok(M::from_handle(self.inner.handle(row)))
    }

    /// A new, unsaved row of a registered table.
    pub fn new_row(&self, table: &str) -> Result<EntityHandle> {
        let table = self.table(table)?;
        let row = MutableRow::new(table, self.inner.id).into_ref();
        Ok(self.inner.handle(row))
    }

    /// Construct an entity, let `init` fill it, and save it.
    pub fn create<M: Model>(&self, init: impl FnOnce(&M) -> Result<()>) -> Result<M> {
        let entity = self.new_entity::<M>()?;
        init(&entity)?;
        entity.handle().save()?;
        Ok(entity)
    }

    /// An entity of `M` known by identity. No query runs until a
    /// non-identity field is read.
    pub fn lazy<M: Model>(&self, id: impl Into<EntityId>) -> Result<M> {
        let table = self.model_table::<M>()?;
        let row = self.inner.lazy_wrap(&table, id.into())?;
        Ok(M::from_handle(self.inner.handle(row)))
    }

    /// Query over the table of `M`.
    pub fn objects<M: Model>(&self) -> Result<EntityQuery<M>> {
        let table = self.model_table::<M>()?;
        Ok(EntityQuery::new(self.inner.weak(), table))
    }

    /// Untyped query over a registered table.
    pub fn query(&self, table: &str) -> Result<EntityQuery<EntityHandle>> {
        let table = self.table(table)?;
        Ok(EntityQuery::new(self.inner.weak(), table))
    }

    // ========================================================================
    // Transactions
    // ========================================================================

    pub fn begin(&self) -> Result<()> {
        self.inner.begin().map(|_| ())
    }

    /// Flush, deliver the buffered change events and commit.
    ///
    /// Without an open transaction this does nothing.
    pub fn commit(&self) -> Result<()> {
        self.inner.commit()
    }

    /// Roll back and clear the transaction cache. Rows inserted by the
    /// transaction become new again.
    pub fn rollback(&self) -> Result<()> {
        self.inner.rollback()
    }

    pub fn in_transaction(&self) -> bool {
        self.inner.scope.borrow().is_some()
    }

    /// Run `body` in a transaction: commit on `Ok`, roll back on `Err`.
    ///
    /// Inside an already open transaction the body joins it and the outer
    /// owner decides.
    pub fn transaction<T>(&self, body: impl FnOnce(&Session) -> Result<T>) -> Result<T> {
        if self.in_transaction() {
            return body(self);
        }
        self.begin()?;
        let outcome = body(self).and_then(|value| self.commit().map(|()| value));
        if outcome.is_err() {
            if let Err(e) = self.rollback() {
                tracing::warn!(error = %e, "Rollback after failed transaction body failed");
            }
        }
        outcome
    }

    /// Write every pending insert and update.
    pub fn flush(&self) -> Result<FlushStats> {
        self.inner.flush(None)
    }

    /// Write pending rows of `tables` and of the tables they reference.
    pub fn flush_tables(&self, tables: &[&str]) -> Result<FlushStats> {
        let names: Vec<String> = tables.iter().map(|t| (*t).to_string()).collect();
        self.inner.flush(Some(&names))
    }

    // ========================================================================
    // Change Events
    // ========================================================================

    pub fn event_bus(&self) -> &EventBus {
        &self.inner.bus
    }

    /// Events buffered by the open transaction, not yet delivered.
    pub fn registered_changes(&self) -> Vec<ChangeEvent> {
        self.inner
            .current_scope()
            .map(|scope| scope.events.snapshot())
            .unwrap_or_default()
    }

    /// Subscribe `callback`, run `body` and commit. The subscription is
    /// removed whether or not the body succeeds; a failed body is not
    /// committed.
    pub fn with_hook<T>(
        &self,
        callback: impl Fn(&ChangeEvent) + Send + Sync + 'static,
        body: impl FnOnce(&Session) -> Result<T>,
    ) -> Result<T> {
        let subscription = self.inner.bus.subscribe(callback);
        let outcome = body(self).and_then(|value| self.commit().map(|()| value));
        self.inner.bus.unsubscribe(subscription);
        outcome
    }
}

/// Builds sessions that share one registry and one event bus.
#[derive(Debug, Default)]
pub struct SessionBuilder {
    config: SessionConfig,
    bus: EventBus,
    registry: Arc<Registry>,
    tables: Vec<TableDef>,
}

impl SessionBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn event_bus(mut self, bus: EventBus) -> Self {
        self.bus = bus;
        self
    }

    pub fn registry(mut self, registry: Arc<Registry>) -> Self {
        self.registry = registry;
        self
    }

    /// Register `M` with every session this builder produces.
    pub fn register<M: Model>(mut self) -> Self {
        self.tables.push(M::table());
        self
    }

    pub fn table(mut self, table: TableDef) -> Self {
        self.tables.push(table);
        self
    }

    /// Build a session over `conn`. Fails when a queued table descriptor is
    /// invalid.
    pub fn build(&self, conn: impl Connection + 'static) -> Result<Session> {
        for table in &self.tables {
            self.registry.register(table.clone())?;
        }
        Ok(Session::from_parts(
            Box::new(conn),
            Arc::clone(&self.registry),
            self.bus.clone(),
            self.config,
        ))
    }
}
