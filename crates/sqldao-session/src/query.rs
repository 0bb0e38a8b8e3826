//! Entity queries.
//!
//! [`EntityQuery`] is clone-on-modify: every modifier borrows the query and
//! returns a new one with its own predicate, joins, relation sets and an
//! empty result cache. Materialized results are cached on the query itself,
//! so repeated [`all`](EntityQuery::all) calls run one statement.
//!
//! Pending writes of every table a statement reads are flushed before it
//! runs.

use crate::entity::{Entity, EntityHandle};
use crate::events::ChangeKind;
use crate::join_context::{Condition, JoinContext, JoinHop, merge_joins};
use crate::row::{MutableRow, ResultCache, RowRef};
use crate::session::SessionInner;
use crate::table::TableDef;
use sqldao_core::{
    EntityId, Error, OrmError, Result, Row, Value, parse_order_spec, validate_identifier,
};
use sqldao_query::{DeleteBuilder, Expr, OrderBy, Select, UpdateBuilder};
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::marker::PhantomData;
use std::rc::{Rc, Weak};
use std::sync::Arc;

fn fresh_cache() -> ResultCache {
    Rc::new(RefCell::new(None))
}

/// Column assignments for [`EntityQuery::update`].
#[derive(Debug)]
pub struct Assignments {
    table: Arc<TableDef>,
    sets: Vec<(String, Expr)>,
    error: Option<OrmError>,
}

impl Assignments {
    fn new(table: Arc<TableDef>) -> Self {
        Self {
            table,
            sets: Vec::new(),
            error: None,
        }
    }

    /// Assign a literal value.
    pub fn set(&mut self, column: &str, value: impl Into<Value>) -> &mut Self {
        self.set_expr(column, Expr::lit(value))
    }

    /// Assign an expression, e.g. `Expr::col("rank").add(1)`.
    pub fn set_expr(&mut self, column: &str, expr: Expr) -> &mut Self {
        if self.table.column_def(column).is_none() {
            self.error.get_or_insert(OrmError::UnknownColumn {
                table: self.table.name().to_string(),
                column: column.to_string(),
            });
        }
        self.sets.push((column.to_string(), expr));
        self
    }
}

/// A lazily executed query over one entity table.
pub struct EntityQuery<E> {
    session: Weak<SessionInner>,
    table: Arc<TableDef>,
    predicate: Option<Expr>,
    joins: Vec<JoinHop>,
    error: Option<OrmError>,
    order: Vec<(String, bool)>,
    limit: Option<u64>,
    offset: Option<u64>,
    distinct: bool,
    group_by: Vec<String>,
    having: Option<Expr>,
    select_related: Vec<String>,
    prefetch_related: Vec<String>,
    for_update: bool,
    cache: ResultCache,
    _entity: PhantomData<fn() -> E>,
}

/// Clones start with an empty result cache.
impl<E> Clone for EntityQuery<E> {
    fn clone(&self) -> Self {
        Self {
            session: self.session.clone(),
            table: Arc::clone(&self.table),
            predicate: self.predicate.clone(),
            joins: self.joins.clone(),
            error: self.error.clone(),
            order: self.order.clone(),
            limit: self.limit,
            offset: self.offset,
            distinct: self.distinct,
            group_by: self.group_by.clone(),
            having: self.having.clone(),
            select_related: self.select_related.clone(),
            prefetch_related: self.prefetch_related.clone(),
            for_update: self.for_update,
            cache: fresh_cache(),
            _entity: PhantomData,
        }
    }
}

impl<E> std::fmt::Debug for EntityQuery<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityQuery")
            .field("table", &self.table.name())
            .field("predicate", &self.predicate)
            .field("joins", &self.joins.len())
            .field("order", &self.order)
            .field("limit", &self.limit)
            .field("offset", &self.offset)
            .field("materialized", &self.cache.borrow().is_some())
            .finish_non_exhaustive()
    }
}

impl<E: Entity> EntityQuery<E> {
    pub(crate) fn new(session: Weak<SessionInner>, table: Arc<TableDef>) -> Self {
        Self {
            session,
            table,
            predicate: None,
            joins: Vec::new(),
            error: None,
            order: Vec::new(),
            limit: None,
            offset: None,
            distinct: false,
            group_by: Vec::new(),
            having: None,
            select_related: Vec::new(),
            prefetch_related: Vec::new(),
            for_update: false,
            cache: fresh_cache(),
            _entity: PhantomData,
        }
    }

    /// Share `cache` as the materialized result list.
    pub(crate) fn with_cache(mut self, cache: ResultCache) -> Self {
        self.cache = cache;
        self
    }

    pub(crate) fn filter_expr(&self, expr: Expr) -> Self {
        let mut next = self.clone();
        next.predicate = Some(match next.predicate.take() {
            Some(existing) => existing.and(expr),
            None => expr,
        });
        next
    }

    fn session(&self) -> Result<Rc<SessionInner>> {
        self.session
            .upgrade()
            .ok_or_else(crate::session::session_closed)
    }

    fn record_error(&mut self, error: OrmError) {
        self.error.get_or_insert(error);
    }

    pub fn table(&self) -> &Arc<TableDef> {
        &self.table
    }

    // ========================================================================
    // Predicates
    // ========================================================================

    fn context(&self) -> Result<JoinContext> {
        let session = self.session()?;
        Ok(JoinContext::root(
            Arc::clone(session.registry()),
            Arc::clone(&self.table),
        ))
    }

    fn with_condition(&self, condition: Condition, negate: bool) -> Self {
        let (expr, joins, error) = condition.into_parts();
        let expr = if negate { expr.not() } else { expr };
        let mut next = self.filter_expr(expr);
        merge_joins(&mut next.joins, &joins);
        if let Some(error) = error {
            next.record_error(error);
        }
        next
    }

    fn build_condition(&self, f: impl FnOnce(&JoinContext) -> Condition) -> Option<Condition> {
        self.context().ok().map(|ctx| f(&ctx))
    }

    /// Keep rows matching the condition built from the root context.
    pub fn filter(&self, f: impl FnOnce(&JoinContext) -> Condition) -> Self {
        match self.build_condition(f) {
            Some(condition) => self.with_condition(condition, false),
            None => self.clone(),
        }
    }

    /// Drop rows matching the condition.
    pub fn exclude(&self, f: impl FnOnce(&JoinContext) -> Condition) -> Self {
        match self.build_condition(f) {
            Some(condition) => self.with_condition(condition, true),
            None => self.clone(),
        }
    }

    pub fn filter_condition(&self, condition: Condition) -> Self {
        self.with_condition(condition, false)
    }

    pub fn exclude_condition(&self, condition: Condition) -> Self {
        self.with_condition(condition, true)
    }

    /// Keep rows whose identity is in `ids`.
    pub fn filter_ids<I>(&self, ids: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<EntityId>,
    {
        let values: Vec<Value> = ids.into_iter().map(|id| id.into().to_value()).collect();
        self.filter_expr(
            Expr::qualified(self.table.name(), self.table.id_column()).in_list(values),
        )
    }

    /// Keep the given entities. Entities without identity match nothing.
    pub fn filter_entities<T: Entity>(&self, entities: &[T]) -> Self {
        let mut ids = Vec::with_capacity(entities.len());
        let mut error = None;
        for entity in entities {
            match entity.handle().id() {
                Ok(Some(id)) => ids.push(id),
                Ok(None) => {}
                Err(Error::Orm(e)) => {
                    error.get_or_insert(e);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Identity lookup failed while filtering entities");
                }
            }
        }
        let mut next = self.filter_ids(ids);
        if let Some(error) = error {
            next.record_error(error);
        }
        next
    }

    // ========================================================================
    // Shape
    // ========================================================================

    /// Order by a root column.
    pub fn order_by(&self, column: &str, descending: bool) -> Self {
        let mut next = self.clone();
        let checked = validate_identifier(column)
            .and_then(|()| self.table.require_column(column).map(|_| ()));
        match checked {
            Ok(()) => next.order.push((column.to_string(), descending)),
            Err(Error::Orm(e)) => next.record_error(e),
            Err(_) => {}
        }
        next
    }

    /// Order by `"name"` or `"-name"` (descending).
    pub fn order_by_str(&self, spec: &str) -> Self {
        match parse_order_spec(spec) {
            Ok((column, descending)) => self.order_by(&column, descending),
            Err(e) => {
                let mut next = self.clone();
                next.record_error(match e {
                    Error::Orm(e) => e,
                    _ => OrmError::InvalidIdentifier {
                        name: spec.to_string(),
                    },
                });
                next
            }
        }
    }

    pub fn limit(&self, n: u64) -> Self {
        let mut next = self.clone();
        next.limit = Some(n);
        next
    }

    pub fn offset(&self, n: u64) -> Self {
        let mut next = self.clone();
        next.offset = Some(n);
        next
    }

    pub fn distinct(&self) -> Self {
        let mut next = self.clone();
        next.distinct = true;
        next
    }

    pub fn group_by(&self, columns: &[&str]) -> Self {
        let mut next = self.clone();
        for column in columns {
            match self.table.require_column(column) {
                Ok(_) => next.group_by.push((*column).to_string()),
                Err(Error::Orm(e)) => next.record_error(e),
                Err(_) => {}
            }
        }
        next
    }

    pub fn having(&self, f: impl FnOnce(&JoinContext) -> Condition) -> Self {
        let Some(condition) = self.build_condition(f) else {
            return self.clone();
        };
        let (expr, joins, error) = condition.into_parts();
        let mut next = self.clone();
        next.having = Some(match next.having.take() {
            Some(existing) => existing.and(expr),
            None => expr,
        });
        merge_joins(&mut next.joins, &joins);
        if let Some(error) = error {
            next.record_error(error);
        }
        next
    }

    /// Load forward relations in the same statement, e.g.
    /// `&["manager", "manager.country"]`.
    pub fn select_related(&self, paths: &[&str]) -> Self {
        let mut next = self.clone();
        for path in paths {
            if !next.select_related.iter().any(|p| p == path) {
                next.select_related.push((*path).to_string());
            }
        }
        next
    }

    /// Load relations with one extra query per hop after the main query.
    pub fn prefetch_related(&self, paths: &[&str]) -> Self {
        let mut next = self.clone();
        for path in paths {
            if !next.prefetch_related.iter().any(|p| p == path) {
                next.prefetch_related.push((*path).to_string());
            }
        }
        next
    }

    /// The same query with an empty result cache.
    pub fn fresh(&self) -> Self {
        self.clone()
    }

    // ========================================================================
    // SQL
    // ========================================================================

    fn check(&self) -> Result<()> {
        match &self.error {
            Some(e) => Err(Error::Orm(e.clone())),
            None => Ok(()),
        }
    }

    fn root_column(&self, column: &str) -> Expr {
        Expr::qualified(self.table.name(), column)
    }

    /// Joins, WHERE, grouping and DISTINCT, without projection or paging.
    fn base_select(&self, joins: &[JoinHop]) -> Select {
        let mut select = Select::from(self.table.name());
        for hop in joins {
            select = select.join(hop.to_join());
        }
        if let Some(predicate) = &self.predicate {
            select = select.filter(predicate.clone());
        }
        if !self.group_by.is_empty() {
            select = select.group_by(self.group_by.iter().map(|c| self.root_column(c)).collect());
        }
        if let Some(having) = &self.having {
            select = select.having(having.clone());
        }
        if self.distinct {
            select = select.distinct();
        }
        select
    }

    fn paged(&self, mut select: Select, reverse: bool) -> Select {
        let mut order = if self.order.is_empty() {
            self.table.default_order()
        } else {
            self.order.clone()
        };
        if reverse && order.is_empty() {
            order.push((self.table.id_column().to_string(), false));
        }
        for (column, descending) in order {
            let expr = self.root_column(&column);
            select = select.order_by(if descending != reverse {
                OrderBy::desc(expr)
            } else {
                OrderBy::asc(expr)
            });
        }
        if let Some(limit) = self.limit {
            select = select.limit(limit);
        }
        if let Some(offset) = self.offset {
            select = select.offset(offset);
        }
        select
    }

    fn root_projection(&self, mut select: Select) -> Select {
        for column in self.table.columns() {
            select = select.column(self.root_column(&column.name));
        }
        select
    }

    /// Hops for every `select_related` path, in path order.
    fn related_hops(&self, ctx: &JoinContext) -> Result<Vec<JoinHop>> {
        let mut hops: Vec<JoinHop> = Vec::new();
        for path in &self.select_related {
            let mut position = ctx.clone();
            for segment in path.split('.') {
                position = position.rel(segment);
                if let Some(e) = position.error() {
                    return Err(Error::Orm(e.clone()));
                }
                let forward = position.path().last().is_some_and(|h| h.forward);
                if !forward {
                    return Err(Error::Custom(format!(
                        "select_related({path}) crosses a reverse relation; use prefetch_related"
                    )));
                }
            }
            merge_joins(&mut hops, position.path());
        }
        Ok(hops)
    }

    fn tables_read(&self, extra: &[JoinHop]) -> Vec<String> {
        let mut tables = vec![self.table.name().to_string()];
        for hop in self.joins.iter().chain(extra) {
            if !tables.contains(&hop.table) {
                tables.push(hop.table.clone());
            }
        }
        tables
    }

    // ========================================================================
    // Execution
    // ========================================================================

    fn load_rows(&self, reverse: bool, limit: Option<u64>) -> Result<Vec<RowRef>> {
        self.check()?;
        let session = self.session()?;
        let ctx = self.context()?;
        let related = self.related_hops(&ctx)?;
        let scope = session.scope()?;
        session.flush_before_query(&self.tables_read(&related))?;

        let mut joins = self.joins.clone();
        merge_joins(&mut joins, &related);
        let mut select = self.root_projection(self.base_select(&joins));
        for hop in &related {
            let table = session.registry().get(&hop.table)?;
            for column in table.columns() {
                select = select.column_as(
                    Expr::qualified(hop.alias.as_str(), column.name.as_str()),
                    format!("{}__{}", hop.alias, column.name),
                );
            }
        }
        let mut select = self.paged(select, reverse);
        if let Some(limit) = limit {
            select = select.limit(limit);
        }
        if self.for_update {
            select = select.for_update();
        }
        let (sql, params) = select.build_with_dialect(session.conn().dialect());
        let rows = session.query(&sql, &params)?;

        let mut seen = HashSet::new();
        let mut result = Vec::with_capacity(rows.len());
        for row in &rows {
            let Some(root) = session.wrap(&self.table, row, None)? else {
                continue;
            };
            self.attach_related(&session, &related, row, &root)?;
            if self.for_update {
                scope.cache.watch(&root);
            }
            if seen.insert(Rc::as_ptr(&root)) {
                result.push(root);
            }
        }

        for path in &self.prefetch_related {
            prefetch(&session, &self.table, &result, path)?;
        }
        Ok(result)
    }

    /// Wrap every joined hop of `row` and link it to its parent.
    fn attach_related(
        &self,
        session: &SessionInner,
        hops: &[JoinHop],
        row: &Row,
        root: &RowRef,
    ) -> Result<()> {
        let mut by_alias: HashMap<&str, RowRef> = HashMap::new();
        for hop in hops {
            let parent = if hop.parent_alias == self.table.name() {
                Some(Rc::clone(root))
            } else {
                by_alias.get(hop.parent_alias.as_str()).cloned()
            };
            let Some(parent) = parent else { continue };
            let table = session.registry().get(&hop.table)?;
            // a NULL optional hop has no row
            let Some(target) = session.wrap(&table, row, Some(&hop.alias))? else {
                continue;
            };
            link(&parent, &hop.parent_column, &target);
            by_alias.insert(hop.alias.as_str(), target);
        }
        Ok(())
    }

    fn handles(&self, rows: Vec<RowRef>) -> Result<Vec<EntityHandle>> {
        let session = self.session()?;
        Ok(rows.into_iter().map(|row| session.handle(row)).collect())
    }

    fn materialize(&self) -> Result<Vec<EntityHandle>> {
        if let Some(cached) = self.cache.borrow().as_ref() {
            return Ok(cached.clone());
        }
        let rows = self.load_rows(false, None)?;
        let handles = self.handles(rows)?;
        *self.cache.borrow_mut() = Some(handles.clone());
        Ok(handles)
    }

    /// Every matching entity. The first call runs the query; later calls
    /// reuse the cached list.
    pub fn all(&self) -> Result<Vec<E>> {
        Ok(self
            .materialize()?
            .into_iter()
            .map(E::from_handle)
            .collect())
    }

    /// Iterate over the cached results, running the query if needed.
    pub fn iter(&self) -> Result<std::vec::IntoIter<E>> {
        Ok(self.all()?.into_iter())
    }

    fn single(&self) -> Result<Option<E>> {
        let rows = self.load_rows(false, None)?;
        match rows.len() {
            0 | 1 => Ok(self.handles(rows)?.into_iter().next().map(E::from_handle)),
            count => Err(Error::Orm(OrmError::AmbiguousGet {
                table: self.table.name().to_string(),
                count,
            })),
        }
    }

    /// The single entity matching the condition, if any.
    pub fn get(&self, f: impl FnOnce(&JoinContext) -> Condition) -> Result<Option<E>> {
        self.filter(f).single()
    }

    /// The entity with identity `id`. A cached row is returned without a
    /// query.
    pub fn get_by_id(&self, id: impl Into<EntityId>) -> Result<Option<E>> {
        let id = id.into();
        let session = self.session()?;
        let cached = session
            .current_scope()
            .and_then(|scope| scope.cache.get(self.table.name(), &id));
        let persisted = cached.as_ref().is_some_and(|row| row.borrow().is_persisted());
        if let (Some(row), true, None) = (cached, persisted, &self.predicate) {
            return Ok(Some(E::from_handle(session.handle(row))));
        }
        self.filter_ids([id]).single()
    }

    /// The first entity in query order; `EntityNotFound` when empty.
    pub fn first(&self) -> Result<E> {
        self.first_or_none()?.ok_or_else(|| self.not_found())
    }

    pub fn first_or_none(&self) -> Result<Option<E>> {
        let rows = self.load_rows(false, Some(1))?;
        Ok(self.handles(rows)?.into_iter().next().map(E::from_handle))
    }

    /// The last entity in query order, by identity when unordered.
    pub fn last(&self) -> Result<E> {
        let rows = self.load_rows(true, Some(1))?;
        self.handles(rows)?
            .into_iter()
            .next()
            .map(E::from_handle)
            .ok_or_else(|| self.not_found())
    }

    fn not_found(&self) -> Error {
        Error::Orm(OrmError::EntityNotFound {
            table: self.table.name().to_string(),
            id: None,
        })
    }

    /// `SELECT COUNT(*)` with the current joins and WHERE.
    pub fn count(&self) -> Result<u64> {
        self.check()?;
        let session = self.session()?;
        session.flush_before_query(&self.tables_read(&[]))?;
        let dialect = session.conn().dialect();
        let wrapped = self.limit.is_some()
            || self.offset.is_some()
            || self.distinct
            || !self.group_by.is_empty();
        let (sql, params) = if wrapped {
            let inner = if self.group_by.is_empty() {
                self.paged(self.root_projection(self.base_select(&self.joins)), false)
            } else {
                self.paged(
                    self.base_select(&self.joins)
                        .column(self.root_column(self.table.id_column())),
                    false,
                )
            };
            let (inner_sql, params) = inner.build_with_dialect(dialect);
            (
                format!(
                    "SELECT COUNT(*) FROM ({inner_sql}) AS {}",
                    dialect.quote_identifier("counted")
                ),
                params,
            )
        } else {
            self.base_select(&self.joins)
                .column(Expr::count_star())
                .build_with_dialect(dialect)
        };
        let rows = session.query(&sql, &params)?;
        let count = rows
            .first()
            .and_then(|r| r.get(0))
            .and_then(Value::as_i64)
            .unwrap_or(0);
        Ok(u64::try_from(count).unwrap_or(0))
    }

    pub fn exists(&self) -> Result<bool> {
        Ok(self.count()? > 0)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(!self.exists()?)
    }

    // ========================================================================
    // Bulk writes
    // ========================================================================

    fn scoped_ids(&self) -> Select {
        self.paged(
            self.base_select(&self.joins)
                .column(self.root_column(self.table.id_column())),
            false,
        )
    }

    fn table_wide(&self) -> bool {
        self.predicate.is_none()
            && self.joins.is_empty()
            && self.limit.is_none()
            && self.offset.is_none()
    }

    /// Delete every matching row and return the number deleted.
    ///
    /// Grouped queries are rejected before anything runs.
    pub fn delete(&self) -> Result<u64> {
        if !self.group_by.is_empty() || self.having.is_some() {
            return Err(Error::Orm(OrmError::UnsupportedDeleteShape {
                table: self.table.name().to_string(),
            }));
        }
        self.check()?;
        let session = self.session()?;
        let scope = session.scope()?;
        session.flush(None)?;
        let dialect = session.conn().dialect();

        let (sql, params) = self.scoped_ids().build_with_dialect(dialect);
        let ids: Vec<EntityId> = session
            .query(&sql, &params)?
            .iter()
            .filter_map(|row| row.get(0).and_then(EntityId::from_value))
            .collect();
        if ids.is_empty() {
            return Ok(0);
        }

        let mut delete = DeleteBuilder::from(self.table.name());
        if !self.table_wide() {
            delete = delete.filter(Expr::col(self.table.id_column()).in_select(self.scoped_ids()));
        }
        let (sql, params) = delete.build_with_dialect(dialect);
        let affected = session.execute(&sql, &params)?;

        scope.cache.remove(self.table.name(), &ids);
        for id in ids {
            scope.emit(self.table.name(), id, ChangeKind::Removed);
        }
        *self.cache.borrow_mut() = None;
        tracing::debug!(table = %self.table.name(), rows = affected, "Bulk delete");
        Ok(affected)
    }

    /// Bulk `UPDATE` of the matching rows. Cached rows of the table are
    /// marked stale so the next read fetches the new values.
    pub fn update(&self, f: impl FnOnce(&mut Assignments)) -> Result<u64> {
        self.check()?;
        let mut assignments = Assignments::new(Arc::clone(&self.table));
        f(&mut assignments);
        if let Some(e) = assignments.error {
            return Err(Error::Orm(e));
        }
        let session = self.session()?;
        let scope = session.scope()?;
        session.flush(None)?;

        let mut update = UpdateBuilder::table(self.table.name());
        for (column, expr) in assignments.sets {
            update = update.set(column, expr);
        }
        if !self.table_wide() {
            let filter = if self.joins.is_empty()
                && self.limit.is_none()
                && self.offset.is_none()
            {
                self.predicate.clone()
            } else {
                Some(Expr::col(self.table.id_column()).in_select(self.scoped_ids()))
            };
            if let Some(filter) = filter {
                update = update.filter(filter);
            }
        }
        let Some((sql, params)) = update.build_with_dialect(session.conn().dialect()) else {
            return Ok(0);
        };
        let affected = session.execute(&sql, &params)?;
        scope.cache.expire_table(self.table.name(), &session.weak());
        *self.cache.borrow_mut() = None;
        tracing::debug!(table = %self.table.name(), rows = affected, "Bulk update");
        Ok(affected)
    }

    /// Load the matching rows for update and apply `f` to each.
    ///
    /// Writes made by `f` need no explicit save: the rows are re-marked at
    /// every flush and written in batches grouped by column set.
    pub fn for_update_each(&self, mut f: impl FnMut(&E) -> Result<()>) -> Result<usize> {
        let mut locked = self.clone();
        locked.for_update = true;
        let rows = locked.load_rows(false, None)?;
        let count = rows.len();
        for handle in self.handles(rows)? {
            f(&E::from_handle(handle))?;
        }
        Ok(count)
    }
}

/// Point `parent.column` at `target` unless the column has an unsaved write.
fn link(parent: &RowRef, column: &str, target: &RowRef) {
    let mut parent = parent.borrow_mut();
    if !parent.has_write(column) {
        parent.cache_ref(column, target);
    }
}

/// Load relation `path` for `rows` with one query per hop.
fn prefetch(session: &SessionInner, table: &Arc<TableDef>, rows: &[RowRef], path: &str) -> Result<()> {
    if rows.is_empty() {
        return Ok(());
    }
    let (head, rest) = match path.split_once('.') {
        Some((head, rest)) => (head, Some(rest)),
        None => (path, None),
    };
    let relation = table.require_relation(head)?.clone();
    let target = session.registry().get(&relation.target)?;
    let query: EntityQuery<EntityHandle> = EntityQuery::new(session.weak(), Arc::clone(&target));

    if relation.kind.is_forward() {
        let mut wanted: Vec<EntityId> = Vec::new();
        let mut missing: Vec<EntityId> = Vec::new();
        let scope = session.scope()?;
        for row in rows {
            MutableRow::resolve(row)?;
            let value = row.borrow().get_value(&relation.column);
            let Some(id) = EntityId::from_value(&value) else {
                continue;
            };
            if wanted.contains(&id) {
                continue;
            }
            let loaded = scope
                .cache
                .get(target.name(), &id)
                .is_some_and(|r| r.borrow().is_loaded());
            if !loaded {
                missing.push(id.clone());
            }
            wanted.push(id);
        }
        if !missing.is_empty() {
            tracing::debug!(
                table = %target.name(),
                relation = %relation.name,
                rows = missing.len(),
                "Prefetching related rows"
            );
            query.filter_ids(missing).load_rows(false, None)?;
        }

        let mut targets = Vec::with_capacity(wanted.len());
        for id in wanted {
            targets.push(session.lazy_wrap(&target, id)?);
        }
        for row in rows {
            let value = row.borrow().get_value(&relation.column);
            let Some(id) = EntityId::from_value(&value) else {
                continue;
            };
            if let Some(found) = targets.iter().find(|t| t.borrow().id() == Some(&id)) {
                link(row, &relation.column, found);
            }
        }
        if let Some(rest) = rest {
            prefetch(session, &target, &targets, rest)?;
        }
        return Ok(());
    }

    // one-to-many and reverse one-to-one share the per-row result cache
    let parent_ids: Vec<Value> = rows
        .iter()
        .filter_map(|row| row.borrow().id().map(EntityId::to_value))
        .collect();
    tracing::debug!(
        table = %target.name(),
        relation = %relation.name,
        parents = parent_ids.len(),
        "Prefetching reverse rows"
    );
    let children = query
        .filter_expr(
            Expr::qualified(target.name(), relation.column.as_str()).in_list(parent_ids),
        )
        .load_rows(false, None)?;

    let mut grouped: HashMap<EntityId, Vec<EntityHandle>> = HashMap::new();
    for child in &children {
        let value = child.borrow().get_value(&relation.column);
        if let Some(parent_id) = EntityId::from_value(&value) {
            grouped
                .entry(parent_id)
                .or_default()
                .push(session.handle(Rc::clone(child)));
        }
    }
    for row in rows {
        let Some(id) = row.borrow().id().cloned() else {
            continue;
        };
        let cache = row.borrow_mut().related_set(&relation.name);
        *cache.borrow_mut() = Some(grouped.remove(&id).unwrap_or_default());
    }
    if let Some(rest) = rest {
        prefetch(session, &target, &children, rest)?;
    }
    Ok(())
}
