//! Transaction-scoped identity map and flush scheduler.
//!
//! One [`TransactionCache`] exists per open transaction. It keeps a
//! [`TableCache`] per table in first-touch order; each holds the identity
//! map, the ordered pending-insert list and the rows scheduled for UPDATE.
//!
//! Flushing writes INSERTs before UPDATEs:
//! - pending inserts are partitioned into ready rows and rows that still
//!   reference an uninserted row; ready rows are batch-inserted per table and
//!   column set, and the loop repeats until nothing is pending
//! - a pass that inserts nothing fails with `SelfReferencingDeadlock`
//! - updates are grouped by their exact set of written columns and run as
//!   one batched statement per group

use crate::events::{ChangeEvent, ChangeKind, EventBuffer};
use crate::row::{FlushAction, RowRef, WriteSet};
use crate::session::SessionInner;
use crate::table::TableDef;
use sqldao_core::{Connection, EntityId, Error, OrmError, Result, Value};
use sqldao_query::{InsertStatement, RowUpdateStatement};
use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap};
use std::rc::{Rc, Weak};
use std::sync::Arc;

fn push_unique(list: &RefCell<Vec<RowRef>>, row: &RowRef) {
    let mut list = list.borrow_mut();
    if !list.iter().any(|r| Rc::ptr_eq(r, row)) {
        list.push(Rc::clone(row));
    }
}

fn remove_from(list: &RefCell<Vec<RowRef>>, row: &RowRef) {
    list.borrow_mut().retain(|r| !Rc::ptr_eq(r, row));
}

/// Cached rows of one table.
pub struct TableCache {
    table: Arc<TableDef>,
    rows: RefCell<HashMap<EntityId, RowRef>>,
    pending: RefCell<Vec<RowRef>>,
    dirty: RefCell<Vec<RowRef>>,
    watched: RefCell<Vec<RowRef>>,
}

impl TableCache {
    fn new(table: Arc<TableDef>) -> Self {
        Self {
            table,
            rows: RefCell::new(HashMap::new()),
            pending: RefCell::new(Vec::new()),
            dirty: RefCell::new(Vec::new()),
            watched: RefCell::new(Vec::new()),
        }
    }

    pub fn table(&self) -> &Arc<TableDef> {
        &self.table
    }

    pub fn get(&self, id: &EntityId) -> Option<RowRef> {
        self.rows.borrow().get(id).cloned()
    }

    /// Store a row under its identity. A different row object at the same
    /// identity is an `IdentityCollision`.
    pub fn store(&self, row: &RowRef) -> Result<()> {
        let id = row.borrow().id().cloned().ok_or_else(|| {
            Error::Custom(format!(
                "cannot cache a row of {} without identity",
                self.table.name()
            ))
        })?;
        let mut rows = self.rows.borrow_mut();
        match rows.get(&id) {
            Some(existing) if Rc::ptr_eq(existing, row) => Ok(()),
            Some(_) => Err(Error::Orm(OrmError::IdentityCollision {
                table: self.table.name().to_string(),
                id,
            })),
            None => {
                rows.insert(id, Rc::clone(row));
                Ok(())
            }
        }
    }

    /// Store the row unless its identity is already taken.
    fn attach(&self, row: &RowRef) {
        let Some(id) = row.borrow().id().cloned() else {
            return;
        };
        self.rows.borrow_mut().entry(id).or_insert_with(|| Rc::clone(row));
    }

    pub fn evict(&self, id: &EntityId) -> Option<RowRef> {
        let row = self.rows.borrow_mut().remove(id)?;
        remove_from(&self.dirty, &row);
        remove_from(&self.watched, &row);
        Some(row)
    }

    pub fn len(&self) -> usize {
        self.rows.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.borrow().is_empty()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.borrow().len()
    }

    /// Every cached row, in no particular order.
    pub fn rows(&self) -> Vec<RowRef> {
        self.rows.borrow().values().cloned().collect()
    }
}

/// Connection and event sink used while flushing.
pub(crate) struct FlushContext<'a> {
    pub conn: &'a dyn Connection,
    pub events: &'a EventBuffer,
    pub transaction_id: u64,
}

impl FlushContext<'_> {
    fn emit(&self, table: &TableDef, id: EntityId, kind: ChangeKind) {
        self.events.push(ChangeEvent {
            table: table.name().to_string(),
            id,
            kind,
            transaction_id: self.transaction_id,
        });
    }
}

/// Row counts written by one flush.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushStats {
    pub inserted: usize,
    pub updated: usize,
}

/// The per-transaction entity cache.
#[derive(Default)]
pub struct TransactionCache {
    tables: RefCell<Vec<Rc<TableCache>>>,
    inserted: RefCell<Vec<RowRef>>,
}

impl TransactionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// The table cache for `table`, created on first touch.
    pub fn table(&self, table: &Arc<TableDef>) -> Rc<TableCache> {
        if let Some(found) = self.find(table.name()) {
            return found;
        }
        let created = Rc::new(TableCache::new(Arc::clone(table)));
        self.tables.borrow_mut().push(Rc::clone(&created));
        created
    }

    pub fn find(&self, name: &str) -> Option<Rc<TableCache>> {
        self.tables
            .borrow()
            .iter()
            .find(|t| t.table.name() == name)
            .cloned()
    }

    /// Table caches in first-touch order.
    pub fn tables(&self) -> Vec<Rc<TableCache>> {
        self.tables.borrow().clone()
    }

    pub fn get(&self, table: &str, id: &EntityId) -> Option<RowRef> {
        self.find(table).and_then(|t| t.get(id))
    }

    pub fn store(&self, row: &RowRef) -> Result<()> {
        let table = Arc::clone(row.borrow().table());
        self.table(&table).store(row)
    }

    pub(crate) fn attach(&self, row: &RowRef) {
        let table = Arc::clone(row.borrow().table());
        self.table(&table).attach(row);
    }

    /// Run `mark_for_save` and queue the row for the next flush.
    ///
    /// New rows referenced through entity-valued columns that were never
    /// saved are scheduled as well, so the insert loop can reach them.
    pub fn schedule_save(&self, row: &RowRef, columns: Option<&[String]>) -> Result<FlushAction> {
        let action = row.borrow_mut().mark_for_save(columns)?;
        let table = Arc::clone(row.borrow().table());
        let cache = self.table(&table);
        match action {
            FlushAction::Insert => push_unique(&cache.pending, row),
            FlushAction::Update => {
                cache.store(row)?;
                push_unique(&cache.dirty, row);
            }
            FlushAction::None => {}
        }
        let unsaved: Vec<RowRef> = row
            .borrow()
            .unresolved_links()
            .into_iter()
            .filter_map(|(_, linked)| linked)
            .filter(|linked| linked.borrow().action() == FlushAction::None)
            .collect();
        for linked in unsaved {
            tracing::debug!(
                table = %linked.borrow().table().name(),
                "Scheduling referenced new row for insert"
            );
            self.schedule_save(&linked, None)?;
        }
        Ok(action)
    }

    /// Forget any queued write for `row`.
    pub fn unschedule(&self, row: &RowRef) {
        let table = Arc::clone(row.borrow().table());
        if let Some(cache) = self.find(table.name()) {
            remove_from(&cache.pending, row);
            remove_from(&cache.dirty, row);
        }
    }

    /// Re-mark `row` with its pending writes at every flush.
    pub(crate) fn watch(&self, row: &RowRef) {
        row.borrow_mut().set_update_on_flush(true);
        let table = Arc::clone(row.borrow().table());
        push_unique(&self.table(&table).watched, row);
    }

    /// Widen `scope` to every table holding a pending row that the scoped
    /// rows reference.
    fn widen(&self, mut scope: BTreeSet<String>) -> BTreeSet<String> {
        loop {
            let mut added = false;
            for cache in self.tables() {
                if !scope.contains(cache.table.name()) {
                    continue;
                }
                let rows: Vec<RowRef> = cache
                    .pending
                    .borrow()
                    .iter()
                    .chain(cache.dirty.borrow().iter())
                    .cloned()
                    .collect();
                for row in rows {
                    for (_, linked) in row.borrow().unresolved_links() {
                        let Some(linked) = linked else { continue };
                        let name = linked.borrow().table().name().to_string();
                        added |= scope.insert(name);
                    }
                }
            }
            if !added {
                return scope;
            }
        }
    }

    /// Flush pending inserts, then updates, for `tables` (all when `None`).
    ///
    /// Re-entrancy is guarded by the caller.
    #[tracing::instrument(level = "debug", skip(self, ctx), fields(transaction = ctx.transaction_id))]
    pub(crate) fn flush(&self, ctx: &FlushContext<'_>, tables: Option<&[String]>) -> Result<FlushStats> {
        let requested: BTreeSet<String> = match tables {
            Some(names) => names.iter().cloned().collect(),
            None => self
                .tables()
                .iter()
                .map(|t| t.table.name().to_string())
                .collect(),
        };
        let scope = self.widen(requested);
        let inserted = self.flush_inserts(ctx, &scope)?;
        let updated = self.flush_updates(ctx, &scope)?;
        let stats = FlushStats { inserted, updated };
        if inserted + updated > 0 {
            tracing::info!(inserted, updated, "Flushed transaction cache");
        }
        Ok(stats)
    }

    fn flush_inserts(&self, ctx: &FlushContext<'_>, scope: &BTreeSet<String>) -> Result<usize> {
        let mut total = 0;
        loop {
            let mut ready: Vec<(Rc<TableCache>, Vec<RowRef>)> = Vec::new();
            let mut blocked: Vec<(String, String)> = Vec::new();
            for cache in self.tables() {
                if !scope.contains(cache.table.name()) {
                    continue;
                }
                let mut table_ready = Vec::new();
                for row in cache.pending.borrow().iter() {
                    let links = row.borrow().unresolved_links();
                    if links.is_empty() {
                        table_ready.push(Rc::clone(row));
                    } else {
                        for (column, _) in links {
                            blocked.push((cache.table.name().to_string(), column));
                        }
                    }
                }
                if !table_ready.is_empty() {
                    ready.push((cache, table_ready));
                }
            }

            if ready.is_empty() {
                if blocked.is_empty() {
                    return Ok(total);
                }
                let tables: BTreeSet<String> = blocked.iter().map(|(t, _)| t.clone()).collect();
                let columns: BTreeSet<String> = blocked
                    .iter()
                    .map(|(t, c)| format!("{t}.{c}"))
                    .collect();
                tracing::warn!(
                    tables = ?tables,
                    columns = ?columns,
                    rows = blocked.len(),
                    "Pending inserts reference each other; cannot order them"
                );
                return Err(Error::Orm(OrmError::SelfReferencingDeadlock {
                    tables: tables.into_iter().collect(),
                    columns: columns.into_iter().collect(),
                }));
            }

            for (cache, rows) in ready {
                for row in &rows {
                    remove_from(&cache.pending, row);
                }
                total += self.insert_rows(ctx, &cache, rows)?;
            }
        }
    }

    fn insert_rows(&self, ctx: &FlushContext<'_>, cache: &TableCache, rows: Vec<RowRef>) -> Result<usize> {
        let mut groups: Vec<(Vec<String>, Vec<(RowRef, WriteSet)>)> = Vec::new();
        for row in rows {
            let set = row.borrow().write_set();
            match groups.iter_mut().find(|(cols, _)| *cols == set.columns) {
                Some((_, members)) => members.push((row, set)),
                None => groups.push((set.columns.clone(), vec![(row, set)])),
            }
        }

        let dialect = ctx.conn.dialect();
        let mut count = 0;
        for (columns, members) in groups {
            let sql = InsertStatement::new(cache.table.name(), columns).build_with_dialect(dialect);
            let params: Vec<Vec<Value>> = members.iter().map(|(_, set)| set.values.clone()).collect();
            let generated = ctx.conn.insert_batch(&sql, &params)?;
            tracing::debug!(table = %cache.table.name(), rows = members.len(), sql = %sql, "Batch insert");
            for (index, (row, set)) in members.into_iter().enumerate() {
                let generated = generated.get(index).and_then(Option::as_ref);
                row.borrow_mut().complete_insert(generated, &set)?;
                cache.store(&row)?;
                self.inserted.borrow_mut().push(Rc::clone(&row));
                if let Some(id) = row.borrow().id().cloned() {
                    ctx.emit(&cache.table, id, ChangeKind::Created);
                }
                count += 1;
            }
        }
        Ok(count)
    }

    fn flush_updates(&self, ctx: &FlushContext<'_>, scope: &BTreeSet<String>) -> Result<usize> {
        let dialect = ctx.conn.dialect();
        let mut total = 0;
        for cache in self.tables() {
            if !scope.contains(cache.table.name()) {
                continue;
            }
            let watched = cache.watched.borrow().clone();
            for row in watched {
                if row.borrow().has_pending_writes() {
                    let action = row.borrow_mut().mark_for_save(None)?;
                    if action == FlushAction::Update {
                        push_unique(&cache.dirty, &row);
                    }
                }
            }

            let dirty = std::mem::take(&mut *cache.dirty.borrow_mut());
            let mut groups: Vec<(Vec<String>, Vec<(RowRef, WriteSet, EntityId)>)> = Vec::new();
            for row in dirty {
                let (action, id) = {
                    let r = row.borrow();
                    (r.action(), r.id().cloned())
                };
                let (FlushAction::Update, Some(id)) = (action, id) else {
                    continue;
                };
                let set = row.borrow().write_set();
                if set.is_empty() {
                    continue;
                }
                match groups.iter_mut().find(|(cols, _)| *cols == set.columns) {
                    Some((_, members)) => members.push((row, set, id)),
                    None => groups.push((set.columns.clone(), vec![(row, set, id)])),
                }
            }

            for (columns, members) in groups {
                let sql = RowUpdateStatement::new(cache.table.name(), columns, cache.table.id_column())
                    .build_with_dialect(dialect);
                let params: Vec<Vec<Value>> = members
                    .iter()
                    .map(|(_, set, id)| {
                        let mut values = set.values.clone();
                        values.push(id.to_value());
                        values
                    })
                    .collect();
                ctx.conn.execute_batch(&sql, &params)?;
                tracing::debug!(table = %cache.table.name(), rows = members.len(), sql = %sql, "Batch update");
                for (row, set, id) in members {
                    row.borrow_mut().apply_persisted_values(&set);
                    ctx.emit(&cache.table, id, ChangeKind::Updated);
                    total += 1;
                }
            }
        }
        Ok(total)
    }

    /// Remove rows of `table` from the cache and mark them deleted.
    pub(crate) fn remove(&self, table: &str, ids: &[EntityId]) -> Vec<RowRef> {
        let Some(cache) = self.find(table) else {
            return Vec::new();
        };
        ids.iter()
            .filter_map(|id| cache.evict(id))
            .inspect(|row| row.borrow_mut().mark_removed())
            .collect()
    }

    /// Mark every cached row of `table` stale.
    pub(crate) fn expire_table(&self, table: &str, session: &Weak<SessionInner>) {
        if let Some(cache) = self.find(table) {
            for row in cache.rows() {
                row.borrow_mut().expire(session.clone());
            }
        }
    }

    /// Detach every row at the end of the transaction.
    ///
    /// After a rollback rows inserted by the transaction become new again.
    /// Persisted rows are expired when `expire` is set or after a rollback.
    pub(crate) fn teardown(&self, session: &Weak<SessionInner>, expire: bool, rolled_back: bool) {
        if rolled_back {
            for row in self.inserted.borrow_mut().drain(..) {
                row.borrow_mut().revert_insert();
            }
        }
        for cache in self.tables.borrow_mut().drain(..) {
            for row in cache.pending.borrow_mut().drain(..) {
                row.borrow_mut().detach();
            }
            for (_, row) in cache.rows.borrow_mut().drain() {
                let mut r = row.borrow_mut();
                r.detach();
                if expire || rolled_back {
                    r.expire(session.clone());
                }
            }
        }
        self.inserted.borrow_mut().clear();
    }

    /// Number of rows waiting for INSERT across all tables.
    pub fn pending_inserts(&self) -> usize {
        self.tables().iter().map(|t| t.pending_len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row::{FieldValue, MutableRow};
    use crate::test_support::{MockConnection, MockState};
    use sqldao_core::{ColumnDef, IdKind, SqlType};
    use std::sync::Mutex;

    fn new_row(table: &Arc<TableDef>, origin: u64) -> RowRef {
        MutableRow::new(Arc::clone(table), origin).into_ref()
    }

    fn person() -> Arc<TableDef> {
        Arc::new(
            TableDef::new("person")
                .column(ColumnDef::new("name", SqlType::Text))
                .column(
                    ColumnDef::new("parent_id", SqlType::BigInt)
                        .nullable(true)
                        .references("person", "id"),
                )
                .many_to_optional("parent", "parent_id", "person"),
        )
    }

    fn named(table: &Arc<TableDef>, name: &str) -> RowRef {
        let row = new_row(table, 1);
        row.borrow_mut()
            .set_value("name", FieldValue::Value(Value::from(name)));
        row
    }

    fn flush(cache: &TransactionCache, conn: &MockConnection, events: &EventBuffer) -> Result<FlushStats> {
        let ctx = FlushContext {
            conn,
            events,
            transaction_id: 1,
        };
        cache.flush(&ctx, None)
    }

    #[test]
    fn test_store_detects_collision() {
        let cache = TransactionCache::new();
        let table = person();
        let first = MutableRow::loaded(Arc::clone(&table), 1, EntityId::Int(1), HashMap::new()).into_ref();
        let second = MutableRow::loaded(Arc::clone(&table), 1, EntityId::Int(1), HashMap::new()).into_ref();
        cache.store(&first).unwrap();
        cache.store(&first).unwrap();
        let err = cache.store(&second).unwrap_err();
        assert!(matches!(err.as_orm(), Some(OrmError::IdentityCollision { .. })));
        assert!(Rc::ptr_eq(&cache.get("person", &EntityId::Int(1)).unwrap(), &first));
    }

    #[test]
    fn test_self_reference_waits_for_parent() {
        let state = Arc::new(Mutex::new(MockState::default()));
        let conn = MockConnection::new(Arc::clone(&state));
        let events = EventBuffer::new();
        let cache = TransactionCache::new();
        let table = person();

        let child = named(&table, "child");
        let parent = named(&table, "parent");
        let other = named(&table, "other");
        child
            .borrow_mut()
            .set_value("parent_id", FieldValue::Entity(Rc::clone(&parent)));
        cache.schedule_save(&child, None).unwrap();
        cache.schedule_save(&parent, None).unwrap();
        cache.schedule_save(&other, None).unwrap();

        let stats = flush(&cache, &conn, &events).unwrap();
        assert_eq!(stats.inserted, 3);
        assert_eq!(cache.pending_inserts(), 0);

        let parent_id = parent.borrow().id().cloned().unwrap();
        assert_eq!(child.borrow().get_value("parent_id"), parent_id.to_value());
        assert_eq!(other.borrow().id(), Some(&EntityId::Int(2)));
        assert_eq!(child.borrow().id(), Some(&EntityId::Int(3)));

        let state = state.lock().unwrap();
        // parent and other share a column set; child adds parent_id
        assert_eq!(state.batches.len(), 2);
        assert_eq!(state.batches[0].1.len(), 2);
        assert_eq!(events.len(), 3);
    }

    #[test]
    fn test_cross_table_cycle_is_a_deadlock() {
        let state = Arc::new(Mutex::new(MockState::default()));
        let conn = MockConnection::new(state);
        let events = EventBuffer::new();
        let cache = TransactionCache::new();
        let table = person();

        let a = named(&table, "a");
        let b = named(&table, "b");
        a.borrow_mut()
            .set_value("parent_id", FieldValue::Entity(Rc::clone(&b)));
        b.borrow_mut()
            .set_value("parent_id", FieldValue::Entity(Rc::clone(&a)));
        cache.schedule_save(&a, None).unwrap();

        // b was scheduled through a's reference
        assert_eq!(cache.pending_inserts(), 2);
        let err = flush(&cache, &conn, &events).unwrap_err();
        match err.as_orm() {
            Some(OrmError::SelfReferencingDeadlock { tables, columns }) => {
                assert_eq!(tables, &vec!["person".to_string()]);
                assert_eq!(columns, &vec!["person.parent_id".to_string()]);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_updates_grouped_by_column_set() {
        let state = Arc::new(Mutex::new(MockState::default()));
        let conn = MockConnection::new(Arc::clone(&state));
        let events = EventBuffer::new();
        let cache = TransactionCache::new();
        let table = person();

        let rows: Vec<RowRef> = (1..=3)
            .map(|i| {
                let mut values = HashMap::new();
                values.insert("name".to_string(), Value::from(format!("p{i}")));
                MutableRow::loaded(Arc::clone(&table), 1, EntityId::Int(i), values).into_ref()
            })
            .collect();
        rows[0].borrow_mut().set_value("name", FieldValue::Value(Value::from("x")));
        rows[1].borrow_mut().set_value("name", FieldValue::Value(Value::from("y")));
        rows[2].borrow_mut().set_value("parent_id", FieldValue::Value(Value::BigInt(1)));
        for row in &rows {
            cache.schedule_save(row, None).unwrap();
        }

        let stats = flush(&cache, &conn, &events).unwrap();
        assert_eq!(stats.updated, 3);
        let state = state.lock().unwrap();
        assert_eq!(state.batches.len(), 2);
        assert_eq!(
            state.batches[0].0,
            "UPDATE \"person\" SET \"name\" = ?1 WHERE \"id\" = ?2"
        );
        assert_eq!(state.batches[0].1.len(), 2);
        assert_eq!(state.batches[0].1[1], vec![Value::from("y"), Value::BigInt(2)]);
        assert!(!rows[0].borrow().is_dirty());
        assert_eq!(events.snapshot()[2].kind, ChangeKind::Updated);
    }

    #[test]
    fn test_flush_scope_widens_to_referenced_tables() {
        let state = Arc::new(Mutex::new(MockState::default()));
        let conn = MockConnection::new(Arc::clone(&state));
        let events = EventBuffer::new();
        let cache = TransactionCache::new();
        let country = Arc::new(TableDef::new("country").column(ColumnDef::new("name", SqlType::Text)));
        let region = Arc::new(
            TableDef::new("region")
                .column(ColumnDef::new("country_id", SqlType::BigInt))
                .many_to_one("country", "country_id", "country"),
        );
        let tag = Arc::new(TableDef::new("tag").id("id", IdKind::Uuid));

        let peru = named(&country, "Peru");
        let lima = new_row(&region, 1);
        lima.borrow_mut()
            .set_value("country_id", FieldValue::Entity(Rc::clone(&peru)));
        let label = new_row(&tag, 1);
        cache.schedule_save(&lima, None).unwrap();
        cache.schedule_save(&label, None).unwrap();

        let ctx = FlushContext {
            conn: &conn,
            events: &events,
            transaction_id: 1,
        };
        let stats = cache.flush(&ctx, Some(&["region".to_string()])).unwrap();
        assert_eq!(stats.inserted, 2);
        assert_eq!(cache.find("tag").unwrap().pending_len(), 1);
        let state = state.lock().unwrap();
        assert!(state.batches[0].0.starts_with("INSERT INTO \"country\""));
        assert!(state.batches[1].0.starts_with("INSERT INTO \"region\""));
    }

    #[test]
    fn test_teardown_after_rollback_reverts_inserts() {
        let state = Arc::new(Mutex::new(MockState::default()));
        let conn = MockConnection::new(state);
        let events = EventBuffer::new();
        let cache = TransactionCache::new();
        let table = person();

        let row = named(&table, "a");
        cache.schedule_save(&row, None).unwrap();
        flush(&cache, &conn, &events).unwrap();
        assert!(row.borrow().is_persisted());

        cache.teardown(&Weak::new(), true, true);
        let r = row.borrow();
        assert!(!r.is_persisted());
        assert!(r.id().is_none());
        assert_eq!(r.get_value("name"), Value::from("a"));
        assert!(cache.tables().is_empty());
    }
}
