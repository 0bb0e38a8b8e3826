//! Per-entity row storage.
//!
//! A [`MutableRow`] holds three layers of column state:
//!
//! - **read values**: what the database last returned (or nothing yet, see
//!   [`RowState`])
//! - **pending writes**: `set` calls not yet handed to the flush scheduler
//! - **saved values**: the write set computed by `mark_for_save`, waiting for
//!   the next flush
//!
//! Visible values are resolved in that priority order (writes, then saved,
//! then reference cache, then read values). Entity references are kept as
//! [`FieldValue::Entity`] until flush converts them to identities; afterwards
//! the row keeps only a `Weak` link in its reference cache.

use crate::entity::EntityHandle;
use crate::session::{SessionInner, session_closed};
use crate::table::TableDef;
use sqldao_core::{EntityId, Error, OrmError, Result, Row, Value};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};
use std::sync::Arc;

/// Shared, interior-mutable row. The transaction cache owns the strong map.
pub type RowRef = Rc<RefCell<MutableRow>>;

/// Materialized result list shared between a query and the row caching it.
pub(crate) type ResultCache = Rc<RefCell<Option<Vec<EntityHandle>>>>;

/// A value written to a column.
#[derive(Clone)]
pub enum FieldValue {
    Value(Value),
    /// A reference to another row, persisted as that row's identity.
    Entity(RowRef),
}

impl std::fmt::Debug for FieldValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldValue::Value(v) => f.debug_tuple("Value").field(v).finish(),
            FieldValue::Entity(row) => match row.try_borrow() {
                Ok(r) => write!(f, "Entity({}#{:?})", r.table.name(), r.id),
                Err(_) => f.write_str("Entity(<borrowed>)"),
            },
        }
    }
}

impl From<Value> for FieldValue {
    fn from(value: Value) -> Self {
        FieldValue::Value(value)
    }
}

/// What the next flush does with a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlushAction {
    #[default]
    None,
    Insert,
    Update,
}

/// Fetch-by-identity for a row whose values have not been read yet.
#[derive(Clone)]
pub struct Loader {
    session: Weak<SessionInner>,
    id: EntityId,
}

impl std::fmt::Debug for Loader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Loader").field("id", &self.id).finish()
    }
}

impl Loader {
    pub(crate) fn new(session: Weak<SessionInner>, id: EntityId) -> Self {
        Self { session, id }
    }

    pub fn id(&self) -> &EntityId {
        &self.id
    }

    fn fetch(&self, table: &Arc<TableDef>) -> Result<HashMap<String, Value>> {
        let session = self.session.upgrade().ok_or_else(session_closed)?;
        let row = session.fetch_by_id(table, &self.id)?.ok_or_else(|| {
            Error::Orm(OrmError::EntityNotFound {
                table: table.name().to_string(),
                id: Some(self.id.clone()),
            })
        })?;
        Ok(values_from_row(table, &row, None))
    }
}

/// Whether the read values are materialized.
#[derive(Debug)]
pub enum RowState {
    Unloaded(Loader),
    Loaded(HashMap<String, Value>),
}

/// Column values of one persisted write, in table column order.
#[derive(Debug, Default)]
pub struct WriteSet {
    pub columns: Vec<String>,
    pub values: Vec<Value>,
    links: Vec<(String, Weak<RefCell<MutableRow>>)>,
}

impl WriteSet {
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

/// Extract a table's columns from a result row. Joined projections alias
/// related columns as `{prefix}__{column}`.
pub(crate) fn values_from_row(
    table: &TableDef,
    row: &Row,
    prefix: Option<&str>,
) -> HashMap<String, Value> {
    table
        .columns()
        .iter()
        .filter_map(|column| {
            let value = match prefix {
                Some(prefix) => row.get_by_name(&format!("{prefix}__{}", column.name)),
                None => row.get_by_name(&column.name),
            };
            value.map(|v| (column.name.clone(), v.clone()))
        })
        .collect()
}

/// One entity instance's database-backed state.
pub struct MutableRow {
    table: Arc<TableDef>,
    origin: u64,
    id: Option<EntityId>,
    persisted: bool,
    state: RowState,
    writes: HashMap<String, FieldValue>,
    saved: HashMap<String, FieldValue>,
    refs: HashMap<String, Weak<RefCell<MutableRow>>>,
    action: FlushAction,
    update_on_flush: bool,
    related_sets: HashMap<String, ResultCache>,
}

impl std::fmt::Debug for MutableRow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutableRow")
            .field("table", &self.table.name())
            .field("id", &self.id)
            .field("persisted", &self.persisted)
            .field("loaded", &self.is_loaded())
            .field("writes", &self.writes)
            .field("saved", &self.saved)
            .field("action", &self.action)
            .finish_non_exhaustive()
    }
}

impl MutableRow {
    /// A new, never persisted row.
    pub fn new(table: Arc<TableDef>, origin: u64) -> Self {
        Self {
            table,
            origin,
            id: None,
            persisted: false,
            state: RowState::Loaded(HashMap::new()),
            writes: HashMap::new(),
            saved: HashMap::new(),
            refs: HashMap::new(),
            action: FlushAction::None,
            update_on_flush: false,
            related_sets: HashMap::new(),
        }
    }

    /// A persisted row whose values are fetched on first access.
    pub(crate) fn shell(table: Arc<TableDef>, origin: u64, loader: Loader) -> Self {
        let mut row = Self::new(table, origin);
        row.id = Some(loader.id.clone());
        row.persisted = true;
        row.state = RowState::Unloaded(loader);
        row
    }

    /// A persisted row built from fetched values.
    pub(crate) fn loaded(
        table: Arc<TableDef>,
        origin: u64,
        id: EntityId,
        values: HashMap<String, Value>,
    ) -> Self {
        let mut row = Self::new(table, origin);
        row.id = Some(id);
        row.persisted = true;
        row.state = RowState::Loaded(values);
        row
    }

    pub fn into_ref(self) -> RowRef {
        Rc::new(RefCell::new(self))
    }

    /// Materialize the read values of `row` if it is still unloaded.
    ///
    /// The fetch runs without any borrow of the row held, so a flush
    /// triggered by the fetch can still touch it.
    pub fn resolve(row: &RowRef) -> Result<()> {
        let (loader, table) = {
            let r = row.borrow();
            match &r.state {
                RowState::Loaded(_) => return Ok(()),
                RowState::Unloaded(loader) => (loader.clone(), Arc::clone(&r.table)),
            }
        };
        let values = loader.fetch(&table)?;
        row.borrow_mut().load(values);
        if let Some(session) = loader.session.upgrade() {
            session.attach(row)?;
        }
        Ok(())
    }

    pub fn table(&self) -> &Arc<TableDef> {
        &self.table
    }

    pub(crate) fn origin(&self) -> u64 {
        self.origin
    }

    pub fn id(&self) -> Option<&EntityId> {
        self.id.as_ref()
    }

    pub fn is_persisted(&self) -> bool {
        self.persisted
    }

    pub fn is_loaded(&self) -> bool {
        matches!(self.state, RowState::Loaded(_))
    }

    pub fn action(&self) -> FlushAction {
        self.action
    }

    /// Pending or saved writes exist.
    pub fn is_dirty(&self) -> bool {
        !self.writes.is_empty() || !self.saved.is_empty()
    }

    pub(crate) fn has_pending_writes(&self) -> bool {
        !self.writes.is_empty()
    }

    /// A pending or saved write exists for `column`.
    pub(crate) fn has_write(&self, column: &str) -> bool {
        self.writes.contains_key(column) || self.saved.contains_key(column)
    }

    pub fn update_on_flush(&self) -> bool {
        self.update_on_flush
    }

    pub(crate) fn set_update_on_flush(&mut self, value: bool) {
        self.update_on_flush = value;
    }

    /// Assign the identity. A second, different identity is rejected.
    pub fn set_id(&mut self, id: EntityId) -> Result<()> {
        match &self.id {
            Some(current) if *current == id => Ok(()),
            Some(current) => Err(Error::Orm(OrmError::IdentityReassigned {
                table: self.table.name().to_string(),
                current: current.clone(),
                attempted: id,
            })),
            None => {
                self.id = Some(id);
                Ok(())
            }
        }
    }

    fn is_self(&self, other: &RowRef) -> bool {
        std::ptr::eq(other.as_ptr(), self)
    }

    /// Identity of a referenced row. A self reference reads our own id.
    fn linked_id(&self, other: &RowRef) -> Option<EntityId> {
        if self.is_self(other) {
            return self.id.clone();
        }
        other.try_borrow().ok().and_then(|r| r.id.clone())
    }

    fn field_to_value(&self, field: &FieldValue) -> Value {
        match field {
            FieldValue::Value(v) => v.clone(),
            FieldValue::Entity(other) => self
                .linked_id(other)
                .map_or(Value::Null, |id| id.to_value()),
        }
    }

    fn read_value(&self, column: &str) -> Option<&Value> {
        match &self.state {
            RowState::Loaded(values) => values.get(column),
            RowState::Unloaded(_) => None,
        }
    }

    fn cached_ref(&self, column: &str) -> Option<RowRef> {
        self.refs.get(column).and_then(Weak::upgrade)
    }

    /// The visible value of `column`. The row must be resolved first.
    pub fn get_value(&self, column: &str) -> Value {
        if column == self.table.id_column() {
            return self.id.as_ref().map_or(Value::Null, EntityId::to_value);
        }
        if let Some(field) = self.writes.get(column).or_else(|| self.saved.get(column)) {
            return self.field_to_value(field);
        }
        if let Some(linked) = self.cached_ref(column).and_then(|r| self.linked_id(&r)) {
            return linked.to_value();
        }
        self.read_value(column).cloned().unwrap_or(Value::Null)
    }

    /// The row currently linked through `column`, if it was set or resolved
    /// through an entity.
    pub fn linked_row(&self, column: &str) -> Option<RowRef> {
        match self.writes.get(column).or_else(|| self.saved.get(column)) {
            Some(FieldValue::Entity(other)) => Some(Rc::clone(other)),
            Some(FieldValue::Value(_)) => None,
            None => self.cached_ref(column),
        }
    }

    pub(crate) fn cache_ref(&mut self, column: &str, other: &RowRef) {
        self.refs.insert(column.to_string(), Rc::downgrade(other));
    }

    /// Whether `field` equals what the row shows without pending writes.
    fn matches_visible(&self, column: &str, field: &FieldValue) -> bool {
        let visible_ref = match self.saved.get(column) {
            Some(FieldValue::Entity(other)) => Some(Rc::clone(other)),
            Some(FieldValue::Value(_)) => None,
            None => self.cached_ref(column),
        };
        if let (FieldValue::Entity(new), Some(current)) = (field, &visible_ref) {
            if Rc::ptr_eq(new, current) {
                return true;
            }
        }
        let visible = match self.saved.get(column) {
            Some(saved) => self.field_to_value(saved),
            None => match visible_ref.as_ref().and_then(|r| self.linked_id(r)) {
                Some(id) => id.to_value(),
                None => self.read_value(column).cloned().unwrap_or(Value::Null),
            },
        };
        match field {
            FieldValue::Value(v) => v.same_as(&visible),
            // An entity without identity never equals a stored value
            FieldValue::Entity(other) => self
                .linked_id(other)
                .is_some_and(|id| id.to_value().same_as(&visible)),
        }
    }

    /// Record a write, or clear the pending write when the value matches
    /// what is already visible.
    pub fn set_value(&mut self, column: &str, field: FieldValue) {
        if self.matches_visible(column, &field) {
            self.writes.remove(column);
        } else {
            self.writes.insert(column.to_string(), field);
        }
    }

    fn not_null_error(&self, column: &str) -> Error {
        Error::Orm(OrmError::NotNull {
            table: self.table.name().to_string(),
            column: column.to_string(),
        })
    }

    /// Compute the flush action and move the write set into saved values.
    ///
    /// New rows become INSERTs carrying every pending write plus the
    /// declared defaults of untouched columns. Persisted rows become sparse
    /// UPDATEs of their pending writes, optionally limited to `columns`.
    /// Nothing is changed when the not-null check fails.
    pub fn mark_for_save(&mut self, columns: Option<&[String]>) -> Result<FlushAction> {
        let id_column = self.table.id_column().to_string();
        if self.persisted {
            let selected: Vec<String> = self
                .writes
                .keys()
                .filter(|c| columns.is_none_or(|only| only.iter().any(|o| o == *c)))
                .cloned()
                .collect();
            for column in &selected {
                let nullable = self.table.column_def(column).is_none_or(|c| c.nullable);
                let value = self.writes.get(column).map(|f| self.field_to_value(f));
                if !nullable && value.is_some_and(|v| v.is_null()) {
                    return Err(self.not_null_error(column));
                }
            }
            for column in selected {
                if let Some(field) = self.writes.remove(&column) {
                    self.saved.insert(column, field);
                }
            }
            if !self.saved.is_empty() {
                self.action = FlushAction::Update;
            }
            return Ok(self.action);
        }

        let mut next = self.saved.clone();
        next.extend(self.writes.iter().map(|(k, v)| (k.clone(), v.clone())));
        for column in self.table.columns() {
            if column.name == id_column || next.contains_key(&column.name) {
                continue;
            }
            if let Some(value) = self.read_value(&column.name) {
                next.insert(column.name.clone(), FieldValue::Value(value.clone()));
            } else if let Some(default) = column.client_default() {
                next.insert(column.name.clone(), FieldValue::Value(default.clone()));
            }
        }
        for column in self.table.columns() {
            if column.nullable || column.auto_increment || column.name == id_column {
                continue;
            }
            match next.get(&column.name) {
                None if column.has_default() => {}
                None => return Err(self.not_null_error(&column.name)),
                Some(FieldValue::Value(v)) if v.is_null() => {
                    return Err(self.not_null_error(&column.name));
                }
                Some(_) => {}
            }
        }
        next.remove(&id_column);
        if self.id.is_none() {
            self.id = self.table.id_kind().generate();
        }
        self.saved = next;
        self.writes.clear();
        self.action = FlushAction::Insert;
        Ok(self.action)
    }

    /// Saved entity-valued columns whose referenced row is not in the
    /// database yet. Pending writes are not part of the next INSERT.
    ///
    /// A self reference is reported with `None` while the row has no
    /// identity, since no single INSERT can supply it.
    pub fn unresolved_links(&self) -> Vec<(String, Option<RowRef>)> {
        self.saved
            .iter()
            .filter_map(|(column, field)| match field {
                FieldValue::Entity(other) if self.is_self(other) => {
                    self.id.is_none().then(|| (column.clone(), None))
                }
                FieldValue::Entity(other) => {
                    let persisted = other.try_borrow().map_or(true, |r| r.persisted);
                    (!persisted).then(|| (column.clone(), Some(Rc::clone(other))))
                }
                FieldValue::Value(_) => None,
            })
            .collect()
    }

    /// Resolve the saved values into bindable values, in column order.
    ///
    /// Includes the identity column when the row already has one.
    pub fn write_set(&self) -> WriteSet {
        let mut set = WriteSet::default();
        for column in self.table.columns() {
            if column.name == self.table.id_column() {
                if self.action == FlushAction::Insert {
                    if let Some(id) = &self.id {
                        set.columns.push(column.name.clone());
                        set.values.push(id.to_value());
                    }
                }
                continue;
            }
            let Some(field) = self.saved.get(&column.name) else {
                continue;
            };
            set.columns.push(column.name.clone());
            set.values.push(self.field_to_value(field));
            if let FieldValue::Entity(other) = field {
                set.links.push((column.name.clone(), Rc::downgrade(other)));
            }
        }
        set
    }

    /// Fold a flushed write set into the read values, rebuild the reference
    /// cache for entity-valued columns and clear the flush action.
    pub fn apply_persisted_values(&mut self, set: &WriteSet) {
        if let RowState::Loaded(values) = &mut self.state {
            for (column, value) in set.columns.iter().zip(&set.values) {
                values.insert(column.clone(), value.clone());
            }
        }
        for (column, link) in &set.links {
            self.refs.insert(column.clone(), link.clone());
        }
        self.saved.clear();
        self.action = FlushAction::None;
    }

    /// Record a completed INSERT.
    pub(crate) fn complete_insert(&mut self, generated: Option<&Value>, set: &WriteSet) -> Result<()> {
        if self.id.is_none() {
            let id = generated.and_then(EntityId::from_value).ok_or_else(|| {
                Error::Custom(format!(
                    "INSERT into {} returned no generated identity",
                    self.table.name()
                ))
            })?;
            self.id = Some(id);
        }
        self.apply_persisted_values(set);
        self.persisted = true;
        Ok(())
    }

    /// Replace the read values with freshly fetched ones.
    pub(crate) fn load(&mut self, values: HashMap<String, Value>) {
        self.state = RowState::Loaded(values);
        self.refs.clear();
        self.related_sets.clear();
    }

    /// Drop pending and saved writes.
    pub(crate) fn discard_changes(&mut self) {
        self.writes.clear();
        self.saved.clear();
        self.action = FlushAction::None;
    }

    pub(crate) fn discard_pending_writes(&mut self) {
        self.writes.clear();
    }

    /// Mark the read values stale so the next access fetches again.
    pub(crate) fn expire(&mut self, session: Weak<SessionInner>) {
        if let (true, Some(id)) = (self.persisted, self.id.clone()) {
            self.state = RowState::Unloaded(Loader::new(session, id));
            self.refs.clear();
            self.related_sets.clear();
        }
    }

    /// Detach from an ending transaction. Unflushed saved values go back to
    /// pending writes.
    pub(crate) fn detach(&mut self) {
        for (column, field) in std::mem::take(&mut self.saved) {
            self.writes.entry(column).or_insert(field);
        }
        self.action = FlushAction::None;
        self.update_on_flush = false;
        self.related_sets.clear();
    }

    /// Undo an INSERT that was rolled back: the row is new again and its
    /// written values become pending writes.
    ///
    /// Columns written through an entity link back to that row, since its
    /// identity may have been rolled back too.
    pub(crate) fn revert_insert(&mut self) {
        let id_column = self.table.id_column().to_string();
        let previous = std::mem::replace(&mut self.state, RowState::Loaded(HashMap::new()));
        if let RowState::Loaded(values) = previous {
            for (column, value) in values {
                if column == id_column {
                    continue;
                }
                let field = match self.cached_ref(&column) {
                    Some(linked) => FieldValue::Entity(linked),
                    None => FieldValue::Value(value),
                };
                self.writes.entry(column).or_insert(field);
            }
        }
        if self.table.id_kind().is_auto_increment() {
            self.id = None;
        }
        self.persisted = false;
        self.refs.clear();
    }

    /// The row was deleted from the database.
    pub(crate) fn mark_removed(&mut self) {
        self.persisted = false;
        self.discard_changes();
        self.related_sets.clear();
    }

    pub(crate) fn related_set(&mut self, relation: &str) -> ResultCache {
        Rc::clone(
            self.related_sets
                .entry(relation.to_string())
                .or_insert_with(|| Rc::new(RefCell::new(None))),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqldao_core::{ColumnDef, IdKind, SqlType};

    fn country() -> Arc<TableDef> {
        Arc::new(
            TableDef::new("country")
                .column(ColumnDef::new("name", SqlType::Text))
                .column(ColumnDef::new("status", SqlType::Text).default_value("active"))
                .column(ColumnDef::new("note", SqlType::Text).nullable(true)),
        )
    }

    fn region() -> Arc<TableDef> {
        Arc::new(
            TableDef::new("region")
                .column(ColumnDef::new("name", SqlType::Text))
                .column(ColumnDef::new("country_id", SqlType::BigInt).references("country", "id"))
                .many_to_one("country", "country_id", "country"),
        )
    }

    fn persisted_country(name: &str) -> MutableRow {
        let mut values = HashMap::new();
        values.insert("id".to_string(), Value::Int(1));
        values.insert("name".to_string(), Value::from(name));
        values.insert("status".to_string(), Value::from("active"));
        MutableRow::loaded(country(), 1, EntityId::Int(1), values)
    }

    #[test]
    fn test_insert_write_set_includes_defaults() {
        let mut row = MutableRow::new(country(), 1);
        row.set_value("name", FieldValue::Value(Value::from("Peru")));
        assert_eq!(row.mark_for_save(None).unwrap(), FlushAction::Insert);
        let set = row.write_set();
        assert_eq!(set.columns, vec!["name", "status"]);
        assert_eq!(set.values, vec![Value::from("Peru"), Value::from("active")]);
        assert!(!row.has_pending_writes());
    }

    #[test]
    fn test_not_null_names_column_and_keeps_state() {
        let mut row = MutableRow::new(country(), 1);
        row.set_value("note", FieldValue::Value(Value::from("x")));
        let err = row.mark_for_save(None).unwrap_err();
        assert_eq!(err.to_string(), "country.name column not allow nulls");
        assert_eq!(row.action(), FlushAction::None);
        assert!(row.has_pending_writes());
    }

    #[test]
    fn test_explicit_null_on_required_column_fails() {
        let mut row = MutableRow::new(country(), 1);
        row.set_value("name", FieldValue::Value(Value::Null));
        assert!(row.mark_for_save(None).is_err());
    }

    #[test]
    fn test_same_value_write_is_elided() {
        let mut row = persisted_country("Peru");
        row.set_value("name", FieldValue::Value(Value::from("Peru")));
        assert!(!row.is_dirty());
        assert_eq!(row.mark_for_save(None).unwrap(), FlushAction::None);

        row.set_value("name", FieldValue::Value(Value::from("Chile")));
        assert!(row.is_dirty());
        row.set_value("name", FieldValue::Value(Value::from("Peru")));
        assert!(!row.is_dirty());
    }

    #[test]
    fn test_update_is_sparse_and_restrictable() {
        let mut row = persisted_country("Peru");
        row.set_value("name", FieldValue::Value(Value::from("Chile")));
        row.set_value("note", FieldValue::Value(Value::from("n")));
        let only = vec!["note".to_string()];
        assert_eq!(row.mark_for_save(Some(&only)).unwrap(), FlushAction::Update);
        let set = row.write_set();
        assert_eq!(set.columns, vec!["note"]);
        assert_eq!(row.get_value("name"), Value::from("Chile"));
        assert!(row.has_pending_writes());
    }

    #[test]
    fn test_update_rejects_null_on_required_column() {
        let mut row = persisted_country("Peru");
        row.set_value("name", FieldValue::Value(Value::Null));
        let err = row.mark_for_save(None).unwrap_err();
        assert!(matches!(err.as_orm(), Some(OrmError::NotNull { .. })));
    }

    #[test]
    fn test_identity_cannot_be_reassigned() {
        let mut row = MutableRow::new(country(), 1);
        row.set_id(EntityId::Int(5)).unwrap();
        row.set_id(EntityId::Int(5)).unwrap();
        let err = row.set_id(EntityId::Int(6)).unwrap_err();
        assert!(matches!(
            err.as_orm(),
            Some(OrmError::IdentityReassigned { current: EntityId::Int(5), .. })
        ));
    }

    #[test]
    fn test_explicit_identity_is_written_on_insert() {
        let mut row = MutableRow::new(country(), 1);
        row.set_id(EntityId::Int(42)).unwrap();
        row.set_value("name", FieldValue::Value(Value::from("Peru")));
        row.mark_for_save(None).unwrap();
        let set = row.write_set();
        assert_eq!(set.columns[0], "id");
        assert_eq!(set.values[0], Value::BigInt(42));
    }

    #[test]
    fn test_uuid_identity_generated_at_save() {
        let table = Arc::new(
            TableDef::new("token")
                .id("id", IdKind::Uuid)
                .column(ColumnDef::new("label", SqlType::Text).nullable(true)),
        );
        let mut row = MutableRow::new(table, 1);
        assert!(row.id().is_none());
        row.mark_for_save(None).unwrap();
        assert!(matches!(row.id(), Some(EntityId::Uuid(_))));
    }

    #[test]
    fn test_entity_reference_resolves_after_insert() {
        let parent = MutableRow::new(country(), 1).into_ref();
        let mut child = MutableRow::new(region(), 1);
        child.set_value("name", FieldValue::Value(Value::from("Lima")));
        child.set_value("country_id", FieldValue::Entity(Rc::clone(&parent)));
        child.mark_for_save(None).unwrap();
        assert_eq!(child.unresolved_links().len(), 1);
        assert_eq!(child.get_value("country_id"), Value::Null);

        {
            let mut p = parent.borrow_mut();
            p.set_value("name", FieldValue::Value(Value::from("Peru")));
            p.mark_for_save(None).unwrap();
            let set = p.write_set();
            p.complete_insert(Some(&Value::BigInt(1)), &set).unwrap();
        }
        assert!(child.unresolved_links().is_empty());
        let set = child.write_set();
        assert_eq!(set.values, vec![Value::from("Lima"), Value::BigInt(1)]);
        child.complete_insert(Some(&Value::BigInt(9)), &set).unwrap();
        assert!(Rc::ptr_eq(&child.linked_row("country_id").unwrap(), &parent));
        assert_eq!(child.get_value("country_id"), Value::BigInt(1));
        assert_eq!(child.get_value("id"), Value::BigInt(9));
    }

    #[test]
    fn test_pending_write_is_not_an_unresolved_link() {
        let saved_parent = MutableRow::new(country(), 1).into_ref();
        let later_parent = MutableRow::new(country(), 1).into_ref();
        let mut child = MutableRow::new(region(), 1);
        child.set_value("name", FieldValue::Value(Value::from("Lima")));
        child.set_value("country_id", FieldValue::Entity(Rc::clone(&saved_parent)));
        child.mark_for_save(None).unwrap();
        child.set_value("country_id", FieldValue::Entity(Rc::clone(&later_parent)));

        let links = child.unresolved_links();
        assert_eq!(links.len(), 1);
        assert!(Rc::ptr_eq(links[0].1.as_ref().unwrap(), &saved_parent));
    }

    #[test]
    fn test_revert_insert_restores_pending_writes() {
        let mut row = MutableRow::new(country(), 1);
        row.set_value("name", FieldValue::Value(Value::from("Peru")));
        row.mark_for_save(None).unwrap();
        let set = row.write_set();
        row.complete_insert(Some(&Value::Int(3)), &set).unwrap();
        assert!(row.is_persisted());

        row.revert_insert();
        assert!(!row.is_persisted());
        assert!(row.id().is_none());
        assert_eq!(row.get_value("name"), Value::from("Peru"));
    }

    #[test]
    fn test_revert_insert_relinks_entity_columns() {
        let parent = MutableRow::new(country(), 1).into_ref();
        parent.borrow_mut().set_value("name", FieldValue::Value(Value::from("Peru")));
        parent.borrow_mut().mark_for_save(None).unwrap();
        let set = parent.borrow().write_set();
        parent.borrow_mut().complete_insert(Some(&Value::BigInt(2)), &set).unwrap();

        let mut child = MutableRow::new(region(), 1);
        child.set_value("name", FieldValue::Value(Value::from("Lima")));
        child.set_value("country_id", FieldValue::Entity(Rc::clone(&parent)));
        child.mark_for_save(None).unwrap();
        let set = child.write_set();
        child.complete_insert(Some(&Value::BigInt(5)), &set).unwrap();

        parent.borrow_mut().revert_insert();
        child.revert_insert();
        assert!(Rc::ptr_eq(&child.linked_row("country_id").unwrap(), &parent));
        assert_eq!(child.get_value("country_id"), Value::Null);

        parent.borrow_mut().set_id(EntityId::Int(3)).unwrap();
        assert_eq!(child.get_value("country_id"), Value::BigInt(3));
    }
}
