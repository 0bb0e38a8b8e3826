//! Entity handles and the typed model traits.
//!
//! [`EntityHandle`] is the untyped accessor over one cached row. Typed
//! entities wrap a handle and implement [`Model`], which supplies the table
//! descriptor and the factory used to build instances from handles:
//!
//! ```ignore
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
//! ```

use crate::events::ChangeKind;
use crate::query::EntityQuery;
use crate::row::{FieldValue, MutableRow, RowRef, values_from_row};
use crate::session::{SessionInner, session_closed};
use crate::table::{Relation, RelationKind, TableDef};
use sqldao_core::{EntityId, Error, OrmError, Result, TypeError, Value};
use sqldao_query::{DeleteBuilder, Expr};
use std::rc::{Rc, Weak};
use std::sync::Arc;

/// A type built around an [`EntityHandle`].
pub trait Entity: Sized {
    fn from_handle(handle: EntityHandle) -> Self;

    fn handle(&self) -> &EntityHandle;
}

/// A typed entity bound to one table.
pub trait Model: Entity {
    /// Name of the table, matching `table().name()`.
    const TABLE: &'static str;

    /// The table descriptor, registered on first use.
    fn table() -> TableDef;
}

/// Accessor for one entity row.
///
/// Clones share the row. Reads and writes go through the row's dirty
/// tracking; nothing is written until the row is saved and flushed.
#[derive(Clone)]
pub struct EntityHandle {
    row: RowRef,
    session: Weak<SessionInner>,
}

impl Entity for EntityHandle {
    fn from_handle(handle: EntityHandle) -> Self {
        handle
    }

    fn handle(&self) -> &EntityHandle {
        self
    }
}

impl std::fmt::Debug for EntityHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.row.try_borrow() {
            Ok(row) => f
                .debug_struct("EntityHandle")
                .field("table", &row.table().name())
                .field("id", &row.id())
                .field("persisted", &row.is_persisted())
                .finish(),
            Err(_) => f.write_str("EntityHandle(<borrowed>)"),
        }
    }
}

/// Handles are equal when they share the row object.
impl PartialEq for EntityHandle {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.row, &other.row)
    }
}

impl Eq for EntityHandle {}

impl EntityHandle {
    pub(crate) fn new(row: RowRef, session: Weak<SessionInner>) -> Self {
        Self { row, session }
    }

    fn session(&self) -> Result<Rc<SessionInner>> {
        self.session.upgrade().ok_or_else(session_closed)
    }

    pub fn table(&self) -> Arc<TableDef> {
        Arc::clone(self.row.borrow().table())
    }

    fn forward_relation(&self, table: &TableDef, name: &str) -> Result<Relation> {
        let relation = table.require_relation(name)?.clone();
        if relation.kind.is_forward() {
            Ok(relation)
        } else {
            Err(Error::Custom(format!(
                "{}.{} is a reverse relation; use one_to_many or reverse_one",
                table.name(),
                relation.name
            )))
        }
    }

    // ========================================================================
    // Identity
    // ========================================================================

    /// The identity. A row scheduled for insert without one is flushed
    /// first so the generated identity can be returned.
    pub fn id(&self) -> Result<Option<EntityId>> {
        let (id, scheduled, table) = {
            let row = self.row.borrow();
            (
                row.id().cloned(),
                row.action() == crate::row::FlushAction::Insert,
                row.table().name().to_string(),
            )
        };
        if id.is_some() || !scheduled {
            return Ok(id);
        }
        self.session()?.flush(Some(&[table]))?;
        Ok(self.row.borrow().id().cloned())
    }

    /// Assign the identity before the first save.
    pub fn set_id(&self, id: impl Into<EntityId>) -> Result<()> {
        self.row.borrow_mut().set_id(id.into())
    }

    // ========================================================================
    // Fields
    // ========================================================================

    /// The visible value of `column`, loading the row on first access.
    /// Reading the identity column never loads.
    pub fn get(&self, column: &str) -> Result<Value> {
        let table = self.table();
        table.require_column(column)?;
        if column == table.id_column() {
            return Ok(self.id()?.map_or(Value::Null, |id| id.to_value()));
        }
        MutableRow::resolve(&self.row)?;
        Ok(self.row.borrow().get_value(column))
    }

    /// [`get`](Self::get) converted to `T`.
    pub fn get_as<T>(&self, column: &str) -> Result<T>
    where
        T: TryFrom<Value, Error = Error>,
    {
        T::try_from(self.get(column)?).map_err(|e| match e {
            Error::Type(te) => Error::Type(TypeError {
                column: Some(column.to_string()),
                ..te
            }),
            other => other,
        })
    }

    /// Write `column`. Writing the visible value clears any pending write.
    pub fn set(&self, column: &str, value: impl Into<Value>) -> Result<()> {
        let table = self.table();
        table.require_column(column)?;
        let value = value.into();
        if column == table.id_column() {
            let id = EntityId::from_value(&value).ok_or_else(|| {
                Error::Custom(format!(
                    "{} is not a valid identity for {}",
                    value,
                    table.name()
                ))
            })?;
            return self.set_id(id);
        }
        // the comparison with the visible value needs the read values
        MutableRow::resolve(&self.row)?;
        self.row
            .borrow_mut()
            .set_value(column, FieldValue::Value(value));
        Ok(())
    }

    // ========================================================================
    // Relations
    // ========================================================================

    /// The entity referenced through a many-to-one or many-to-optional
    /// relation, by relation name or foreign key column.
    ///
    /// Checks the row's reference cache, then the transaction cache, and
    /// otherwise returns an unloaded shell. No query runs unless the owning
    /// row itself still has to be loaded.
    pub fn related(&self, name: &str) -> Result<Option<EntityHandle>> {
        let table = self.table();
        let relation = self.forward_relation(&table, name)?;
        let linked = self.row.borrow().linked_row(&relation.column);
        if let Some(linked) = linked {
            return Ok(Some(EntityHandle::new(linked, self.session.clone())));
        }

        MutableRow::resolve(&self.row)?;
        let value = self.row.borrow().get_value(&relation.column);
        let Some(id) = EntityId::from_value(&value) else {
            return Ok(None);
        };
        let session = self.session()?;
        let target_table = session.registry().get(&relation.target)?;
        let target = session.lazy_wrap(&target_table, id)?;
        let mut row = self.row.borrow_mut();
        if !row.has_write(&relation.column) {
            row.cache_ref(&relation.column, &target);
        }
        Ok(Some(EntityHandle::new(target, self.session.clone())))
    }

    /// [`related`](Self::related) as a typed entity.
    pub fn related_as<E: Entity>(&self, name: &str) -> Result<Option<E>> {
        Ok(self.related(name)?.map(E::from_handle))
    }

    /// Point a forward relation at `target`, or clear it with `None`.
    ///
    /// The reference is kept as the row itself until flush, so an unsaved
    /// target is inserted first and its generated identity is written.
    pub fn set_related(&self, name: &str, target: Option<&EntityHandle>) -> Result<()> {
        let table = self.table();
        let relation = self.forward_relation(&table, name)?;
        let field = match target {
            Some(target) => {
                let same_origin = target.row.borrow().origin() == self.row.borrow().origin();
                let target_table = target.row.borrow().table().name().to_string();
                if !same_origin {
                    return Err(Error::Orm(OrmError::CrossDatabaseReference {
                        table: table.name().to_string(),
                        column: relation.column,
                    }));
                }
                if target_table != relation.target {
                    return Err(Error::Custom(format!(
                        "{}.{} references {}, not {}",
                        table.name(),
                        relation.column,
                        relation.target,
                        target_table
                    )));
                }
                FieldValue::Entity(Rc::clone(&target.row))
            }
            None => FieldValue::Value(Value::Null),
        };
        MutableRow::resolve(&self.row)?;
        self.row.borrow_mut().set_value(&relation.column, field);
        Ok(())
    }

    /// The rows of a one-to-many relation, as a query filtered on the
    /// foreign key.
    ///
    /// The result is cached on this row per relation: repeated calls share
    /// one materialized list until the transaction ends. Use
    /// [`EntityQuery::fresh`] to re-query.
    pub fn one_to_many<E: Entity>(&self, name: &str) -> Result<EntityQuery<E>> {
        let relation = self.reverse_relation(name, RelationKind::OneToMany)?;
        self.reverse_query(&relation)
    }

    /// The single row of a reverse one-to-one relation, or `None` when no
    /// row points back. More than one row pointing back is an error.
    ///
    /// Shares the per-row result cache with
    /// [`prefetch_related`](EntityQuery::prefetch_related).
    pub fn reverse_one(&self, name: &str) -> Result<Option<EntityHandle>> {
        let relation = self.reverse_relation(name, RelationKind::ReverseOne)?;
        let mut rows = self.reverse_query::<EntityHandle>(&relation)?.all()?;
        if rows.len() > 1 {
            return Err(Error::Orm(OrmError::AmbiguousGet {
                table: relation.target,
                count: rows.len(),
            }));
        }
        Ok(rows.pop())
    }

    /// [`reverse_one`](Self::reverse_one) as a typed entity.
    pub fn reverse_one_as<E: Entity>(&self, name: &str) -> Result<Option<E>> {
        Ok(self.reverse_one(name)?.map(E::from_handle))
    }

    fn reverse_relation(&self, name: &str, kind: RelationKind) -> Result<Relation> {
        let table = self.table();
        let relation = table.require_relation(name)?.clone();
        if relation.kind != kind {
            return Err(Error::Custom(format!(
                "{}.{} is not a {} relation",
                table.name(),
                relation.name,
                match kind {
                    RelationKind::ReverseOne => "reverse one-to-one",
                    _ => "one-to-many",
                }
            )));
        }
        Ok(relation)
    }

    fn reverse_query<E: Entity>(&self, relation: &Relation) -> Result<EntityQuery<E>> {
        let session = self.session()?;
        let target = session.registry().get(&relation.target)?;
        let key = Expr::qualified(target.name(), relation.column.as_str());
        let predicate = match self.id()? {
            Some(id) => key.eq(Expr::lit(id.to_value())),
            // an unsaved owner has no children
            None => Expr::raw("1 = 0"),
        };
        let cache = self.row.borrow_mut().related_set(&relation.name);
        Ok(EntityQuery::new(session.weak(), target)
            .filter_expr(predicate)
            .with_cache(cache))
    }

    // ========================================================================
    // Persistence
    // ========================================================================

    /// Schedule the row for the next flush: INSERT when new, otherwise a
    /// sparse UPDATE of the written columns.
    pub fn save(&self) -> Result<()> {
        self.schedule(None)
    }

    /// Like [`save`](Self::save), limited to `columns` for a persisted row.
    pub fn save_columns(&self, columns: &[&str]) -> Result<()> {
        let columns: Vec<String> = columns.iter().map(|c| (*c).to_string()).collect();
        self.schedule(Some(&columns))
    }

    fn schedule(&self, columns: Option<&[String]>) -> Result<()> {
        let session = self.session()?;
        let scope = session.scope()?;
        let action = scope.cache.schedule_save(&self.row, columns)?;
        tracing::trace!(
            table = %self.row.borrow().table().name(),
            action = ?action,
            "Row scheduled"
        );
        Ok(())
    }

    /// Delete the row. A row that was never inserted is just unscheduled.
    pub fn delete(&self) -> Result<()> {
        let session = self.session()?;
        let scope = session.scope()?;
        let (persisted, table) = {
            let row = self.row.borrow();
            (row.is_persisted(), Arc::clone(row.table()))
        };
        if !persisted {
            scope.cache.unschedule(&self.row);
            self.row.borrow_mut().discard_changes();
            return Ok(());
        }

        session.flush(None)?;
        let id = self.row.borrow().id().cloned().ok_or_else(|| {
            Error::Orm(OrmError::EntityNotFound {
                table: table.name().to_string(),
                id: None,
            })
        })?;
        let (sql, params) = DeleteBuilder::from(table.name())
            .filter(Expr::col(table.id_column()).eq(Expr::lit(id.to_value())))
            .build_with_dialect(session.conn().dialect());
        session.execute(&sql, &params)?;

        scope.cache.unschedule(&self.row);
        if scope.cache.remove(table.name(), std::slice::from_ref(&id)).is_empty() {
            self.row.borrow_mut().mark_removed();
        }
        scope.emit(table.name(), id, ChangeKind::Removed);
        Ok(())
    }

    /// Re-read the row from the database.
    ///
    /// Without `reset`, pending saves are flushed first; unsaved writes of a
    /// row that was already persisted are dropped. With `reset`, every
    /// unsaved and scheduled change is discarded before reading.
    pub fn reload(&self, reset: bool) -> Result<()> {
        if self.refetch(reset)? {
            Ok(())
        } else {
            Err(Error::Orm(OrmError::EntityNotFound {
                table: self.row.borrow().table().name().to_string(),
                id: self.row.borrow().id().cloned(),
            }))
        }
    }

    /// [`reload`](Self::reload) without reset, returning `None` when the row
    /// no longer exists.
    pub fn refresh_or_none(&self) -> Result<Option<EntityHandle>> {
        Ok(self.refetch(false)?.then(|| self.clone()))
    }

    fn refetch(&self, reset: bool) -> Result<bool> {
        let session = self.session()?;
        let table = self.table();
        if reset {
            if let Some(scope) = session.current_scope() {
                scope.cache.unschedule(&self.row);
            }
            self.row.borrow_mut().discard_changes();
        } else {
            let was_persisted = self.row.borrow().is_persisted();
            session.flush(None)?;
            if was_persisted {
                self.row.borrow_mut().discard_pending_writes();
            }
        }

        let Some(id) = self.row.borrow().id().cloned() else {
            return Ok(false);
        };
        let Some(fetched) = session.fetch_by_id(&table, &id)? else {
            return Ok(false);
        };
        self.row
            .borrow_mut()
            .load(values_from_row(&table, &fetched, None));
        session.attach(&self.row)?;
        Ok(true)
    }

    // ========================================================================
    // State
    // ========================================================================

    /// The row has not been inserted yet.
    pub fn is_new(&self) -> bool {
        !self.row.borrow().is_persisted()
    }

    pub fn is_loaded(&self) -> bool {
        self.row.borrow().is_loaded()
    }

    pub fn is_dirty(&self) -> bool {
        self.row.borrow().is_dirty()
    }
}
