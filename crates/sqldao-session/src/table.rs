//! Table descriptors and the registry that owns them.
//!
//! A [`TableDef`] is built once per table and registered in a [`Registry`].
//! Everything else (join contexts, entity queries, cached rows) holds an
//! `Arc<TableDef>` to the registered descriptor and never copies it.

use sqldao_core::validate::validate_identifier;
use sqldao_core::{ColumnDef, Error, IdKind, OrmError, Result, SqlType, parse_order_spec};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

/// How a relation reaches its target table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationKind {
    /// Required foreign key on the owning table.
    ManyToOne,
    /// Nullable foreign key on the owning table.
    ManyToOptional,
    /// Reverse view: the foreign key lives on the target table.
    OneToMany,
    /// Reverse view of a foreign key that at most one target row holds.
    ReverseOne,
}

impl RelationKind {
    /// Whether the foreign key column lives on the owning table.
    pub const fn is_forward(self) -> bool {
        matches!(self, RelationKind::ManyToOne | RelationKind::ManyToOptional)
    }
}

/// A named relation declared on a table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relation {
    pub name: String,
    pub kind: RelationKind,
    /// Foreign key column. On the owning table for forward relations, on the
    /// target table for reverse ones.
    pub column: String,
    pub target: String,
}

/// Schema and relation metadata for one entity table.
#[derive(Debug, Clone)]
pub struct TableDef {
    name: String,
    columns: Vec<ColumnDef>,
    id_column: String,
    id_kind: IdKind,
    relations: Vec<Relation>,
    default_order: Vec<String>,
}

fn id_column_def(name: &str, kind: IdKind) -> ColumnDef {
    match kind {
        IdKind::Int => ColumnDef::new(name, SqlType::Integer)
            .primary_key(true)
            .auto_increment(true),
        IdKind::Long => ColumnDef::new(name, SqlType::BigInt)
            .primary_key(true)
            .auto_increment(true),
        IdKind::Uuid => ColumnDef::new(name, SqlType::Uuid).primary_key(true),
    }
}

impl TableDef {
    /// Start a descriptor with an auto-increment integer `id` column.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: vec![id_column_def("id", IdKind::Int)],
            id_column: "id".to_string(),
            id_kind: IdKind::Int,
            relations: Vec::new(),
            default_order: Vec::new(),
        }
    }

    /// Replace the identity column.
    pub fn id(mut self, name: impl Into<String>, kind: IdKind) -> Self {
        let name = name.into();
        self.columns.retain(|c| c.name != self.id_column);
        self.columns.insert(0, id_column_def(&name, kind));
        self.id_column = name;
        self.id_kind = kind;
        self
    }

    pub fn column(mut self, column: ColumnDef) -> Self {
        self.columns.push(column);
        self
    }

    /// Declare a required foreign key relation through `column`.
    pub fn many_to_one(
        self,
        name: impl Into<String>,
        column: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        self.relation(RelationKind::ManyToOne, name, column, target)
    }

    /// Declare an optional foreign key relation through `column`.
    pub fn many_to_optional(
        self,
        name: impl Into<String>,
        column: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        self.relation(RelationKind::ManyToOptional, name, column, target)
    }

    /// Declare the reverse side of `target.column`.
    pub fn one_to_many(
        self,
        name: impl Into<String>,
        target: impl Into<String>,
        column: impl Into<String>,
    ) -> Self {
        self.relation(RelationKind::OneToMany, name, column, target)
    }

    /// Declare the reverse side of `target.column` when at most one target
    /// row points back.
    pub fn reverse_one(
        self,
        name: impl Into<String>,
        target: impl Into<String>,
        column: impl Into<String>,
    ) -> Self {
        self.relation(RelationKind::ReverseOne, name, column, target)
    }

    fn relation(
        mut self,
        kind: RelationKind,
        name: impl Into<String>,
        column: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        self.relations.push(Relation {
            name: name.into(),
            kind,
            column: column.into(),
            target: target.into(),
        });
        self
    }

    /// Default ordering as `"name"` or `"-name"` specs.
    pub fn order_by(mut self, spec: &str) -> Self {
        self.default_order.push(spec.to_string());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn columns(&self) -> &[ColumnDef] {
        &self.columns
    }

    pub fn column_def(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn id_column(&self) -> &str {
        &self.id_column
    }

    pub fn id_kind(&self) -> IdKind {
        self.id_kind
    }

    pub fn relations(&self) -> &[Relation] {
        &self.relations
    }

    /// Find a relation by name, or a forward relation by its column.
    pub fn relation_named(&self, name: &str) -> Option<&Relation> {
        self.relations
            .iter()
            .find(|r| r.name == name)
            .or_else(|| {
                self.relations
                    .iter()
                    .find(|r| r.kind.is_forward() && r.column == name)
            })
    }

    /// Default ordering as `(column, descending)` pairs.
    pub fn default_order(&self) -> Vec<(String, bool)> {
        self.default_order
            .iter()
            .filter_map(|spec| parse_order_spec(spec).ok())
            .collect()
    }

    pub(crate) fn require_column(&self, name: &str) -> Result<&ColumnDef> {
        self.column_def(name).ok_or_else(|| {
            Error::Orm(OrmError::UnknownColumn {
                table: self.name.clone(),
                column: name.to_string(),
            })
        })
    }

    pub(crate) fn require_relation(&self, name: &str) -> Result<&Relation> {
        self.relation_named(name).ok_or_else(|| {
            Error::Orm(OrmError::UnknownRelation {
                table: self.name.clone(),
                relation: name.to_string(),
            })
        })
    }

    fn validate(&self) -> Result<()> {
        validate_identifier(&self.name)?;
        for column in &self.columns {
            validate_identifier(&column.name)?;
        }
        for relation in &self.relations {
            validate_identifier(&relation.name)?;
            if relation.kind.is_forward() {
                self.require_column(&relation.column)?;
            }
        }
        for spec in &self.default_order {
            let (column, _) = parse_order_spec(spec)?;
            self.require_column(&column)?;
        }
        Ok(())
    }
}

#[derive(Default)]
struct RegistryState {
    by_name: HashMap<String, Arc<TableDef>>,
    order: Vec<Arc<TableDef>>,
}

/// The set of base table descriptors.
///
/// Shared by every session built from the same builder. Registration is
/// idempotent by table name: the first descriptor wins.
#[derive(Default)]
pub struct Registry {
    state: RwLock<RegistryState>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("Registry")
            .field("tables", &state.order.iter().map(|t| t.name()).collect::<Vec<_>>())
            .finish()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a descriptor, returning the canonical instance.
    pub fn register(&self, table: TableDef) -> Result<Arc<TableDef>> {
        if let Some(existing) = self.lookup(table.name()) {
            return Ok(existing);
        }
        table.validate()?;
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = state.by_name.get(table.name()) {
            return Ok(Arc::clone(existing));
        }
        tracing::debug!(table = %table.name(), columns = table.columns().len(), "Registered table");
        let table = Arc::new(table);
        state
            .by_name
            .insert(table.name().to_string(), Arc::clone(&table));
        state.order.push(Arc::clone(&table));
        Ok(table)
    }

    /// Look up a table, failing with `UnknownTable`.
    pub fn get(&self, name: &str) -> Result<Arc<TableDef>> {
        self.lookup(name).ok_or_else(|| {
            Error::Orm(OrmError::UnknownTable {
                table: name.to_string(),
            })
        })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.lookup(name).is_some()
    }

    /// Registered tables in registration order.
    pub fn tables(&self) -> Vec<Arc<TableDef>> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .order
            .clone()
    }

    fn lookup(&self, name: &str) -> Option<Arc<TableDef>> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .by_name
            .get(name)
            .cloned()
    }
}
