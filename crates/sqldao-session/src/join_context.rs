//! Join-aware predicate building.
//!
//! A [`JoinContext`] is an immutable position in the relation graph: a table
//! reached from the query root through zero or more hops. Walking a relation
//! with [`JoinContext::rel`] returns a new context one hop further; nothing
//! is shared or mutated, so contexts can be built freely inside filter
//! closures.
//!
//! Column references and conditions carry the hops they need. The query
//! merges those hops into its join list, emitting each alias once.
//!
//! Aliases are derived from the path: a first hop is `{fkcol}_{table}`, a
//! nested one `{parent_alias}__{fkcol}_{table}`. Two different paths to the
//! same table therefore never share an alias.

use crate::entity::EntityHandle;
use crate::table::{Registry, RelationKind, TableDef};
use sqldao_core::{EntityId, OrmError, Value};
use sqldao_query::{Expr, Join, JoinType};
use std::sync::Arc;

/// One JOIN emitted for a relation hop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinHop {
    pub alias: String,
    pub parent_alias: String,
    pub table: String,
    /// Column on the parent side of the ON clause.
    pub parent_column: String,
    /// Column on the joined side of the ON clause.
    pub column: String,
    pub join_type: JoinType,
    /// Whether the foreign key lives on the parent.
    pub forward: bool,
}

impl JoinHop {
    pub fn to_join(&self) -> Join {
        let on = Expr::qualified(self.alias.as_str(), self.column.as_str())
            .eq(Expr::qualified(self.parent_alias.as_str(), self.parent_column.as_str()));
        let join = match self.join_type {
            JoinType::Inner => Join::inner(self.table.as_str(), on),
            JoinType::Left => Join::left(self.table.as_str(), on),
        };
        join.alias(self.alias.as_str())
    }
}

/// Append the hops of `extra` that `joins` does not already have.
pub(crate) fn merge_joins(joins: &mut Vec<JoinHop>, extra: &[JoinHop]) {
    for hop in extra {
        if !joins.iter().any(|j| j.alias == hop.alias) {
            joins.push(hop.clone());
        }
    }
}

fn first_error(a: Option<OrmError>, b: Option<OrmError>) -> Option<OrmError> {
    a.or(b)
}

/// A table position reached from the query root.
#[derive(Debug, Clone)]
pub struct JoinContext {
    registry: Arc<Registry>,
    table: Arc<TableDef>,
    alias: String,
    path: Vec<JoinHop>,
    error: Option<OrmError>,
}

impl JoinContext {
    /// The context of a query's root table.
    pub fn root(registry: Arc<Registry>, table: Arc<TableDef>) -> Self {
        let alias = table.name().to_string();
        Self {
            registry,
            table,
            alias,
            path: Vec::new(),
            error: None,
        }
    }

    pub fn table(&self) -> &Arc<TableDef> {
        &self.table
    }

    /// Name used to qualify this table's columns.
    pub fn alias(&self) -> &str {
        &self.alias
    }

    /// Hops from the root to this table.
    pub fn path(&self) -> &[JoinHop] {
        &self.path
    }

    pub(crate) fn error(&self) -> Option<&OrmError> {
        self.error.as_ref()
    }

    fn failed(&self, error: OrmError) -> Self {
        let mut next = self.clone();
        next.error.get_or_insert(error);
        next
    }

    /// Walk the relation `name` (or a forward relation by its column).
    ///
    /// An unknown relation yields a context that records the error; it is
    /// reported when the query runs.
    pub fn rel(&self, name: &str) -> JoinContext {
        if self.error.is_some() {
            return self.clone();
        }
        let Some(relation) = self.table.relation_named(name) else {
            return self.failed(OrmError::UnknownRelation {
                table: self.table.name().to_string(),
                relation: name.to_string(),
            });
        };
        let target = match self.registry.get(&relation.target) {
            Ok(target) => target,
            Err(_) => {
                return self.failed(OrmError::UnknownTable {
                    table: relation.target.clone(),
                });
            }
        };

        let below_left = self.path.iter().any(|h| h.join_type == JoinType::Left);
        let join_type = if below_left || relation.kind == RelationKind::ManyToOptional {
            JoinType::Left
        } else {
            JoinType::Inner
        };
        let segment = format!("{}_{}", relation.column, target.name());
        let alias = if self.path.is_empty() {
            segment
        } else {
            format!("{}__{}", self.alias, segment)
        };
        let (parent_column, column) = if relation.kind.is_forward() {
            (relation.column.clone(), target.id_column().to_string())
        } else {
            (self.table.id_column().to_string(), relation.column.clone())
        };
        let hop = JoinHop {
            alias: alias.clone(),
            parent_alias: self.alias.clone(),
            table: target.name().to_string(),
            parent_column,
            column,
            join_type,
            forward: relation.kind.is_forward(),
        };

        let mut path = self.path.clone();
        path.push(hop);
        JoinContext {
            registry: Arc::clone(&self.registry),
            table: target,
            alias,
            path,
            error: None,
        }
    }

    /// A column of this table. The identity column behaves as [`id`](Self::id).
    pub fn col(&self, name: &str) -> ColumnRef {
        if name == self.table.id_column() {
            return self.id();
        }
        let error = match self.table.column_def(name) {
            Some(_) => self.error.clone(),
            None => first_error(
                self.error.clone(),
                Some(OrmError::UnknownColumn {
                    table: self.table.name().to_string(),
                    column: name.to_string(),
                }),
            ),
        };
        ColumnRef {
            expr: Expr::qualified(self.alias.as_str(), name),
            joins: self.path.clone(),
            error,
        }
    }

    /// The identity of this table.
    ///
    /// At the end of a forward hop this is the parent's foreign key column,
    /// so the hop itself is not joined.
    pub fn id(&self) -> ColumnRef {
        match self.path.last() {
            Some(hop) if hop.forward => ColumnRef {
                expr: Expr::qualified(hop.parent_alias.as_str(), hop.parent_column.as_str()),
                joins: self.path[..self.path.len() - 1].to_vec(),
                error: self.error.clone(),
            },
            _ => ColumnRef {
                expr: Expr::qualified(self.alias.as_str(), self.table.id_column()),
                joins: self.path.clone(),
                error: self.error.clone(),
            },
        }
    }

    pub fn is_null(&self) -> Condition {
        self.id().is_null()
    }

    pub fn is_not_null(&self) -> Condition {
        self.id().is_not_null()
    }

    /// This position holds `entity`. An entity without identity matches
    /// nothing.
    pub fn eq(&self, entity: &EntityHandle) -> Condition {
        match entity.id() {
            Ok(Some(id)) => self.eq_id(id),
            Ok(None) => self.in_ids(Vec::<EntityId>::new()),
            Err(e) => {
                let mut condition = self.id().eq(Value::Null);
                condition.error = condition.error.or_else(|| match e {
                    sqldao_core::Error::Orm(orm) => Some(orm),
                    _ => Some(OrmError::EntityNotFound {
                        table: entity.table().name().to_string(),
                        id: None,
                    }),
                });
                condition
            }
        }
    }

    pub fn eq_id(&self, id: impl Into<EntityId>) -> Condition {
        self.id().eq(id.into().to_value())
    }

    pub fn in_ids<I>(&self, ids: I) -> Condition
    where
        I: IntoIterator,
        I::Item: Into<EntityId>,
    {
        let values: Vec<Value> = ids.into_iter().map(|id| id.into().to_value()).collect();
        self.id().in_list(values)
    }
}

/// A column reachable from the query root, plus the joins it needs.
#[derive(Debug, Clone)]
pub struct ColumnRef {
    expr: Expr,
    joins: Vec<JoinHop>,
    error: Option<OrmError>,
}

impl ColumnRef {
    /// The qualified column expression.
    pub fn expr(&self) -> &Expr {
        &self.expr
    }

    fn condition(&self, expr: Expr) -> Condition {
        Condition {
            expr,
            joins: self.joins.clone(),
            error: self.error.clone(),
        }
    }

    pub fn eq(&self, value: impl Into<Value>) -> Condition {
        self.condition(self.expr.clone().eq(Expr::lit(value)))
    }

    pub fn ne(&self, value: impl Into<Value>) -> Condition {
        self.condition(self.expr.clone().ne(Expr::lit(value)))
    }

    pub fn lt(&self, value: impl Into<Value>) -> Condition {
        self.condition(self.expr.clone().lt(Expr::lit(value)))
    }

    pub fn le(&self, value: impl Into<Value>) -> Condition {
        self.condition(self.expr.clone().le(Expr::lit(value)))
    }

    pub fn gt(&self, value: impl Into<Value>) -> Condition {
        self.condition(self.expr.clone().gt(Expr::lit(value)))
    }

    pub fn ge(&self, value: impl Into<Value>) -> Condition {
        self.condition(self.expr.clone().ge(Expr::lit(value)))
    }

    pub fn is_null(&self) -> Condition {
        self.condition(self.expr.clone().is_null())
    }

    pub fn is_not_null(&self) -> Condition {
        self.condition(self.expr.clone().is_not_null())
    }

    pub fn like(&self, pattern: impl Into<String>) -> Condition {
        self.condition(self.expr.clone().like(pattern))
    }

    pub fn not_like(&self, pattern: impl Into<String>) -> Condition {
        self.condition(self.expr.clone().not_like(pattern))
    }

    pub fn in_list(&self, values: Vec<Value>) -> Condition {
        self.condition(self.expr.clone().in_list(values))
    }

    pub fn not_in_list(&self, values: Vec<Value>) -> Condition {
        self.condition(self.expr.clone().not_in_list(values))
    }

    /// Compare with another column; both sides' joins are kept.
    pub fn eq_col(&self, other: &ColumnRef) -> Condition {
        let mut condition = self.condition(self.expr.clone().eq(other.expr.clone()));
        merge_joins(&mut condition.joins, &other.joins);
        condition.error = first_error(condition.error, other.error.clone());
        condition
    }
}

/// A WHERE/HAVING predicate with the joins it depends on.
#[derive(Debug, Clone)]
pub struct Condition {
    expr: Expr,
    joins: Vec<JoinHop>,
    error: Option<OrmError>,
}

impl Condition {
    /// A predicate on the root table that needs no joins.
    pub fn from_expr(expr: Expr) -> Self {
        Self {
            expr,
            joins: Vec::new(),
            error: None,
        }
    }

    pub fn expr(&self) -> &Expr {
        &self.expr
    }

    pub fn joins(&self) -> &[JoinHop] {
        &self.joins
    }

    fn combine(self, other: Condition, expr: Expr) -> Condition {
        let mut joins = self.joins;
        merge_joins(&mut joins, &other.joins);
        Condition {
            expr,
            joins,
            error: first_error(self.error, other.error),
        }
    }

    pub fn and(self, other: Condition) -> Condition {
        let expr = self.expr.clone().and(other.expr.clone());
        self.combine(other, expr)
    }

    pub fn or(self, other: Condition) -> Condition {
        let expr = self.expr.clone().or(other.expr.clone());
        self.combine(other, expr)
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(self) -> Condition {
        Condition {
            expr: self.expr.not(),
            ..self
        }
    }

    pub(crate) fn into_parts(self) -> (Expr, Vec<JoinHop>, Option<OrmError>) {
        (self.expr, self.joins, self.error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqldao_core::{ColumnDef, Dialect, SqlType};
    use sqldao_query::Select;

    fn registry() -> Arc<Registry> {
        let registry = Arc::new(Registry::new());
        registry
            .register(
                TableDef::new("country")
                    .column(ColumnDef::new("name", SqlType::Text))
                    .one_to_many("regions", "region", "country_id"),
            )
            .unwrap();
        registry
            .register(
                TableDef::new("region")
                    .column(ColumnDef::new("name", SqlType::Text))
                    .column(ColumnDef::new("country_id", SqlType::BigInt))
                    .many_to_one("country", "country_id", "country"),
            )
            .unwrap();
        registry
            .register(
                TableDef::new("school")
                    .column(ColumnDef::new("name", SqlType::Text))
                    .column(ColumnDef::new("region_id", SqlType::BigInt))
                    .column(ColumnDef::new("secondary_region_id", SqlType::BigInt).nullable(true))
                    .column(ColumnDef::new("parent_id", SqlType::BigInt).nullable(true))
                    .many_to_one("region", "region_id", "region")
                    .many_to_optional("secondary_region", "secondary_region_id", "region")
                    .many_to_optional("parent", "parent_id", "school"),
            )
            .unwrap();
        registry
    }

    fn root(table: &str) -> JoinContext {
        let registry = registry();
        let table = registry.get(table).unwrap();
        JoinContext::root(registry, table)
    }

    fn render(condition: &Condition, table: &str) -> String {
        let mut select = Select::from(table);
        for hop in condition.joins() {
            select = select.join(hop.to_join());
        }
        select
            .filter(condition.expr().clone())
            .build_with_dialect(Dialect::Sqlite)
            .0
    }

    #[test]
    fn test_two_hop_aliases_and_join_kinds() {
        let ctx = root("school");
        let condition = ctx.rel("region").rel("country").col("name").eq("Peru");
        let aliases: Vec<_> = condition.joins().iter().map(|h| h.alias.as_str()).collect();
        assert_eq!(aliases, vec!["region_id_region", "region_id_region__country_id_country"]);
        assert!(condition.joins().iter().all(|h| h.join_type == JoinType::Inner));
        assert_eq!(
            render(&condition, "school"),
            "SELECT \"school\".* FROM \"school\" \
             INNER JOIN \"region\" AS \"region_id_region\" ON \"region_id_region\".\"id\" = \"school\".\"region_id\" \
             INNER JOIN \"country\" AS \"region_id_region__country_id_country\" \
             ON \"region_id_region__country_id_country\".\"id\" = \"region_id_region\".\"country_id\" \
             WHERE \"region_id_region__country_id_country\".\"name\" = ?1"
        );
    }

    #[test]
    fn test_optional_hop_makes_descendants_left() {
        let ctx = root("school");
        let condition = ctx.rel("secondary_region").rel("country").col("name").eq("Peru");
        assert!(condition.joins().iter().all(|h| h.join_type == JoinType::Left));
    }

    #[test]
    fn test_distinct_paths_do_not_collide() {
        let ctx = root("school");
        let a = ctx.rel("region").col("name").eq("Lima");
        let b = ctx.rel("secondary_region").col("name").eq("Cusco");
        let both = a.and(b);
        assert_eq!(both.joins().len(), 2);
        assert_ne!(both.joins()[0].alias, both.joins()[1].alias);
    }

    #[test]
    fn test_shared_hops_emitted_once() {
        let ctx = root("school");
        let region = ctx.rel("region");
        let condition = region
            .col("name")
            .eq("Lima")
            .or(region.rel("country").col("name").eq("Peru"));
        assert_eq!(condition.joins().len(), 2);
    }

    #[test]
    fn test_self_relation_compares_foreign_key() {
        let ctx = root("school");
        let condition = ctx.rel("parent").is_null();
        assert!(condition.joins().is_empty());
        assert_eq!(
            render(&condition, "school"),
            "SELECT \"school\".* FROM \"school\" WHERE \"school\".\"parent_id\" IS NULL"
        );
        let by_id = ctx.rel("parent").eq_id(4);
        assert!(by_id.joins().is_empty());
    }

    #[test]
    fn test_reverse_hop_joins_on_foreign_key() {
        let ctx = root("country");
        let condition = ctx.rel("regions").col("name").eq("Lima");
        let hop = &condition.joins()[0];
        assert_eq!(hop.alias, "country_id_region");
        assert_eq!(hop.parent_column, "id");
        assert_eq!(hop.column, "country_id");
        assert_eq!(hop.join_type, JoinType::Inner);
    }

    #[test]
    fn test_unknown_names_record_errors() {
        let ctx = root("school");
        let (_, _, error) = ctx.rel("nope").col("name").eq("x").into_parts();
        assert!(matches!(error, Some(OrmError::UnknownRelation { .. })));
        let (_, _, error) = ctx.col("nmae").eq("x").into_parts();
        assert!(matches!(error, Some(OrmError::UnknownColumn { .. })));
    }
}
