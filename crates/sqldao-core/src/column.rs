//! Column definitions.

use crate::types::SqlType;
use crate::value::Value;

/// Referential action for foreign key constraints (ON DELETE / ON UPDATE).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReferentialAction {
    /// Raise an error if any references exist.
    #[default]
    NoAction,
    Restrict,
    /// Delete/update referencing rows.
    Cascade,
    /// Set referencing columns to NULL.
    SetNull,
    /// Set referencing columns to their default values.
    SetDefault,
}

impl ReferentialAction {
    /// Get the SQL representation of this action.
    #[must_use]
    pub const fn as_sql(&self) -> &'static str {
        match self {
            ReferentialAction::NoAction => "NO ACTION",
            ReferentialAction::Restrict => "RESTRICT",
            ReferentialAction::Cascade => "CASCADE",
            ReferentialAction::SetNull => "SET NULL",
            ReferentialAction::SetDefault => "SET DEFAULT",
        }
    }
}

/// A column default.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnDefault {
    /// Applied by the entity layer to untouched columns of an INSERT row.
    Value(Value),
    /// A SQL expression rendered into the DDL and evaluated by the database.
    Sql(String),
}

/// Foreign key target of a column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKey {
    pub table: String,
    pub column: String,
    pub on_delete: Option<ReferentialAction>,
    pub on_update: Option<ReferentialAction>,
}

/// Schema description of one column.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnDef {
    pub name: String,
    pub sql_type: SqlType,
    pub nullable: bool,
    pub primary_key: bool,
    pub auto_increment: bool,
    pub unique: bool,
    pub default: Option<ColumnDefault>,
    pub foreign_key: Option<ForeignKey>,
}

impl ColumnDef {
    /// Create a NOT NULL column with no default.
    pub fn new(name: impl Into<String>, sql_type: SqlType) -> Self {
        Self {
            name: name.into(),
            sql_type,
            nullable: false,
            primary_key: false,
            auto_increment: false,
            unique: false,
            default: None,
            foreign_key: None,
        }
    }

    pub fn nullable(mut self, value: bool) -> Self {
        self.nullable = value;
        self
    }

    pub fn primary_key(mut self, value: bool) -> Self {
        self.primary_key = value;
        self
    }

    pub fn auto_increment(mut self, value: bool) -> Self {
        self.auto_increment = value;
        self
    }

    pub fn unique(mut self, value: bool) -> Self {
        self.unique = value;
        self
    }

    /// Set a client-side default applied on INSERT.
    pub fn default_value(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(ColumnDefault::Value(value.into()));
        self
    }

    /// Set a database-side default expression.
    pub fn default_sql(mut self, expr: impl Into<String>) -> Self {
        self.default = Some(ColumnDefault::Sql(expr.into()));
        self
    }

    /// Reference `table.column`.
    pub fn references(mut self, table: impl Into<String>, column: impl Into<String>) -> Self {
        self.foreign_key = Some(ForeignKey {
            table: table.into(),
            column: column.into(),
            on_delete: None,
            on_update: None,
        });
        self
    }

    /// Set the ON DELETE action. Has no effect without a foreign key.
    pub fn on_delete(mut self, action: ReferentialAction) -> Self {
        if let Some(fk) = self.foreign_key.as_mut() {
            fk.on_delete = Some(action);
        }
        self
    }

    /// Set the ON UPDATE action. Has no effect without a foreign key.
    pub fn on_update(mut self, action: ReferentialAction) -> Self {
        if let Some(fk) = self.foreign_key.as_mut() {
            fk.on_update = Some(action);
        }
        self
    }

    /// Whether an INSERT may omit a value for this column.
    pub fn has_default(&self) -> bool {
        self.default.is_some()
    }

    /// The client-side default, if any.
    pub fn client_default(&self) -> Option<&Value> {
        match &self.default {
            Some(ColumnDefault::Value(v)) => Some(v),
            _ => None,
        }
    }
}
