//! CREATE TABLE statement builder.

use sqldao_core::{ColumnDef, ColumnDefault, Dialect, SqlType};

/// Builder for CREATE TABLE statements.
#[derive(Debug)]
pub struct CreateTable<'a> {
    table: &'a str,
    columns: &'a [ColumnDef],
    if_not_exists: bool,
}

impl<'a> CreateTable<'a> {
    pub fn new(table: &'a str, columns: &'a [ColumnDef]) -> Self {
        Self {
            table,
            columns,
            if_not_exists: false,
        }
    }

    /// Add IF NOT EXISTS clause.
    pub fn if_not_exists(mut self) -> Self {
        self.if_not_exists = true;
        self
    }

    /// Build the CREATE TABLE SQL.
    pub fn build_with_dialect(&self, dialect: Dialect) -> String {
        let mut sql = String::from("CREATE TABLE ");
        if self.if_not_exists {
            sql.push_str("IF NOT EXISTS ");
        }
        sql.push_str(&dialect.quote_identifier(self.table));
        sql.push_str(" (\n  ");

        let mut parts = Vec::new();
        let mut constraints = Vec::new();

        for column in self.columns {
            parts.push(column_definition(dialect, column));

            if column.unique && !column.primary_key {
                constraints.push(format!(
                    "CONSTRAINT {} UNIQUE ({})",
                    dialect.quote_identifier(&format!("uk_{}_{}", self.table, column.name)),
                    dialect.quote_identifier(&column.name)
                ));
            }

            if let Some(fk) = &column.foreign_key {
                let mut constraint = format!(
                    "CONSTRAINT {} FOREIGN KEY ({}) REFERENCES {}({})",
                    dialect.quote_identifier(&format!("fk_{}_{}", self.table, column.name)),
                    dialect.quote_identifier(&column.name),
                    dialect.quote_identifier(&fk.table),
                    dialect.quote_identifier(&fk.column)
                );
                if let Some(action) = fk.on_delete {
                    constraint.push_str(" ON DELETE ");
                    constraint.push_str(action.as_sql());
                }
                if let Some(action) = fk.on_update {
                    constraint.push_str(" ON UPDATE ");
                    constraint.push_str(action.as_sql());
                }
                constraints.push(constraint);
            }
        }

        parts.extend(constraints);
        sql.push_str(&parts.join(",\n  "));
        sql.push_str("\n)");
        sql
    }
}

fn column_definition(dialect: Dialect, column: &ColumnDef) -> String {
    let name = dialect.quote_identifier(&column.name);

    if column.primary_key && column.auto_increment {
        return match dialect {
            // AUTOINCREMENT is only accepted on exactly INTEGER PRIMARY KEY
            Dialect::Sqlite => format!("{name} INTEGER PRIMARY KEY AUTOINCREMENT"),
            Dialect::Postgres => match column.sql_type {
                SqlType::Integer => format!("{name} SERIAL PRIMARY KEY"),
                _ => format!("{name} BIGSERIAL PRIMARY KEY"),
            },
            Dialect::Mysql => format!(
                "{name} {} NOT NULL AUTO_INCREMENT PRIMARY KEY",
                column.sql_type.sql_name()
            ),
        };
    }

    let mut def = format!("{name} {}", column.sql_type.sql_name());
    if column.primary_key {
        def.push_str(" PRIMARY KEY");
    }
    if !column.nullable {
        def.push_str(" NOT NULL");
    }
    if let Some(ColumnDefault::Sql(expr)) = &column.default {
        def.push_str(" DEFAULT ");
        def.push_str(expr);
    }
    def
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqldao_core::ReferentialAction;

    fn region_columns() -> Vec<ColumnDef> {
        vec![
            ColumnDef::new("id", SqlType::BigInt)
                .primary_key(true)
                .auto_increment(true),
            ColumnDef::new("name", SqlType::VarChar(50)).unique(true),
            ColumnDef::new("country_id", SqlType::BigInt)
                .references("country", "id")
                .on_delete(ReferentialAction::Cascade),
            ColumnDef::new("created", SqlType::Text)
                .nullable(true)
                .default_sql("CURRENT_TIMESTAMP"),
        ]
    }

    #[test]
    fn test_create_table_sqlite() {
        let columns = region_columns();
        let sql = CreateTable::new("region", &columns)
            .if_not_exists()
            .build_with_dialect(Dialect::Sqlite);
        assert!(sql.starts_with("CREATE TABLE IF NOT EXISTS \"region\" (\n"));
        assert!(sql.contains("\"id\" INTEGER PRIMARY KEY AUTOINCREMENT"));
        assert!(sql.contains("\"name\" VARCHAR(50) NOT NULL"));
        assert!(sql.contains("\"created\" TEXT DEFAULT CURRENT_TIMESTAMP"));
        assert!(sql.contains("CONSTRAINT \"uk_region_name\" UNIQUE (\"name\")"));
        assert!(sql.contains(
            "FOREIGN KEY (\"country_id\") REFERENCES \"country\"(\"id\") ON DELETE CASCADE"
        ));
    }

    #[test]
    fn test_create_table_postgres_serial() {
        let columns = region_columns();
        let sql = CreateTable::new("region", &columns).build_with_dialect(Dialect::Postgres);
        assert!(sql.contains("\"id\" BIGSERIAL PRIMARY KEY"));
    }

    #[test]
    fn test_client_default_not_rendered() {
        let columns = vec![ColumnDef::new("rank", SqlType::Integer).default_value(3)];
        let sql = CreateTable::new("t", &columns).build_with_dialect(Dialect::Sqlite);
        assert!(!sql.contains("DEFAULT"));
    }
}
