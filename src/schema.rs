//! Staging schema definitions and DDL generation.

use serde::{Deserialize, Serialize};

/// Quote an SQL identifier, doubling embedded quotes.
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Schema-qualified, quoted relation name.
pub fn qualified(schema: &str, table: &str) -> String {
    format!("{}.{}", quote_ident(schema), quote_ident(table))
}

/// Staging schema: one relation per stream plus the watermark settings table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagingSchema {
    /// Schema name
    pub name: String,
    /// Tables in this schema
    pub tables: Vec<Table>,
}

impl StagingSchema {
    /// Create a new schema.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tables: Vec::new(),
        }
    }

    /// Build the schema for the given stream tables and settings table.
    pub fn for_streams<'a>(
        name: impl Into<String>,
        settings_table: &str,
        stream_tables: impl IntoIterator<Item = &'a str>,
    ) -> Self {
        let mut schema = Self::new(name);
        schema.tables.push(Table::watermarks(settings_table));
        schema
            .tables
            .extend(stream_tables.into_iter().map(Table::staging));
        schema
    }

    /// Table with the given name, if the schema has one.
    pub fn table(&self, name: &str) -> Option<&Table> {
        self.tables.iter().find(|t| t.name == name)
    }

    /// All statements needed to create the schema, in order.
    pub fn ddl_statements(&self) -> Vec<String> {
        let mut statements = vec![format!(
            "CREATE SCHEMA IF NOT EXISTS {}",
            quote_ident(&self.name)
        )];
        statements.extend(self.tables.iter().map(|t| t.to_postgres_ddl(&self.name)));
        statements
    }
}

/// Table definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Table {
    /// Table name
    pub name: String,
    /// Columns
    pub columns: Vec<Column>,
    /// Primary key columns
    pub primary_key: Vec<String>,
}

impl Table {
    /// Create a new table.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            primary_key: Vec::new(),
        }
    }

    /// Staging relation: `(id TEXT PRIMARY KEY, object_value TEXT, update_ts TIMESTAMP)`.
    pub fn staging(name: impl Into<String>) -> Self {
        Self::new(name)
            .key_column("id", ColumnType::Text)
            .column("object_value", ColumnType::Text)
            .column("update_ts", ColumnType::Timestamp)
    }

    /// Watermark settings relation: `(workflow_key TEXT PRIMARY KEY, last_batch_date TIMESTAMP)`.
    pub fn watermarks(name: impl Into<String>) -> Self {
        Self::new(name)
            .key_column("workflow_key", ColumnType::Text)
            .column("last_batch_date", ColumnType::Timestamp)
    }

    fn column(mut self, name: &str, column_type: ColumnType) -> Self {
        self.columns.push(Column::new(name, column_type));
        self
    }

    /// NOT NULL column that joins the primary key.
    fn key_column(mut self, name: &str, column_type: ColumnType) -> Self {
        self.columns.push(Column::new(name, column_type).nullable(false));
        self.primary_key.push(name.to_string());
        self
    }

    /// Generate CREATE TABLE DDL for PostgreSQL.
    pub fn to_postgres_ddl(&self, schema: &str) -> String {
        let mut ddl = format!(
            "CREATE TABLE IF NOT EXISTS {} (\n",
            qualified(schema, &self.name)
        );

        let lines: Vec<String> = self
            .columns
            .iter()
            .map(|c| {
                format!(
                    "    {} {}{}",
                    quote_ident(&c.name),
                    c.column_type.to_postgres(),
                    c.constraints_ddl()
                )
            })
            .collect();
        ddl.push_str(&lines.join(",\n"));

        if !self.primary_key.is_empty() {
            let pk: Vec<String> = self.primary_key.iter().map(|c| quote_ident(c)).collect();
            ddl.push_str(&format!(",\n    PRIMARY KEY ({})", pk.join(", ")));
        }

        ddl.push_str("\n)");
        ddl
    }

    /// Column with the given name.
    pub fn column_named(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }
}

/// Column definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Column {
    /// Column name
    pub name: String,
    /// Column type
    pub column_type: ColumnType,
    /// Is nullable
    pub nullable: bool,
}

impl Column {
    /// Create a new column.
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            nullable: true,
        }
    }

    /// Set nullable.
    pub fn nullable(mut self, nullable: bool) -> Self {
        self.nullable = nullable;
        self
    }

    fn constraints_ddl(&self) -> &'static str {
        if self.nullable { "" } else { " NOT NULL" }
    }
}

/// Column types used by the staging layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    /// Text (unlimited length)
    Text,
    /// Timestamp without timezone
    Timestamp,
}

impl ColumnType {
    /// Convert to PostgreSQL type string.
    pub fn to_postgres(&self) -> &'static str {
        match self {
            ColumnType::Text => "TEXT",
            ColumnType::Timestamp => "TIMESTAMP",
        }
    }
}
