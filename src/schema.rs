//! Schema introspection
//!
//! Reads table and column metadata out of `information_schema` to ground
//! the synthesizer. A snapshot is fetched per synthesis call and never
//! cached across calls: staleness costs more than the re-fetch next to
//! LLM latency.

use crate::error::{AskError, Result};
use crate::executor::row_to_object;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use sqlx::Row;

/// Longest string value handed to the synthesizer; longer values are cut
/// so a single wide cell cannot blow up the prompt.
pub const MAX_VALUE_LENGTH: usize = 10_000;

/// How many sample rows `table_info` shows per table.
const SAMPLE_ROWS: i64 = 3;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnMetadata {
    pub name: String,
    pub data_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableMetadata {
    pub name: String,
    /// Ordered by ordinal position.
    pub columns: Vec<ColumnMetadata>,
    /// Known after ingestion; `None` when introspected.
    pub row_count: Option<u64>,
}

#[derive(Clone)]
pub struct SchemaIntrospector {
    pool: PgPool,
}

impl SchemaIntrospector {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Enumerate user tables and their columns in the `public` schema.
    pub async fn list_tables(&self) -> Result<Vec<TableMetadata>> {
        let rows = sqlx::query(
            r#"
            SELECT table_name, column_name, data_type
            FROM information_schema.columns
            WHERE table_schema = 'public'
            ORDER BY table_name, ordinal_position
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AskError::Connection(format!("Schema introspection failed: {}", e)))?;

        let mut tables: Vec<TableMetadata> = Vec::new();
        for row in rows {
            let table_name: String = row
                .try_get("table_name")
                .map_err(|e| AskError::Connection(e.to_string()))?;
            let column = ColumnMetadata {
                name: row.try_get("column_name").unwrap_or_default(),
                data_type: row.try_get("data_type").unwrap_or_default(),
            };
            let start_new = tables.last().map_or(true, |t| t.name != table_name);
            if start_new {
                tables.push(TableMetadata {
                    name: table_name,
                    columns: vec![column],
                    row_count: None,
                });
            } else if let Some(last) = tables.last_mut() {
                last.columns.push(column);
            }
        }
        Ok(tables)
    }

    /// Render schema plus a few sample rows for the given tables, with
    /// every value bounded by [`MAX_VALUE_LENGTH`].
    pub async fn table_info(&self, tables: &[TableMetadata]) -> Result<String> {
        let mut parts = Vec::new();
        for table in tables {
            parts.push(render_table(table));

            let sample_sql = format!(
                "SELECT * FROM {} LIMIT {}",
                quote_ident(&table.name),
                SAMPLE_ROWS
            );
            match sqlx::query(&sample_sql).fetch_all(&self.pool).await {
                Ok(rows) if !rows.is_empty() => {
                    parts.push(format!("Sample rows ({}):", rows.len()));
                    for row in &rows {
                        let object = row_to_object(row);
                        let rendered = table
                            .columns
                            .iter()
                            .map(|c| {
                                let value = object
                                    .get(&c.name)
                                    .map(render_value)
                                    .unwrap_or_else(|| "NULL".to_string());
                                format!("{}={}", c.name, truncate_value(&value))
                            })
                            .collect::<Vec<_>>()
                            .join(", ");
                        parts.push(format!("  {}", rendered));
                    }
                }
                Ok(_) => parts.push("Sample rows: (table is empty)".to_string()),
                Err(e) => parts.push(format!("Sample rows unavailable: {}", e)),
            }
        }
        Ok(parts.join("\n"))
    }
}

/// Render one table's schema for the prompt.
pub fn render_table(table: &TableMetadata) -> String {
    let columns = table
        .columns
        .iter()
        .map(|c| format!("{} ({})", c.name, c.data_type))
        .collect::<Vec<_>>()
        .join(", ");
    format!("Table: {}\nColumns: {}", table.name, columns)
}

/// Render a whole snapshot for the `list_tables` tool observation.
pub fn render_tables(tables: &[TableMetadata]) -> String {
    if tables.is_empty() {
        return "No tables found in the public schema.".to_string();
    }
    tables
        .iter()
        .map(render_table)
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn render_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Cut a string at [`MAX_VALUE_LENGTH`] characters.
pub fn truncate_value(value: &str) -> String {
    if value.chars().count() <= MAX_VALUE_LENGTH {
        return value.to_string();
    }
    value.chars().take(MAX_VALUE_LENGTH).collect()
}

/// Double-quote an identifier, escaping embedded quotes.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
