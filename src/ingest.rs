//! Dataset ingestion
//!
//! Turns an uploaded CSV into a PostgreSQL table. The table name is
//! derived deterministically from the filename, column types are inferred
//! by scanning every value, and loading under an existing name replaces
//! the table (drop and recreate, never append). A 0-based `"index"`
//! column is always persisted alongside the data.

use crate::error::{AskError, Result};
use crate::executor::is_connection_error;
use crate::schema::{quote_ident, ColumnMetadata, TableMetadata};
use chrono::NaiveDate;
use lazy_static::lazy_static;
use regex::Regex;
use sqlx::{PgPool, Postgres, QueryBuilder};
use tracing::info;

/// PostgreSQL identifier length limit.
const MAX_IDENTIFIER_LENGTH: usize = 63;

/// Postgres allows 65535 bind parameters per statement.
const MAX_BIND_PARAMS: usize = 65_535;

const DATE_FORMAT: &str = "%Y-%m-%d";

lazy_static! {
    static ref NON_WORD: Regex = Regex::new(r"\W+").unwrap();
}

/// Derive a table name from a filename.
///
/// Steps, in order: strip the extension, collapse each run of non-word
/// characters to one underscore, prefix `t_` when the first character is
/// not alphabetic, lowercase, truncate to 63 characters. Idempotent.
pub fn sanitize_table_name(filename: &str) -> String {
    let stem = std::path::Path::new(filename)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mut name = NON_WORD.replace_all(&stem, "_").into_owned();
    let starts_alpha = name
        .chars()
        .next()
        .map(|c| c.is_alphabetic())
        .unwrap_or(false);
    if !starts_alpha {
        name = format!("t_{}", name);
    }
    let name = name.to_lowercase();
    name.chars().take(MAX_IDENTIFIER_LENGTH).collect()
}

/// Column types the ingester can persist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Bigint,
    Double,
    Boolean,
    Date,
    Text,
}

impl ColumnType {
    pub fn sql_type(&self) -> &'static str {
        match self {
            ColumnType::Bigint => "BIGINT",
            ColumnType::Double => "DOUBLE PRECISION",
            ColumnType::Boolean => "BOOLEAN",
            ColumnType::Date => "DATE",
            ColumnType::Text => "TEXT",
        }
    }
}

/// Infer a column type from all of its values. Empty cells are NULLs and
/// do not constrain the type; a column with no values at all is TEXT.
pub fn infer_column_type<'a>(values: impl Iterator<Item = &'a str>) -> ColumnType {
    let mut any_value = false;
    let mut is_int = true;
    let mut is_float = true;
    let mut is_bool = true;
    let mut is_date = true;

    for value in values {
        let value = value.trim();
        if value.is_empty() {
            continue;
        }
        any_value = true;
        if is_int && value.parse::<i64>().is_err() {
            is_int = false;
        }
        if is_float && value.parse::<f64>().is_err() {
            is_float = false;
        }
        if is_bool && !matches!(value.to_ascii_lowercase().as_str(), "true" | "false") {
            is_bool = false;
        }
        if is_date && NaiveDate::parse_from_str(value, DATE_FORMAT).is_err() {
            is_date = false;
        }
        if !is_int && !is_float && !is_bool && !is_date {
            return ColumnType::Text;
        }
    }

    if !any_value {
        ColumnType::Text
    } else if is_bool {
        ColumnType::Boolean
    } else if is_int {
        ColumnType::Bigint
    } else if is_float {
        ColumnType::Double
    } else if is_date {
        ColumnType::Date
    } else {
        ColumnType::Text
    }
}

/// Build the CREATE TABLE statement, index column first.
fn build_create_table(table: &str, headers: &[String], types: &[ColumnType]) -> String {
    let mut columns = vec![format!("{} BIGINT", quote_ident("index"))];
    for (header, column_type) in headers.iter().zip(types) {
        columns.push(format!(
            "{} {}",
            quote_ident(header),
            column_type.sql_type()
        ));
    }
    format!(
        "CREATE TABLE {} ({})",
        quote_ident(table),
        columns.join(", ")
    )
}

pub struct DatasetIngester {
    pool: PgPool,
}

impl DatasetIngester {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Persist an uploaded CSV as a table, replacing any table with the
    /// same derived name.
    pub async fn ingest(&self, file_bytes: &[u8], filename: &str) -> Result<TableMetadata> {
        let table_name = sanitize_table_name(filename);
        if table_name.is_empty() {
            return Err(AskError::Ingestion(format!(
                "filename {:?} produced an empty table name",
                filename
            )));
        }

        let mut reader = csv::ReaderBuilder::new().from_reader(file_bytes);
        let headers: Vec<String> = reader
            .headers()
            .map_err(|e| AskError::Ingestion(format!("failed to read CSV header: {}", e)))?
            .iter()
            .map(String::from)
            .collect();
        if headers.is_empty() {
            return Err(AskError::Ingestion("CSV has no columns".to_string()));
        }

        let records: Vec<csv::StringRecord> = reader
            .records()
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| AskError::Ingestion(format!("failed to parse CSV: {}", e)))?;

        let types: Vec<ColumnType> = (0..headers.len())
            .map(|i| infer_column_type(records.iter().filter_map(|r| r.get(i))))
            .collect();

        info!(
            "Ingesting {:?} as table {} ({} columns, {} rows)",
            filename,
            table_name,
            headers.len(),
            records.len()
        );

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| AskError::Connection(e.to_string()))?;

        // Replace semantics: drop whatever was there before.
        sqlx::query(&format!("DROP TABLE IF EXISTS {}", quote_ident(&table_name)))
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;

        sqlx::query(&build_create_table(&table_name, &headers, &types))
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;

        if !records.is_empty() {
            let column_list = std::iter::once("index".to_string())
                .chain(headers.iter().cloned())
                .map(|c| quote_ident(&c))
                .collect::<Vec<_>>()
                .join(", ");
            let insert_prefix = format!(
                "INSERT INTO {} ({}) ",
                quote_ident(&table_name),
                column_list
            );

            let params_per_row = headers.len() + 1;
            let rows_per_batch = (MAX_BIND_PARAMS / params_per_row).clamp(1, 1000);

            let indexed: Vec<(usize, &csv::StringRecord)> =
                records.iter().enumerate().collect();
            for batch in indexed.chunks(rows_per_batch) {
                let mut builder: QueryBuilder<Postgres> =
                    QueryBuilder::new(insert_prefix.clone());
                builder.push_values(batch, |mut b, (row_index, record)| {
                    b.push_bind(*row_index as i64);
                    for (i, column_type) in types.iter().enumerate() {
                        let cell = record.get(i).unwrap_or("").trim();
                        match column_type {
                            ColumnType::Bigint => {
                                b.push_bind(cell.parse::<i64>().ok());
                            }
                            ColumnType::Double => {
                                b.push_bind(cell.parse::<f64>().ok());
                            }
                            ColumnType::Boolean => {
                                b.push_bind(match cell.to_ascii_lowercase().as_str() {
                                    "true" => Some(true),
                                    "false" => Some(false),
                                    _ => None,
                                });
                            }
                            ColumnType::Date => {
                                b.push_bind(NaiveDate::parse_from_str(cell, DATE_FORMAT).ok());
                            }
                            ColumnType::Text => {
                                b.push_bind(if cell.is_empty() {
                                    None
                                } else {
                                    Some(cell.to_string())
                                });
                            }
                        }
                    }
                });
                builder
                    .build()
                    .execute(&mut *tx)
                    .await
                    .map_err(map_sqlx_error)?;
            }
        }

        tx.commit()
            .await
            .map_err(|e| AskError::Connection(e.to_string()))?;

        let mut columns = vec![ColumnMetadata {
            name: "index".to_string(),
            data_type: "bigint".to_string(),
        }];
        columns.extend(headers.iter().zip(&types).map(|(header, column_type)| {
            ColumnMetadata {
                name: header.clone(),
                data_type: column_type.sql_type().to_lowercase(),
            }
        }));

        Ok(TableMetadata {
            name: table_name,
            columns,
            row_count: Some(records.len() as u64),
        })
    }
}

fn map_sqlx_error(e: sqlx::Error) -> AskError {
    if is_connection_error(&e) {
        AskError::Connection(e.to_string())
    } else {
        AskError::Ingestion(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_matches_reference_cases() {
        assert_eq!(sanitize_table_name("Sales Report 2023.csv"), "sales_report_2023");
        assert_eq!(sanitize_table_name("123_data.csv"), "t_123_data");
    }

    #[test]
    fn sanitize_is_idempotent() {
        for name in [
            "Sales Report 2023.csv",
            "123_data.csv",
            "weird--name!!.tar.gz",
            ".csv",
            "UPPER CASE.CSV",
        ] {
            let once = sanitize_table_name(name);
            assert_eq!(sanitize_table_name(&once), once, "not idempotent for {name:?}");
        }
    }

    #[test]
    fn sanitize_truncates_to_63() {
        let long = format!("{}.csv", "a".repeat(100));
        assert_eq!(sanitize_table_name(&long).chars().count(), 63);
    }

    #[test]
    fn sanitize_collapses_runs() {
        assert_eq!(sanitize_table_name("a--b  c.csv"), "a_b_c");
    }

    #[test]
    fn infers_types_from_values() {
        assert_eq!(
            infer_column_type(["1", "2", "3"].into_iter()),
            ColumnType::Bigint
        );
        assert_eq!(
            infer_column_type(["1.5", "2", ""].into_iter()),
            ColumnType::Double
        );
        assert_eq!(
            infer_column_type(["true", "FALSE"].into_iter()),
            ColumnType::Boolean
        );
        assert_eq!(
            infer_column_type(["2023-01-31", "2023-02-01"].into_iter()),
            ColumnType::Date
        );
        assert_eq!(
            infer_column_type(["abc", "1"].into_iter()),
            ColumnType::Text
        );
        assert_eq!(infer_column_type(["", ""].into_iter()), ColumnType::Text);
    }

    #[test]
    fn create_table_starts_with_index_column() {
        let sql = build_create_table(
            "sales_report_2023",
            &["region".to_string(), "amount".to_string()],
            &[ColumnType::Text, ColumnType::Double],
        );
        assert_eq!(
            sql,
            "CREATE TABLE \"sales_report_2023\" (\"index\" BIGINT, \"region\" TEXT, \"amount\" DOUBLE PRECISION)"
        );
    }
}
