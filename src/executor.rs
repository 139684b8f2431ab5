//! SQL executor tool
//!
//! Runs synthesizer-proposed SQL against the live database. Runtime
//! failures are not raised: they are converted into textual observations
//! so the reasoning loop can see the error and correct itself on the next
//! step. Only plain queries get through; a tool call can never mutate
//! schema.

use crate::error::{AskError, Result};
use crate::schema::truncate_value;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sqlparser::ast::Statement;
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use sqlx::postgres::PgRow;
use sqlx::{Column, PgPool, Row, TypeInfo};
use std::collections::HashMap;
use tracing::{debug, warn};

/// Rows shown to the model per observation. The full result set is kept
/// for the caller; the model only needs enough to answer.
const MAX_OBSERVATION_ROWS: usize = 100;

/// Ordered tabular output of a query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TabularResult {
    pub columns: Vec<String>,
    pub rows: Vec<HashMap<String, Value>>,
}

impl TabularResult {
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }
}

/// What a single execution produced: data, or a failure descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ExecutionResult {
    Rows(TabularResult),
    Failure(String),
}

impl ExecutionResult {
    /// Serialize for the reasoning loop. Errors read as plain text so the
    /// model can react to them; rows are capped and value-truncated.
    pub fn as_observation(&self) -> String {
        match self {
            ExecutionResult::Failure(message) => format!("Error: {}", message),
            ExecutionResult::Rows(result) => {
                let shown: Vec<&HashMap<String, Value>> =
                    result.rows.iter().take(MAX_OBSERVATION_ROWS).collect();
                let rows: Vec<Value> = shown
                    .iter()
                    .map(|row| {
                        let truncated: serde_json::Map<String, Value> = row
                            .iter()
                            .map(|(k, v)| (k.clone(), truncate_json_value(v)))
                            .collect();
                        Value::Object(truncated)
                    })
                    .collect();
                let mut observation = json!({
                    "columns": result.columns,
                    "rows": rows,
                    "row_count": result.row_count(),
                });
                if result.row_count() > MAX_OBSERVATION_ROWS {
                    observation["note"] = json!(format!(
                        "showing first {} of {} rows",
                        MAX_OBSERVATION_ROWS,
                        result.row_count()
                    ));
                }
                observation.to_string()
            }
        }
    }
}

#[derive(Clone)]
pub struct SqlExecutor {
    pool: PgPool,
}

impl SqlExecutor {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Execute one statement and return rows or a failure observation.
    ///
    /// SQL-level errors (syntax, missing relation, bad types) come back as
    /// `ExecutionResult::Failure`; only an unreachable database is an `Err`.
    pub async fn run(&self, sql: &str) -> Result<ExecutionResult> {
        debug!("Executing SQL: {}", sql);

        if let Err(message) = ensure_read_only(sql) {
            warn!("Rejected statement: {}", message);
            return Ok(ExecutionResult::Failure(message));
        }

        match sqlx::query(sql).fetch_all(&self.pool).await {
            Ok(rows) => {
                let columns = rows
                    .first()
                    .map(|row| {
                        row.columns()
                            .iter()
                            .map(|c| c.name().to_string())
                            .collect()
                    })
                    .unwrap_or_default();
                let rows = rows.iter().map(row_to_object).collect();
                Ok(ExecutionResult::Rows(TabularResult { columns, rows }))
            }
            Err(e) if is_connection_error(&e) => Err(AskError::Connection(e.to_string())),
            Err(e) => Ok(ExecutionResult::Failure(e.to_string())),
        }
    }

    /// Like [`run`], but lifts failures into `AskError::Execution` for
    /// callers outside the reasoning loop.
    pub async fn run_strict(&self, sql: &str) -> Result<TabularResult> {
        match self.run(sql).await? {
            ExecutionResult::Rows(result) => Ok(result),
            ExecutionResult::Failure(message) => Err(AskError::Execution(message)),
        }
    }
}

/// Errors that mean the database itself is unreachable, as opposed to a
/// statement that failed.
pub(crate) fn is_connection_error(e: &sqlx::Error) -> bool {
    matches!(
        e,
        sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::Configuration(_)
    )
}

/// Reject anything that is not a plain query.
///
/// A parse error is also a rejection: the message flows back to the model
/// as an observation, which is earlier feedback than a database error.
fn ensure_read_only(sql: &str) -> std::result::Result<(), String> {
    let statements = Parser::parse_sql(&PostgreSqlDialect {}, sql)
        .map_err(|e| format!("SQL parse error: {}", e))?;
    if statements.is_empty() {
        return Err("Empty SQL statement".to_string());
    }
    for statement in &statements {
        match statement {
            Statement::Query(query) => {
                // SELECT INTO creates a table and sneaks past the
                // statement-level check.
                if let sqlparser::ast::SetExpr::Select(select) = &*query.body {
                    if select.into.is_some() {
                        return Err(
                            "Only read-only SELECT statements are allowed, got: SELECT INTO"
                                .to_string(),
                        );
                    }
                }
            }
            other => {
                return Err(format!(
                    "Only read-only SELECT statements are allowed, got: {}",
                    statement_kind(other)
                ));
            }
        }
    }
    Ok(())
}

fn statement_kind(statement: &Statement) -> &'static str {
    match statement {
        Statement::Insert { .. } => "INSERT",
        Statement::Update { .. } => "UPDATE",
        Statement::Delete { .. } => "DELETE",
        Statement::Drop { .. } => "DROP",
        Statement::CreateTable { .. } => "CREATE TABLE",
        Statement::AlterTable { .. } => "ALTER TABLE",
        Statement::Truncate { .. } => "TRUNCATE",
        _ => "a non-query statement",
    }
}

/// Decode one row into a column-name → JSON value map.
///
/// Covers the types the ingester produces plus the scalars Postgres
/// returns for aggregates. Anything unrecognized falls back to text.
pub(crate) fn row_to_object(row: &PgRow) -> HashMap<String, Value> {
    let mut object = HashMap::with_capacity(row.columns().len());
    for (idx, column) in row.columns().iter().enumerate() {
        let value = match column.type_info().name() {
            "BOOL" => row
                .try_get::<Option<bool>, _>(idx)
                .map(|v| v.map(Value::Bool).unwrap_or(Value::Null)),
            "INT2" => row
                .try_get::<Option<i16>, _>(idx)
                .map(|v| v.map(|n| json!(n)).unwrap_or(Value::Null)),
            "INT4" => row
                .try_get::<Option<i32>, _>(idx)
                .map(|v| v.map(|n| json!(n)).unwrap_or(Value::Null)),
            "INT8" => row
                .try_get::<Option<i64>, _>(idx)
                .map(|v| v.map(|n| json!(n)).unwrap_or(Value::Null)),
            "FLOAT4" => row
                .try_get::<Option<f32>, _>(idx)
                .map(|v| v.map(|n| float_value(n as f64)).unwrap_or(Value::Null)),
            "FLOAT8" => row
                .try_get::<Option<f64>, _>(idx)
                .map(|v| v.map(float_value).unwrap_or(Value::Null)),
            "NUMERIC" => row
                .try_get::<Option<Decimal>, _>(idx)
                .map(|v| v.map(decimal_value).unwrap_or(Value::Null)),
            "TEXT" | "VARCHAR" | "BPCHAR" | "CHAR" | "NAME" => row
                .try_get::<Option<String>, _>(idx)
                .map(|v| v.map(Value::String).unwrap_or(Value::Null)),
            "DATE" => row
                .try_get::<Option<chrono::NaiveDate>, _>(idx)
                .map(|v| v.map(|d| Value::String(d.to_string())).unwrap_or(Value::Null)),
            "TIME" => row
                .try_get::<Option<chrono::NaiveTime>, _>(idx)
                .map(|v| v.map(|t| Value::String(t.to_string())).unwrap_or(Value::Null)),
            "TIMESTAMP" => row
                .try_get::<Option<chrono::NaiveDateTime>, _>(idx)
                .map(|v| v.map(|t| Value::String(t.to_string())).unwrap_or(Value::Null)),
            "TIMESTAMPTZ" => row
                .try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(idx)
                .map(|v| v.map(|t| Value::String(t.to_rfc3339())).unwrap_or(Value::Null)),
            "UUID" => row
                .try_get::<Option<uuid::Uuid>, _>(idx)
                .map(|v| v.map(|u| Value::String(u.to_string())).unwrap_or(Value::Null)),
            "JSON" | "JSONB" => row
                .try_get::<Option<Value>, _>(idx)
                .map(|v| v.unwrap_or(Value::Null)),
            other => {
                debug!("Falling back to text decode for column type {}", other);
                row.try_get::<Option<String>, _>(idx)
                    .map(|v| v.map(Value::String).unwrap_or(Value::Null))
            }
        };
        let value = value.unwrap_or_else(|e| {
            warn!(
                "Failed to decode column {} ({}): {}",
                column.name(),
                column.type_info().name(),
                e
            );
            Value::Null
        });
        object.insert(column.name().to_string(), value);
    }
    object
}

fn float_value(f: f64) -> Value {
    serde_json::Number::from_f64(f)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

fn decimal_value(d: Decimal) -> Value {
    match d.to_f64().and_then(serde_json::Number::from_f64) {
        Some(n) => Value::Number(n),
        None => Value::String(d.to_string()),
    }
}

fn truncate_json_value(value: &Value) -> Value {
    match value {
        Value::String(s) => Value::String(truncate_value(s)),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selects_pass_the_gate() {
        assert!(ensure_read_only("SELECT * FROM sales_report_2023").is_ok());
        assert!(ensure_read_only(
            "SELECT table_name FROM information_schema.tables WHERE table_schema = 'public' LIMIT 10"
        )
        .is_ok());
        assert!(ensure_read_only("WITH t AS (SELECT 1 AS n) SELECT n FROM t").is_ok());
    }

    #[test]
    fn mutations_are_rejected() {
        assert!(ensure_read_only("DROP TABLE sales_report_2023").is_err());
        assert!(ensure_read_only("DELETE FROM t WHERE 1=1").is_err());
        assert!(ensure_read_only("INSERT INTO t VALUES (1)").is_err());
        assert!(ensure_read_only("UPDATE t SET a = 1").is_err());
    }

    #[test]
    fn parse_errors_become_observations() {
        let err = ensure_read_only("SELEC * FORM t").unwrap_err();
        assert!(err.contains("parse error"));
    }

    #[test]
    fn mixed_statements_are_rejected() {
        assert!(ensure_read_only("SELECT 1; DROP TABLE t").is_err());
    }

    #[test]
    fn failure_observation_reads_as_error_text() {
        let failure = ExecutionResult::Failure("relation \"missing\" does not exist".to_string());
        assert_eq!(
            failure.as_observation(),
            "Error: relation \"missing\" does not exist"
        );
    }

    #[test]
    fn rows_observation_is_json_with_counts() {
        let mut row = HashMap::new();
        row.insert("n".to_string(), json!(42));
        let result = ExecutionResult::Rows(TabularResult {
            columns: vec!["n".to_string()],
            rows: vec![row],
        });
        let observation = result.as_observation();
        let parsed: Value = serde_json::from_str(&observation).unwrap();
        assert_eq!(parsed["row_count"], json!(1));
        assert_eq!(parsed["rows"][0]["n"], json!(42));
    }

    #[test]
    fn observation_caps_rows() {
        let rows = (0..250)
            .map(|i| {
                let mut row = HashMap::new();
                row.insert("n".to_string(), json!(i));
                row
            })
            .collect();
        let result = ExecutionResult::Rows(TabularResult {
            columns: vec!["n".to_string()],
            rows,
        });
        let parsed: Value = serde_json::from_str(&result.as_observation()).unwrap();
        assert_eq!(parsed["rows"].as_array().unwrap().len(), MAX_OBSERVATION_ROWS);
        assert_eq!(parsed["row_count"], json!(250));
        assert!(parsed["note"].as_str().unwrap().contains("250"));
    }
}
