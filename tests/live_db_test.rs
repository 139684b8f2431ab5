//! End-to-end checks against a real PostgreSQL instance.
//!
//! Ignored by default; run with a scratch database:
//! `DATABASE_URL=postgresql://... cargo test -- --ignored`

use askdb::executor::{ExecutionResult, SqlExecutor};
use askdb::ingest::DatasetIngester;
use askdb::schema::SchemaIntrospector;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

async fn connect() -> PgPool {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must point at a scratch database");
    PgPoolOptions::new()
        .max_connections(2)
        .connect(&url)
        .await
        .expect("failed to connect")
}

const FIRST_CSV: &str = "region,amount,closed\nnorth,10.5,true\nsouth,3.25,false\n";
const SECOND_CSV: &str = "region,amount,closed\nwest,7.75,true\n";

#[tokio::test]
#[ignore]
async fn reingesting_replaces_the_table() -> Result<(), Box<dyn std::error::Error>> {
    let pool = connect().await;
    let ingester = DatasetIngester::new(pool.clone());

    let first = ingester
        .ingest(FIRST_CSV.as_bytes(), "Live Replace Check.csv")
        .await?;
    assert_eq!(first.name, "live_replace_check");
    assert_eq!(first.row_count, Some(2));

    let second = ingester
        .ingest(SECOND_CSV.as_bytes(), "Live Replace Check.csv")
        .await?;
    assert_eq!(second.name, first.name);
    assert_eq!(second.row_count, Some(1));

    // Exactly one table with that name, holding the latest upload.
    let introspector = SchemaIntrospector::new(pool.clone());
    let tables = introspector.list_tables().await?;
    let matching: Vec<_> = tables
        .iter()
        .filter(|t| t.name == "live_replace_check")
        .collect();
    assert_eq!(matching.len(), 1);

    let executor = SqlExecutor::new(pool.clone());
    let result = executor
        .run_strict("SELECT count(*) AS n FROM live_replace_check")
        .await?;
    assert_eq!(result.rows[0]["n"], serde_json::json!(1));

    sqlx::query("DROP TABLE IF EXISTS live_replace_check")
        .execute(&pool)
        .await?;
    Ok(())
}

#[tokio::test]
#[ignore]
async fn index_column_is_persisted() -> Result<(), Box<dyn std::error::Error>> {
    let pool = connect().await;
    let ingester = DatasetIngester::new(pool.clone());

    ingester
        .ingest(FIRST_CSV.as_bytes(), "live_index_check.csv")
        .await?;

    let executor = SqlExecutor::new(pool.clone());
    let result = executor
        .run_strict("SELECT \"index\", region FROM live_index_check ORDER BY \"index\"")
        .await?;
    assert_eq!(result.rows.len(), 2);
    assert_eq!(result.rows[0]["index"], serde_json::json!(0));
    assert_eq!(result.rows[1]["index"], serde_json::json!(1));

    sqlx::query("DROP TABLE IF EXISTS live_index_check")
        .execute(&pool)
        .await?;
    Ok(())
}

#[tokio::test]
#[ignore]
async fn executor_refuses_to_mutate() -> Result<(), Box<dyn std::error::Error>> {
    let pool = connect().await;
    let executor = SqlExecutor::new(pool);

    match executor.run("DROP TABLE IF EXISTS anything").await? {
        ExecutionResult::Failure(message) => {
            assert!(message.contains("read-only"));
        }
        ExecutionResult::Rows(_) => panic!("mutating statement must not execute"),
    }
    Ok(())
}
