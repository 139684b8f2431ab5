//! Caller-facing pipeline
//!
//! Owns the connection pool and the reasoning-engine client, and wires
//! the components together: ingest a dataset, introspect the schema, ask
//! a question. Each call is stateless, so one pipeline can serve
//! concurrent callers.

use crate::config::{validate_database_url, PipelineConfig};
use crate::error::{AskError, Result};
use crate::executor::{SqlExecutor, TabularResult};
use crate::ingest::DatasetIngester;
use crate::llm::{LlmClient, ReasoningEngine};
use crate::normalizer::{normalize, AskResponse};
use crate::schema::{SchemaIntrospector, TableMetadata};
use crate::synthesizer::{DbTools, QuerySynthesizer};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Connection smoke test, also backing the CLI `tables` command.
const LIST_TABLES_SQL: &str =
    "SELECT table_name FROM information_schema.tables WHERE table_schema = 'public' LIMIT 10";

pub struct Pipeline {
    pool: PgPool,
    config: PipelineConfig,
    engine: Arc<dyn ReasoningEngine>,
}

impl Pipeline {
    /// Validate configuration, connect, and smoke-test the database.
    ///
    /// Malformed settings fail here with `InvalidConfig` before any
    /// remote call; an unreachable database fails with `Connection`.
    pub async fn connect(config: PipelineConfig, database_url: &str) -> Result<Self> {
        config.validate()?;
        validate_database_url(database_url)?;

        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(30))
            .connect(database_url)
            .await
            .map_err(|e| AskError::Connection(e.to_string()))?;

        sqlx::query("SELECT 1")
            .execute(&pool)
            .await
            .map_err(|e| AskError::Connection(e.to_string()))?;

        info!("Connected to database, model: {}", config.model.display_name());

        let engine: Arc<dyn ReasoningEngine> = Arc::new(LlmClient::from_config(&config));
        Ok(Self {
            pool,
            config,
            engine,
        })
    }

    /// Build a pipeline around an existing pool and engine. Test seam.
    pub fn with_engine(
        config: PipelineConfig,
        pool: PgPool,
        engine: Arc<dyn ReasoningEngine>,
    ) -> Self {
        Self {
            pool,
            config,
            engine,
        }
    }

    /// Answer a natural-language question about the data.
    ///
    /// The whole synthesis call runs under the configured wall-clock
    /// bound; on expiry the call is abandoned, its trace discarded, and a
    /// timeout surfaced.
    pub async fn ask(&self, question: &str, table_hint: Option<&str>) -> Result<AskResponse> {
        let synthesizer = QuerySynthesizer::new(
            Arc::clone(&self.engine),
            Arc::new(DbTools::new(self.pool.clone())),
            self.config.step_budget,
        );

        let outcome = tokio::time::timeout(
            self.config.wall_clock_timeout,
            synthesizer.synthesize(question, table_hint),
        )
        .await
        .map_err(|_| {
            AskError::Timeout(format!(
                "synthesis exceeded the {:?} wall-clock bound",
                self.config.wall_clock_timeout
            ))
        })??;

        normalize(outcome)
    }

    /// Materialize an uploaded CSV as a queryable table.
    pub async fn ingest(&self, file_bytes: &[u8], filename: &str) -> Result<TableMetadata> {
        DatasetIngester::new(self.pool.clone())
            .ingest(file_bytes, filename)
            .await
    }

    /// Enumerate tables and columns in the public schema.
    pub async fn list_tables(&self) -> Result<Vec<TableMetadata>> {
        SchemaIntrospector::new(self.pool.clone()).list_tables().await
    }

    /// Cheap connectivity probe listing up to ten table names.
    pub async fn test_connection(&self) -> Result<TabularResult> {
        SqlExecutor::new(self.pool.clone())
            .run_strict(LIST_TABLES_SQL)
            .await
    }

    /// Release the shared connection pool. Call on worker teardown.
    pub async fn close(self) {
        self.pool.close().await;
    }
}
