//! Query synthesizer
//!
//! Bounded tool-calling loop that turns a natural-language question into
//! SQL and an answer. The loop alternates between reasoning (asking the
//! engine for the next action) and acting (dispatching a tool call),
//! until the engine emits a final answer or the step budget runs out.
//!
//! Failed SQL comes back as an observation, not an error, so the engine
//! can read the error text and repair its query on the next step.

use crate::error::Result;
use crate::executor::{ExecutionResult, SqlExecutor, TabularResult};
use crate::llm::{AgentAction, ChatMessage, ReasoningEngine, ToolCall, ToolDefinition};
use crate::schema::{render_tables, SchemaIntrospector, TableMetadata};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::json;
use sqlx::PgPool;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Sentinel rendered into the prompt when the caller has no table context.
pub const NO_TABLE_HINT: &str = "not known";

/// One entry in a synthesis trace.
#[derive(Debug, Clone, Serialize)]
pub enum TraceStep {
    ToolCall {
        tool: String,
        arguments: String,
        observation: String,
        failed: bool,
    },
    Final {
        output: String,
    },
}

/// Everything one synthesis call produced. Owned by that call; never
/// reused across calls.
#[derive(Debug, Clone, Serialize)]
pub struct SynthesisOutcome {
    pub call_id: String,
    /// The engine's final answer text, absent when the budget ran out.
    pub final_output: Option<String>,
    pub trace: Vec<TraceStep>,
    /// Tool calls actually issued.
    pub steps_used: u32,
    /// Last successful tabular observation, if any.
    pub last_result: Option<TabularResult>,
    /// The SQL that produced `last_result`.
    pub last_sql: Option<String>,
}

/// The tools the reasoning loop can act through.
#[async_trait]
pub trait AgentTools: Send + Sync {
    async fn execute_sql(&self, sql: &str) -> Result<ExecutionResult>;
    async fn list_tables(&self) -> Result<Vec<TableMetadata>>;
    /// Rendered schema + sample rows for the named tables (all when empty).
    async fn table_info(&self, tables: &[String]) -> Result<String>;
}

/// Live-database implementation of [`AgentTools`].
pub struct DbTools {
    executor: SqlExecutor,
    introspector: SchemaIntrospector,
}

impl DbTools {
    pub fn new(pool: PgPool) -> Self {
        Self {
            executor: SqlExecutor::new(pool.clone()),
            introspector: SchemaIntrospector::new(pool),
        }
    }
}

#[async_trait]
impl AgentTools for DbTools {
    async fn execute_sql(&self, sql: &str) -> Result<ExecutionResult> {
        self.executor.run(sql).await
    }

    async fn list_tables(&self) -> Result<Vec<TableMetadata>> {
        self.introspector.list_tables().await
    }

    async fn table_info(&self, tables: &[String]) -> Result<String> {
        let snapshot = self.introspector.list_tables().await?;
        let selected: Vec<TableMetadata> = if tables.is_empty() {
            snapshot
        } else {
            snapshot
                .into_iter()
                .filter(|t| tables.iter().any(|name| name == &t.name))
                .collect()
        };
        if selected.is_empty() {
            return Ok(format!(
                "No matching tables for: {}. Use list_tables to see what exists.",
                tables.join(", ")
            ));
        }
        self.introspector.table_info(&selected).await
    }
}

/// Tool schemas advertised to the reasoning engine.
pub fn agent_toolset() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition {
            name: "execute_sql".to_string(),
            description: "Execute a PostgreSQL SELECT statement against the database and \
                          return the resulting rows as JSON. If the query is invalid, the \
                          error message is returned instead; read it and fix the query."
                .to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "query": {
                        "type": "string",
                        "description": "A single PostgreSQL SELECT statement."
                    }
                },
                "required": ["query"]
            }),
        },
        ToolDefinition {
            name: "list_tables".to_string(),
            description: "List all tables in the database with their columns and types."
                .to_string(),
            parameters: json!({
                "type": "object",
                "properties": {}
            }),
        },
        ToolDefinition {
            name: "table_info".to_string(),
            description: "Show the schema and a few sample rows for specific tables."
                .to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "tables": {
                        "type": "array",
                        "items": { "type": "string" },
                        "description": "Table names to describe. Empty for all tables."
                    }
                },
                "required": []
            }),
        },
    ]
}

pub struct QuerySynthesizer {
    engine: Arc<dyn ReasoningEngine>,
    tools: Arc<dyn AgentTools>,
    step_budget: u32,
}

impl QuerySynthesizer {
    pub fn new(
        engine: Arc<dyn ReasoningEngine>,
        tools: Arc<dyn AgentTools>,
        step_budget: u32,
    ) -> Self {
        Self {
            engine,
            tools,
            step_budget,
        }
    }

    /// Run one synthesis call to completion or budget exhaustion.
    pub async fn synthesize(
        &self,
        question: &str,
        table_hint: Option<&str>,
    ) -> Result<SynthesisOutcome> {
        let call_id = uuid::Uuid::new_v4().to_string();
        let hint = table_hint.unwrap_or(NO_TABLE_HINT);
        info!(call_id = %call_id, "Synthesizing answer for question: {}", question);

        let toolset = agent_toolset();
        let mut messages = vec![
            ChatMessage::system(build_system_prompt()),
            ChatMessage::user(build_user_prompt(question, hint)),
        ];

        let mut trace: Vec<TraceStep> = Vec::new();
        let mut steps_used: u32 = 0;
        let mut last_result: Option<TabularResult> = None;
        let mut last_sql: Option<String> = None;

        while steps_used < self.step_budget {
            let action = self.engine.propose_next_step(&messages, &toolset).await?;

            let calls = match action {
                AgentAction::Final(output) => {
                    info!(call_id = %call_id, steps = steps_used, "Reached final answer");
                    trace.push(TraceStep::Final {
                        output: output.clone(),
                    });
                    return Ok(SynthesisOutcome {
                        call_id,
                        final_output: Some(output),
                        trace,
                        steps_used,
                        last_result,
                        last_sql,
                    });
                }
                AgentAction::ToolCalls(calls) => calls,
            };

            messages.push(ChatMessage::assistant_tool_calls(calls.clone()));

            // Tool calls run strictly one at a time; each consumes a unit
            // of the budget. Calls past the budget are answered with a
            // refusal observation so the message list stays well-formed.
            for call in &calls {
                if steps_used >= self.step_budget {
                    messages.push(ChatMessage::tool(
                        call.id.clone(),
                        "Error: step budget exhausted.",
                    ));
                    continue;
                }
                steps_used += 1;

                let (observation, failed) = self
                    .dispatch(call, &mut last_result, &mut last_sql)
                    .await?;
                debug!(
                    call_id = %call_id,
                    step = steps_used,
                    tool = %call.name,
                    failed,
                    "Tool observation: {}",
                    observation
                );
                trace.push(TraceStep::ToolCall {
                    tool: call.name.clone(),
                    arguments: call.arguments.clone(),
                    observation: observation.clone(),
                    failed,
                });
                messages.push(ChatMessage::tool(call.id.clone(), observation));
            }
        }

        warn!(
            call_id = %call_id,
            budget = self.step_budget,
            "Step budget exhausted without a final answer"
        );
        Ok(SynthesisOutcome {
            call_id,
            final_output: None,
            trace,
            steps_used,
            last_result,
            last_sql,
        })
    }

    /// Dispatch one tool call and return (observation, failed).
    ///
    /// Only connection-level faults surface as `Err`; every other problem
    /// becomes an observation for the engine to react to.
    async fn dispatch(
        &self,
        call: &ToolCall,
        last_result: &mut Option<TabularResult>,
        last_sql: &mut Option<String>,
    ) -> Result<(String, bool)> {
        let args: serde_json::Value =
            serde_json::from_str(&call.arguments).unwrap_or_else(|_| json!({}));

        match call.name.as_str() {
            "execute_sql" => {
                let Some(sql) = args["query"].as_str() else {
                    return Ok((
                        "Error: execute_sql requires a 'query' string argument.".to_string(),
                        true,
                    ));
                };
                let result = self.tools.execute_sql(sql).await?;
                match result {
                    ExecutionResult::Rows(ref table) => {
                        *last_result = Some(table.clone());
                        *last_sql = Some(sql.to_string());
                        Ok((result.as_observation(), false))
                    }
                    ExecutionResult::Failure(_) => Ok((result.as_observation(), true)),
                }
            }
            "list_tables" => {
                let tables = self.tools.list_tables().await?;
                Ok((render_tables(&tables), false))
            }
            "table_info" => {
                let names: Vec<String> = match &args["tables"] {
                    serde_json::Value::Array(items) => items
                        .iter()
                        .filter_map(|v| v.as_str().map(String::from))
                        .collect(),
                    serde_json::Value::String(s) => s
                        .split(',')
                        .map(|part| part.trim().to_string())
                        .filter(|part| !part.is_empty())
                        .collect(),
                    _ => Vec::new(),
                };
                let info = self.tools.table_info(&names).await?;
                Ok((info, false))
            }
            other => Ok((format!("Error: unknown tool '{}'.", other), true)),
        }
    }
}

fn build_system_prompt() -> String {
    "You are an agent designed to interact with a PostgreSQL database. \
     Given an input question, create a syntactically correct PostgreSQL query, \
     execute it with the execute_sql tool, look at the results, and return the answer. \
     If you are unsure which tables or columns exist, call list_tables or table_info first. \
     If a query returns an error, read the error message, rewrite the query, and try again. \
     Unless the question asks for a specific number of rows, limit results to 50. \
     Never issue INSERT, UPDATE, DELETE, DROP, or any other statement that modifies the database."
        .to_string()
}

fn build_user_prompt(question: &str, table_hint: &str) -> String {
    format!(
        "Write a PostgreSQL query to answer the following question: {}\n\n\
         The query is likely regarding a table whose name is {}.\n\n\
         Do NOT refuse to answer the question. If the question cannot be answered \
         exactly, run the closest best-effort query and answer from its results. \
         Nothing bad will happen if you are wrong; it is OK as long as you try.",
        question, table_hint
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_prompt_carries_hint_and_never_refuse_clause() {
        let prompt = build_user_prompt("How many rows?", "sales_report_2023");
        assert!(prompt.contains("sales_report_2023"));
        assert!(prompt.contains("Do NOT refuse"));
        assert!(prompt.contains("PostgreSQL"));
    }

    #[test]
    fn missing_hint_uses_sentinel() {
        let prompt = build_user_prompt("What tables exist?", NO_TABLE_HINT);
        assert!(prompt.contains("a table whose name is not known"));
    }

    #[test]
    fn toolset_exposes_executor_and_introspection() {
        let names: Vec<String> = agent_toolset().into_iter().map(|t| t.name).collect();
        assert_eq!(names, vec!["execute_sql", "list_tables", "table_info"]);
    }
}
