//! Result normalizer
//!
//! Shapes a synthesis outcome into the single answer that crosses the
//! system boundary. When the last executed query produced tabular data,
//! that data wins over the engine's textual restatement of it; a text
//! summary of a table is lossy, the table is not.

use crate::error::{AskError, Result};
use crate::executor::TabularResult;
use crate::synthesizer::SynthesisOutcome;
use serde::Serialize;

/// What the caller gets back: a scalar text answer or a result set.
#[derive(Debug, Clone, Serialize)]
pub enum FinalAnswer {
    Text(String),
    Table(TabularResult),
}

#[derive(Debug, Clone, Serialize)]
pub struct AskResponse {
    pub answer: FinalAnswer,
    /// `false` when the step budget ran out and this is the best partial
    /// result rather than a confirmed final answer.
    pub complete: bool,
    /// Tool calls spent reaching the answer.
    pub steps: u32,
    /// The SQL behind a tabular answer, when there was one.
    pub sql: Option<String>,
}

/// Extract the authoritative answer from a finished synthesis call.
pub fn normalize(outcome: SynthesisOutcome) -> Result<AskResponse> {
    let SynthesisOutcome {
        final_output,
        steps_used,
        last_result,
        last_sql,
        ..
    } = outcome;

    let tabular = last_result.filter(|table| !table.rows.is_empty());

    match final_output {
        Some(text) => match tabular {
            Some(table) => Ok(AskResponse {
                answer: FinalAnswer::Table(table),
                complete: true,
                steps: steps_used,
                sql: last_sql,
            }),
            None => Ok(AskResponse {
                answer: FinalAnswer::Text(text),
                complete: true,
                steps: steps_used,
                sql: last_sql,
            }),
        },
        // Budget ran out: fall back to the best partial result.
        None => match tabular {
            Some(table) => Ok(AskResponse {
                answer: FinalAnswer::Table(table),
                complete: false,
                steps: steps_used,
                sql: last_sql,
            }),
            None => Err(AskError::Timeout(format!(
                "step budget exhausted after {} tool calls without an answer",
                steps_used
            ))),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synthesizer::TraceStep;
    use serde_json::json;
    use std::collections::HashMap;

    fn table_of(n: i64) -> TabularResult {
        let mut row = HashMap::new();
        row.insert("n".to_string(), json!(n));
        TabularResult {
            columns: vec!["n".to_string()],
            rows: vec![row],
        }
    }

    fn outcome(
        final_output: Option<&str>,
        last_result: Option<TabularResult>,
        steps: u32,
    ) -> SynthesisOutcome {
        SynthesisOutcome {
            call_id: "test-call".to_string(),
            final_output: final_output.map(String::from),
            trace: vec![TraceStep::Final {
                output: "x".to_string(),
            }],
            steps_used: steps,
            last_sql: last_result.as_ref().map(|_| "SELECT n".to_string()),
            last_result,
        }
    }

    #[test]
    fn tabular_data_beats_text_restatement() {
        let response = normalize(outcome(Some("The value is 7."), Some(table_of(7)), 2)).unwrap();
        assert!(response.complete);
        match response.answer {
            FinalAnswer::Table(table) => assert_eq!(table.rows[0]["n"], json!(7)),
            FinalAnswer::Text(_) => panic!("expected tabular answer"),
        }
        assert_eq!(response.sql.as_deref(), Some("SELECT n"));
    }

    #[test]
    fn text_answer_surfaces_verbatim_without_rows() {
        let response = normalize(outcome(Some("No data loaded yet."), None, 1)).unwrap();
        match response.answer {
            FinalAnswer::Text(text) => assert_eq!(text, "No data loaded yet."),
            FinalAnswer::Table(_) => panic!("expected text answer"),
        }
    }

    #[test]
    fn empty_table_does_not_shadow_text() {
        let empty = TabularResult {
            columns: vec!["n".to_string()],
            rows: vec![],
        };
        let response = normalize(outcome(Some("Nothing matched."), Some(empty), 1)).unwrap();
        assert!(matches!(response.answer, FinalAnswer::Text(_)));
    }

    #[test]
    fn exhausted_budget_returns_partial_table() {
        let response = normalize(outcome(None, Some(table_of(3)), 15)).unwrap();
        assert!(!response.complete);
        assert!(matches!(response.answer, FinalAnswer::Table(_)));
    }

    #[test]
    fn exhausted_budget_without_partial_is_timeout() {
        let err = normalize(outcome(None, None, 15)).unwrap_err();
        assert!(matches!(err, AskError::Timeout(_)));
    }
}
