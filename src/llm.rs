//! Reasoning-engine client
//!
//! Wraps the chat-completions tool-calling API behind the narrow
//! [`ReasoningEngine`] trait so the synthesizer loop can be driven by a
//! scripted engine in tests. Temperature is pinned to zero: repeated calls
//! with the same schema and question stay as reproducible as the provider
//! allows.

use crate::config::{LanguageModel, PipelineConfig};
use crate::error::{AskError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

/// Tool definition advertised to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// A tool call proposed by the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// Raw JSON arguments, parsed by the dispatcher.
    pub arguments: String,
}

/// The model's next move: act through tools, or answer.
#[derive(Debug, Clone)]
pub enum AgentAction {
    ToolCalls(Vec<ToolCall>),
    Final(String),
}

/// Message in chat format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: Option<String>,
    pub tool_calls: Option<Vec<ToolCall>>,
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn assistant_tool_calls(tool_calls: Vec<ToolCall>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: None,
            tool_calls: Some(tool_calls),
            tool_call_id: None,
        }
    }

    /// Tool observation returned to the model.
    pub fn tool(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: "tool".to_string(),
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: Some(tool_call_id.into()),
        }
    }
}

/// Narrow interface the synthesizer loop depends on.
#[async_trait]
pub trait ReasoningEngine: Send + Sync {
    /// Given the accumulated conversation and the available tools,
    /// propose the next action.
    async fn propose_next_step(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
    ) -> Result<AgentAction>;
}

pub struct LlmClient {
    api_key: String,
    base_url: String,
    model: LanguageModel,
    client: reqwest::Client,
}

impl LlmClient {
    pub fn new(api_key: String, base_url: String, model: LanguageModel) -> Self {
        Self {
            api_key,
            base_url,
            model,
            client: reqwest::Client::new(),
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(
            config.api_key.clone(),
            config.base_url.clone(),
            config.model,
        )
    }
}

#[async_trait]
impl ReasoningEngine for LlmClient {
    async fn propose_next_step(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
    ) -> Result<AgentAction> {
        let api_messages: Vec<serde_json::Value> = messages
            .iter()
            .map(|m| {
                let mut msg = json!({ "role": m.role });
                if let Some(ref content) = m.content {
                    msg["content"] = json!(content);
                }
                if let Some(ref tool_calls) = m.tool_calls {
                    msg["tool_calls"] = json!(tool_calls
                        .iter()
                        .map(|tc| {
                            json!({
                                "id": tc.id,
                                "type": "function",
                                "function": {
                                    "name": tc.name,
                                    "arguments": tc.arguments,
                                },
                            })
                        })
                        .collect::<Vec<_>>());
                }
                if let Some(ref tool_call_id) = m.tool_call_id {
                    msg["tool_call_id"] = json!(tool_call_id);
                }
                msg
            })
            .collect();

        let api_tools: Vec<serde_json::Value> = tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    },
                })
            })
            .collect();

        let body = json!({
            "model": self.model.api_id(),
            "messages": api_messages,
            "tools": api_tools,
            "tool_choice": "auto",
            "temperature": 0.0,
            "max_tokens": 1000,
        });

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| AskError::Connection(format!("LLM API call failed: {}", e)))?;

        let status = response.status();
        let response_json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| AskError::Llm(format!("Failed to parse LLM response: {}", e)))?;

        if !status.is_success() {
            return Err(AskError::Llm(format!(
                "LLM API returned {}: {}",
                status,
                response_json["error"]["message"]
                    .as_str()
                    .unwrap_or("unknown error")
            )));
        }

        parse_chat_response(&response_json)
    }
}

/// Extract the proposed action from a chat-completions response body.
pub fn parse_chat_response(response: &serde_json::Value) -> Result<AgentAction> {
    let message = &response["choices"][0]["message"];

    if let Some(tool_calls) = message["tool_calls"].as_array() {
        let calls: Vec<ToolCall> = tool_calls
            .iter()
            .filter_map(|tc| {
                Some(ToolCall {
                    id: tc["id"].as_str()?.to_string(),
                    name: tc["function"]["name"].as_str()?.to_string(),
                    arguments: tc["function"]["arguments"].as_str()?.to_string(),
                })
            })
            .collect();
        if calls.is_empty() {
            return Err(AskError::Llm(
                "Malformed tool_calls in LLM response".to_string(),
            ));
        }
        return Ok(AgentAction::ToolCalls(calls));
    }

    let content = message["content"]
        .as_str()
        .ok_or_else(|| AskError::Llm("No content in LLM response".to_string()))?;
    Ok(AgentAction::Final(content.to_string()))
}
