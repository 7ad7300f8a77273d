//! Tool capability type and the request/response shapes the agent loop and
//! provider adapters share.

use crate::types::message::ChatMessage;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    Native,
    Shell,
    Mcp,
}

/// A callable tool. Three kinds coexist behind this one capability set:
/// in-process (compiled-in), local subprocess (`--schema`/`--execute`), and
/// remote server (stdio/SSE/streamable HTTP, see `crate::tools::mcp`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tool {
    pub name: String,
    pub description: String,
    /// JSON Schema describing the tool's arguments.
    pub schema: serde_json::Value,
    #[serde(rename = "type")]
    pub kind: ToolKind,
    /// Origin identifier used for persistence (file path, or `file#name`
    /// for a remote-server tool) so sessions can re-load the exact set.
    pub source: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThinkingEffort {
    Off,
    Low,
    Medium,
    High,
}

impl Default for ThinkingEffort {
    fn default() -> Self {
        ThinkingEffort::Off
    }
}

/// What the caller hands the core for one completion round.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub base_url: Option<String>,
    pub timeout: Duration,
    pub temperature: f32,
    /// `provider/model` form, e.g. `"openai/gpt-5"`.
    pub model: String,
    pub max_tokens: u32,
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<Tool>,
    pub response_schema: Option<serde_json::Value>,
    pub thinking_effort: ThinkingEffort,
    pub tool_timeout: Duration,
    pub max_history: Option<usize>,
    pub system_prompt: Option<String>,
    pub max_parallel: Option<usize>,
    pub max_iterations: usize,
}

impl CompletionRequest {
    pub fn new(model: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            base_url: None,
            timeout: Duration::from_secs(120),
            temperature: 1.0,
            model: model.into(),
            max_tokens: 4096,
            messages,
            tools: Vec::new(),
            response_schema: None,
            thinking_effort: ThinkingEffort::Off,
            tool_timeout: Duration::from_secs(30),
            max_history: None,
            system_prompt: None,
            max_parallel: None,
            max_iterations: 10,
        }
    }

    /// Validate the recognized configuration options per the external
    /// interface contract. Called before any network call.
    pub fn validate(&self) -> crate::error::Result<()> {
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(crate::error::ChatCoreError::Configuration(format!(
                "temperature {} outside [0.0, 2.0]",
                self.temperature
            )));
        }
        if self.max_tokens == 0 {
            return Err(crate::error::ChatCoreError::Configuration(
                "max_tokens must be positive".to_string(),
            ));
        }
        if !self.model.contains('/') {
            return Err(crate::error::ChatCoreError::Configuration(format!(
                "model \"{}\" is missing a \"<provider>/<model>\" prefix",
                self.model
            )));
        }
        if let Some(schema) = &self.response_schema {
            if schema.get("type").is_none() {
                return Err(crate::error::ChatCoreError::Configuration(
                    "response_schema is missing \"type\"".to_string(),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_out_of_range_temperature() {
        let mut req = CompletionRequest::new("openai/gpt-5", vec![]);
        req.temperature = 3.0;
        assert!(req.validate().is_err());
    }

    #[test]
    fn rejects_model_without_provider_prefix() {
        let req = CompletionRequest::new("gpt-5", vec![]);
        assert!(req.validate().is_err());
    }

    #[test]
    fn rejects_schema_without_type() {
        let mut req = CompletionRequest::new("openai/gpt-5", vec![]);
        req.response_schema = Some(serde_json::json!({"properties": {}}));
        assert!(req.validate().is_err());
    }

    #[test]
    fn accepts_well_formed_request() {
        let req = CompletionRequest::new("anthropic/claude", vec![]);
        assert!(req.validate().is_ok());
    }
}
