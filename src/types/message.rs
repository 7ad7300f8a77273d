//! Provider-agnostic conversation data model.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// One piece of message content. Tagged so callers never need to sniff a
/// runtime type to know what they're holding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { url: String, mime_type: Option<String> },
    ImageBase64 {
        data: String,
        mime_type: String,
        filename: Option<String>,
    },
}

/// Normalized terminal cause of a completion round. Set exactly once, on the
/// assistant's terminal message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
    ContentFilter,
    Error,
}

/// A structured request from the model to invoke a named tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// Raw JSON-encoded arguments, as the provider streamed them. Parsed
    /// lazily by the agent loop (parse failures become tool-result text,
    /// not a crate-level error).
    pub arguments: String,
}

/// The textual response to a tool call, appended as a `tool`-role message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub tool_call_id: String,
    pub tool_name: String,
    pub content: String,
    pub is_error: bool,
}

/// Metadata key carrying Anthropic's thinking-block record, resubmitted
/// verbatim on later turns.
pub const META_ANTHROPIC_THINKING_BLOCKS: &str = "anthropic_thinking_blocks";
/// Metadata key mapping a Gemini tool-call id to its base64 thought signature.
pub const META_GEMINI_THOUGHT_SIGNATURES: &str = "gemini_thought_signatures";
pub const META_INPUT_TOKENS: &str = "input_tokens";
pub const META_OUTPUT_TOKENS: &str = "output_tokens";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnthropicThinkingBlock {
    #[serde(rename = "type")]
    pub block_type: String,
    pub thinking: String,
    pub signature: String,
}

/// The unit of conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub parts: Vec<ContentPart>,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    /// Thinking text, not re-sent to providers as plain content.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<StopReason>,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            ..Self::empty(Role::User)
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
            ..Self::empty(Role::System)
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            ..Self::empty(Role::Assistant)
        }
    }

    pub fn tool_result(tool_call_id: impl Into<String>, tool_name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool_call_id: Some(tool_call_id.into()),
            tool_name: Some(tool_name.into()),
            ..Self::empty(Role::Tool)
        }
    }

    fn empty(role: Role) -> Self {
        Self {
            role,
            content: String::new(),
            parts: Vec::new(),
            tool_calls: Vec::new(),
            tool_call_id: None,
            tool_name: None,
            reasoning: None,
            metadata: HashMap::new(),
            stop_reason: None,
        }
    }

    pub fn input_tokens(&self) -> Option<u64> {
        self.metadata.get(META_INPUT_TOKENS).and_then(|v| v.as_u64())
    }

    pub fn output_tokens(&self) -> Option<u64> {
        self.metadata.get(META_OUTPUT_TOKENS).and_then(|v| v.as_u64())
    }

    pub fn set_token_usage(&mut self, input_tokens: u64, output_tokens: u64) {
        self.metadata
            .insert(META_INPUT_TOKENS.to_string(), serde_json::json!(input_tokens));
        self.metadata
            .insert(META_OUTPUT_TOKENS.to_string(), serde_json::json!(output_tokens));
    }

    pub fn anthropic_thinking_blocks(&self) -> Vec<AnthropicThinkingBlock> {
        self.metadata
            .get(META_ANTHROPIC_THINKING_BLOCKS)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default()
    }

    pub fn set_anthropic_thinking_blocks(&mut self, blocks: &[AnthropicThinkingBlock]) {
        if blocks.is_empty() {
            return;
        }
        self.metadata.insert(
            META_ANTHROPIC_THINKING_BLOCKS.to_string(),
            serde_json::json!(blocks),
        );
    }

    pub fn gemini_thought_signatures(&self) -> HashMap<String, String> {
        self.metadata
            .get(META_GEMINI_THOUGHT_SIGNATURES)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default()
    }

    pub fn set_gemini_thought_signatures(&mut self, sigs: &HashMap<String, String>) {
        if sigs.is_empty() {
            return;
        }
        self.metadata.insert(
            META_GEMINI_THOUGHT_SIGNATURES.to_string(),
            serde_json::json!(sigs),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_result_carries_id_and_name() {
        let msg = ChatMessage::tool_result("call_1", "bash", "ok");
        assert_eq!(msg.role, Role::Tool);
        assert_eq!(msg.tool_call_id.as_deref(), Some("call_1"));
        assert_eq!(msg.tool_name.as_deref(), Some("bash"));
    }

    #[test]
    fn thinking_block_round_trips_through_metadata() {
        let mut msg = ChatMessage::assistant("42");
        let blocks = vec![AnthropicThinkingBlock {
            block_type: "thinking".to_string(),
            thinking: "Let me consider.".to_string(),
            signature: "sig-xyz".to_string(),
        }];
        msg.set_anthropic_thinking_blocks(&blocks);

        let restored = msg.anthropic_thinking_blocks();
        assert_eq!(restored.len(), 1);
        assert_eq!(restored[0].signature, "sig-xyz");
        assert_eq!(restored[0].thinking, "Let me consider.");
    }

    #[test]
    fn gemini_signatures_round_trip() {
        let mut msg = ChatMessage::assistant("");
        let mut sigs = HashMap::new();
        sigs.insert("gemini-0".to_string(), "c2lnbmF0dXJl".to_string());
        msg.set_gemini_thought_signatures(&sigs);

        assert_eq!(
            msg.gemini_thought_signatures().get("gemini-0").cloned(),
            Some("c2lnbmF0dXJl".to_string())
        );
    }

    #[test]
    fn serializes_with_stable_role_names() {
        let msg = ChatMessage::user("hello");
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["role"], "user");
        assert_eq!(json["content"], "hello");
    }
}
