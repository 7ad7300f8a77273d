//! Session store: a uniform capability set over two back-ends — in-memory
//! (volatile, per-process) and filesystem (durable, shared across
//! processes via an advisory lock per context). No teacher module covers
//! persistence directly; the `Arc<RwLock<...>>`-per-entry shape is carried
//! over from the teacher's general concurrency idiom (see `memory`).

pub mod filesystem;
pub mod memory;

use crate::error::Result;
use crate::types::{ChatMessage, CompletionRequest, ThinkingEffort, Tool, ToolKind};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub use filesystem::FilesystemSessionStore;
pub use memory::MemorySessionStore;

/// One loaded tool's identity, persisted so a reopened context can
/// re-instantiate the exact working set rather than starting tool-less.
/// Mirrors `Tool`'s `name`/`type`/`source` fields exactly (see spec §3).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveTool {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ToolKind,
    pub source: String,
}

impl From<&Tool> for ActiveTool {
    fn from(tool: &Tool) -> Self {
        Self {
            name: tool.name.clone(),
            kind: tool.kind,
            source: tool.source.clone(),
        }
    }
}

/// Per-context settings persisted alongside history, merged against a
/// caller-supplied `CompletionRequest` once per turn.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub system_prompt: Option<String>,
    pub max_history: Option<usize>,
    pub thinking_effort: Option<ThinkingEffort>,
    /// Seconds, not a `Duration`, since `Duration` has no serde impl;
    /// converted at the `CompletionRequest` boundary.
    pub tool_timeout_secs: Option<u64>,
    /// The exact tool set loaded when this metadata was last saved, so the
    /// next turn can re-load shell/MCP tools by `source` instead of
    /// starting the context tool-less. See `ToolRegistry::reload_active_tools`.
    #[serde(default)]
    pub active_tools: Vec<ActiveTool>,
    pub last_used: Option<String>,
    #[serde(default)]
    pub extra: HashMap<String, serde_json::Value>,
}

/// One open, locked conversation. Dropping it without calling `close` still
/// releases the lock (advisory locks are held by file handle/OS guard), but
/// callers should call `close` to flush deterministically.
#[async_trait]
pub trait Session: Send + Sync {
    fn get_name(&self) -> &str;
    async fn add_message(&mut self, message: ChatMessage) -> Result<()>;
    async fn get_history(&self) -> Result<Vec<ChatMessage>>;
    /// Drops history, preserves metadata, bumps `last_used`.
    async fn clear(&mut self) -> Result<()>;
    async fn get_metadata(&self) -> Result<SessionMetadata>;
    async fn set_metadata(&mut self, metadata: SessionMetadata) -> Result<()>;
    async fn update_metadata(&mut self, partial: SessionMetadata) -> Result<()>;
    async fn close(self: Box<Self>) -> Result<()>;
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get(&self, name: &str) -> Result<Box<dyn Session>>;
    async fn exists(&self, name: &str) -> Result<bool>;
    async fn list(&self) -> Result<Vec<String>>;
    async fn get_last(&self) -> Result<Option<String>>;
    async fn get_all_metadata(&self) -> Result<HashMap<String, SessionMetadata>>;
    /// No-op (quietly skipped) if the context's lock is currently held by
    /// another open session.
    async fn delete(&self, name: &str) -> Result<bool>;
    async fn purge(&self) -> Result<usize> {
        let mut deleted = 0;
        for name in self.list().await? {
            if self.delete(&name).await? {
                deleted += 1;
            }
        }
        Ok(deleted)
    }
}

/// `/ \ : * ? " < > |`, control characters, `.`/`..`, and leading/trailing
/// space or dot are all rejected — the same constraint set applied
/// uniformly by both store implementations.
pub fn validate_context_name(name: &str) -> Result<()> {
    use crate::error::ChatCoreError;

    if name.is_empty() {
        return Err(ChatCoreError::Configuration("context name must not be empty".to_string()));
    }
    if name == "." || name == ".." {
        return Err(ChatCoreError::Configuration(format!(
            "context name \"{name}\" is reserved"
        )));
    }
    const FORBIDDEN: &[char] = &['/', '\\', ':', '*', '?', '"', '<', '>', '|'];
    if let Some(c) = name.chars().find(|c| FORBIDDEN.contains(c)) {
        return Err(ChatCoreError::Configuration(format!(
            "context name \"{name}\" contains forbidden character '{c}'"
        )));
    }
    if name.chars().any(|c| (c as u32) < 0x20 || (c as u32) == 0x7F) {
        return Err(ChatCoreError::Configuration(format!(
            "context name \"{name}\" contains a control character"
        )));
    }
    if name.starts_with(' ') || name.ends_with(' ') || name.starts_with('.') || name.ends_with('.') {
        return Err(ChatCoreError::Configuration(format!(
            "context name \"{name}\" has leading/trailing space or dot"
        )));
    }
    Ok(())
}

/// Merge rule applied once per turn, before calling the LLM: for each
/// setting the caller did not explicitly provide, fall back to the stored
/// value; the caller always wins when it did provide one. Only fields the
/// request type represents as genuinely optional (`system_prompt`,
/// `max_history`, `model` when empty) participate — `temperature`,
/// `max_tokens`, `thinking_effort`, and `tool_timeout` have no "unset"
/// representation in `CompletionRequest` (plain `f32`/`u32`/`ThinkingEffort`/
/// `Duration`, not `Option<_>`), so a caller wanting the stored value for
/// those must omit building a request at all and read `SessionMetadata`
/// directly (see design notes).
///
/// Returns whether the system prompt changed on an existing non-empty
/// conversation, which the caller must treat as a reset trigger.
pub fn merge_settings(request: &mut CompletionRequest, stored: &SessionMetadata, history_len: usize) -> bool {
    if request.model.is_empty() {
        if let Some(model) = &stored.model {
            request.model = model.clone();
        }
    }
    if request.system_prompt.is_none() {
        request.system_prompt = stored.system_prompt.clone();
    }
    if request.max_history.is_none() {
        request.max_history = stored.max_history;
    }

    let system_prompt_changed = stored.system_prompt.is_some()
        && request.system_prompt.is_some()
        && stored.system_prompt != request.system_prompt;
    system_prompt_changed && history_len > 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_forbidden_characters() {
        assert!(validate_context_name("a/b").is_err());
        assert!(validate_context_name("a:b").is_err());
    }

    #[test]
    fn rejects_dot_and_dotdot() {
        assert!(validate_context_name(".").is_err());
        assert!(validate_context_name("..").is_err());
    }

    #[test]
    fn rejects_leading_trailing_space_or_dot() {
        assert!(validate_context_name(" alice").is_err());
        assert!(validate_context_name("alice ").is_err());
        assert!(validate_context_name(".alice").is_err());
    }

    #[test]
    fn accepts_ordinary_name() {
        assert!(validate_context_name("alice").is_ok());
    }

    #[test]
    fn system_prompt_change_on_nonempty_history_is_flagged() {
        let mut request = CompletionRequest::new("openai/gpt-5", vec![]);
        request.system_prompt = Some("S2".to_string());
        let stored = SessionMetadata {
            system_prompt: Some("S1".to_string()),
            ..Default::default()
        };
        assert!(merge_settings(&mut request, &stored, 4));
    }

    #[test]
    fn no_reset_when_history_is_empty() {
        let mut request = CompletionRequest::new("openai/gpt-5", vec![]);
        request.system_prompt = Some("S2".to_string());
        let stored = SessionMetadata {
            system_prompt: Some("S1".to_string()),
            ..Default::default()
        };
        assert!(!merge_settings(&mut request, &stored, 0));
    }
}
