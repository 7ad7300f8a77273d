//! Streaming core: the thread-safe accumulator that provider adapters mutate
//! and the single consumer channel every completion flows through.
//!
//! Mirrors the shape of the teacher's `ChatLoopHandle` channel pair, but
//! collapses the old `StreamChunk`/`LoopStep` split into one `StreamEvent`
//! union, since nothing downstream needs to see streaming and loop-control
//! events as distinct channels.

use crate::types::{ChatMessage, StopReason, ToolCall};
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::mpsc;

/// The unified stream: reasoning and content may interleave; `tool_call`
/// events (one per tool invoked) precede `complete`; `complete` is always
/// last and carries the fully-assembled assistant message; `error`
/// terminates the stream.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Reasoning(String),
    Content(String),
    ToolCall(ToolCall),
    Complete(ChatMessage),
    Error(String),
}

/// One accumulator-owned tool-call slot. `arguments` starts as the literal
/// `"{}"`; the first non-empty delta overwrites rather than appends, so a
/// provider streaming `["{\"a\":", "1}"]` yields `"{\"a\":1}"`, not
/// `"{}{\"a\":1}"`.
#[derive(Debug, Clone)]
pub struct ToolCallSlot {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

impl ToolCallSlot {
    fn new(id: String, name: String) -> Self {
        Self {
            id,
            name,
            arguments: "{}".to_string(),
        }
    }

    /// Append (or, on the first delta, overwrite the `"{}"` placeholder)
    /// an arguments fragment. Used by OpenAI and Anthropic, whose chunks
    /// carry incremental deltas.
    fn append_arguments(&mut self, delta: &str) {
        if delta.is_empty() {
            return;
        }
        if self.arguments == "{}" {
            self.arguments = delta.to_string();
        } else {
            self.arguments.push_str(delta);
        }
    }
}

/// Accumulator mutated by exactly one adapter thread per stream, read by the
/// consumer only at `complete`. A mutex guards the tool-call slice because
/// providers may interleave chunks across tool calls.
pub struct StreamState {
    tx: mpsc::Sender<StreamEvent>,
    reasoning: Mutex<String>,
    tool_calls: Mutex<Vec<ToolCallSlot>>,
    input_tokens: Mutex<u64>,
    output_tokens: Mutex<u64>,
    cached_tokens: Mutex<u64>,
    metadata: Mutex<HashMap<String, serde_json::Value>>,
}

impl StreamState {
    pub fn new(tx: mpsc::Sender<StreamEvent>) -> Self {
        Self {
            tx,
            reasoning: Mutex::new(String::new()),
            tool_calls: Mutex::new(Vec::new()),
            input_tokens: Mutex::new(0),
            output_tokens: Mutex::new(0),
            cached_tokens: Mutex::new(0),
            metadata: Mutex::new(HashMap::new()),
        }
    }

    /// Append to the accumulator and enqueue a content event. Never blocks
    /// the adapter beyond one channel send.
    pub async fn emit_content(&self, text: impl Into<String>) {
        let _ = self.tx.send(StreamEvent::Content(text.into())).await;
    }

    /// Append to the reasoning buffer (kept for logging/metadata) and
    /// enqueue a reasoning event. Never re-emitted on `complete`.
    pub async fn emit_reasoning(&self, text: impl Into<String>) {
        let text = text.into();
        self.reasoning.lock().unwrap().push_str(&text);
        let _ = self.tx.send(StreamEvent::Reasoning(text)).await;
    }

    /// Enqueue an error event. The adapter is expected to return immediately
    /// afterward; no event follows an error.
    pub async fn emit_error(&self, message: impl Into<String>) {
        let message = message.into();
        log::error!("{message}");
        let _ = self.tx.send(StreamEvent::Error(message)).await;
    }

    pub fn reasoning_text(&self) -> String {
        self.reasoning.lock().unwrap().clone()
    }

    /// Append a new tool-call slot (Anthropic `tool_use` block start, or the
    /// first OpenAI delta at a fresh index) and return its index.
    pub fn append_tool_call(&self, id: String, name: String) -> usize {
        let mut calls = self.tool_calls.lock().unwrap();
        calls.push(ToolCallSlot::new(id, name));
        calls.len() - 1
    }

    /// Ensure a slot exists at `index`, creating empty ones up to it if the
    /// provider's index-based scheme skips ahead (OpenAI deltas arrive
    /// keyed by a numeric index, not necessarily in append order).
    pub fn ensure_slot(&self, index: usize, id: Option<&str>, name: Option<&str>) {
        let mut calls = self.tool_calls.lock().unwrap();
        while calls.len() <= index {
            calls.push(ToolCallSlot::new(String::new(), String::new()));
        }
        let slot = &mut calls[index];
        if let Some(id) = id {
            if !id.is_empty() {
                slot.id = id.to_string();
            }
        }
        if let Some(name) = name {
            if !name.is_empty() {
                slot.name = name.to_string();
            }
        }
    }

    /// Append (overwrite-then-append) an arguments delta at a known index.
    pub fn update_tool_call_at_index(&self, index: usize, arguments_delta: &str) {
        let mut calls = self.tool_calls.lock().unwrap();
        if let Some(slot) = calls.get_mut(index) {
            slot.append_arguments(arguments_delta);
        }
    }

    pub fn update_tool_call_arguments(&self, index: usize, arguments_delta: &str) {
        self.update_tool_call_at_index(index, arguments_delta);
    }

    /// Replace the whole tool-call slice in one step. Used by the Ollama
    /// adapter, whose chunks carry the full current list rather than
    /// incremental deltas.
    pub fn reset_tool_calls(&self, calls: Vec<ToolCallSlot>) {
        *self.tool_calls.lock().unwrap() = calls;
    }

    pub fn tool_call_count(&self) -> usize {
        self.tool_calls.lock().unwrap().len()
    }

    pub fn set_token_usage(&self, input_tokens: u64, output_tokens: u64, cached_tokens: u64) {
        *self.input_tokens.lock().unwrap() = input_tokens;
        *self.output_tokens.lock().unwrap() = output_tokens;
        *self.cached_tokens.lock().unwrap() = cached_tokens;
    }

    pub fn set_metadata(&self, key: impl Into<String>, value: serde_json::Value) {
        self.metadata.lock().unwrap().insert(key.into(), value);
    }

    /// Snapshot of the accumulated tool calls, filtering out slots whose id
    /// never arrived (a gap in an index-based provider's deltas).
    pub fn tool_calls_snapshot(&self) -> Vec<ToolCall> {
        self.drain_tool_calls()
    }

    fn drain_tool_calls(&self) -> Vec<ToolCall> {
        self.tool_calls
            .lock()
            .unwrap()
            .iter()
            .filter(|slot| !slot.id.is_empty())
            .map(|slot| ToolCall {
                id: slot.id.clone(),
                name: slot.name.clone(),
                arguments: slot.arguments.clone(),
            })
            .collect()
    }

    /// Emit the final `complete` event. `content` is left empty: it already
    /// streamed as `content` events and duplicating it would double-print.
    pub async fn complete(&self, stop_reason: StopReason) {
        let tool_calls = self.drain_tool_calls();
        for call in &tool_calls {
            let _ = self.tx.send(StreamEvent::ToolCall(call.clone())).await;
        }

        let mut msg = ChatMessage::assistant("");
        msg.tool_calls = tool_calls;
        msg.stop_reason = Some(stop_reason);
        msg.set_token_usage(
            *self.input_tokens.lock().unwrap(),
            *self.output_tokens.lock().unwrap(),
        );
        for (key, value) in self.metadata.lock().unwrap().iter() {
            msg.metadata.insert(key.clone(), value.clone());
        }

        let _ = self.tx.send(StreamEvent::Complete(msg)).await;
    }

    /// Variant used for structured output, where "the content" is a JSON
    /// document extracted from a synthetic tool call rather than streamed
    /// text, so it's sent intact instead of left empty.
    pub async fn complete_with_content(&self, content: impl Into<String>, stop_reason: StopReason) {
        let mut msg = ChatMessage::assistant(content);
        msg.stop_reason = Some(stop_reason);
        msg.set_token_usage(
            *self.input_tokens.lock().unwrap(),
            *self.output_tokens.lock().unwrap(),
        );
        let _ = self.tx.send(StreamEvent::Complete(msg)).await;
    }
}

/// Create a stream's channel pair. Adapters hold the `StreamState` (wrapping
/// the sender); consumers hold the receiver.
pub fn channel(buffer: usize) -> (StreamState, mpsc::Receiver<StreamEvent>) {
    let (tx, rx) = mpsc::channel(buffer);
    (StreamState::new(tx), rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn overwrite_then_append_avoids_garbage_json() {
        let (state, mut rx) = channel(8);
        drop(rx.try_recv());
        let idx = state.append_tool_call("call_1".to_string(), "get_weather".to_string());
        state.update_tool_call_at_index(idx, "{\"a\":");
        state.update_tool_call_at_index(idx, "1}");

        let calls = state.drain_tool_calls();
        assert_eq!(calls[0].arguments, "{\"a\":1}");
    }

    #[tokio::test]
    async fn complete_event_carries_empty_content_and_populated_tool_calls() {
        let (state, mut rx) = channel(8);
        let idx = state.append_tool_call("call_1".to_string(), "bash".to_string());
        state.update_tool_call_at_index(idx, "{}");
        state.complete(StopReason::ToolUse).await;

        // tool_call event precedes complete
        let first = rx.recv().await.unwrap();
        assert!(matches!(first, StreamEvent::ToolCall(_)));
        let second = rx.recv().await.unwrap();
        match second {
            StreamEvent::Complete(msg) => {
                assert_eq!(msg.content, "");
                assert_eq!(msg.tool_calls.len(), 1);
                assert_eq!(msg.stop_reason, Some(StopReason::ToolUse));
            }
            other => panic!("expected Complete, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn reset_tool_calls_replaces_rather_than_appends() {
        let (state, _rx) = channel(8);
        state.append_tool_call("stale".to_string(), "old".to_string());
        state.reset_tool_calls(vec![ToolCallSlot {
            id: "call_0".to_string(),
            name: "bash".to_string(),
            arguments: "{\"command\":\"ls\"}".to_string(),
        }]);
        assert_eq!(state.tool_call_count(), 1);
        assert_eq!(state.drain_tool_calls()[0].id, "call_0");
    }
}
