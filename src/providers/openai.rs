//! OpenAI-compatible streaming adapter.
//!
//! Chunks are deltas: optional `content`, optional reasoning content, and
//! optional `tool_calls[]` each carrying a numeric `index`. Tool-call
//! arguments accumulate incrementally at `tool_calls[index]`; the `"{}"`
//! placeholder is overwritten (not appended to) by the first delta, per
//! `StreamState::update_tool_call_at_index`.

use crate::error::{ChatCoreError, Result};
use crate::providers::{http_client, resolve_base_url, ChatProvider};
use crate::stream::{self, StreamEvent, StreamState};
use crate::types::{ChatMessage, CompletionRequest, Role, StopReason};
use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

pub struct OpenAiProvider {
    client: reqwest::Client,
    api_key: Option<String>,
}

impl OpenAiProvider {
    pub fn new(api_key: Option<String>) -> Self {
        Self {
            client: http_client(std::time::Duration::from_secs(120)),
            api_key,
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<WireMessage>,
    stream: bool,
    stream_options: StreamOptions,
    temperature: f32,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<WireTool>,
}

#[derive(Debug, Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<WireToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct WireToolCall {
    id: String,
    #[serde(rename = "type")]
    kind: &'static str,
    function: WireFunctionCall,
}

#[derive(Debug, Serialize)]
struct WireFunctionCall {
    name: String,
    arguments: String,
}

#[derive(Debug, Serialize)]
struct WireTool {
    #[serde(rename = "type")]
    kind: &'static str,
    function: WireFunction,
}

#[derive(Debug, Serialize)]
struct WireFunction {
    name: String,
    description: String,
    parameters: Value,
}

fn role_str(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    }
}

fn to_wire_messages(messages: &[ChatMessage]) -> Vec<WireMessage> {
    messages
        .iter()
        .map(|m| WireMessage {
            role: role_str(m.role),
            content: if m.content.is_empty() && !m.tool_calls.is_empty() {
                None
            } else {
                Some(m.content.clone())
            },
            tool_calls: if m.tool_calls.is_empty() {
                None
            } else {
                Some(
                    m.tool_calls
                        .iter()
                        .map(|tc| WireToolCall {
                            id: tc.id.clone(),
                            kind: "function",
                            function: WireFunctionCall {
                                name: tc.name.clone(),
                                arguments: tc.arguments.clone(),
                            },
                        })
                        .collect(),
                )
            },
            tool_call_id: m.tool_call_id.clone(),
        })
        .collect()
}

/// OpenAI rejects empty `properties`; zero-argument tools get a dummy
/// optional `__noargs` property (stripped again at invocation time by the
/// tool registry, see `crate::tools`).
fn to_wire_tools(tools: &[crate::types::Tool]) -> Vec<WireTool> {
    tools
        .iter()
        .map(|t| {
            let mut schema = t.schema.clone();
            if let Some(obj) = schema.as_object_mut() {
                let empty = obj
                    .get("properties")
                    .and_then(|p| p.as_object())
                    .map(|p| p.is_empty())
                    .unwrap_or(true);
                if empty {
                    obj.insert(
                        "properties".to_string(),
                        json!({"__noargs": {"type": "string", "description": "unused"}}),
                    );
                }
            }
            WireTool {
                kind: "function",
                function: WireFunction {
                    name: t.name.clone(),
                    description: t.description.clone(),
                    parameters: schema,
                },
            }
        })
        .collect()
}

#[derive(Debug, Deserialize)]
struct ChatCompletionChunk {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    delta: Delta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Delta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCallDelta>>,
}

#[derive(Debug, Deserialize)]
struct ToolCallDelta {
    index: usize,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<FunctionDelta>,
}

#[derive(Debug, Default, Deserialize)]
struct FunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    prompt_tokens: u64,
    completion_tokens: u64,
    #[serde(default)]
    prompt_tokens_details: Option<PromptTokensDetails>,
}

#[derive(Debug, Default, Deserialize)]
struct PromptTokensDetails {
    #[serde(default)]
    cached_tokens: u64,
}

fn map_finish_reason(reason: &str) -> StopReason {
    match reason {
        "stop" => StopReason::EndTurn,
        "tool_calls" | "function_call" => StopReason::ToolUse,
        "length" => StopReason::MaxTokens,
        "content_filter" => StopReason::ContentFilter,
        _ => StopReason::EndTurn,
    }
}

/// Process one SSE chunk, mutating `state` per the rules in §4.2.1. Returns
/// the finish reason once the provider sends one.
fn process_chunk(chunk: &ChatCompletionChunk, state: &StreamState) -> Option<StopReason> {
    let mut stop = None;
    for choice in &chunk.choices {
        if let Some(deltas) = &choice.delta.tool_calls {
            for d in deltas {
                state.ensure_slot(d.index, d.id.as_deref(), d.function.as_ref().and_then(|f| f.name.as_deref()));
                if let Some(f) = &d.function {
                    if let Some(args) = &f.arguments {
                        state.update_tool_call_at_index(d.index, args);
                    }
                }
            }
        }
        if let Some(reason) = &choice.finish_reason {
            stop = Some(map_finish_reason(reason));
        }
    }
    if let Some(usage) = &chunk.usage {
        state.set_token_usage(
            usage.prompt_tokens,
            usage.completion_tokens,
            usage
                .prompt_tokens_details
                .as_ref()
                .map(|d| d.cached_tokens)
                .unwrap_or(0),
        );
    }
    stop
}

#[async_trait]
impl ChatProvider for OpenAiProvider {
    async fn stream(
        &self,
        request: CompletionRequest,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<StreamEvent>> {
        request.validate()?;

        let base_url = resolve_base_url(&request.base_url, DEFAULT_BASE_URL);
        let (_, model) = request
            .model
            .split_once('/')
            .ok_or_else(|| ChatCoreError::Configuration("missing provider prefix".into()))?;

        let body = ChatCompletionRequest {
            model: model.to_string(),
            messages: to_wire_messages(&request.messages),
            stream: true,
            stream_options: StreamOptions { include_usage: true },
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            tools: to_wire_tools(&request.tools),
        };

        let mut req = self
            .client
            .post(format!("{base_url}/chat/completions"))
            .json(&body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        let (state, rx) = stream::channel(64);
        let client_future = req.send();

        tokio::spawn(async move {
            let response = tokio::select! {
                _ = cancel.cancelled() => {
                    state.emit_error("cancelled".to_string()).await;
                    return;
                }
                resp = client_future => resp,
            };

            let response = match response {
                Ok(r) => r,
                Err(e) => {
                    state.emit_error(format!("openai transport error: {e}")).await;
                    return;
                }
            };

            if !response.status().is_success() {
                let status = response.status();
                let text = response.text().await.unwrap_or_default();
                state
                    .emit_error(format!("openai http error {status}: {text}"))
                    .await;
                return;
            }

            let mut events = response.bytes_stream().eventsource();
            let mut final_stop = StopReason::EndTurn;
            let mut any_tool_calls = false;

            loop {
                let next = tokio::select! {
                    _ = cancel.cancelled() => {
                        state.emit_error("cancelled".to_string()).await;
                        return;
                    }
                    next = events.next() => next,
                };
                let Some(event) = next else { break };
                let event = match event {
                    Ok(e) => e,
                    Err(e) => {
                        state.emit_error(format!("openai stream error: {e}")).await;
                        return;
                    }
                };
                if event.data == "[DONE]" {
                    break;
                }
                let chunk: ChatCompletionChunk = match serde_json::from_str(&event.data) {
                    Ok(c) => c,
                    Err(e) => {
                        state
                            .emit_error(format!("openai malformed chunk: {e}"))
                            .await;
                        return;
                    }
                };

                for choice in &chunk.choices {
                    if let Some(reasoning) = &choice.delta.reasoning_content {
                        if !reasoning.is_empty() {
                            state.emit_reasoning(reasoning.clone()).await;
                        }
                    }
                    if let Some(content) = &choice.delta.content {
                        if !content.is_empty() {
                            state.emit_content(content.clone()).await;
                        }
                    }
                }
                if chunk.choices.iter().any(|c| c.delta.tool_calls.is_some()) {
                    any_tool_calls = true;
                }
                if let Some(stop) = process_chunk(&chunk, &state) {
                    final_stop = stop;
                }
            }

            if any_tool_calls && state.tool_call_count() > 0 && final_stop == StopReason::EndTurn {
                final_stop = StopReason::ToolUse;
            }
            state.complete(final_stop).await;
        });

        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_finish_reasons() {
        assert_eq!(map_finish_reason("stop"), StopReason::EndTurn);
        assert_eq!(map_finish_reason("tool_calls"), StopReason::ToolUse);
        assert_eq!(map_finish_reason("length"), StopReason::MaxTokens);
        assert_eq!(map_finish_reason("content_filter"), StopReason::ContentFilter);
        assert_eq!(map_finish_reason("anything_else"), StopReason::EndTurn);
    }

    #[test]
    fn zero_arg_tool_gets_dummy_property() {
        let tool = crate::types::Tool {
            name: "ping".to_string(),
            description: "ping".to_string(),
            schema: json!({"type": "object", "properties": {}}),
            kind: crate::types::ToolKind::Native,
            source: "native".to_string(),
        };
        let wire = to_wire_tools(std::slice::from_ref(&tool));
        assert!(wire[0].function.parameters["properties"]
            .get("__noargs")
            .is_some());
    }

    #[tokio::test]
    async fn tool_call_deltas_accumulate_overwrite_then_append() {
        let (state, _rx) = stream::channel(8);
        let chunk1: ChatCompletionChunk = serde_json::from_value(json!({
            "choices": [{"delta": {"tool_calls": [{"index": 0, "id": "call_1", "function": {"name": "get_weather", "arguments": "{\"a\":"}}]}}]
        }))
        .unwrap();
        let chunk2: ChatCompletionChunk = serde_json::from_value(json!({
            "choices": [{"delta": {"tool_calls": [{"index": 0, "function": {"arguments": "1}"}}]}, "finish_reason": "tool_calls"}]
        }))
        .unwrap();
        process_chunk(&chunk1, &state);
        let stop = process_chunk(&chunk2, &state);
        assert_eq!(stop, Some(StopReason::ToolUse));

        let calls = state.tool_calls_snapshot();
        assert_eq!(calls[0].arguments, "{\"a\":1}");
    }
}
