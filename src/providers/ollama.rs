//! Ollama streaming adapter (reset-on-update).
//!
//! Each streaming chunk carries the full current tool-call list rather than
//! an incremental delta; `done: true` marks the last chunk, which repeats
//! the full accumulated content and must not be re-emitted. This adapter
//! has no teacher counterpart — built directly from the reset-on-update
//! description, reusing `StreamState::reset_tool_calls` (added for this
//! purpose) instead of the append-based helpers the other three adapters use.

use crate::error::{ChatCoreError, Result};
use crate::providers::{http_client, resolve_base_url, ChatProvider};
use crate::stream::{self, StreamEvent, StreamState, ToolCallSlot};
use crate::types::{ChatMessage, CompletionRequest, Role, StopReason};
use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::AsyncBufReadExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::LinesStream;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;

const DEFAULT_BASE_URL: &str = "http://localhost:11434";

pub struct OllamaProvider {
    client: reqwest::Client,
}

impl OllamaProvider {
    pub fn new() -> Self {
        Self {
            client: http_client(std::time::Duration::from_secs(300)),
        }
    }
}

impl Default for OllamaProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<WireMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<WireTool>,
    think: bool,
    options: ChatOptions,
}

#[derive(Debug, Serialize)]
struct ChatOptions {
    temperature: f32,
    num_predict: u32,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: &'static str,
    content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<WireToolCall>>,
}

#[derive(Debug, Serialize)]
struct WireToolCall {
    function: WireFunctionCall,
}

#[derive(Debug, Serialize)]
struct WireFunctionCall {
    name: String,
    arguments: Value,
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
            content: m.content.clone(),
            tool_calls: if m.tool_calls.is_empty() {
                None
            } else {
                Some(
                    m.tool_calls
                        .iter()
                        .map(|tc| WireToolCall {
                            function: WireFunctionCall {
                                name: tc.name.clone(),
                                arguments: serde_json::from_str(&tc.arguments)
                                    .unwrap_or(Value::Null),
                            },
                        })
                        .collect(),
                )
            },
        })
        .collect()
}

#[derive(Debug, Deserialize)]
struct ChatChunk {
    message: ChunkMessage,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    prompt_eval_count: u64,
    #[serde(default)]
    eval_count: u64,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkMessage {
    #[serde(default)]
    content: String,
    #[serde(default)]
    thinking: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ChunkToolCall>>,
}

#[derive(Debug, Deserialize)]
struct ChunkToolCall {
    function: ChunkFunctionCall,
}

#[derive(Debug, Deserialize)]
struct ChunkFunctionCall {
    name: String,
    arguments: Value,
}

/// Process one chunk. `thinking_observed` tracks whether a thinking delta
/// has appeared yet this stream, so pre-thinking content (which some
/// models spuriously emit before the real thinking pass) is suppressed.
fn tool_call_slots(chunk: &ChatChunk) -> Vec<ToolCallSlot> {
    chunk
        .message
        .tool_calls
        .iter()
        .flatten()
        .enumerate()
        .map(|(i, tc)| ToolCallSlot {
            id: format!("call_{i}"),
            name: tc.function.name.clone(),
            arguments: tc.function.arguments.to_string(),
        })
        .collect()
}

#[async_trait]
impl ChatProvider for OllamaProvider {
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

        let body = ChatRequest {
            model: model.to_string(),
            messages: to_wire_messages(&request.messages),
            stream: true,
            tools: request
                .tools
                .iter()
                .map(|t| WireTool {
                    kind: "function",
                    function: WireFunction {
                        name: t.name.clone(),
                        description: t.description.clone(),
                        parameters: t.schema.clone(),
                    },
                })
                .collect(),
            think: crate::config::thinking_enabled(request.thinking_effort),
            options: ChatOptions {
                temperature: request.temperature,
                num_predict: request.max_tokens,
            },
        };

        let thinking_enabled = crate::config::thinking_enabled(request.thinking_effort);
        let req = self.client.post(format!("{base_url}/api/chat")).json(&body);
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
                    state.emit_error(format!("ollama transport error: {e}")).await;
                    return;
                }
            };
            if !response.status().is_success() {
                let status = response.status();
                let text = response.text().await.unwrap_or_default();
                state
                    .emit_error(format!("ollama http error {status}: {text}"))
                    .await;
                return;
            }

            let byte_stream = response
                .bytes_stream()
                .map(|r| r.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e)));
            let reader = StreamReader::new(byte_stream);
            let mut lines = LinesStream::new(reader.lines());

            let mut final_stop = StopReason::EndTurn;
            let mut thinking_observed = false;
            let mut input_tokens = 0u64;
            let mut output_tokens = 0u64;

            loop {
                let next = tokio::select! {
                    _ = cancel.cancelled() => {
                        state.emit_error("cancelled".to_string()).await;
                        return;
                    }
                    next = lines.next() => next,
                };
                let Some(line) = next else { break };
                let line = match line {
                    Ok(l) => l,
                    Err(e) => {
                        state.emit_error(format!("ollama stream error: {e}")).await;
                        return;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }
                let chunk: ChatChunk = match serde_json::from_str(&line) {
                    Ok(c) => c,
                    Err(e) => {
                        state.emit_error(format!("ollama malformed chunk: {e}")).await;
                        return;
                    }
                };

                if let Some(thinking) = &chunk.message.thinking {
                    if !thinking.is_empty() {
                        thinking_observed = true;
                        state.emit_reasoning(thinking.clone()).await;
                    }
                }

                // Thinking-enabled streams may emit content both before and
                // after the thinking pass; suppress the former. Non-thinking
                // streams pass content straight through.
                let suppress_pre_thinking = thinking_enabled && !thinking_observed;
                if !chunk.done && !chunk.message.content.is_empty() && !suppress_pre_thinking {
                    state.emit_content(chunk.message.content.clone()).await;
                }

                // A terminal `done` chunk often repeats `"tool_calls": []`
                // alongside the final usage counts; resetting on an empty
                // list here would wipe out the calls accumulated from an
                // earlier, non-empty chunk, so only whole-replace on a
                // genuinely populated list.
                if chunk.message.tool_calls.as_ref().is_some_and(|calls| !calls.is_empty()) {
                    state.reset_tool_calls(tool_call_slots(&chunk));
                }

                if chunk.done {
                    input_tokens = chunk.prompt_eval_count;
                    output_tokens = chunk.eval_count;
                    final_stop = if state.tool_call_count() > 0 {
                        StopReason::ToolUse
                    } else {
                        StopReason::EndTurn
                    };
                    break;
                }
            }

            state.set_token_usage(input_tokens, output_tokens, 0);
            state.complete(final_stop).await;
        });

        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn last_non_empty_tool_call_chunk_wins_over_later_empty_done() {
        let chunk_with_calls: ChatChunk = serde_json::from_value(json!({
            "message": {"content": "", "tool_calls": [{"function": {"name": "bash", "arguments": {"command": "ls"}}}]},
            "done": false
        }))
        .unwrap();
        let slots = tool_call_slots(&chunk_with_calls);
        assert_eq!(slots.len(), 1);
        assert_eq!(slots[0].name, "bash");
    }

    /// Regression: a terminal `done` chunk carrying `"tool_calls": []`
    /// deserializes to `Some(vec![])`, not `None` — the reset guard must
    /// check emptiness, not just presence, or it wipes the accumulator.
    #[test]
    fn empty_tool_calls_list_on_done_chunk_does_not_reset_the_accumulator() {
        let (state, _rx) = crate::stream::channel(8);
        state.reset_tool_calls(vec![crate::stream::ToolCallSlot {
            id: "call_0".to_string(),
            name: "bash".to_string(),
            arguments: "{}".to_string(),
        }]);

        let done_chunk: ChatChunk = serde_json::from_value(json!({
            "message": {"content": "", "tool_calls": []},
            "done": true
        }))
        .unwrap();
        assert!(done_chunk.message.tool_calls.is_some());

        if done_chunk.message.tool_calls.as_ref().is_some_and(|calls| !calls.is_empty()) {
            state.reset_tool_calls(tool_call_slots(&done_chunk));
        }

        assert_eq!(state.tool_call_count(), 1);
    }
}
