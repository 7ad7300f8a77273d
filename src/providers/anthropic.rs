//! Anthropic streaming adapter (event-based).
//!
//! Events: `message_start`, `content_block_start`, `content_block_delta`,
//! `content_block_stop`, `message_delta`, `message_stop`. Thinking blocks
//! are sealed at `content_block_stop` and attached to the final message's
//! `anthropic_thinking_blocks` metadata for verbatim resubmission.

use crate::error::{ChatCoreError, Result};
use crate::providers::{http_client, resolve_base_url, ChatProvider};
use crate::stream::{self, StreamEvent, StreamState};
use crate::types::{AnthropicThinkingBlock, ChatMessage, CompletionRequest, Role, StopReason};
use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1";
const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicProvider {
    client: reqwest::Client,
    api_key: String,
}

impl AnthropicProvider {
    pub fn new(api_key: String) -> Self {
        Self {
            client: http_client(std::time::Duration::from_secs(120)),
            api_key,
        }
    }
}

#[derive(Debug, Serialize)]
struct CreateMessageRequest {
    model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<WireMessage>,
    max_tokens: u32,
    temperature: f32,
    stream: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<WireTool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    thinking: Option<ThinkingConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<ToolChoice>,
}

/// Name of the synthetic tool used to force structured output. Anthropic has
/// no dedicated "JSON mode"; forcing a tool call is the documented
/// workaround, so the caller's `response_schema` is wrapped as this tool's
/// sole argument and extracted back out of the call once it arrives.
const STRUCTURED_OUTPUT_TOOL: &str = "extract_structured_data";

#[derive(Debug, Serialize)]
struct ToolChoice {
    #[serde(rename = "type")]
    kind: &'static str,
    name: String,
}

#[derive(Debug, Serialize)]
struct ThinkingConfig {
    #[serde(rename = "type")]
    kind: &'static str,
    budget_tokens: u32,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: &'static str,
    content: Vec<WireBlock>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireBlock {
    Thinking { thinking: String, signature: String },
    Text { text: String },
    ToolUse { id: String, name: String, input: Value },
    ToolResult { tool_use_id: String, content: String },
}

#[derive(Debug, Serialize)]
struct WireTool {
    name: String,
    description: String,
    input_schema: Value,
}

fn to_wire_messages(messages: &[ChatMessage]) -> Vec<WireMessage> {
    messages
        .iter()
        .filter(|m| m.role != Role::System)
        .map(|m| {
            let mut content = Vec::new();

            // Resubmission rule: thinking blocks precede content/tool_use blocks.
            for block in m.anthropic_thinking_blocks() {
                content.push(WireBlock::Thinking {
                    thinking: block.thinking,
                    signature: block.signature,
                });
            }

            match m.role {
                Role::Tool => {
                    content.push(WireBlock::ToolResult {
                        tool_use_id: m.tool_call_id.clone().unwrap_or_default(),
                        content: m.content.clone(),
                    });
                }
                _ => {
                    if !m.content.is_empty() {
                        content.push(WireBlock::Text {
                            text: m.content.clone(),
                        });
                    }
                    for tc in &m.tool_calls {
                        let input: Value =
                            serde_json::from_str(&tc.arguments).unwrap_or(json!({}));
                        content.push(WireBlock::ToolUse {
                            id: tc.id.clone(),
                            name: tc.name.clone(),
                            input,
                        });
                    }
                }
            }

            let role = match m.role {
                Role::Tool | Role::User => "user",
                Role::Assistant => "assistant",
                Role::System => unreachable!("system messages are filtered above"),
            };

            WireMessage { role, content }
        })
        .collect()
}

fn system_prompt(messages: &[ChatMessage]) -> Option<String> {
    messages
        .iter()
        .find(|m| m.role == Role::System)
        .map(|m| m.content.clone())
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum SseEvent {
    #[serde(rename = "message_start")]
    MessageStart { message: MessageStart },
    #[serde(rename = "content_block_start")]
    ContentBlockStart {
        index: usize,
        content_block: ContentBlockStart,
    },
    #[serde(rename = "content_block_delta")]
    ContentBlockDelta { index: usize, delta: ContentDelta },
    #[serde(rename = "content_block_stop")]
    ContentBlockStop { index: usize },
    #[serde(rename = "message_delta")]
    MessageDelta { delta: MessageDeltaContent, usage: AnthropicUsageDelta },
    #[serde(rename = "message_stop")]
    MessageStop,
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct MessageStart {
    usage: AnthropicUsage,
}

#[derive(Debug, Deserialize)]
struct AnthropicUsage {
    input_tokens: u64,
    #[serde(default)]
    cache_read_input_tokens: u64,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlockStart {
    Text { text: String },
    Thinking { thinking: String },
    ToolUse { id: String, name: String },
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentDelta {
    TextDelta { text: String },
    ThinkingDelta { thinking: String },
    SignatureDelta { signature: String },
    InputJsonDelta { partial_json: String },
}

#[derive(Debug, Deserialize)]
struct MessageDeltaContent {
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AnthropicUsageDelta {
    #[serde(default)]
    output_tokens: u64,
}

fn map_stop_reason(reason: &str) -> StopReason {
    match reason {
        "end_turn" | "stop_sequence" => StopReason::EndTurn,
        "tool_use" => StopReason::ToolUse,
        "max_tokens" => StopReason::MaxTokens,
        "refusal" => StopReason::ContentFilter,
        _ => StopReason::EndTurn,
    }
}

/// In-stream scratch: the thinking block currently being accumulated (text
/// so far, sealed with its signature at `content_block_stop`) and which
/// tool-call slot each content-block index maps to.
#[derive(Default)]
struct ScratchState {
    current_thinking: Option<(String, String)>,
    thinking_blocks: Vec<AnthropicThinkingBlock>,
    block_index_to_slot: std::collections::HashMap<usize, usize>,
}

fn handle_event(event: SseEvent, state: &StreamState, scratch: &mut ScratchState) -> EventOutcome {
    match event {
        SseEvent::MessageStart { message } => {
            EventOutcome::InputUsage(message.usage.input_tokens, message.usage.cache_read_input_tokens)
        }
        SseEvent::ContentBlockStart { index, content_block } => {
            match content_block {
                ContentBlockStart::Thinking { thinking } => {
                    scratch.current_thinking = Some((thinking, String::new()));
                }
                ContentBlockStart::ToolUse { id, name } => {
                    let slot = state.append_tool_call(id, name);
                    scratch.block_index_to_slot.insert(index, slot);
                }
                ContentBlockStart::Text { text } => {
                    if !text.is_empty() {
                        return EventOutcome::Content(text);
                    }
                }
            }
            EventOutcome::Continue
        }
        SseEvent::ContentBlockDelta { index, delta } => match delta {
            ContentDelta::TextDelta { text } => EventOutcome::Content(text),
            ContentDelta::ThinkingDelta { thinking } => {
                if let Some((text, _)) = &mut scratch.current_thinking {
                    text.push_str(&thinking);
                } else {
                    scratch.current_thinking = Some((thinking.clone(), String::new()));
                }
                EventOutcome::Reasoning(thinking)
            }
            ContentDelta::SignatureDelta { signature } => {
                if let Some((_, sig)) = &mut scratch.current_thinking {
                    sig.push_str(&signature);
                }
                EventOutcome::Continue
            }
            ContentDelta::InputJsonDelta { partial_json } => {
                if let Some(&slot) = scratch.block_index_to_slot.get(&index) {
                    state.update_tool_call_at_index(slot, &partial_json);
                }
                EventOutcome::Continue
            }
        },
        SseEvent::ContentBlockStop { .. } => {
            if let Some((thinking, signature)) = scratch.current_thinking.take() {
                scratch.thinking_blocks.push(AnthropicThinkingBlock {
                    block_type: "thinking".to_string(),
                    thinking,
                    signature,
                });
            }
            EventOutcome::Continue
        }
        SseEvent::MessageDelta { delta, usage } => {
            let stop = delta.stop_reason.as_deref().map(map_stop_reason);
            EventOutcome::Stop(stop, usage.output_tokens)
        }
        SseEvent::MessageStop | SseEvent::Other => EventOutcome::Continue,
    }
}

/// Pulls `arguments.data` out of the forced `extract_structured_data` call,
/// if one is present among `calls`. Returns `None` if the model somehow
/// didn't make the call or omitted `data`, leaving the caller to fall back
/// to surfacing the raw tool call.
fn extract_structured_output(calls: &[crate::types::ToolCall]) -> Option<Value> {
    calls
        .iter()
        .find(|call| call.name == STRUCTURED_OUTPUT_TOOL)
        .and_then(|call| serde_json::from_str::<Value>(&call.arguments).ok())
        .and_then(|args| args.get("data").cloned())
}

enum EventOutcome {
    Continue,
    Content(String),
    Reasoning(String),
    InputUsage(u64, u64),
    Stop(Option<StopReason>, u64),
}

#[async_trait]
impl ChatProvider for AnthropicProvider {
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

        let thinking = crate::config::thinking_budget(request.thinking_effort).map(|budget| ThinkingConfig {
            kind: "enabled",
            budget_tokens: budget,
        });

        let mut tools: Vec<WireTool> = request
            .tools
            .iter()
            .map(|t| WireTool {
                name: t.name.clone(),
                description: t.description.clone(),
                input_schema: t.schema.clone(),
            })
            .collect();

        let mut tool_choice = None;
        if let Some(schema) = &request.response_schema {
            tools.push(WireTool {
                name: STRUCTURED_OUTPUT_TOOL.to_string(),
                description: "Return the extracted data matching the required schema.".to_string(),
                input_schema: json!({
                    "type": "object",
                    "properties": { "data": schema },
                    "required": ["data"],
                }),
            });
            tool_choice = Some(ToolChoice {
                kind: "tool",
                name: STRUCTURED_OUTPUT_TOOL.to_string(),
            });
        }
        let wants_structured_output = request.response_schema.is_some();

        let body = CreateMessageRequest {
            model: model.to_string(),
            system: system_prompt(&request.messages).or(request.system_prompt.clone()),
            messages: to_wire_messages(&request.messages),
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            stream: true,
            tools,
            thinking,
            tool_choice,
        };

        let req = self
            .client
            .post(format!("{base_url}/messages"))
            .header("x-api-key", self.api_key.clone())
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body);

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
                    state.emit_error(format!("anthropic transport error: {e}")).await;
                    return;
                }
            };
            if !response.status().is_success() {
                let status = response.status();
                let text = response.text().await.unwrap_or_default();
                state
                    .emit_error(format!("anthropic http error {status}: {text}"))
                    .await;
                return;
            }

            let mut events = response.bytes_stream().eventsource();
            let mut scratch = ScratchState::default();
            let mut final_stop = StopReason::EndTurn;
            let mut input_tokens = 0u64;
            let mut cached_tokens = 0u64;
            let mut output_tokens = 0u64;

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
                        state.emit_error(format!("anthropic stream error: {e}")).await;
                        return;
                    }
                };
                if event.data.is_empty() {
                    continue;
                }
                let parsed: SseEvent = match serde_json::from_str(&event.data) {
                    Ok(p) => p,
                    Err(_) => SseEvent::Other,
                };
                match handle_event(parsed, &state, &mut scratch) {
                    EventOutcome::Continue => {}
                    EventOutcome::Content(text) => state.emit_content(text).await,
                    EventOutcome::Reasoning(text) => state.emit_reasoning(text).await,
                    EventOutcome::InputUsage(input, cached) => {
                        input_tokens = input;
                        cached_tokens = cached;
                    }
                    EventOutcome::Stop(stop, out_tokens) => {
                        if let Some(s) = stop {
                            final_stop = s;
                        }
                        output_tokens = out_tokens;
                    }
                }
            }

            if !scratch.thinking_blocks.is_empty() {
                state.set_metadata(
                    crate::types::META_ANTHROPIC_THINKING_BLOCKS,
                    serde_json::json!(scratch.thinking_blocks),
                );
            }
            state.set_token_usage(input_tokens, output_tokens, cached_tokens);

            if wants_structured_output {
                if let Some(data) = extract_structured_output(&state.tool_calls_snapshot()) {
                    let content = serde_json::to_string(&data).unwrap_or_default();
                    state.complete_with_content(content, StopReason::EndTurn).await;
                    return;
                }
            }

            if state.tool_call_count() > 0 && final_stop == StopReason::EndTurn {
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
    fn maps_stop_reasons_including_refusal() {
        assert_eq!(map_stop_reason("end_turn"), StopReason::EndTurn);
        assert_eq!(map_stop_reason("tool_use"), StopReason::ToolUse);
        assert_eq!(map_stop_reason("max_tokens"), StopReason::MaxTokens);
        assert_eq!(map_stop_reason("refusal"), StopReason::ContentFilter);
    }

    #[test]
    fn thinking_block_is_sealed_with_its_signature() {
        let (state, _rx) = stream::channel(8);
        let mut scratch = ScratchState::default();

        handle_event(
            SseEvent::ContentBlockStart {
                index: 0,
                content_block: ContentBlockStart::Thinking {
                    thinking: String::new(),
                },
            },
            &state,
            &mut scratch,
        );
        handle_event(
            SseEvent::ContentBlockDelta {
                index: 0,
                delta: ContentDelta::ThinkingDelta {
                    thinking: "Let me consider.".to_string(),
                },
            },
            &state,
            &mut scratch,
        );
        handle_event(
            SseEvent::ContentBlockDelta {
                index: 0,
                delta: ContentDelta::SignatureDelta {
                    signature: "sig-xyz".to_string(),
                },
            },
            &state,
            &mut scratch,
        );
        handle_event(SseEvent::ContentBlockStop { index: 0 }, &state, &mut scratch);

        assert_eq!(scratch.thinking_blocks.len(), 1);
        assert_eq!(scratch.thinking_blocks[0].signature, "sig-xyz");
        assert_eq!(scratch.thinking_blocks[0].thinking, "Let me consider.");
    }

    #[test]
    fn extracts_data_from_the_forced_structured_output_call() {
        let calls = vec![crate::types::ToolCall {
            id: "call_1".to_string(),
            name: STRUCTURED_OUTPUT_TOOL.to_string(),
            arguments: r#"{"data":{"x":7}}"#.to_string(),
        }];
        let data = extract_structured_output(&calls).unwrap();
        assert_eq!(serde_json::to_string(&data).unwrap(), r#"{"x":7}"#);
    }

    #[test]
    fn no_structured_output_call_yields_none() {
        let calls = vec![crate::types::ToolCall {
            id: "call_1".to_string(),
            name: "some_other_tool".to_string(),
            arguments: "{}".to_string(),
        }];
        assert!(extract_structured_output(&calls).is_none());
    }

    #[test]
    fn resubmission_places_thinking_blocks_before_text() {
        let mut msg = ChatMessage::assistant("42");
        msg.set_anthropic_thinking_blocks(&[AnthropicThinkingBlock {
            block_type: "thinking".to_string(),
            thinking: "Let me consider.".to_string(),
            signature: "sig-xyz".to_string(),
        }]);
        let wire = to_wire_messages(std::slice::from_ref(&msg));
        match &wire[0].content[0] {
            WireBlock::Thinking { signature, .. } => assert_eq!(signature, "sig-xyz"),
            _ => panic!("expected thinking block first"),
        }
    }
}
