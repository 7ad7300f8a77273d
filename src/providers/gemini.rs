//! Gemini streaming adapter (whole-chunk).
//!
//! Each chunk is a complete candidate carrying `parts[]`; there is no
//! incremental delta to accumulate. Thought signatures are opaque bytes the
//! provider sends base64-free; this adapter base64-encodes them into
//! `gemini_thought_signatures[tool_call_id]` for resubmission, and forces
//! `stop_reason = tool_use` whenever any tool calls were seen, since Gemini's
//! own `finishReason` does not reliably signal it.

use crate::error::{ChatCoreError, Result};
use crate::providers::{http_client, resolve_base_url, ChatProvider};
use crate::stream::{self, StreamEvent, StreamState};
use crate::types::{ChatMessage, CompletionRequest, Role, StopReason};
use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

pub struct GeminiProvider {
    client: reqwest::Client,
    api_key: String,
}

impl GeminiProvider {
    pub fn new(api_key: String) -> Self {
        Self {
            client: http_client(std::time::Duration::from_secs(120)),
            api_key,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest {
    contents: Vec<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<GeminiContent>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<GeminiTool>,
    generation_config: GeminiGenerationConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiGenerationConfig {
    temperature: f32,
    max_output_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    thinking_config: Option<GeminiThinkingConfig>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiThinkingConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    thinking_budget: Option<u32>,
    include_thoughts: bool,
}

#[derive(Debug, Serialize)]
struct GeminiContent {
    role: &'static str,
    parts: Vec<GeminiPartOut>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiPartOut {
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    function_call: Option<GeminiFunctionCall>,
    #[serde(skip_serializing_if = "Option::is_none")]
    function_response: Option<GeminiFunctionResponse>,
    #[serde(skip_serializing_if = "Option::is_none")]
    thought_signature: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct GeminiFunctionCall {
    name: String,
    args: Value,
}

#[derive(Debug, Serialize)]
struct GeminiFunctionResponse {
    name: String,
    response: Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiTool {
    function_declarations: Vec<GeminiFunctionDeclaration>,
}

#[derive(Debug, Serialize)]
struct GeminiFunctionDeclaration {
    name: String,
    description: String,
    parameters: Value,
}

fn text_part(text: impl Into<String>) -> GeminiPartOut {
    GeminiPartOut {
        text: Some(text.into()),
        function_call: None,
        function_response: None,
        thought_signature: None,
    }
}

fn to_gemini_contents(messages: &[ChatMessage]) -> Vec<GeminiContent> {
    messages
        .iter()
        .filter(|m| m.role != Role::System)
        .map(|m| {
            let role = match m.role {
                Role::User | Role::Tool => "user",
                Role::Assistant => "model",
                Role::System => unreachable!(),
            };

            let mut parts = Vec::new();
            if m.role == Role::Tool {
                parts.push(GeminiPartOut {
                    text: None,
                    function_call: None,
                    function_response: Some(GeminiFunctionResponse {
                        name: m.tool_name.clone().unwrap_or_default(),
                        response: json!({"result": m.content}),
                    }),
                    thought_signature: None,
                });
            } else {
                if !m.content.is_empty() {
                    parts.push(text_part(m.content.clone()));
                }
                let signatures = m.gemini_thought_signatures();
                for tc in &m.tool_calls {
                    let args: Value = serde_json::from_str(&tc.arguments).unwrap_or(json!({}));
                    parts.push(GeminiPartOut {
                        text: None,
                        function_call: Some(GeminiFunctionCall {
                            name: tc.name.clone(),
                            args,
                        }),
                        function_response: None,
                        thought_signature: signatures.get(&tc.id).cloned(),
                    });
                }
            }

            GeminiContent { role, parts }
        })
        .collect()
}

fn system_instruction(messages: &[ChatMessage], fallback: &Option<String>) -> Option<GeminiContent> {
    let text = messages
        .iter()
        .find(|m| m.role == Role::System)
        .map(|m| m.content.clone())
        .or_else(|| fallback.clone())?;
    Some(GeminiContent {
        role: "user",
        parts: vec![text_part(text)],
    })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
    #[serde(default)]
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiCandidate {
    content: GeminiContentIn,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeminiContentIn {
    #[serde(default)]
    parts: Vec<GeminiPartIn>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiPartIn {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    thought: bool,
    #[serde(default)]
    function_call: Option<GeminiFunctionCall>,
    #[serde(default)]
    thought_signature: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: u64,
    #[serde(default)]
    candidates_token_count: u64,
    #[serde(default)]
    cached_content_token_count: u64,
}

fn map_finish_reason(reason: &str) -> StopReason {
    match reason {
        "STOP" => StopReason::EndTurn,
        "MAX_TOKENS" => StopReason::MaxTokens,
        "SAFETY" | "RECITATION" | "BLOCKLIST" | "PROHIBITED_CONTENT" | "SPII" => {
            StopReason::ContentFilter
        }
        "MALFORMED_FUNCTION_CALL" => StopReason::Error,
        _ => StopReason::EndTurn,
    }
}

fn next_call_id(counter: &AtomicU64) -> String {
    format!("gemini-{}", counter.fetch_add(1, Ordering::SeqCst))
}

/// Process one whole-candidate chunk, mutating `state` per §4.2.3. Returns
/// the mapped finish reason when the candidate carries one.
async fn process_candidate(
    candidate: &GeminiCandidate,
    state: &StreamState,
    signatures: &mut HashMap<String, String>,
    counter: &AtomicU64,
) -> Option<StopReason> {
    for part in &candidate.content.parts {
        if let Some(text) = &part.text {
            if !text.is_empty() {
                if part.thought {
                    state.emit_reasoning(text.clone()).await;
                } else {
                    state.emit_content(text.clone()).await;
                }
            }
        }
        if let Some(call) = &part.function_call {
            let id = next_call_id(counter);
            let slot = state.append_tool_call(id.clone(), call.name.clone());
            state.update_tool_call_at_index(slot, &call.args.to_string());
            if let Some(sig) = &part.thought_signature {
                let encoded = base64::engine::general_purpose::STANDARD.encode(sig.as_bytes());
                signatures.insert(id, encoded);
            }
        }
    }
    candidate.finish_reason.as_deref().map(map_finish_reason)
}

#[async_trait]
impl ChatProvider for GeminiProvider {
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

        let thinking_budget = crate::config::thinking_budget(request.thinking_effort);
        let thinking_config = if crate::config::thinking_enabled(request.thinking_effort) {
            Some(GeminiThinkingConfig {
                thinking_budget,
                include_thoughts: true,
            })
        } else {
            None
        };

        let body = GenerateContentRequest {
            contents: to_gemini_contents(&request.messages),
            system_instruction: system_instruction(&request.messages, &request.system_prompt),
            tools: if request.tools.is_empty() {
                vec![]
            } else {
                vec![GeminiTool {
                    function_declarations: request
                        .tools
                        .iter()
                        .map(|t| GeminiFunctionDeclaration {
                            name: t.name.clone(),
                            description: t.description.clone(),
                            parameters: t.schema.clone(),
                        })
                        .collect(),
                }]
            },
            generation_config: GeminiGenerationConfig {
                temperature: request.temperature,
                max_output_tokens: request.max_tokens,
                thinking_config,
            },
        };

        let url = format!(
            "{base_url}/models/{model}:streamGenerateContent?alt=sse&key={}",
            self.api_key
        );
        let req = self.client.post(url).json(&body);

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
                    state.emit_error(format!("gemini transport error: {e}")).await;
                    return;
                }
            };
            if !response.status().is_success() {
                let status = response.status();
                let text = response.text().await.unwrap_or_default();
                state
                    .emit_error(format!("gemini http error {status}: {text}"))
                    .await;
                return;
            }

            use eventsource_stream::Eventsource;
            use futures::StreamExt;

            let mut events = response.bytes_stream().eventsource();
            let mut final_stop = StopReason::EndTurn;
            let mut signatures = HashMap::new();
            let counter = AtomicU64::new(0);
            let mut input_tokens = 0u64;
            let mut output_tokens = 0u64;
            let mut cached_tokens = 0u64;

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
                        state.emit_error(format!("gemini stream error: {e}")).await;
                        return;
                    }
                };
                let chunk: GenerateContentResponse = match serde_json::from_str(&event.data) {
                    Ok(c) => c,
                    Err(e) => {
                        state.emit_error(format!("gemini malformed chunk: {e}")).await;
                        return;
                    }
                };
                for candidate in &chunk.candidates {
                    if let Some(stop) =
                        process_candidate(candidate, &state, &mut signatures, &counter).await
                    {
                        final_stop = stop;
                    }
                }
                if let Some(usage) = &chunk.usage_metadata {
                    input_tokens = usage.prompt_token_count;
                    output_tokens = usage.candidates_token_count;
                    cached_tokens = usage.cached_content_token_count;
                }
            }

            if !signatures.is_empty() {
                state.set_metadata(
                    crate::types::META_GEMINI_THOUGHT_SIGNATURES,
                    serde_json::json!(signatures),
                );
            }
            // Gemini's finishReason does not reliably signal tool_use.
            if state.tool_call_count() > 0 && final_stop != StopReason::Error {
                final_stop = StopReason::ToolUse;
            }
            state.set_token_usage(input_tokens, output_tokens, cached_tokens);
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
        assert_eq!(map_finish_reason("STOP"), StopReason::EndTurn);
        assert_eq!(map_finish_reason("MAX_TOKENS"), StopReason::MaxTokens);
        assert_eq!(map_finish_reason("SAFETY"), StopReason::ContentFilter);
        assert_eq!(
            map_finish_reason("MALFORMED_FUNCTION_CALL"),
            StopReason::Error
        );
    }

    #[tokio::test]
    async fn thought_signature_round_trips_through_base64() {
        let (state, _rx) = stream::channel(8);
        let counter = AtomicU64::new(0);
        let mut signatures = HashMap::new();

        let candidate: GeminiCandidate = serde_json::from_value(json!({
            "content": {"parts": [{"functionCall": {"name": "get_weather", "args": {"city": "Tokyo"}}, "thoughtSignature": "raw-sig"}]},
            "finishReason": "STOP"
        }))
        .unwrap();

        process_candidate(&candidate, &state, &mut signatures, &counter).await;

        let calls = state.tool_calls_snapshot();
        let encoded = signatures.get(&calls[0].id).unwrap();
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .unwrap();
        assert_eq!(decoded, b"raw-sig");
    }

    #[tokio::test]
    async fn tool_calls_force_stop_reason_to_tool_use() {
        let (state, _rx) = stream::channel(8);
        let counter = AtomicU64::new(0);
        let mut signatures = HashMap::new();
        let candidate: GeminiCandidate = serde_json::from_value(json!({
            "content": {"parts": [{"functionCall": {"name": "bash", "args": {}}}]},
            "finishReason": "STOP"
        }))
        .unwrap();
        let stop = process_candidate(&candidate, &state, &mut signatures, &counter).await;
        assert_eq!(stop, Some(StopReason::EndTurn));
        // forcing to tool_use happens as a post-process step in `stream()`,
        // exercised here directly against the accumulator it reads.
        assert!(state.tool_call_count() > 0);
    }
}
