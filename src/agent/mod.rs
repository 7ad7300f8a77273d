//! The agent loop: stream a completion, dispatch tool calls, repeat until
//! a terminal stop reason or the iteration cap. No teacher module covers
//! this directly — the per-event callback shape is grounded in the
//! `StreamEvent` design note (capability polymorphism over inheritance)
//! and the parallel dispatch in `agent::parallel`.

pub mod parallel;

pub use parallel::{execute_parallel, BeforeToolHook, DefaultContext};

use crate::dispatcher;
use crate::error::ChatCoreError;
use crate::providers::ChatProvider;
use crate::stream::StreamEvent;
use crate::tools::ToolRegistry;
use crate::types::{ChatMessage, CompletionRequest, StopReason, ToolCall};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Observer hooks the caller wires in for live feedback. Every method has a
/// no-op default so a caller only implements what it needs.
#[async_trait]
pub trait AgentHooks: Send + Sync {
    async fn on_reasoning(&self, _text: &str) {}
    async fn on_content(&self, _text: &str) {}
    async fn on_tool_start(&self, _call: &ToolCall) {}
    async fn on_tool_end(&self, _result: &ChatMessage) {}
    async fn on_complete(&self, _message: &ChatMessage) {}
    async fn on_error(&self, _message: &str) {}
}

pub struct NoopHooks;
#[async_trait]
impl AgentHooks for NoopHooks {}

#[derive(Debug, Clone)]
pub struct AgentOutcome {
    pub final_message: ChatMessage,
    pub all_generated_messages: Vec<ChatMessage>,
    pub iteration_count: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error(transparent)]
    Core(#[from] ChatCoreError),
    /// `max_iterations` was reached without a terminal stop reason. Carries
    /// everything the loop produced so the caller can still persist it.
    #[error("iteration cap of {limit} reached without a terminal stop reason")]
    IterationCap { limit: usize, partial: Box<AgentOutcome> },
}

/// Where each iteration's stream comes from: the model-string dispatcher
/// for normal use, or a directly-injected provider (tests, or a caller
/// that already resolved its own credentials).
enum StreamSource {
    Dispatch { app_prefix: String },
    Provider(Arc<dyn ChatProvider>),
}

pub struct AgentLoop {
    registry: Arc<ToolRegistry>,
    hooks: Arc<dyn AgentHooks>,
    before_tool: Arc<dyn BeforeToolHook>,
    source: StreamSource,
}

impl AgentLoop {
    pub fn new(registry: Arc<ToolRegistry>, app_prefix: impl Into<String>) -> Self {
        Self {
            registry,
            hooks: Arc::new(NoopHooks),
            before_tool: Arc::new(DefaultContext),
            source: StreamSource::Dispatch {
                app_prefix: app_prefix.into(),
            },
        }
    }

    pub fn with_provider(registry: Arc<ToolRegistry>, provider: Arc<dyn ChatProvider>) -> Self {
        Self {
            registry,
            hooks: Arc::new(NoopHooks),
            before_tool: Arc::new(DefaultContext),
            source: StreamSource::Provider(provider),
        }
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn AgentHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_before_tool(mut self, before_tool: Arc<dyn BeforeToolHook>) -> Self {
        self.before_tool = before_tool;
        self
    }

    async fn open_stream(
        &self,
        request: CompletionRequest,
        cancel: CancellationToken,
    ) -> crate::error::Result<mpsc::Receiver<StreamEvent>> {
        match &self.source {
            StreamSource::Dispatch { app_prefix } => {
                dispatcher::dispatch(request, app_prefix, cancel).await
            }
            StreamSource::Provider(provider) => provider.stream(request, cancel).await,
        }
    }

    pub async fn run(
        &self,
        request: CompletionRequest,
        cancel: CancellationToken,
    ) -> Result<AgentOutcome, AgentError> {
        request.validate()?;

        let mut messages = request.messages.clone();
        let mut all_generated = Vec::new();

        for iteration in 1..=request.max_iterations {
            if cancel.is_cancelled() {
                return Err(ChatCoreError::Cancelled.into());
            }

            let mut iter_request = request.clone();
            iter_request.messages = messages.clone();
            iter_request.tools = self.registry.get_tools_for_llm();

            let mut rx = self.open_stream(iter_request, cancel.clone()).await?;

            let mut assistant_message = None;
            while let Some(event) = rx.recv().await {
                match event {
                    StreamEvent::Reasoning(text) => self.hooks.on_reasoning(&text).await,
                    StreamEvent::Content(text) => self.hooks.on_content(&text).await,
                    StreamEvent::ToolCall(call) => self.hooks.on_tool_start(&call).await,
                    StreamEvent::Error(message) => {
                        self.hooks.on_error(&message).await;
                        return Err(ChatCoreError::Protocol(message).into());
                    }
                    StreamEvent::Complete(message) => {
                        assistant_message = Some(message);
                    }
                }
            }

            let assistant_message = assistant_message.ok_or_else(|| {
                ChatCoreError::Protocol("stream closed without a complete event".to_string())
            })?;
            self.hooks.on_complete(&assistant_message).await;
            messages.push(assistant_message.clone());
            all_generated.push(assistant_message.clone());

            match assistant_message.stop_reason {
                Some(StopReason::EndTurn) | Some(StopReason::MaxTokens) | None => {
                    return Ok(AgentOutcome {
                        final_message: assistant_message,
                        all_generated_messages: all_generated,
                        iteration_count: iteration,
                    });
                }
                Some(StopReason::ContentFilter) => {
                    self.hooks.on_error("blocked by content filter").await;
                    return Err(ChatCoreError::Policy.into());
                }
                Some(StopReason::Error) => {
                    self.hooks.on_error("malformed output").await;
                    return Err(ChatCoreError::ModelOutput.into());
                }
                Some(StopReason::ToolUse) => {
                    if assistant_message.tool_calls.is_empty() {
                        return Ok(AgentOutcome {
                            final_message: assistant_message,
                            all_generated_messages: all_generated,
                            iteration_count: iteration,
                        });
                    }

                    let results = execute_parallel(
                        &assistant_message.tool_calls,
                        Arc::clone(&self.registry),
                        Arc::clone(&self.before_tool),
                        request.tool_timeout,
                        request.max_parallel,
                        cancel.clone(),
                    )
                    .await;

                    for result in &results {
                        self.hooks.on_tool_end(result).await;
                    }
                    messages.extend(results.clone());
                    all_generated.extend(results);
                }
            }
        }

        let last = messages
            .last()
            .cloned()
            .unwrap_or_else(|| ChatMessage::assistant(""));
        crate::logger::log(format!(
            "agent loop: iteration cap of {} reached for model {}",
            request.max_iterations, request.model
        ));
        Err(AgentError::IterationCap {
            limit: request.max_iterations,
            partial: Box::new(AgentOutcome {
                final_message: last,
                all_generated_messages: all_generated,
                iteration_count: request.max_iterations,
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Always calls the "echo" tool on the first turn, then ends on the
    /// second — exercises the tool_use -> end_turn dispatch path end to end.
    struct ScriptedProvider {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ChatProvider for ScriptedProvider {
        async fn stream(
            &self,
            _request: CompletionRequest,
            _cancel: CancellationToken,
        ) -> crate::error::Result<mpsc::Receiver<StreamEvent>> {
            let turn = self.calls.fetch_add(1, Ordering::SeqCst);
            let (state, rx) = stream::channel(8);
            if turn == 0 {
                state.append_tool_call("call_1".to_string(), "echo".to_string());
                state.update_tool_call_arguments(0, r#"{"text":"hi"}"#);
                state.complete(StopReason::ToolUse).await;
            } else {
                state.emit_content("done".to_string()).await;
                state.complete_with_content("done".to_string(), StopReason::EndTurn).await;
            }
            Ok(rx)
        }
    }

    struct EchoTool;
    #[async_trait]
    impl crate::tools::NativeTool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "echoes text back"
        }
        fn schema(&self) -> serde_json::Value {
            serde_json::json!({"type": "object", "properties": {"text": {"type": "string"}}})
        }
        async fn execute(
            &self,
            args: serde_json::Value,
            _ctx: serde_json::Value,
            _cancel: CancellationToken,
        ) -> Result<String, String> {
            Ok(args.get("text").and_then(|v| v.as_str()).unwrap_or("").to_string())
        }
    }

    #[tokio::test]
    async fn tool_use_then_end_turn_runs_two_iterations() {
        let registry = Arc::new(ToolRegistry::new().register_native(EchoTool));
        let provider = Arc::new(ScriptedProvider { calls: AtomicUsize::new(0) });
        let agent = AgentLoop::with_provider(registry, provider);

        let request = CompletionRequest::new("openai/gpt-5", vec![ChatMessage::user("hi")]);
        let outcome = agent.run(request, CancellationToken::new()).await.unwrap();

        assert_eq!(outcome.iteration_count, 2);
        assert_eq!(outcome.final_message.content, "done");
        // one assistant message per turn, plus one tool-result message
        assert_eq!(outcome.all_generated_messages.len(), 3);
    }

    #[tokio::test]
    async fn iteration_cap_is_reached_when_the_model_never_stops() {
        struct NeverEndsProvider;
        #[async_trait]
        impl ChatProvider for NeverEndsProvider {
            async fn stream(
                &self,
                _request: CompletionRequest,
                _cancel: CancellationToken,
            ) -> crate::error::Result<mpsc::Receiver<StreamEvent>> {
                let (state, rx) = stream::channel(8);
                state.append_tool_call("call_1".to_string(), "echo".to_string());
                state.update_tool_call_arguments(0, "{}");
                state.complete(StopReason::ToolUse).await;
                Ok(rx)
            }
        }

        let registry = Arc::new(ToolRegistry::new().register_native(EchoTool));
        let provider = Arc::new(NeverEndsProvider);
        let mut request = CompletionRequest::new("openai/gpt-5", vec![ChatMessage::user("hi")]);
        request.max_iterations = 2;
        let agent = AgentLoop::with_provider(registry, provider);

        let err = agent.run(request, CancellationToken::new()).await.unwrap_err();
        match err {
            AgentError::IterationCap { limit, partial } => {
                assert_eq!(limit, 2);
                assert_eq!(partial.iteration_count, 2);
                assert!(!partial.all_generated_messages.is_empty());
            }
            _ => panic!("expected IterationCap, got {err:?}"),
        }
    }

    #[test]
    fn iteration_cap_error_carries_partial_outcome() {
        let outcome = AgentOutcome {
            final_message: ChatMessage::assistant("partial"),
            all_generated_messages: vec![ChatMessage::assistant("partial")],
            iteration_count: 10,
        };
        let err = AgentError::IterationCap {
            limit: 10,
            partial: Box::new(outcome),
        };
        match err {
            AgentError::IterationCap { partial, .. } => {
                assert_eq!(partial.all_generated_messages.len(), 1);
            }
            _ => panic!("expected IterationCap"),
        }
    }
}
