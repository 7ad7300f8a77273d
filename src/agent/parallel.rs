//! Bounded, order-preserving parallel tool execution.
//!
//! Grounded in the retrieved agent-session `execute_tools_parallel`/
//! `execute_tool` free-function pattern (`futures::future::join_all` over
//! pre-collected futures, each producing a result at its own index so the
//! output vector's order matches call order regardless of completion
//! order), extended with a `tokio::sync::Semaphore` for the `max_parallel`
//! bound the teacher's source did not need.

use crate::tools::ToolRegistry;
use crate::types::{ChatMessage, ToolCall};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

/// Hook invoked before a tool executes; may substitute a modified context
/// (used for dependency injection into tools).
pub trait BeforeToolHook: Send + Sync {
    fn before_tool(&self, call: &ToolCall) -> serde_json::Value;
}

pub struct DefaultContext;
impl BeforeToolHook for DefaultContext {
    fn before_tool(&self, _call: &ToolCall) -> serde_json::Value {
        serde_json::Value::Null
    }
}

/// Execute `calls` with up to `max_parallel` running concurrently (or all
/// of them, if `None`), honoring `tool_timeout` per invocation and
/// `cancel` for the whole batch. Every call produces exactly one
/// `ChatMessage` (tool-role), in call order, regardless of completion
/// order or outcome.
pub async fn execute_parallel(
    calls: &[ToolCall],
    registry: Arc<ToolRegistry>,
    before_tool: Arc<dyn BeforeToolHook>,
    tool_timeout: Duration,
    max_parallel: Option<usize>,
    cancel: CancellationToken,
) -> Vec<ChatMessage> {
    let permits = max_parallel.unwrap_or(calls.len().max(1));
    let semaphore = Arc::new(Semaphore::new(permits));

    let futures: Vec<_> = calls
        .iter()
        .map(|call| {
            let registry = Arc::clone(&registry);
            let semaphore = Arc::clone(&semaphore);
            let before_tool = Arc::clone(&before_tool);
            let cancel = cancel.clone();
            let call = call.clone();
            async move {
                let _permit = tokio::select! {
                    _ = cancel.cancelled() => return cancelled_result(&call),
                    permit = semaphore.acquire_owned() => match permit {
                        Ok(p) => p,
                        Err(_) => return cancelled_result(&call),
                    },
                };

                let ctx = before_tool.before_tool(&call);
                let child_token = cancel.child_token();
                let result = tokio::select! {
                    _ = cancel.cancelled() => return cancelled_result(&call),
                    r = tokio::time::timeout(tool_timeout, registry.execute(&call, ctx, child_token)) => r,
                };

                match result {
                    Ok(tool_result) => tool_result,
                    Err(_) => ChatMessage::tool_result(
                        call.id.clone(),
                        call.name.clone(),
                        format!("Error: tool execution timed out after {:?}", tool_timeout),
                    ),
                }
            }
        })
        .collect();

    futures::future::join_all(futures).await
}

fn cancelled_result(call: &ToolCall) -> ChatMessage {
    ChatMessage::tool_result(call.id.clone(), call.name.clone(), "Error: cancelled")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{NativeTool, ToolRegistry};
    use async_trait::async_trait;
    use std::time::Instant;

    struct SlowTool;
    #[async_trait]
    impl NativeTool for SlowTool {
        fn name(&self) -> &str {
            "slow"
        }
        fn description(&self) -> &str {
            "sleeps then returns"
        }
        fn schema(&self) -> serde_json::Value {
            serde_json::json!({"type": "object", "properties": {}})
        }
        async fn execute(
            &self,
            _args: serde_json::Value,
            _ctx: serde_json::Value,
            _cancel: CancellationToken,
        ) -> Result<String, String> {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok("slow-done".to_string())
        }
    }

    struct FastTool;
    #[async_trait]
    impl NativeTool for FastTool {
        fn name(&self) -> &str {
            "fast"
        }
        fn description(&self) -> &str {
            "returns immediately"
        }
        fn schema(&self) -> serde_json::Value {
            serde_json::json!({"type": "object", "properties": {}})
        }
        async fn execute(
            &self,
            _args: serde_json::Value,
            _ctx: serde_json::Value,
            _cancel: CancellationToken,
        ) -> Result<String, String> {
            Ok("fast-done".to_string())
        }
    }

    #[tokio::test]
    async fn result_order_matches_call_order_not_completion_order() {
        let registry = Arc::new(
            ToolRegistry::new()
                .register_native(SlowTool)
                .register_native(FastTool),
        );
        let calls = vec![
            ToolCall {
                id: "1".to_string(),
                name: "slow".to_string(),
                arguments: "{}".to_string(),
            },
            ToolCall {
                id: "2".to_string(),
                name: "fast".to_string(),
                arguments: "{}".to_string(),
            },
        ];

        let start = Instant::now();
        let results = execute_parallel(
            &calls,
            registry,
            Arc::new(DefaultContext),
            Duration::from_secs(5),
            None,
            CancellationToken::new(),
        )
        .await;
        assert!(
            start.elapsed() < Duration::from_millis(200),
            "tools should run concurrently"
        );

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].tool_call_id.as_deref(), Some("1"));
        assert_eq!(results[0].content, "slow-done");
        assert_eq!(results[1].tool_call_id.as_deref(), Some("2"));
        assert_eq!(results[1].content, "fast-done");
    }

    #[tokio::test]
    async fn unknown_tool_still_produces_exactly_one_result() {
        let registry = Arc::new(ToolRegistry::new());
        let calls = vec![ToolCall {
            id: "1".to_string(),
            name: "missing".to_string(),
            arguments: "{}".to_string(),
        }];
        let results = execute_parallel(
            &calls,
            registry,
            Arc::new(DefaultContext),
            Duration::from_secs(5),
            None,
            CancellationToken::new(),
        )
        .await;
        assert_eq!(results.len(), 1);
        assert!(
            results[0].content.to_lowercase().contains("not found")
                || results[0].content.to_lowercase().contains("unknown")
        );
    }
}
