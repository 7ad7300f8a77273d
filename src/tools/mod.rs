//! Tool registry: a uniform set of callable tools loaded from three
//! sources (native, local subprocess, remote server) and invoked through
//! one capability set. `execute` always returns exactly one tool-role
//! `ChatMessage`, synthesizing a result for parse failures, missing tools,
//! and timeouts the same way a real tool failure would — generalized from
//! the teacher's `ToolRegistry::execute`, which returned `Option<ToolResult>`
//! (`None` on an unknown tool) and therefore could silently drop a turn.

pub mod mcp;
pub mod native;
pub mod shell;

use crate::types::{ChatMessage, Tool, ToolCall, ToolKind};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub use native::BashTool;

/// An in-process tool. Shell and remote-server tools implement the same
/// effective contract (args in, text or error out) but over a subprocess
/// or wire protocol instead of a trait method — see `shell` and `mcp`.
#[async_trait]
pub trait NativeTool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn schema(&self) -> serde_json::Value;
    async fn execute(
        &self,
        args: serde_json::Value,
        ctx: serde_json::Value,
        cancel: CancellationToken,
    ) -> Result<String, String>;
}

#[derive(Clone)]
enum RegisteredTool {
    Native(Arc<dyn NativeTool>),
    Shell(Arc<shell::ShellTool>),
    Mcp(Arc<mcp::McpTool>),
}

impl RegisteredTool {
    fn as_capability(&self, name: &str) -> Tool {
        match self {
            RegisteredTool::Native(t) => Tool {
                name: name.to_string(),
                description: t.description().to_string(),
                schema: t.schema(),
                kind: ToolKind::Native,
                source: "native".to_string(),
            },
            RegisteredTool::Shell(t) => Tool {
                name: name.to_string(),
                description: t.description.clone(),
                schema: t.schema.clone(),
                kind: ToolKind::Shell,
                source: t.path.display().to_string(),
            },
            RegisteredTool::Mcp(t) => Tool {
                name: name.to_string(),
                description: t.description.clone(),
                schema: t.schema.clone(),
                kind: ToolKind::Mcp,
                source: t.source.clone(),
            },
        }
    }

    async fn invoke(
        &self,
        args: serde_json::Value,
        ctx: serde_json::Value,
        cancel: CancellationToken,
    ) -> Result<String, String> {
        match self {
            RegisteredTool::Native(t) => t.execute(args, ctx, cancel).await,
            RegisteredTool::Shell(t) => t.execute(&args).await,
            RegisteredTool::Mcp(t) => t.execute(args, cancel).await,
        }
    }
}

#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, RegisteredTool>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_native<T: NativeTool + 'static>(mut self, tool: T) -> Self {
        let name = tool.name().to_string();
        self.tools.insert(name, RegisteredTool::Native(Arc::new(tool)));
        self
    }

    pub fn register_shell(mut self, tool: shell::ShellTool) -> Self {
        let name = tool.name.clone();
        self.tools.insert(name, RegisteredTool::Shell(Arc::new(tool)));
        self
    }

    pub fn register_mcp(mut self, tool: mcp::McpTool) -> Self {
        let name = tool.name.clone();
        self.tools.insert(name, RegisteredTool::Mcp(Arc::new(tool)));
        self
    }

    pub fn has_tool(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn tool_names(&self) -> Vec<&str> {
        self.tools.keys().map(|s| s.as_str()).collect()
    }

    /// Tools converted into the provider-agnostic capability shape; per-
    /// provider schema conversion (e.g. the `__noargs` dummy property)
    /// happens in each adapter, not here.
    pub fn get_tools_for_llm(&self) -> Vec<Tool> {
        self.tools
            .iter()
            .map(|(name, tool)| tool.as_capability(name))
            .collect()
    }

    /// The registry's tools in the shape a session persists as
    /// `SessionMetadata::active_tools`, the counterpart to
    /// `reload_active_tools` below.
    pub fn active_tools(&self) -> Vec<crate::session::ActiveTool> {
        self.tools
            .iter()
            .map(|(name, tool)| crate::session::ActiveTool::from(&tool.as_capability(name)))
            .collect()
    }

    /// Re-instantiate shell and MCP tools from a session's persisted
    /// `active_tools` list (spec §3/§4.4: "tools can be re-loaded on the
    /// next turn") so a reopened context gets its working set back without
    /// the caller re-specifying every tool path/reference. Native tools are
    /// compiled-in and assumed already registered by the caller; an entry
    /// naming one that isn't registered is skipped, since there is no
    /// generic way to reconstruct a native tool from a name alone. A
    /// shell/MCP entry that fails to load (binary moved, server
    /// unreachable) is also skipped rather than failing the whole reload.
    pub async fn reload_active_tools(
        mut self,
        active: &[crate::session::ActiveTool],
        shell_timeout: std::time::Duration,
    ) -> Self {
        let mut mcp_sources: Vec<&str> = Vec::new();

        for entry in active {
            match entry.kind {
                ToolKind::Native => {}
                ToolKind::Shell => {
                    let path = std::path::Path::new(&entry.source);
                    if let Ok(tool) = shell::ShellTool::discover(path, shell_timeout).await {
                        self = self.register_shell(tool);
                    }
                }
                ToolKind::Mcp => {
                    if !mcp_sources.contains(&entry.source.as_str()) {
                        mcp_sources.push(&entry.source);
                    }
                }
            }
        }

        for source in mcp_sources {
            if let Ok(tools) = mcp::load_tools(source).await {
                for tool in tools {
                    self = self.register_mcp(tool);
                }
            }
        }

        self
    }

    /// Execute one tool call, always returning exactly one tool-role
    /// message: argument-parse failures, unknown tools, and execution
    /// errors are all synthesized into the message text rather than
    /// propagated, so the model can see and react to them.
    pub async fn execute(
        &self,
        call: &ToolCall,
        ctx: serde_json::Value,
        cancel: CancellationToken,
    ) -> ChatMessage {
        let mut args: serde_json::Value = match serde_json::from_str(&call.arguments) {
            Ok(v) => v,
            Err(e) => {
                return ChatMessage::tool_result(
                    call.id.clone(),
                    call.name.clone(),
                    format!("Error: could not parse arguments: {e}"),
                )
            }
        };
        // `__noargs` is a dummy property adapters inject so providers that
        // reject empty `properties` (OpenAI-style) can still call
        // zero-argument tools; strip it before it reaches a real tool.
        if let Some(obj) = args.as_object_mut() {
            obj.remove("__noargs");
        }

        let Some(tool) = self.tools.get(&call.name) else {
            return ChatMessage::tool_result(
                call.id.clone(),
                call.name.clone(),
                format!("Error: tool \"{}\" not found", call.name),
            );
        };

        match tool.invoke(args, ctx, cancel).await {
            Ok(output) => ChatMessage::tool_result(call.id.clone(), call.name.clone(), output),
            Err(err) => ChatMessage::tool_result(call.id.clone(), call.name.clone(), err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn registers_and_executes_bash() {
        let registry = ToolRegistry::new().register_native(BashTool::new());
        assert!(registry.has_tool("bash"));

        let call = ToolCall {
            id: "1".to_string(),
            name: "bash".to_string(),
            arguments: json!({"command": "echo hello"}).to_string(),
        };
        let msg = registry.execute(&call, serde_json::Value::Null, CancellationToken::new()).await;
        assert!(msg.content.contains("hello"));
    }

    #[tokio::test]
    async fn unknown_tool_is_synthesized_not_dropped() {
        let registry = ToolRegistry::new();
        let call = ToolCall {
            id: "1".to_string(),
            name: "ghost".to_string(),
            arguments: "{}".to_string(),
        };
        let msg = registry.execute(&call, serde_json::Value::Null, CancellationToken::new()).await;
        assert!(msg.content.contains("not found"));
        assert_eq!(msg.tool_call_id.as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn strips_noargs_dummy_property_before_dispatch() {
        struct EchoesArgs;
        #[async_trait]
        impl NativeTool for EchoesArgs {
            fn name(&self) -> &str {
                "recorder"
            }
            fn description(&self) -> &str {
                "echoes the args it was called with"
            }
            fn schema(&self) -> serde_json::Value {
                json!({"type": "object", "properties": {}})
            }
            async fn execute(
                &self,
                args: serde_json::Value,
                _ctx: serde_json::Value,
                _cancel: CancellationToken,
            ) -> Result<String, String> {
                Ok(args.to_string())
            }
        }

        let registry = ToolRegistry::new().register_native(EchoesArgs);
        let call = ToolCall {
            id: "1".to_string(),
            name: "recorder".to_string(),
            arguments: json!({"__noargs": "unused"}).to_string(),
        };
        let msg = registry.execute(&call, serde_json::Value::Null, CancellationToken::new()).await;
        assert_eq!(msg.content, "{}");
    }

    #[tokio::test]
    async fn active_tools_round_trips_through_reload() {
        let registry = ToolRegistry::new().register_native(BashTool::new());
        let active = registry.active_tools();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].name, "bash");
        assert_eq!(active[0].kind, crate::types::ToolKind::Native);
    }

    #[tokio::test]
    async fn reloads_a_shell_tool_from_its_persisted_source() {
        use std::io::Write;
        use std::os::unix::fs::PermissionsExt;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"#!/bin/sh
if [ "$1" = "--schema" ]; then
  echo '{{"title":"wc","type":"object","properties":{{"text":{{"type":"string"}}}},"required":["text"]}}'
else
  echo -n "2"
fi
"#
        )
        .unwrap();
        let path = file.into_temp_path();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();

        let active = vec![crate::session::ActiveTool {
            name: "wc".to_string(),
            kind: crate::types::ToolKind::Shell,
            source: path.to_string_lossy().to_string(),
        }];

        let registry = ToolRegistry::new()
            .reload_active_tools(&active, std::time::Duration::from_secs(5))
            .await;
        assert!(registry.has_tool("wc"));
    }

    #[tokio::test]
    async fn reload_skips_a_native_entry_with_no_generic_reconstruction() {
        let active = vec![crate::session::ActiveTool {
            name: "bash".to_string(),
            kind: crate::types::ToolKind::Native,
            source: "native".to_string(),
        }];
        let registry = ToolRegistry::new()
            .reload_active_tools(&active, std::time::Duration::from_secs(5))
            .await;
        assert!(!registry.has_tool("bash"));
    }

    #[tokio::test]
    async fn malformed_arguments_become_a_result_not_a_crash() {
        let registry = ToolRegistry::new().register_native(BashTool::new());
        let call = ToolCall {
            id: "1".to_string(),
            name: "bash".to_string(),
            arguments: "{not json".to_string(),
        };
        let msg = registry.execute(&call, serde_json::Value::Null, CancellationToken::new()).await;
        assert!(msg.content.to_lowercase().contains("parse"));
    }
}
