//! Remote tool-server (MCP) transports: stdio child process, SSE, and
//! streamable HTTP, selected per server entry in a `{"mcpServers": {...}}`
//! config file. No teacher module covers this — grounded only on the
//! `rmcp` crate's own client/transport feature set (the dependency this
//! repo shares with the querymt example's manifest) and the wire contract
//! described for remote servers.

use crate::error::{ChatCoreError, Result};
use rmcp::model::CallToolRequestParam;
use rmcp::transport::{SseClientTransport, StreamableHttpClientTransport, TokioChildProcess};
use rmcp::ServiceExt;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Deserialize)]
struct McpServersFile {
    #[serde(rename = "mcpServers")]
    mcp_servers: HashMap<String, McpServerConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "transport", rename_all = "lowercase", default)]
enum McpServerConfig {
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
    },
    Sse {
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
        #[serde(default)]
        timeout_secs: Option<u64>,
    },
    Streamable {
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
        #[serde(default)]
        timeout_secs: Option<u64>,
    },
}

impl Default for McpServerConfig {
    fn default() -> Self {
        McpServerConfig::Stdio {
            command: String::new(),
            args: Vec::new(),
            env: HashMap::new(),
        }
    }
}

/// `path/to/file.json` or `path/to/file.json#serverName`. Loading a
/// multi-server file without `#` is a configuration error.
fn parse_reference(reference: &str) -> Result<(&str, Option<&str>)> {
    if !reference.ends_with(".json") && !reference.contains(".json#") {
        return Err(ChatCoreError::Configuration(format!(
            "mcp server reference must point at a .json file: {reference}"
        )));
    }
    match reference.split_once('#') {
        Some((path, name)) => Ok((path, Some(name))),
        None => Ok((reference, None)),
    }
}

async fn load_configs(reference: &str) -> Result<Vec<(String, McpServerConfig, String)>> {
    let (path, name) = parse_reference(reference)?;
    let text = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| ChatCoreError::Configuration(format!("failed to read {path}: {e}")))?;
    let file: McpServersFile = serde_json::from_str(&text)
        .map_err(|e| ChatCoreError::Configuration(format!("malformed mcp server file {path}: {e}")))?;

    match name {
        Some(name) => {
            let config = file.mcp_servers.get(name).cloned().ok_or_else(|| {
                ChatCoreError::Configuration(format!("no server named \"{name}\" in {path}"))
            })?;
            Ok(vec![(name.to_string(), config, reference.to_string())])
        }
        None => {
            if file.mcp_servers.len() != 1 {
                return Err(ChatCoreError::Configuration(format!(
                    "{path} defines {} servers; reference a specific one with {path}#name",
                    file.mcp_servers.len()
                )));
            }
            Ok(file
                .mcp_servers
                .into_iter()
                .map(|(name, config)| {
                    let source = format!("{path}#{name}");
                    (name, config, source)
                })
                .collect())
        }
    }
}

/// A tool exposed by a remote MCP server. Connects fresh per invocation;
/// stdio servers are spawned per call, HTTP-based ones open a new client.
pub struct McpTool {
    pub name: String,
    pub description: String,
    pub schema: Value,
    pub source: String,
    config: McpServerConfig,
    remote_name: String,
}

impl McpTool {
    pub async fn execute(&self, args: Value, _cancel: CancellationToken) -> Result<String, String> {
        let arguments = match args {
            Value::Object(map) => Some(map),
            Value::Null => None,
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                Some(map)
            }
        };

        let result = match &self.config {
            McpServerConfig::Stdio { command, args, env } => {
                let mut cmd = Command::new(command);
                cmd.args(args);
                for (k, v) in env {
                    cmd.env(k, v);
                }
                let transport = TokioChildProcess::new(cmd)
                    .map_err(|e| format!("failed to spawn mcp server \"{}\": {e}", self.remote_name))?;
                let client = ()
                    .serve(transport)
                    .await
                    .map_err(|e| format!("mcp handshake failed for \"{}\": {e}", self.remote_name))?;
                let result = client
                    .call_tool(CallToolRequestParam {
                        name: self.remote_name.clone().into(),
                        arguments,
                    })
                    .await
                    .map_err(|e| format!("mcp tool call failed: {e}"));
                let _ = client.cancel().await;
                result
            }
            McpServerConfig::Sse { url, timeout_secs, .. } => {
                let transport = SseClientTransport::start(url.clone())
                    .await
                    .map_err(|e| format!("failed to connect to {url}: {e}"))?;
                let client = tokio::time::timeout(
                    Duration::from_secs(timeout_secs.unwrap_or(30)),
                    ().serve(transport),
                )
                .await
                .map_err(|_| format!("timed out connecting to {url}"))?
                .map_err(|e| format!("mcp handshake failed for {url}: {e}"))?;
                let result = client
                    .call_tool(CallToolRequestParam {
                        name: self.remote_name.clone().into(),
                        arguments,
                    })
                    .await
                    .map_err(|e| format!("mcp tool call failed: {e}"));
                let _ = client.cancel().await;
                result
            }
            McpServerConfig::Streamable { url, timeout_secs, .. } => {
                let transport = StreamableHttpClientTransport::from_uri(url.clone());
                let client = tokio::time::timeout(
                    Duration::from_secs(timeout_secs.unwrap_or(30)),
                    ().serve(transport),
                )
                .await
                .map_err(|_| format!("timed out connecting to {url}"))?
                .map_err(|e| format!("mcp handshake failed for {url}: {e}"))?;
                let result = client
                    .call_tool(CallToolRequestParam {
                        name: self.remote_name.clone().into(),
                        arguments,
                    })
                    .await
                    .map_err(|e| format!("mcp tool call failed: {e}"));
                let _ = client.cancel().await;
                result
            }
        }?;

        Ok(result
            .content
            .into_iter()
            .filter_map(|c| c.as_text().map(|t| t.text.clone()))
            .collect::<Vec<_>>()
            .join("\n"))
    }
}

/// Connect once, list tools, and wrap each as an `McpTool` carrying enough
/// config to reconnect per call. `source` is recorded on every tool as the
/// exact reference string so a session can re-load the same set next turn.
pub async fn load_tools(reference: &str) -> Result<Vec<McpTool>> {
    let configs = load_configs(reference).await?;
    let mut tools = Vec::new();

    for (remote_name, config, source) in configs {
        let listed = list_remote_tools(&config, &remote_name).await?;
        for tool in listed {
            tools.push(McpTool {
                name: tool.0,
                description: tool.1,
                schema: tool.2,
                source: source.clone(),
                config: config.clone(),
                remote_name: remote_name.clone(),
            });
        }
    }

    Ok(tools)
}

async fn list_remote_tools(
    config: &McpServerConfig,
    remote_name: &str,
) -> Result<Vec<(String, String, Value)>> {
    let tools = match config {
        McpServerConfig::Stdio { command, args, env } => {
            let mut cmd = Command::new(command);
            cmd.args(args);
            for (k, v) in env {
                cmd.env(k, v);
            }
            let transport = TokioChildProcess::new(cmd).map_err(|e| {
                ChatCoreError::Transport(format!("failed to spawn mcp server \"{remote_name}\": {e}"))
            })?;
            let client = ().serve(transport).await.map_err(|e| {
                ChatCoreError::Transport(format!("mcp handshake failed for \"{remote_name}\": {e}"))
            })?;
            let tools = client.list_all_tools().await.map_err(|e| {
                ChatCoreError::Transport(format!("failed to list tools for \"{remote_name}\": {e}"))
            })?;
            let _ = client.cancel().await;
            tools
        }
        McpServerConfig::Sse { url, .. } => {
            let transport = SseClientTransport::start(url.clone())
                .await
                .map_err(|e| ChatCoreError::Transport(format!("failed to connect to {url}: {e}")))?;
            let client = ()
                .serve(transport)
                .await
                .map_err(|e| ChatCoreError::Transport(format!("mcp handshake failed for {url}: {e}")))?;
            let tools = client
                .list_all_tools()
                .await
                .map_err(|e| ChatCoreError::Transport(format!("failed to list tools for {url}: {e}")))?;
            let _ = client.cancel().await;
            tools
        }
        McpServerConfig::Streamable { url, .. } => {
            let transport = StreamableHttpClientTransport::from_uri(url.clone());
            let client = ()
                .serve(transport)
                .await
                .map_err(|e| ChatCoreError::Transport(format!("mcp handshake failed for {url}: {e}")))?;
            let tools = client
                .list_all_tools()
                .await
                .map_err(|e| ChatCoreError::Transport(format!("failed to list tools for {url}: {e}")))?;
            let _ = client.cancel().await;
            tools
        }
    };

    Ok(tools
        .into_iter()
        .map(|t| {
            let schema = Value::Object((*t.input_schema).clone());
            (t.name.to_string(), t.description.unwrap_or_default().to_string(), schema)
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_json_reference() {
        assert!(parse_reference("servers.yaml").is_err());
    }

    #[test]
    fn splits_file_and_server_name() {
        let (path, name) = parse_reference("servers.json#alpha").unwrap();
        assert_eq!(path, "servers.json");
        assert_eq!(name, Some("alpha"));
    }

    #[test]
    fn bare_file_has_no_server_name() {
        let (path, name) = parse_reference("servers.json").unwrap();
        assert_eq!(path, "servers.json");
        assert_eq!(name, None);
    }
}
