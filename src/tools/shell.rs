//! Local subprocess tools speaking the `--schema`/`--execute` contract:
//! invoked once with `--schema` at load time to discover its name and
//! JSON Schema, then with `--execute <json-args>` per call. Grounded on
//! the same subprocess-with-timeout shape as `native::bash::BashTool`,
//! adapted to a fixed two-mode CLI instead of an arbitrary command string.

use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::Command;

use crate::error::{ChatCoreError, Result};

pub struct ShellTool {
    pub name: String,
    pub description: String,
    pub schema: Value,
    pub path: PathBuf,
    pub timeout: Duration,
}

impl ShellTool {
    /// Invoke `path --schema`, parse the JSON Schema from stdout, and
    /// require a `title` field to use as the tool's name.
    pub async fn discover(path: &Path, timeout: Duration) -> Result<Self> {
        let output = Command::new(path)
            .arg("--schema")
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| {
                ChatCoreError::Transport(format!("failed to spawn {}: {e}", path.display()))
            })?;

        if !output.status.success() {
            return Err(ChatCoreError::Transport(format!(
                "{} --schema exited with {}: {}",
                path.display(),
                output.status,
                String::from_utf8_lossy(&output.stderr)
            )));
        }

        let schema: Value = serde_json::from_slice(&output.stdout).map_err(|e| {
            ChatCoreError::Configuration(format!(
                "{} --schema did not produce valid JSON: {e}",
                path.display()
            ))
        })?;

        let name = schema
            .get("title")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                ChatCoreError::Configuration(format!(
                    "{} --schema output is missing a \"title\" field",
                    path.display()
                ))
            })?
            .to_string();

        if schema.get("type").is_none() {
            return Err(ChatCoreError::Configuration(format!(
                "{} --schema output is missing a \"type\" field",
                path.display()
            )));
        }

        let description = schema
            .get("description")
            .and_then(|v| v.as_str())
            .unwrap_or("shell tool")
            .to_string();

        Ok(Self {
            name,
            description,
            schema,
            path: path.to_path_buf(),
            timeout,
        })
    }

    pub async fn execute(&self, args: &Value) -> Result<String, String> {
        let args_json = args.to_string();
        let mut cmd = Command::new(&self.path);
        cmd.args(["--execute", &args_json]);
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .map_err(|e| format!("failed to spawn {}: {e}", self.path.display()))?;

        let stdout = child.stdout.take().ok_or("failed to capture stdout")?;
        let stderr = child.stderr.take().ok_or("failed to capture stderr")?;

        let stdout_handle = tokio::spawn(async move {
            let mut buf = Vec::new();
            tokio::io::BufReader::new(stdout).read_to_end(&mut buf).await.ok();
            buf
        });
        let stderr_handle = tokio::spawn(async move {
            let mut buf = Vec::new();
            tokio::io::BufReader::new(stderr).read_to_end(&mut buf).await.ok();
            buf
        });

        let status = match tokio::time::timeout(self.timeout, child.wait()).await {
            Ok(result) => result.map_err(|e| format!("wait failed: {e}"))?,
            Err(_) => {
                let _ = child.kill().await;
                return Err(format!(
                    "{} timed out after {:?}",
                    self.path.display(),
                    self.timeout
                ));
            }
        };

        let stdout_bytes = stdout_handle.await.unwrap_or_default();
        let stderr_bytes = stderr_handle.await.unwrap_or_default();
        let stdout_text = String::from_utf8_lossy(&stdout_bytes).trim().to_string();
        let stderr_text = String::from_utf8_lossy(&stderr_bytes).trim().to_string();

        if status.success() {
            Ok(stdout_text)
        } else {
            let combined = if stderr_text.is_empty() { stdout_text } else { format!("{stdout_text}\n{stderr_text}") };
            Err(format!(
                "{} exited with {}: {}",
                self.path.display(),
                status,
                combined
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;

    fn write_fake_tool(body: &str) -> tempfile::TempPath {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "#!/bin/sh\n{body}").unwrap();
        let path = file.into_temp_path();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[tokio::test]
    async fn discovers_name_from_title_and_executes() {
        let path = write_fake_tool(
            r#"
if [ "$1" = "--schema" ]; then
  echo '{"title":"wc","type":"object","properties":{"text":{"type":"string"}},"required":["text"]}'
else
  echo -n "2"
fi
"#,
        );
        let tool = ShellTool::discover(&path, Duration::from_secs(5)).await.unwrap();
        assert_eq!(tool.name, "wc");

        let result = tool.execute(&serde_json::json!({"text": "hello world"})).await.unwrap();
        assert_eq!(result, "2");
    }

    #[tokio::test]
    async fn missing_title_is_a_configuration_error() {
        let path = write_fake_tool(r#"echo '{"type":"object"}'"#);
        let result = ShellTool::discover(&path, Duration::from_secs(5)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn nonzero_exit_reports_captured_output() {
        let path = write_fake_tool(
            r#"
if [ "$1" = "--schema" ]; then
  echo '{"title":"boom","type":"object","properties":{}}'
else
  echo "bad input" 1>&2
  exit 1
fi
"#,
        );
        let tool = ShellTool::discover(&path, Duration::from_secs(5)).await.unwrap();
        let result = tool.execute(&serde_json::json!({})).await;
        let err = result.unwrap_err();
        assert!(err.contains("bad input"));
    }
}
