//! Built-in tools shipped with the runtime: filesystem access, shell
//! execution, and HTTP fetch. Filesystem tools confine themselves to the
//! workspace directory unless configured otherwise.

use super::{Tool, ToolResult};
use crate::policy::ActionClass;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

const EXEC_OUTPUT_LIMIT: usize = 64 * 1024;

/// Resolve a user-supplied path against the workspace, refusing escapes
/// when confinement is on.
fn resolve_path(workspace: &Path, raw: &str, restrict: bool) -> Result<PathBuf> {
    let path = Path::new(raw);
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        workspace.join(path)
    };
    // Normalise without requiring the leaf to exist.
    let normalised = joined
        .parent()
        .and_then(|p| p.canonicalize().ok())
        .map(|p| p.join(joined.file_name().unwrap_or_default()))
        .unwrap_or(joined);
    if restrict {
        let workspace = workspace
            .canonicalize()
            .unwrap_or_else(|_| workspace.to_path_buf());
        if !normalised.starts_with(&workspace) {
            anyhow::bail!("path escapes the workspace: {raw}");
        }
    }
    Ok(normalised)
}

pub struct ReadFileTool {
    workspace: PathBuf,
    restrict: bool,
}

impl ReadFileTool {
    pub fn new(workspace: PathBuf, restrict: bool) -> Self {
        Self { workspace, restrict }
    }
}

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "fs.read"
    }

    fn description(&self) -> &str {
        "Read a file and return its contents as text"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {"type": "string", "description": "File path, relative to the workspace"}
            },
            "required": ["path"]
        })
    }

    fn action_class(&self) -> ActionClass {
        ActionClass::FileOps
    }

    async fn execute(&self, params: Value) -> Result<ToolResult> {
        let raw = params["path"]
            .as_str()
            .context("missing required argument: path")?;
        let path = resolve_path(&self.workspace, raw, self.restrict)?;
        match tokio::fs::read_to_string(&path).await {
            Ok(contents) => Ok(ToolResult::new(contents)),
            Err(e) => Ok(ToolResult::error(format!("cannot read {raw}: {e}"))),
        }
    }
}

pub struct WriteFileTool {
    workspace: PathBuf,
    restrict: bool,
}

impl WriteFileTool {
    pub fn new(workspace: PathBuf, restrict: bool) -> Self {
        Self { workspace, restrict }
    }
}

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "fs.write"
    }

    fn description(&self) -> &str {
        "Write text content to a file, creating parent directories as needed"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {"type": "string"},
                "content": {"type": "string"}
            },
            "required": ["path", "content"]
        })
    }

    fn action_class(&self) -> ActionClass {
        ActionClass::FileOps
    }

    async fn execute(&self, params: Value) -> Result<ToolResult> {
        let raw = params["path"]
            .as_str()
            .context("missing required argument: path")?;
        let content = params["content"]
            .as_str()
            .context("missing required argument: content")?;
        let path = resolve_path(&self.workspace, raw, self.restrict)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, content).await?;
        Ok(ToolResult::new(format!(
            "wrote {} bytes to {raw}",
            content.len()
        )))
    }
}

pub struct ListDirTool {
    workspace: PathBuf,
    restrict: bool,
}

impl ListDirTool {
    pub fn new(workspace: PathBuf, restrict: bool) -> Self {
        Self { workspace, restrict }
    }
}

#[async_trait]
impl Tool for ListDirTool {
    fn name(&self) -> &str {
        "fs.list"
    }

    fn description(&self) -> &str {
        "List directory entries (name and kind)"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {"type": "string", "description": "Directory path, defaults to the workspace root"}
            }
        })
    }

    fn action_class(&self) -> ActionClass {
        ActionClass::FileOps
    }

    async fn execute(&self, params: Value) -> Result<ToolResult> {
        let raw = params["path"].as_str().unwrap_or(".");
        let path = resolve_path(&self.workspace, raw, self.restrict)?;
        let mut entries = tokio::fs::read_dir(&path)
            .await
            .with_context(|| format!("cannot list {raw}"))?;
        let mut lines = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let kind = if entry.file_type().await?.is_dir() {
                "dir"
            } else {
                "file"
            };
            lines.push(format!("{kind}\t{}", entry.file_name().to_string_lossy()));
        }
        lines.sort();
        Ok(ToolResult::new(lines.join("\n")))
    }
}

pub struct ShellExecTool {
    workspace: PathBuf,
    timeout: Duration,
}

impl ShellExecTool {
    pub fn new(workspace: PathBuf, timeout: Duration) -> Self {
        Self { workspace, timeout }
    }
}

#[async_trait]
impl Tool for ShellExecTool {
    fn name(&self) -> &str {
        "shell.exec"
    }

    fn description(&self) -> &str {
        "Run a shell command in the workspace and return stdout/stderr"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": {"type": "string"}
            },
            "required": ["command"]
        })
    }

    fn action_class(&self) -> ActionClass {
        ActionClass::Shell
    }

    fn declared_timeout(&self) -> Option<Duration> {
        Some(self.timeout)
    }

    async fn execute(&self, params: Value) -> Result<ToolResult> {
        let command = params["command"]
            .as_str()
            .context("missing required argument: command")?;
        debug!("shell.exec: {}", command);
        let output = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&self.workspace)
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("failed to spawn: {command}"))?;

        let mut text = String::new();
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stdout.is_empty() {
            text.push_str(&stdout);
        }
        if !stderr.is_empty() {
            if !text.is_empty() {
                text.push('\n');
            }
            text.push_str("stderr: ");
            text.push_str(&stderr);
        }
        if text.len() > EXEC_OUTPUT_LIMIT {
            text.truncate(EXEC_OUTPUT_LIMIT);
            text.push_str("\n[output truncated]");
        }
        if output.status.success() {
            Ok(ToolResult::new(text))
        } else {
            Ok(ToolResult::error(format!(
                "exit status {}: {text}",
                output.status.code().unwrap_or(-1)
            )))
        }
    }
}

pub struct HttpFetchTool {
    client: reqwest::Client,
}

impl HttpFetchTool {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpFetchTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for HttpFetchTool {
    fn name(&self) -> &str {
        "http.fetch"
    }

    fn description(&self) -> &str {
        "Fetch a URL with GET and return the response body as text"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "url": {"type": "string", "format": "uri"}
            },
            "required": ["url"]
        })
    }

    fn action_class(&self) -> ActionClass {
        ActionClass::Network
    }

    async fn execute(&self, params: Value) -> Result<ToolResult> {
        let url = params["url"]
            .as_str()
            .context("missing required argument: url")?;
        let resp = self.client.get(url).send().await;
        match resp {
            Ok(resp) => {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                if status.is_success() {
                    Ok(ToolResult::new(body))
                } else {
                    Ok(ToolResult::error(format!("HTTP {status}: {body}")))
                }
            }
            Err(e) => Ok(ToolResult::error(format!("fetch failed: {e}"))),
        }
    }
}
