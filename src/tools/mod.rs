pub mod builtin;
pub mod mcp;
pub mod registry;
pub mod skill_tool;

pub use registry::{RegistryError, ToolDescriptor, ToolHandle, ToolRegistry, ToolSource};

use crate::policy::ActionClass;
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

/// Cap applied to tool results before they are fed back to the model.
pub const MAX_RESULT_CHARS: usize = 10_000;

#[derive(Debug, Clone)]
pub struct ToolResult {
    pub content: String,
    pub is_error: bool,
}

impl ToolResult {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: true,
        }
    }
}

impl std::fmt::Display for ToolResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.content)
    }
}

#[async_trait]
pub trait Tool: Send + Sync {
    /// Fully qualified `namespace.name`, e.g. `fs.read`.
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON Schema for the arguments object.
    fn parameters(&self) -> Value;

    fn action_class(&self) -> ActionClass;

    /// Declared per-call deadline override. The registry clamps it to the
    /// hard cap.
    fn declared_timeout(&self) -> Option<Duration> {
        None
    }

    /// Opt out of strict argument validation at the registry boundary.
    fn skip_validation(&self) -> bool {
        false
    }

    async fn execute(&self, params: Value) -> anyhow::Result<ToolResult>;
}

/// Truncate a tool result to `max_chars`, keeping head and tail context the
/// way a reader would want it.
pub fn truncate_result(content: &str, max_chars: usize) -> String {
    if content.len() <= max_chars {
        return content.to_string();
    }
    let keep = max_chars.saturating_sub(64) / 2;
    let head_end = content
        .char_indices()
        .nth(keep)
        .map_or(content.len(), |(i, _)| i);
    let tail_chars = content.chars().count().saturating_sub(keep);
    let tail_start = content
        .char_indices()
        .nth(tail_chars)
        .map_or(0, |(i, _)| i);
    format!(
        "{}\n[... truncated {} chars ...]\n{}",
        &content[..head_end],
        content.len().saturating_sub(head_end + (content.len() - tail_start)),
        &content[tail_start..]
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_results_untouched() {
        assert_eq!(truncate_result("ok", 100), "ok");
    }

    #[test]
    fn long_results_truncated_with_marker() {
        let long = "a".repeat(50_000);
        let out = truncate_result(&long, 10_000);
        assert!(out.len() < 11_000);
        assert!(out.contains("truncated"));
    }

    #[test]
    fn truncation_is_utf8_safe() {
        let long = "é".repeat(20_000);
        let out = truncate_result(&long, 1_000);
        assert!(out.contains("truncated"));
        // Must not split a multibyte character.
        assert!(out.chars().count() > 0);
    }
}
