use crate::errors::PryxResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value, // JSON Schema
}

/// Provider-facing message representation. The agent loop converts stored
/// messages into this before each submission.
#[derive(Debug, Clone, Default)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
    pub tool_calls: Vec<ToolCallRequest>,
    /// For role="tool" messages: the tool call this result answers.
    pub tool_call_id: Option<String>,
    /// Whether this tool result represents an error (for role="tool").
    pub is_error: bool,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn assistant(content: impl Into<String>, tool_calls: Vec<ToolCallRequest>) -> Self {
        Self {
            role: "assistant".into(),
            content: content.into(),
            tool_calls,
            ..Default::default()
        }
    }

    pub fn tool_result(
        tool_call_id: impl Into<String>,
        content: impl Into<String>,
        is_error: bool,
    ) -> Self {
        Self {
            role: "tool".into(),
            content: content.into(),
            tool_call_id: Some(tool_call_id.into()),
            is_error,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProviderRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolDefinition>,
    pub max_tokens: u32,
    pub temperature: f32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    ToolUse,
    MaxTokens,
    Other(String),
}

impl FinishReason {
    pub fn as_str(&self) -> &str {
        match self {
            FinishReason::Stop => "stop",
            FinishReason::ToolUse => "tool_use",
            FinishReason::MaxTokens => "max_tokens",
            FinishReason::Other(s) => s,
        }
    }
}

/// One event on a provider stream. Tool calls may arrive either fully
/// formed (`ToolCall`) or as a start + argument fragments that the consumer
/// assembles; adapters pick whichever maps onto their wire format.
#[derive(Debug, Clone)]
pub enum ProviderEvent {
    TextDelta(String),
    ToolCallStart { id: String, name: String },
    ToolCallDelta { id: String, arguments_fragment: String },
    ToolCall(ToolCallRequest),
    Usage { input_tokens: i64, output_tokens: i64 },
    Finish(FinishReason),
    Error { message: String, retryable: bool },
}

/// Narrow contract the core holds against a language model.
///
/// `submit` returns the consumer side of a single-producer channel; the
/// agent loop is the sole consumer. Fan-out to external subscribers is the
/// event bus's job, not the adapter's.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn name(&self) -> &str;

    fn default_model(&self) -> &str;

    async fn submit(
        &self,
        request: ProviderRequest,
        cancel: CancellationToken,
    ) -> PryxResult<mpsc::Receiver<ProviderEvent>>;

    /// Models this provider advertises; used by the gateway's provider API.
    async fn list_models(&self) -> PryxResult<Vec<String>> {
        Ok(vec![self.default_model().to_string()])
    }
}

/// Channel capacity for provider event streams. The loop consumes promptly;
/// this only buffers bursts.
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Best-effort input token estimate used for cost prechecks: four bytes per
/// token, matching what provider tokenizers average on English prose.
pub fn estimate_tokens(messages: &[ChatMessage]) -> i64 {
    let chars: usize = messages
        .iter()
        .map(|m| {
            m.content.len()
                + m.tool_calls
                    .iter()
                    .map(|tc| tc.arguments.to_string().len() + tc.name.len())
                    .sum::<usize>()
        })
        .sum();
    (chars / 4) as i64
}
