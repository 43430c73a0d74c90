//! Anthropic messages API adapter with SSE streaming.

use crate::config::ProviderConfig;
use crate::errors::{PryxError, PryxResult};
use crate::providers::base::{
    ChatMessage, EVENT_CHANNEL_CAPACITY, FinishReason, LlmProvider, ProviderEvent,
    ProviderRequest, ToolCallRequest, ToolDefinition,
};
use crate::providers::resolve::{Credential, CredentialResolver};
use crate::providers::sse::SseDecoder;
use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const STREAM_CHUNK_TIMEOUT_SECS: u64 = 120;

pub struct AnthropicProvider {
    client: reqwest::Client,
    base_url: String,
    config: ProviderConfig,
    resolver: Arc<CredentialResolver>,
    default_model: String,
}

impl AnthropicProvider {
    pub fn new(
        config: ProviderConfig,
        resolver: Arc<CredentialResolver>,
        default_model: String,
    ) -> Self {
        let base_url = config
            .base_url
            .clone()
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        Self {
            client: reqwest::Client::new(),
            base_url,
            config,
            resolver,
            default_model,
        }
    }

    fn build_payload(request: &ProviderRequest) -> Value {
        let (system, messages) = convert_messages(&request.messages);
        let mut payload = json!({
            "model": request.model,
            "messages": messages,
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
            "stream": true,
        });
        if let Some(system) = system {
            payload["system"] = json!(system);
        }
        if !request.tools.is_empty() {
            payload["tools"] = json!(convert_tools(&request.tools));
            payload["tool_choice"] = json!({"type": "auto"});
        }
        payload
    }
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    fn default_model(&self) -> &str {
        &self.default_model
    }

    async fn submit(
        &self,
        request: ProviderRequest,
        cancel: CancellationToken,
    ) -> PryxResult<mpsc::Receiver<ProviderEvent>> {
        let credential = self.resolver.resolve("anthropic", &self.config).await?;
        let payload = Self::build_payload(&request);

        let mut req = self
            .client
            .post(&self.base_url)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&payload);
        req = match &credential {
            Credential::ApiKey(key) => req.header("x-api-key", key),
            Credential::OauthToken(token) => req.bearer_auth(token),
        };

        let resp = req.send().await.map_err(|e| PryxError::Provider {
            message: format!("request failed: {e}"),
            retryable: true,
        })?;
        let status = resp.status();
        if !status.is_success() {
            let retry_after = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok());
            let body = resp.text().await.unwrap_or_default();
            return Err(match status.as_u16() {
                401 | 403 => PryxError::Auth(parse_error_message(&body)),
                429 => PryxError::RateLimit { retry_after },
                s if s >= 500 => PryxError::Provider {
                    message: format!("upstream {s}: {}", parse_error_message(&body)),
                    retryable: true,
                },
                s => PryxError::Provider {
                    message: format!("API error {s}: {}", parse_error_message(&body)),
                    retryable: false,
                },
            });
        }

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        tokio::spawn(async move {
            let mut stream = resp.bytes_stream();
            let mut decoder = SseDecoder::new();
            let mut current_tool_id = String::new();
            let mut current_tool_name = String::new();
            let mut current_tool_json = String::new();
            let mut finish: Option<FinishReason> = None;
            let mut input_tokens: i64 = 0;

            loop {
                let chunk = tokio::select! {
                    () = cancel.cancelled() => {
                        debug!("anthropic stream cancelled");
                        return;
                    }
                    chunk = tokio::time::timeout(
                        Duration::from_secs(STREAM_CHUNK_TIMEOUT_SECS),
                        stream.next(),
                    ) => chunk,
                };
                let chunk = match chunk {
                    Ok(Some(Ok(bytes))) => bytes,
                    Ok(Some(Err(e))) => {
                        let _ = tx
                            .send(ProviderEvent::Error {
                                message: format!("stream read error: {e}"),
                                retryable: true,
                            })
                            .await;
                        return;
                    }
                    Ok(None) => break,
                    Err(_) => {
                        let _ = tx
                            .send(ProviderEvent::Error {
                                message: "stream stalled".into(),
                                retryable: true,
                            })
                            .await;
                        return;
                    }
                };

                for frame in decoder.feed(&chunk) {
                    let Some(data) = frame.data else { continue };
                    match data["type"].as_str().unwrap_or("") {
                        "message_start" => {
                            if let Some(tokens) = data["message"]["usage"]["input_tokens"].as_i64()
                            {
                                input_tokens = tokens;
                            }
                        }
                        "content_block_start" => {
                            let block = &data["content_block"];
                            if block["type"].as_str() == Some("tool_use") {
                                current_tool_id =
                                    block["id"].as_str().unwrap_or("").to_string();
                                current_tool_name =
                                    block["name"].as_str().unwrap_or("").to_string();
                                current_tool_json.clear();
                                let _ = tx
                                    .send(ProviderEvent::ToolCallStart {
                                        id: current_tool_id.clone(),
                                        name: current_tool_name.clone(),
                                    })
                                    .await;
                            }
                        }
                        "content_block_delta" => match data["delta"]["type"].as_str() {
                            Some("text_delta") => {
                                if let Some(text) = data["delta"]["text"].as_str() {
                                    let _ = tx
                                        .send(ProviderEvent::TextDelta(text.to_string()))
                                        .await;
                                }
                            }
                            Some("input_json_delta") => {
                                if let Some(fragment) = data["delta"]["partial_json"].as_str() {
                                    current_tool_json.push_str(fragment);
                                    let _ = tx
                                        .send(ProviderEvent::ToolCallDelta {
                                            id: current_tool_id.clone(),
                                            arguments_fragment: fragment.to_string(),
                                        })
                                        .await;
                                }
                            }
                            _ => {}
                        },
                        "content_block_stop" => {
                            if !current_tool_id.is_empty() {
                                let arguments: Value = serde_json::from_str(&current_tool_json)
                                    .unwrap_or(Value::Null);
                                let _ = tx
                                    .send(ProviderEvent::ToolCall(ToolCallRequest {
                                        id: std::mem::take(&mut current_tool_id),
                                        name: std::mem::take(&mut current_tool_name),
                                        arguments,
                                    }))
                                    .await;
                                current_tool_json.clear();
                            }
                        }
                        "message_delta" => {
                            if let Some(reason) = data["delta"]["stop_reason"].as_str() {
                                finish = Some(match reason {
                                    "end_turn" => FinishReason::Stop,
                                    "tool_use" => FinishReason::ToolUse,
                                    "max_tokens" => FinishReason::MaxTokens,
                                    other => FinishReason::Other(other.to_string()),
                                });
                            }
                            if let Some(tokens) = data["usage"]["output_tokens"].as_i64() {
                                let _ = tx
                                    .send(ProviderEvent::Usage {
                                        input_tokens,
                                        output_tokens: tokens,
                                    })
                                    .await;
                            }
                        }
                        "error" => {
                            let message = data["error"]["message"]
                                .as_str()
                                .unwrap_or("unknown stream error")
                                .to_string();
                            warn!("anthropic stream error: {message}");
                            let _ = tx
                                .send(ProviderEvent::Error {
                                    message,
                                    retryable: false,
                                })
                                .await;
                            return;
                        }
                        _ => {}
                    }
                }
            }

            let _ = tx
                .send(ProviderEvent::Finish(finish.unwrap_or(FinishReason::Stop)))
                .await;
        });

        Ok(rx)
    }

    async fn list_models(&self) -> PryxResult<Vec<String>> {
        Ok(vec![
            "claude-opus-4-5".into(),
            "claude-sonnet-4-5".into(),
            "claude-haiku-4-5".into(),
        ])
    }
}

/// Convert neutral messages into the Anthropic wire shape. System messages
/// are lifted out into the top-level `system` field; tool results become
/// user-role `tool_result` blocks.
fn convert_messages(messages: &[ChatMessage]) -> (Option<String>, Vec<Value>) {
    let mut system_parts = Vec::new();
    let mut out: Vec<Value> = Vec::new();

    for msg in messages {
        match msg.role.as_str() {
            "system" => system_parts.push(msg.content.clone()),
            "assistant" => {
                let mut blocks = Vec::new();
                if !msg.content.is_empty() {
                    blocks.push(json!({"type": "text", "text": msg.content}));
                }
                for tc in &msg.tool_calls {
                    blocks.push(json!({
                        "type": "tool_use",
                        "id": tc.id,
                        "name": tc.name,
                        "input": tc.arguments,
                    }));
                }
                out.push(json!({"role": "assistant", "content": blocks}));
            }
            "tool" => {
                out.push(json!({
                    "role": "user",
                    "content": [{
                        "type": "tool_result",
                        "tool_use_id": msg.tool_call_id.clone().unwrap_or_default(),
                        "content": msg.content,
                        "is_error": msg.is_error,
                    }],
                }));
            }
            _ => out.push(json!({"role": "user", "content": msg.content})),
        }
    }

    let system = if system_parts.is_empty() {
        None
    } else {
        Some(system_parts.join("\n\n"))
    };
    (system, out)
}

fn convert_tools(tools: &[ToolDefinition]) -> Vec<Value> {
    tools
        .iter()
        .map(|t| {
            json!({
                "name": t.name,
                "description": t.description,
                "input_schema": t.parameters,
            })
        })
        .collect()
}

fn parse_error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v["error"]["message"].as_str().map(str::to_string))
        .unwrap_or_else(|| {
            let mut s = body.to_string();
            s.truncate(200);
            s
        })
}
