//! OpenAI-compatible chat completions adapter with SSE streaming. Also
//! serves self-hosted endpoints that speak the same wire format via the
//! `base_url` override.

use crate::config::ProviderConfig;
use crate::errors::{PryxError, PryxResult};
use crate::providers::base::{
    ChatMessage, EVENT_CHANNEL_CAPACITY, FinishReason, LlmProvider, ProviderEvent,
    ProviderRequest, ToolCallRequest, ToolDefinition,
};
use crate::providers::resolve::CredentialResolver;
use crate::providers::sse::SseDecoder;
use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1/chat/completions";
const STREAM_CHUNK_TIMEOUT_SECS: u64 = 120;

pub struct OpenAiProvider {
    client: reqwest::Client,
    base_url: String,
    config: ProviderConfig,
    resolver: Arc<CredentialResolver>,
    default_model: String,
}

impl OpenAiProvider {
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
        let messages: Vec<Value> = request.messages.iter().map(convert_message).collect();
        let mut payload = json!({
            "model": request.model,
            "messages": messages,
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
            "stream": true,
            "stream_options": {"include_usage": true},
        });
        if !request.tools.is_empty() {
            payload["tools"] = json!(convert_tools(&request.tools));
        }
        payload
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
    }

    fn default_model(&self) -> &str {
        &self.default_model
    }

    async fn submit(
        &self,
        request: ProviderRequest,
        cancel: CancellationToken,
    ) -> PryxResult<mpsc::Receiver<ProviderEvent>> {
        let credential = self.resolver.resolve("openai", &self.config).await?;
        let payload = Self::build_payload(&request);

        let resp = self
            .client
            .post(&self.base_url)
            .bearer_auth(credential.secret())
            .json(&payload)
            .send()
            .await
            .map_err(|e| PryxError::Provider {
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
                401 | 403 => PryxError::Auth(body),
                429 => PryxError::RateLimit { retry_after },
                s if s >= 500 => PryxError::Provider {
                    message: format!("upstream {s}"),
                    retryable: true,
                },
                s => PryxError::Provider {
                    message: format!("API error {s}: {body}"),
                    retryable: false,
                },
            });
        }

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        tokio::spawn(async move {
            let mut stream = resp.bytes_stream();
            let mut decoder = SseDecoder::new();
            // Tool call fragments accumulate per index until finish.
            let mut partial_tools: BTreeMap<u64, (String, String, String)> = BTreeMap::new();
            let mut finish: Option<FinishReason> = None;

            loop {
                let chunk = tokio::select! {
                    () = cancel.cancelled() => {
                        debug!("openai stream cancelled");
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
                    // `[DONE]` decodes with no data and falls through here.
                    let Some(data) = frame.data else { continue };

                    if let Some(usage) = data.get("usage").filter(|u| !u.is_null()) {
                        let _ = tx
                            .send(ProviderEvent::Usage {
                                input_tokens: usage["prompt_tokens"].as_i64().unwrap_or(0),
                                output_tokens: usage["completion_tokens"].as_i64().unwrap_or(0),
                            })
                            .await;
                    }

                    let Some(choice) = data["choices"].get(0) else {
                        continue;
                    };
                    let delta = &choice["delta"];
                    if let Some(text) = delta["content"].as_str()
                        && !text.is_empty()
                    {
                        let _ = tx.send(ProviderEvent::TextDelta(text.to_string())).await;
                    }
                    if let Some(tool_calls) = delta["tool_calls"].as_array() {
                        for tc in tool_calls {
                            let index = tc["index"].as_u64().unwrap_or(0);
                            let entry = partial_tools.entry(index).or_default();
                            if let Some(id) = tc["id"].as_str() {
                                entry.0 = id.to_string();
                            }
                            if let Some(name) = tc["function"]["name"].as_str() {
                                entry.1.push_str(name);
                                let _ = tx
                                    .send(ProviderEvent::ToolCallStart {
                                        id: entry.0.clone(),
                                        name: entry.1.clone(),
                                    })
                                    .await;
                            }
                            if let Some(args) = tc["function"]["arguments"].as_str() {
                                entry.2.push_str(args);
                                let _ = tx
                                    .send(ProviderEvent::ToolCallDelta {
                                        id: entry.0.clone(),
                                        arguments_fragment: args.to_string(),
                                    })
                                    .await;
                            }
                        }
                    }
                    if let Some(reason) = choice["finish_reason"].as_str() {
                        finish = Some(match reason {
                            "stop" => FinishReason::Stop,
                            "tool_calls" => FinishReason::ToolUse,
                            "length" => FinishReason::MaxTokens,
                            other => FinishReason::Other(other.to_string()),
                        });
                    }
                }
            }

            // Finalise accumulated tool calls before closing the stream.
            for (_, (id, name, args)) in partial_tools {
                if name.is_empty() {
                    continue;
                }
                let arguments: Value = serde_json::from_str(&args).unwrap_or(Value::Null);
                let _ = tx
                    .send(ProviderEvent::ToolCall(ToolCallRequest {
                        id,
                        name,
                        arguments,
                    }))
                    .await;
            }
            let _ = tx
                .send(ProviderEvent::Finish(finish.unwrap_or(FinishReason::Stop)))
                .await;
        });

        Ok(rx)
    }

    async fn list_models(&self) -> PryxResult<Vec<String>> {
        Ok(vec!["gpt-5".into(), "gpt-4o".into(), "gpt-4o-mini".into()])
    }
}

fn convert_message(msg: &ChatMessage) -> Value {
    match msg.role.as_str() {
        "assistant" if !msg.tool_calls.is_empty() => {
            let tool_calls: Vec<Value> = msg
                .tool_calls
                .iter()
                .map(|tc| {
                    json!({
                        "id": tc.id,
                        "type": "function",
                        "function": {
                            "name": tc.name,
                            "arguments": tc.arguments.to_string(),
                        },
                    })
                })
                .collect();
            json!({
                "role": "assistant",
                "content": msg.content,
                "tool_calls": tool_calls,
            })
        }
        "tool" => json!({
            "role": "tool",
            "tool_call_id": msg.tool_call_id.clone().unwrap_or_default(),
            "content": msg.content,
        }),
        role => json!({"role": role, "content": msg.content}),
    }
}

fn convert_tools(tools: &[ToolDefinition]) -> Vec<Value> {
    tools
        .iter()
        .map(|t| {
            json!({
                "type": "function",
                "function": {
                    "name": t.name,
                    "description": t.description,
                    "parameters": t.parameters,
                },
            })
        })
        .collect()
}
