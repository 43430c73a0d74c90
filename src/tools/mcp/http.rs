//! Minimal JSON-RPC client for MCP servers reachable over HTTP. Handles
//! both plain-JSON responses and servers that answer a POST with a short
//! SSE stream (the streamable-http flavour); in the latter case the
//! response message is fished out of the event stream by request id.

use crate::providers::sse::SseDecoder;
use anyhow::{Context, Result, bail};
use serde_json::{Value, json};
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;
use tracing::debug;

const PROTOCOL_VERSION: &str = "2025-03-26";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

pub struct HttpMcpClient {
    client: reqwest::Client,
    endpoint: String,
    next_id: AtomicI64,
}

impl HttpMcpClient {
    pub fn new(endpoint: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint,
            next_id: AtomicI64::new(1),
        }
    }

    async fn rpc(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        debug!("mcp http rpc: {} (id={})", method, id);
        let resp = self
            .client
            .post(&self.endpoint)
            .header("accept", "application/json, text/event-stream")
            .timeout(REQUEST_TIMEOUT)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("MCP request to {} failed", self.endpoint))?;
        if !resp.status().is_success() {
            bail!("MCP server returned HTTP {}", resp.status());
        }

        let content_type = resp
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let text = resp.text().await.context("MCP response unreadable")?;

        let message = if content_type.contains("text/event-stream") {
            // The whole event stream is in hand; decode it and fish out the
            // response message by request id.
            let mut decoder = SseDecoder::new();
            let mut frames = decoder.feed(text.as_bytes());
            frames.extend(decoder.finish());
            frames
                .into_iter()
                .filter_map(|f| f.data)
                .find(|m| m["id"].as_i64() == Some(id))
                .context("no response message in MCP event stream")?
        } else {
            serde_json::from_str(&text).context("MCP response is not JSON")?
        };

        if let Some(error) = message.get("error").filter(|e| !e.is_null()) {
            bail!(
                "MCP error {}: {}",
                error["code"].as_i64().unwrap_or(0),
                error["message"].as_str().unwrap_or("unknown")
            );
        }
        Ok(message["result"].clone())
    }

    async fn notify(&self, method: &str) -> Result<()> {
        let body = json!({"jsonrpc": "2.0", "method": method});
        self.client
            .post(&self.endpoint)
            .timeout(REQUEST_TIMEOUT)
            .json(&body)
            .send()
            .await?;
        Ok(())
    }

    pub async fn initialize(&self) -> Result<()> {
        self.rpc(
            "initialize",
            json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {},
                "clientInfo": {"name": "pryx", "version": env!("CARGO_PKG_VERSION")},
            }),
        )
        .await?;
        // Best effort; some servers don't require it.
        let _ = self.notify("notifications/initialized").await;
        Ok(())
    }

    pub async fn list_tools(&self) -> Result<Vec<(String, String, Value)>> {
        let result = self.rpc("tools/list", json!({})).await?;
        let tools = result["tools"]
            .as_array()
            .context("tools/list result missing tools array")?;
        Ok(tools
            .iter()
            .filter_map(|t| {
                let name = t["name"].as_str()?.to_string();
                let description = t["description"].as_str().unwrap_or("").to_string();
                let schema = t
                    .get("inputSchema")
                    .cloned()
                    .unwrap_or_else(|| json!({"type": "object"}));
                Some((name, description, schema))
            })
            .collect())
    }

    /// Returns `(concatenated text content, is_error)`.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<(String, bool)> {
        let result = self
            .rpc("tools/call", json!({"name": name, "arguments": arguments}))
            .await?;
        let is_error = result["isError"].as_bool().unwrap_or(false);
        let mut output = String::new();
        if let Some(blocks) = result["content"].as_array() {
            for block in blocks {
                match block["type"].as_str() {
                    Some("text") => {
                        if !output.is_empty() {
                            output.push('\n');
                        }
                        output.push_str(block["text"].as_str().unwrap_or(""));
                    }
                    Some(other) => {
                        if !output.is_empty() {
                            output.push('\n');
                        }
                        output.push_str(&format!("[{other} content]"));
                    }
                    None => {}
                }
            }
        }
        if output.is_empty() {
            output = "(no output)".to_string();
        }
        Ok((output, is_error))
    }
}
