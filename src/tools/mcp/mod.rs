//! MCP server connections and tool discovery.
//!
//! Connections are lazy and long-lived. A server that fails to connect is
//! marked errored and retried with exponential backoff (1 s initial, 60 s
//! cap, jitter); its tools are hidden until it recovers. Invocations on one
//! connection are serialised by a per-server mutex: the underlying protocol
//! is half-duplex, and interleaved frames would corrupt state.

pub mod http;
pub mod proxy;

use crate::config::{McpServerConfig, McpTransport};
use anyhow::{Context, Result, bail};
use http::HttpMcpClient;
use rmcp::ServiceExt;
use rmcp::transport::TokioChildProcess;
use serde_json::Value;
use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::{info, warn};

const BACKOFF_INITIAL_SECS: f64 = 1.0;
const BACKOFF_CAP_SECS: f64 = 60.0;

#[derive(Debug, Clone)]
pub struct McpToolInfo {
    pub name: String,
    pub description: String,
    pub schema: Value,
}

enum Connection {
    Stdio(rmcp::service::RunningService<rmcp::RoleClient, ()>),
    Http(HttpMcpClient),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerHealth {
    Disconnected,
    Connected,
    Errored,
}

struct ServerInner {
    conn: Option<Connection>,
    health: ServerHealth,
    attempt: u32,
    retry_at: Option<Instant>,
}

pub struct McpServer {
    pub name: String,
    pub config: McpServerConfig,
    /// Guards the connection and serialises invocations (half-duplex).
    inner: tokio::sync::Mutex<ServerInner>,
    tools: RwLock<Vec<McpToolInfo>>,
}

impl McpServer {
    fn new(name: String, config: McpServerConfig) -> Self {
        Self {
            name,
            config,
            inner: tokio::sync::Mutex::new(ServerInner {
                conn: None,
                health: ServerHealth::Disconnected,
                attempt: 0,
                retry_at: None,
            }),
            tools: RwLock::new(Vec::new()),
        }
    }

    pub fn health_sync(&self) -> ServerHealth {
        self.inner
            .try_lock()
            .map(|g| g.health)
            .unwrap_or(ServerHealth::Connected)
    }

    pub fn known_tools(&self) -> Vec<McpToolInfo> {
        self.tools.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    async fn connect_locked(&self, inner: &mut ServerInner) -> Result<()> {
        if inner.conn.is_some() {
            return Ok(());
        }
        if let Some(retry_at) = inner.retry_at
            && Instant::now() < retry_at
        {
            bail!(
                "server '{}' backing off after {} failed attempt(s)",
                self.name,
                inner.attempt
            );
        }

        let connected = match self.config.transport {
            McpTransport::Stdio => self.connect_stdio().await,
            McpTransport::Http | McpTransport::Sse => self.connect_http().await,
        };
        match connected {
            Ok(conn) => {
                inner.conn = Some(conn);
                inner.health = ServerHealth::Connected;
                inner.attempt = 0;
                inner.retry_at = None;
                info!("MCP server '{}' connected", self.name);
                Ok(())
            }
            Err(e) => {
                inner.health = ServerHealth::Errored;
                inner.attempt += 1;
                let base = (BACKOFF_INITIAL_SECS
                    * 2f64.powi(inner.attempt.saturating_sub(1) as i32))
                .min(BACKOFF_CAP_SECS);
                let delay = base + fastrand::f64() * base * 0.25;
                inner.retry_at = Some(Instant::now() + Duration::from_secs_f64(delay));
                warn!(
                    "MCP server '{}' connect failed (attempt {}, retry in {:.1}s): {}",
                    self.name, inner.attempt, delay, e
                );
                Err(e)
            }
        }
    }

    async fn connect_stdio(&self) -> Result<Connection> {
        let mut cmd = Command::new(&self.config.command);
        cmd.args(&self.config.args);
        for (k, v) in &self.config.env {
            cmd.env(k, v);
        }
        cmd.stdin(std::process::Stdio::piped());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::inherit());

        let transport = TokioChildProcess::new(cmd)?;
        let client = ()
            .serve(transport)
            .await
            .map_err(|e| anyhow::anyhow!("MCP handshake failed for '{}': {}", self.name, e))?;
        Ok(Connection::Stdio(client))
    }

    async fn connect_http(&self) -> Result<Connection> {
        let client = HttpMcpClient::new(self.config.endpoint.clone());
        client.initialize().await?;
        Ok(Connection::Http(client))
    }

    /// Connect if needed and refresh the tool list. Idempotent.
    pub async fn refresh(&self) -> Result<usize> {
        let mut inner = self.inner.lock().await;
        self.connect_locked(&mut inner).await?;
        let listed = match inner.conn.as_ref().context("not connected")? {
            Connection::Stdio(client) => {
                let tools = client
                    .peer()
                    .list_all_tools()
                    .await
                    .map_err(|e| anyhow::anyhow!("tools/list failed: {e}"))?;
                tools
                    .into_iter()
                    .map(|t| McpToolInfo {
                        name: t.name.to_string(),
                        description: t.description.as_deref().unwrap_or("").to_string(),
                        schema: Value::Object((*t.input_schema).clone()),
                    })
                    .collect::<Vec<_>>()
            }
            Connection::Http(client) => client
                .list_tools()
                .await?
                .into_iter()
                .map(|(name, description, schema)| McpToolInfo {
                    name,
                    description,
                    schema,
                })
                .collect(),
        };
        let count = listed.len();
        {
            let mut tools = self.tools.write().unwrap_or_else(|e| e.into_inner());
            *tools = listed;
        }
        info!("MCP server '{}' exposes {} tool(s)", self.name, count);
        Ok(count)
    }

    /// Invoke a tool on this server. The inner mutex is held for the whole
    /// call, so invocations never interleave on one connection.
    pub async fn call(&self, tool: &str, arguments: Value) -> Result<(String, bool)> {
        let mut inner = self.inner.lock().await;
        self.connect_locked(&mut inner).await?;
        let result = match inner.conn.as_ref().context("not connected")? {
            Connection::Stdio(client) => {
                let args = match arguments {
                    Value::Object(map) => Some(map),
                    Value::Null => None,
                    other => {
                        let mut map = serde_json::Map::new();
                        map.insert("input".to_string(), other);
                        Some(map)
                    }
                };
                let mut request = rmcp::model::CallToolRequestParams::new(Cow::Owned(tool.to_string()));
                if let Some(args) = args {
                    request = request.with_arguments(args);
                }
                let result = client
                    .peer()
                    .call_tool(request)
                    .await
                    .map_err(|e| anyhow::anyhow!("tools/call failed: {e}"))?;
                let is_error = result.is_error.unwrap_or(false);
                let mut output = String::new();
                for content in &result.content {
                    if let rmcp::model::RawContent::Text(text) = &content.raw {
                        if !output.is_empty() {
                            output.push('\n');
                        }
                        output.push_str(&text.text);
                    }
                }
                if output.is_empty() {
                    output = "(no output)".to_string();
                }
                (output, is_error)
            }
            Connection::Http(client) => client.call_tool(tool, arguments).await?,
        };
        Ok(result)
    }

    /// Drop the connection and remember the failure for backoff purposes.
    pub async fn mark_failed(&self) {
        let mut inner = self.inner.lock().await;
        inner.conn = None;
        inner.health = ServerHealth::Errored;
        inner.attempt += 1;
        let base = (BACKOFF_INITIAL_SECS * 2f64.powi(inner.attempt.saturating_sub(1) as i32))
            .min(BACKOFF_CAP_SECS);
        inner.retry_at = Some(Instant::now() + Duration::from_secs_f64(base));
    }

    pub async fn shutdown(&self) {
        let mut inner = self.inner.lock().await;
        if let Some(Connection::Stdio(client)) = inner.conn.take()
            && let Err(e) = client.cancel().await
        {
            warn!("error shutting down MCP server '{}': {}", self.name, e);
        }
        inner.health = ServerHealth::Disconnected;
    }
}

/// Owns the server descriptors and their connections.
pub struct McpManager {
    servers: RwLock<HashMap<String, Arc<McpServer>>>,
}

impl McpManager {
    pub fn from_config(configs: &HashMap<String, McpServerConfig>) -> Self {
        let servers = configs
            .iter()
            .map(|(name, cfg)| {
                (
                    name.clone(),
                    Arc::new(McpServer::new(name.clone(), cfg.clone())),
                )
            })
            .collect();
        Self {
            servers: RwLock::new(servers),
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<McpServer>> {
        self.servers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    pub fn list(&self) -> Vec<Arc<McpServer>> {
        let mut servers: Vec<_> = self
            .servers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        servers.sort_by(|a, b| a.name.cmp(&b.name));
        servers
    }

    pub fn add(&self, name: String, config: McpServerConfig) -> Arc<McpServer> {
        let server = Arc::new(McpServer::new(name.clone(), config));
        let mut servers = self.servers.write().unwrap_or_else(|e| e.into_inner());
        servers.insert(name, server.clone());
        server
    }

    pub async fn remove(&self, name: &str) -> bool {
        let server = {
            let mut servers = self.servers.write().unwrap_or_else(|e| e.into_inner());
            servers.remove(name)
        };
        match server {
            Some(server) => {
                server.shutdown().await;
                true
            }
            None => false,
        }
    }

    /// Refresh every enabled server, swallowing individual failures (they
    /// are already marked for backoff).
    pub async fn refresh_all(&self) {
        for server in self.list() {
            if !server.config.enabled {
                continue;
            }
            if let Err(e) = server.refresh().await {
                warn!("MCP refresh for '{}' failed: {}", server.name, e);
            }
        }
    }

    /// Discovered tools of enabled, healthy servers, as
    /// `(server, trust, tool)` tuples for the registry.
    pub fn discovered_tools(&self) -> Vec<(Arc<McpServer>, String, McpToolInfo)> {
        let mut out = Vec::new();
        for server in self.list() {
            if !server.config.enabled || server.health_sync() != ServerHealth::Connected {
                continue;
            }
            for tool in server.known_tools() {
                out.push((server.clone(), server.config.trust.clone(), tool));
            }
        }
        out
    }

    pub async fn shutdown(&self) {
        for server in self.list() {
            server.shutdown().await;
        }
    }
}
