//! Wraps a single MCP server tool as an `impl Tool` for the registry.

use super::{McpServer, McpToolInfo};
use crate::policy::ActionClass;
use crate::tools::{Tool, ToolResult};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

pub struct McpProxyTool {
    server: Arc<McpServer>,
    info: McpToolInfo,
    qualified_name: String,
}

impl McpProxyTool {
    pub fn new(server: Arc<McpServer>, info: McpToolInfo) -> Self {
        let qualified_name = format!("{}.{}", server.name, info.name);
        Self {
            server,
            info,
            qualified_name,
        }
    }
}

#[async_trait]
impl Tool for McpProxyTool {
    fn name(&self) -> &str {
        &self.qualified_name
    }

    fn description(&self) -> &str {
        &self.info.description
    }

    fn parameters(&self) -> Value {
        self.info.schema.clone()
    }

    fn action_class(&self) -> ActionClass {
        // External processes/endpoints; policy treats them as network-facing.
        ActionClass::Network
    }

    async fn execute(&self, params: Value) -> anyhow::Result<ToolResult> {
        debug!("MCP tool call: {}", self.qualified_name);
        match self.server.call(&self.info.name, params).await {
            Ok((output, is_error)) => {
                if is_error {
                    Ok(ToolResult::error(output))
                } else {
                    Ok(ToolResult::new(output))
                }
            }
            Err(e) => {
                warn!("MCP tool '{}' failed: {}", self.qualified_name, e);
                self.server.mark_failed().await;
                Ok(ToolResult::error(format!(
                    "MCP tool '{}' call failed: {}",
                    self.qualified_name, e
                )))
            }
        }
    }
}
