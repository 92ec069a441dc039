use async_trait::async_trait;

use super::client::McpClient;
use super::error::McpError;
use crate::errors::{AgentError, AgentResult};
use crate::models::content::Content;
use crate::models::tool::{Tool, ToolCall};
use crate::systems::System;

/// The tools of one connected MCP server, presented as a [`System`]
pub struct McpSystem {
    client: McpClient,
    name: String,
    description: String,
    instructions: String,
    tools: Vec<Tool>,
}

impl McpSystem {
    /// Snapshot the server's tools so the controller can route to them
    pub async fn from_client(client: &McpClient) -> Result<Self, McpError> {
        let tools = client.list_tools().await?;
        let description = match client.server_info().await {
            Some(info) if !info.name.is_empty() => {
                format!("Tools provided by the MCP server {} {}", info.name, info.version)
                    .trim_end()
                    .to_string()
            }
            _ => format!("Tools provided by the MCP server {}", client.server_name()),
        };

        Ok(Self {
            client: client.clone(),
            name: client.server_name().to_string(),
            description,
            instructions: client.instructions().await.unwrap_or_default(),
            tools,
        })
    }
}

#[async_trait]
impl System for McpSystem {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn instructions(&self) -> &str {
        &self.instructions
    }

    fn tools(&self) -> &[Tool] {
        &self.tools
    }

    async fn call(&self, tool_call: ToolCall) -> AgentResult<Vec<Content>> {
        if !self.tools.iter().any(|t| t.name == tool_call.name) {
            return Err(AgentError::ToolNotFound(tool_call.name));
        }
        self.client
            .call_tool(&tool_call.name, tool_call.arguments)
            .await
            .map_err(|e| match e {
                McpError::ToolFailed(message) => AgentError::ExecutionError(message),
                other => AgentError::ExecutionError(other.to_string()),
            })
    }
}
