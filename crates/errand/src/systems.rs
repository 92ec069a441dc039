use async_trait::async_trait;

use crate::errors::AgentResult;
use crate::models::content::Content;
use crate::models::tool::{Tool, ToolCall};

/// Core trait that defines a system that can be operated by an AI agent
#[async_trait]
pub trait System: Send + Sync {
    /// Get the name of the system
    fn name(&self) -> &str;

    /// Get the system description
    fn description(&self) -> &str;

    /// Get system instructions
    fn instructions(&self) -> &str;

    /// Get available tools, with names local to this system
    fn tools(&self) -> &[Tool];

    /// Call one of this system's tools by its local name
    async fn call(&self, tool_call: ToolCall) -> AgentResult<Vec<Content>>;
}
