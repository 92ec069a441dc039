use serde::Serialize;
use std::collections::HashMap;

use crate::errors::{AgentError, AgentResult};
use crate::models::content::Content;
use crate::models::tool::{Tool, ToolCall};
use crate::providers::utils::sanitize_function_name;
use crate::systems::System;

/// Separator between the system name and the tool name in exposed tool names
pub const TOOL_SEPARATOR: &str = "__";

#[derive(Clone, Debug, Serialize)]
pub struct SystemInfo {
    pub name: String,
    pub description: String,
    pub instructions: String,
}

/// Registry of the systems an agent can operate
///
/// Every tool is exposed to the model as `<system>__<tool>`, reduced to the
/// characters providers accept in function names.
#[derive(Default)]
pub struct Controller {
    systems: Vec<Box<dyn System>>,
    // exposed name -> (index into systems, tool name local to the system)
    routes: HashMap<String, (usize, String)>,
}

impl Controller {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a system and all of its tools
    pub fn register(&mut self, system: Box<dyn System>) -> AgentResult<()> {
        let name = system.name().to_string();
        if name.is_empty() || name.contains(TOOL_SEPARATOR) {
            return Err(AgentError::InvalidToolName(format!(
                "System name '{}' must be non-empty and must not contain '{}'",
                name, TOOL_SEPARATOR
            )));
        }
        if self.systems.iter().any(|s| s.name() == name) {
            return Err(AgentError::Internal(format!(
                "A system named '{}' is already registered",
                name
            )));
        }

        let index = self.systems.len();
        let mut routes = Vec::with_capacity(system.tools().len());
        for tool in system.tools() {
            let exposed = exposed_name(&name, &tool.name);
            if self.routes.contains_key(&exposed) || routes.iter().any(|(e, _)| e == &exposed) {
                return Err(AgentError::InvalidToolName(format!(
                    "Tool '{}' of system '{}' collides with an existing tool name '{}'",
                    tool.name, name, exposed
                )));
            }
            routes.push((exposed, tool.name.clone()));
        }

        tracing::debug!(system = %name, tools = routes.len(), "registered system");
        for (exposed, local) in routes {
            self.routes.insert(exposed, (index, local));
        }
        self.systems.push(system);
        Ok(())
    }

    /// All tools with their exposed names, in registration order
    pub fn tools(&self) -> Vec<Tool> {
        self.systems
            .iter()
            .flat_map(|system| {
                system.tools().iter().map(move |tool| {
                    Tool::new(
                        exposed_name(system.name(), &tool.name),
                        &tool.description,
                        tool.input_schema.clone(),
                    )
                })
            })
            .collect()
    }

    /// Route a call made with an exposed tool name to the owning system
    pub async fn dispatch(&self, call: ToolCall) -> AgentResult<Vec<Content>> {
        if !call.name.contains(TOOL_SEPARATOR) {
            return Err(AgentError::InvalidToolName(call.name));
        }
        let (index, local) = self
            .routes
            .get(&call.name)
            .ok_or_else(|| AgentError::ToolNotFound(call.name.clone()))?;
        let system = &self.systems[*index];

        tracing::debug!(system = %system.name(), tool = %local, "dispatching tool call");
        system.call(ToolCall::new(local, call.arguments)).await
    }

    pub fn system_names(&self) -> Vec<&str> {
        self.systems.iter().map(|s| s.name()).collect()
    }

    pub fn systems_info(&self) -> Vec<SystemInfo> {
        self.systems
            .iter()
            .map(|system| SystemInfo {
                name: system.name().to_string(),
                description: system.description().to_string(),
                instructions: system.instructions().to_string(),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.systems.len()
    }

    pub fn is_empty(&self) -> bool {
        self.systems.is_empty()
    }
}

fn exposed_name(system: &str, tool: &str) -> String {
    sanitize_function_name(&format!("{}{}{}", system, TOOL_SEPARATOR, tool))
}
