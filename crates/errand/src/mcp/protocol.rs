use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::models::content::Content;
use crate::models::role::Role;
use crate::models::tool::Tool;

pub const PROTOCOL_VERSION: &str = "2024-11-05";
pub const JSONRPC_VERSION: &str = "2.0";

pub const METHOD_NOT_FOUND: i64 = -32601;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    /// Absent for notifications
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(id: u64, method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(json!(id)),
            method: method.to_string(),
            params,
        }
    }

    pub fn notification(method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: None,
            method: method.to_string(),
            params,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(id),
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: Value, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(id),
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
                data: None,
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// A line read from the server, classified by shape
#[derive(Debug)]
pub enum Incoming {
    Response(JsonRpcResponse),
    /// A request the server sends to us; it expects an answer
    Request { id: Value, method: String },
    Notification { method: String },
}

impl Incoming {
    pub fn parse(line: &str) -> Result<Self, serde_json::Error> {
        let value: Value = serde_json::from_str(line)?;
        let method = value.get("method").and_then(|m| m.as_str()).map(String::from);
        let id = value.get("id").filter(|id| !id.is_null()).cloned();
        Ok(match (method, id) {
            (Some(method), Some(id)) => Incoming::Request { id, method },
            (Some(method), None) => Incoming::Notification { method },
            (None, _) => Incoming::Response(serde_json::from_value(value)?),
        })
    }
}

pub fn initialize_params(client_name: &str, client_version: &str) -> Value {
    json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": {
            "name": client_name,
            "version": client_version
        }
    })
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Implementation {
    pub name: String,
    #[serde(default)]
    pub version: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    #[serde(default)]
    pub protocol_version: String,
    #[serde(default)]
    pub server_info: Implementation,
    #[serde(default)]
    pub instructions: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpTool {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "empty_object_schema")]
    pub input_schema: Value,
}

fn empty_object_schema() -> Value {
    json!({"type": "object", "properties": {}})
}

impl From<McpTool> for Tool {
    fn from(tool: McpTool) -> Self {
        Tool::new(tool.name, tool.description.unwrap_or_default(), tool.input_schema)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListToolsResult {
    #[serde(default)]
    pub tools: Vec<McpTool>,
    #[serde(default)]
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Annotations {
    #[serde(default)]
    pub audience: Option<Vec<Role>>,
    #[serde(default)]
    pub priority: Option<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceContents {
    pub uri: String,
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum McpContent {
    Text {
        text: String,
        #[serde(default)]
        annotations: Option<Annotations>,
    },
    #[serde(rename_all = "camelCase")]
    Image {
        data: String,
        mime_type: String,
        #[serde(default)]
        annotations: Option<Annotations>,
    },
    Resource {
        resource: ResourceContents,
        #[serde(default)]
        annotations: Option<Annotations>,
    },
    #[serde(other)]
    Unsupported,
}

impl McpContent {
    pub fn into_content(self) -> Content {
        let (content, annotations) = match self {
            McpContent::Text { text, annotations } => (Content::text(text), annotations),
            McpContent::Image {
                data,
                mime_type,
                annotations,
            } => (Content::image(data, mime_type), annotations),
            McpContent::Resource {
                resource,
                annotations,
            } => {
                let text = resource
                    .text
                    .unwrap_or_else(|| format!("[binary resource {}]", resource.uri));
                (Content::text(text), annotations)
            }
            McpContent::Unsupported => (
                Content::text("[tool returned content of an unsupported type]"),
                None,
            ),
        };

        match annotations {
            Some(Annotations { audience, priority }) => {
                let content = match audience {
                    Some(audience) => content.with_audience(audience),
                    None => content,
                };
                match priority {
                    Some(priority) => content.with_priority(priority),
                    None => content,
                }
            }
            None => content,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallToolResult {
    #[serde(default)]
    pub content: Vec<McpContent>,
    #[serde(default)]
    pub is_error: bool,
}
