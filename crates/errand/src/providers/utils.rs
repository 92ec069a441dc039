use anyhow::{anyhow, Result};
use serde_json::{json, Value};
use std::collections::HashSet;

use crate::errors::AgentError;
use crate::models::content::{Content, ImageContent};
use crate::models::message::{Message, MessageContent};
use crate::models::role::Role;
use crate::models::tool::{Tool, ToolCall};

/// Convert internal Message format to OpenAI's API message specification
pub fn messages_to_openai_spec(messages: &[Message]) -> Vec<Value> {
    let mut messages_spec = Vec::new();

    for message in messages {
        let mut converted = json!({
            "role": message.role
        });
        let mut tool_calls = Vec::new();
        let mut output = Vec::new();

        for content in &message.content {
            match content {
                MessageContent::Text(text) => {
                    if !text.text.is_empty() {
                        converted["content"] = json!(text.text);
                    }
                }
                MessageContent::ToolRequest(request) => match &request.tool_call {
                    Ok(tool_call) => {
                        tool_calls.push(json!({
                            "id": request.id,
                            "type": "function",
                            "function": {
                                "name": sanitize_function_name(&tool_call.name),
                                "arguments": tool_call.arguments.to_string(),
                            }
                        }));
                    }
                    Err(e) => {
                        output.push(json!({
                            "role": "tool",
                            "content": format!("Error: {}", e),
                            "tool_call_id": request.id
                        }));
                    }
                },
                MessageContent::ToolResponse(response) => match &response.tool_result {
                    Ok(contents) => {
                        let mut tool_content = Vec::new();
                        let mut image_messages = Vec::new();

                        for content in contents.iter().filter(|c| c.is_for_assistant()) {
                            match content.unannotated() {
                                Content::Image(image) => {
                                    tool_content.push(Content::text("This tool result included an image that is uploaded in the next message."));
                                    image_messages.push(json!({
                                        "role": "user",
                                        "content": [convert_image(&image)]
                                    }));
                                }
                                text => tool_content.push(text),
                            }
                        }

                        output.push(json!({
                            "role": "tool",
                            "content": tool_content,
                            "tool_call_id": response.id
                        }));
                        // Images must follow the tool message they belong to
                        output.extend(image_messages);
                    }
                    Err(e) => {
                        // A tool result error is shown as output so the model can interpret the error message
                        output.push(json!({
                            "role": "tool",
                            "content": format!("The tool call returned the following error:\n{}", e),
                            "tool_call_id": response.id
                        }));
                    }
                },
                MessageContent::Image(image) => {
                    converted["content"] = json!([convert_image(image)]);
                }
            }
        }

        if !tool_calls.is_empty() {
            converted["tool_calls"] = json!(tool_calls);
        }
        if converted.get("content").is_some() || converted.get("tool_calls").is_some() {
            output.insert(0, converted);
        }
        messages_spec.extend(output);
    }

    messages_spec
}

pub fn convert_image(image: &ImageContent) -> Value {
    json!({
        "type": "image_url",
        "image_url": {
            "url": format!("data:{};base64,{}", image.mime_type, image.data)
        }
    })
}

/// Convert internal Tool format to OpenAI's API tool specification
pub fn tools_to_openai_spec(tools: &[Tool]) -> Result<Vec<Value>> {
    ensure_unique_tool_names(tools)?;
    Ok(tools
        .iter()
        .map(|tool| {
            json!({
                "type": "function",
                "function": {
                    "name": tool.name,
                    "description": tool.description,
                    "parameters": tool.input_schema,
                }
            })
        })
        .collect())
}

pub fn ensure_unique_tool_names(tools: &[Tool]) -> Result<()> {
    let mut tool_names = HashSet::new();
    for tool in tools {
        if !tool_names.insert(&tool.name) {
            return Err(anyhow!("Duplicate tool name: {}", tool.name));
        }
    }
    Ok(())
}

/// Convert OpenAI's API response to internal Message format
pub fn openai_response_to_message(response: Value) -> Result<Message> {
    let original = response
        .get("choices")
        .and_then(|choices| choices.get(0))
        .and_then(|choice| choice.get("message"))
        .ok_or_else(|| anyhow!("Invalid response format from OpenAI API: no message"))?;

    let mut message = Message::assistant();

    if let Some(text) = original.get("content").and_then(|t| t.as_str()) {
        message = message.with_text(text);
    }

    if let Some(tool_calls) = original.get("tool_calls").and_then(|t| t.as_array()) {
        for tool_call in tool_calls {
            let id = tool_call["id"].as_str().unwrap_or_default().to_string();
            let function_name = tool_call["function"]["name"]
                .as_str()
                .unwrap_or_default()
                .to_string();
            let arguments = tool_call["function"]["arguments"]
                .as_str()
                .unwrap_or_default();
            message = message.with_tool_request(
                id.clone(),
                parse_tool_call(&id, &function_name, arguments),
            );
        }
    }

    Ok(message)
}

/// Validate a function name and decode its JSON-encoded arguments
pub fn parse_tool_call(id: &str, function_name: &str, arguments: &str) -> Result<ToolCall, AgentError> {
    if !is_valid_function_name(function_name) {
        return Err(AgentError::ToolNotFound(format!(
            "The provided function name '{}' had invalid characters, it must match this regex [a-zA-Z0-9_-]+",
            function_name
        )));
    }
    // Some models send an empty string for tools without parameters
    let arguments = if arguments.trim().is_empty() { "{}" } else { arguments };
    serde_json::from_str::<Value>(arguments)
        .map(|params| ToolCall::new(function_name, params))
        .map_err(|e| {
            AgentError::InvalidParameters(format!(
                "Could not interpret tool use parameters for id {}: {}",
                id, e
            ))
        })
}

pub fn sanitize_function_name(name: &str) -> String {
    name.chars()
        .map(|c| if is_function_name_char(c) { c } else { '_' })
        .collect()
}

pub fn is_valid_function_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(is_function_name_char)
}

fn is_function_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

/// Role string for providers that name the assistant "model"
pub fn gemini_role(role: Role) -> &'static str {
    match role {
        Role::User => "user",
        Role::Assistant => "model",
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Context length exceeded. Message: {0}")]
pub struct ContextLengthExceededError(String);

pub fn check_openai_context_length_error(error: &Value) -> Option<ContextLengthExceededError> {
    let code = error.get("code")?.as_str()?;
    if code == "context_length_exceeded" || code == "string_above_max_length" {
        let message = error
            .get("message")
            .and_then(|m| m.as_str())
            .unwrap_or("Unknown error")
            .to_string();
        Some(ContextLengthExceededError(message))
    } else {
        None
    }
}
