use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::Client;
use reqwest::StatusCode;
use serde_json::{json, Value};
use std::time::Duration;

use super::base::{Provider, Usage};
use super::configs::AnthropicProviderConfig;
use super::utils::{ensure_unique_tool_names, is_valid_function_name, sanitize_function_name};
use crate::errors::AgentError;
use crate::models::content::Content;
use crate::models::message::{Message, MessageContent};
use crate::models::tool::{Tool, ToolCall};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: i32 = 4096;

pub struct AnthropicProvider {
    client: Client,
    config: AnthropicProviderConfig,
}

impl AnthropicProvider {
    pub fn new(config: AnthropicProviderConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(600)) // 10 minutes timeout
            .build()?;

        Ok(Self { client, config })
    }

    fn get_usage(data: &Value) -> Usage {
        let usage = &data["usage"];
        let read = |key: &str| usage.get(key).and_then(|v| v.as_i64()).map(|v| v as i32);
        Usage::new(read("input_tokens"), read("output_tokens"), None).with_derived_total()
    }

    fn content_to_block(content: &Content) -> Value {
        match content {
            Content::Text(text) => json!({"type": "text", "text": text.text}),
            Content::Image(image) => json!({
                "type": "image",
                "source": {
                    "type": "base64",
                    "media_type": image.mime_type,
                    "data": image.data,
                }
            }),
        }
    }

    fn messages_to_anthropic_spec(messages: &[Message]) -> Vec<Value> {
        let mut anthropic_messages = Vec::new();

        for message in messages {
            let mut blocks = Vec::new();
            for content in &message.content {
                match content {
                    MessageContent::Text(text) => {
                        if !text.text.is_empty() {
                            blocks.push(json!({"type": "text", "text": text.text}));
                        }
                    }
                    MessageContent::Image(image) => {
                        blocks.push(Self::content_to_block(&Content::Image(image.clone())));
                    }
                    MessageContent::ToolRequest(request) => match &request.tool_call {
                        Ok(tool_call) => blocks.push(json!({
                            "type": "tool_use",
                            "id": request.id,
                            "name": sanitize_function_name(&tool_call.name),
                            "input": tool_call.arguments,
                        })),
                        // A failed parse still needs a tool_use block so the error result can pair with it
                        Err(_) => blocks.push(json!({
                            "type": "tool_use",
                            "id": request.id,
                            "name": "invalid_tool_call",
                            "input": {},
                        })),
                    },
                    MessageContent::ToolResponse(response) => {
                        let block = match &response.tool_result {
                            Ok(contents) => json!({
                                "type": "tool_result",
                                "tool_use_id": response.id,
                                "content": contents
                                    .iter()
                                    .filter(|c| c.is_for_assistant())
                                    .map(Self::content_to_block)
                                    .collect::<Vec<_>>(),
                            }),
                            Err(e) => json!({
                                "type": "tool_result",
                                "tool_use_id": response.id,
                                "content": format!("The tool call returned the following error:\n{}", e),
                                "is_error": true,
                            }),
                        };
                        blocks.push(block);
                    }
                }
            }

            if !blocks.is_empty() {
                anthropic_messages.push(json!({
                    "role": message.role,
                    "content": blocks
                }));
            }
        }

        anthropic_messages
    }

    fn tools_to_anthropic_spec(tools: &[Tool]) -> Result<Vec<Value>> {
        ensure_unique_tool_names(tools)?;
        Ok(tools
            .iter()
            .map(|tool| {
                json!({
                    "name": tool.name,
                    "description": tool.description,
                    "input_schema": tool.input_schema,
                })
            })
            .collect())
    }

    fn response_to_message(response: &Value) -> Result<Message> {
        let blocks = response
            .get("content")
            .and_then(|c| c.as_array())
            .ok_or_else(|| anyhow!("Invalid response format from Anthropic API"))?;

        let mut message = Message::assistant();
        for block in blocks {
            match block.get("type").and_then(|t| t.as_str()) {
                Some("text") => {
                    if let Some(text) = block.get("text").and_then(|t| t.as_str()) {
                        message = message.with_text(text);
                    }
                }
                Some("tool_use") => {
                    let id = block["id"].as_str().unwrap_or_default().to_string();
                    let name = block["name"].as_str().unwrap_or_default();
                    let call = if is_valid_function_name(name) {
                        Ok(ToolCall::new(name, block["input"].clone()))
                    } else {
                        Err(AgentError::ToolNotFound(format!(
                            "The provided function name '{}' had invalid characters, it must match this regex [a-zA-Z0-9_-]+",
                            name
                        )))
                    };
                    message = message.with_tool_request(id, call);
                }
                other => tracing::debug!(block_type = ?other, "skipping anthropic content block"),
            }
        }
        Ok(message)
    }

    async fn post(&self, payload: Value) -> Result<Value> {
        let url = format!("{}/v1/messages", self.config.host.trim_end_matches('/'));

        let response = self
            .client
            .post(&url)
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&payload)
            .send()
            .await?;

        match response.status() {
            StatusCode::OK => Ok(response.json().await?),
            status if status == StatusCode::TOO_MANY_REQUESTS || status.as_u16() >= 500 => {
                Err(anyhow!("Server error: {}", status))
            }
            status => {
                let error_text = response.text().await.unwrap_or_default();
                Err(anyhow!("Request failed: {} - {}", status, error_text))
            }
        }
    }
}

#[async_trait]
impl Provider for AnthropicProvider {
    async fn complete(
        &self,
        system: &str,
        messages: &[Message],
        tools: &[Tool],
    ) -> Result<(Message, Usage)> {
        let mut payload = json!({
            "model": self.config.model,
            "system": system,
            "messages": Self::messages_to_anthropic_spec(messages),
            "max_tokens": self.config.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS)
        });

        if !tools.is_empty() {
            payload["tools"] = json!(Self::tools_to_anthropic_spec(tools)?);
        }
        if let Some(temp) = self.config.temperature {
            payload["temperature"] = json!(temp);
        }

        tracing::debug!(model = %self.config.model, messages = messages.len(), "anthropic completion");
        let response = self.post(payload).await?;

        let message = Self::response_to_message(&response)?;
        let usage = Self::get_usage(&response);

        Ok((message, usage))
    }
}
