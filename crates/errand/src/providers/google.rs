use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::Client;
use reqwest::StatusCode;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use super::base::{Provider, Usage};
use super::configs::GoogleProviderConfig;
use super::utils::{ensure_unique_tool_names, gemini_role, is_valid_function_name};
use crate::errors::AgentError;
use crate::models::content::Content;
use crate::models::message::{Message, MessageContent};
use crate::models::tool::{Tool, ToolCall};

// Gemini function calls carry no id, so we mint our own to pair requests with responses
static NEXT_CALL_ID: AtomicU64 = AtomicU64::new(1);

// JSON Schema keywords the Gemini function declaration schema rejects
const UNSUPPORTED_SCHEMA_KEYS: &[&str] = &["$schema", "additionalProperties", "$ref", "$defs"];

// Finish reasons that may legitimately come back with no content
const COMPLETE_FINISH_REASONS: &[&str] = &["STOP", "MAX_TOKENS"];

pub struct GoogleProvider {
    client: Client,
    config: GoogleProviderConfig,
}

impl GoogleProvider {
    pub fn new(config: GoogleProviderConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(600)) // 10 minutes timeout
            .build()?;

        Ok(Self { client, config })
    }

    fn get_usage(data: &Value) -> Usage {
        let usage = &data["usageMetadata"];
        let read = |key: &str| usage.get(key).and_then(|v| v.as_i64()).map(|v| v as i32);
        Usage::new(
            read("promptTokenCount"),
            read("candidatesTokenCount"),
            read("totalTokenCount"),
        )
        .with_derived_total()
    }

    fn messages_to_gemini_spec(messages: &[Message]) -> Vec<Value> {
        // functionResponse parts are keyed by function name, not by call id
        let mut call_names: HashMap<&str, &str> = HashMap::new();
        let mut contents = Vec::new();

        for message in messages {
            let mut parts = Vec::new();
            for content in &message.content {
                match content {
                    MessageContent::Text(text) => {
                        if !text.text.is_empty() {
                            parts.push(json!({"text": text.text}));
                        }
                    }
                    MessageContent::Image(image) => parts.push(json!({
                        "inlineData": {"mimeType": image.mime_type, "data": image.data}
                    })),
                    MessageContent::ToolRequest(request) => {
                        if let Ok(tool_call) = &request.tool_call {
                            call_names.insert(&request.id, &tool_call.name);
                            parts.push(json!({
                                "functionCall": {
                                    "name": tool_call.name,
                                    "args": tool_call.arguments,
                                }
                            }));
                        }
                    }
                    MessageContent::ToolResponse(response) => {
                        let Some(name) = call_names.get(response.id.as_str()) else {
                            // The request never reached the model as a functionCall; report in text
                            if let Err(e) = &response.tool_result {
                                parts.push(json!({"text": format!("The tool call returned the following error:\n{}", e)}));
                            }
                            continue;
                        };
                        match &response.tool_result {
                            Ok(results) => {
                                let mut texts = Vec::new();
                                let mut images = Vec::new();
                                for result in results.iter().filter(|c| c.is_for_assistant()) {
                                    match result {
                                        Content::Text(text) => texts.push(text.text.clone()),
                                        Content::Image(image) => {
                                            texts.push("This tool result included an image that is uploaded alongside this response.".to_string());
                                            images.push(json!({
                                                "inlineData": {"mimeType": image.mime_type, "data": image.data}
                                            }));
                                        }
                                    }
                                }
                                parts.push(json!({
                                    "functionResponse": {
                                        "name": name,
                                        "response": {"content": texts.join("\n")}
                                    }
                                }));
                                parts.extend(images);
                            }
                            Err(e) => parts.push(json!({
                                "functionResponse": {
                                    "name": name,
                                    "response": {"error": e.to_string()}
                                }
                            })),
                        }
                    }
                }
            }

            if !parts.is_empty() {
                contents.push(json!({
                    "role": gemini_role(message.role),
                    "parts": parts
                }));
            }
        }

        contents
    }

    fn tools_to_gemini_spec(tools: &[Tool]) -> Result<Vec<Value>> {
        ensure_unique_tool_names(tools)?;
        Ok(tools
            .iter()
            .map(|tool| {
                let mut declaration = json!({
                    "name": tool.name,
                    "description": tool.description,
                });
                // Parameterless tools must omit the schema entirely
                let has_properties = tool
                    .input_schema
                    .get("properties")
                    .and_then(|p| p.as_object())
                    .is_some_and(|p| !p.is_empty());
                if has_properties {
                    declaration["parameters"] = clean_schema(&tool.input_schema);
                }
                declaration
            })
            .collect())
    }

    fn response_to_message(response: &Value) -> Result<Message> {
        let candidate = response
            .get("candidates")
            .and_then(|c| c.get(0))
            .ok_or_else(|| match response.get("promptFeedback") {
                Some(feedback) => anyhow!("Gemini returned no candidates: {}", feedback),
                None => anyhow!("Invalid response format from Gemini API: no candidates"),
            })?;

        let parts = candidate["content"]["parts"]
            .as_array()
            .cloned()
            .unwrap_or_default();

        if parts.is_empty() {
            let reason = candidate["finishReason"].as_str().unwrap_or("UNSPECIFIED");
            if !COMPLETE_FINISH_REASONS.contains(&reason) {
                return Err(anyhow!(
                    "Gemini stopped without a response: finishReason {}",
                    reason
                ));
            }
        }

        let mut message = Message::assistant();
        for part in parts {
            if let Some(text) = part.get("text").and_then(|t| t.as_str()) {
                message = message.with_text(text);
            } else if let Some(call) = part.get("functionCall") {
                let id = format!("gemini_call_{}", NEXT_CALL_ID.fetch_add(1, Ordering::Relaxed));
                let name = call["name"].as_str().unwrap_or_default();
                let tool_call = if is_valid_function_name(name) {
                    let args = match call.get("args") {
                        Some(Value::Null) | None => json!({}),
                        Some(args) => args.clone(),
                    };
                    Ok(ToolCall::new(name, args))
                } else {
                    Err(AgentError::ToolNotFound(format!(
                        "The provided function name '{}' had invalid characters, it must match this regex [a-zA-Z0-9_-]+",
                        name
                    )))
                };
                message = message.with_tool_request(id, tool_call);
            }
        }

        Ok(message)
    }

    async fn post(&self, payload: Value) -> Result<Value> {
        let url = format!(
            "{}/v1beta/models/{}:generateContent",
            self.config.host.trim_end_matches('/'),
            self.config.model
        );

        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.config.api_key)
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

/// Drop schema keywords Gemini does not accept, recursively
fn clean_schema(schema: &Value) -> Value {
    match schema {
        Value::Object(map) => {
            let cleaned: Map<String, Value> = map
                .iter()
                .filter(|(key, _)| !UNSUPPORTED_SCHEMA_KEYS.contains(&key.as_str()))
                .map(|(key, value)| (key.clone(), clean_schema(value)))
                .collect();
            Value::Object(cleaned)
        }
        Value::Array(items) => Value::Array(items.iter().map(clean_schema).collect()),
        other => other.clone(),
    }
}

#[async_trait]
impl Provider for GoogleProvider {
    async fn complete(
        &self,
        system: &str,
        messages: &[Message],
        tools: &[Tool],
    ) -> Result<(Message, Usage)> {
        let mut payload = json!({
            "contents": Self::messages_to_gemini_spec(messages),
        });

        if !system.is_empty() {
            payload["systemInstruction"] = json!({"parts": [{"text": system}]});
        }
        if !tools.is_empty() {
            payload["tools"] = json!([{
                "functionDeclarations": Self::tools_to_gemini_spec(tools)?
            }]);
        }

        let mut generation_config = Map::new();
        if let Some(temp) = self.config.temperature {
            generation_config.insert("temperature".to_string(), json!(temp));
        }
        if let Some(tokens) = self.config.max_tokens {
            generation_config.insert("maxOutputTokens".to_string(), json!(tokens));
        }
        if !generation_config.is_empty() {
            payload["generationConfig"] = Value::Object(generation_config);
        }

        tracing::debug!(model = %self.config.model, messages = messages.len(), "gemini completion");
        let response = self.post(payload).await?;

        if let Some(error) = response.get("error") {
            return Err(anyhow!("Gemini API error: {}", error));
        }

        let message = Self::response_to_message(&response)?;
        let usage = Self::get_usage(&response);

        Ok((message, usage))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::Agent;
    use crate::controller::Controller;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn setup_mock_server(response_body: Value) -> (MockServer, GoogleProvider) {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1beta/models/gemini-2.0-flash-exp:generateContent"))
            .and(header("x-goog-api-key", "test_api_key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(response_body))
            .mount(&mock_server)
            .await;

        let provider = GoogleProvider::new(GoogleProviderConfig {
            host: mock_server.uri(),
            api_key: "test_api_key".to_string(),
            model: "gemini-2.0-flash-exp".to_string(),
            temperature: None,
            max_tokens: Some(512),
        })
        .unwrap();
        (mock_server, provider)
    }

    #[tokio::test]
    async fn test_complete_basic() -> Result<()> {
        let response_body = json!({
            "candidates": [{
                "content": {"role": "model", "parts": [{"text": "Hello there."}]},
                "finishReason": "STOP"
            }],
            "usageMetadata": {
                "promptTokenCount": 8,
                "candidatesTokenCount": 3,
                "totalTokenCount": 11
            }
        });

        let (_server, provider) = setup_mock_server(response_body).await;
        let (message, usage) = provider
            .complete("Be brief.", &[Message::user().with_text("Hi")], &[])
            .await?;

        assert_eq!(message.text(), "Hello there.");
        assert_eq!(usage, Usage::new(Some(8), Some(3), Some(11)));
        Ok(())
    }

    #[tokio::test]
    async fn test_complete_function_call() -> Result<()> {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1beta/models/gemini-2.0-flash-exp:generateContent"))
            .and(body_partial_json(json!({
                "systemInstruction": {"parts": [{"text": "system"}]},
                "generationConfig": {"maxOutputTokens": 512}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "candidates": [{
                    "content": {"role": "model", "parts": [{
                        "functionCall": {
                            "name": "filesystem__search_files",
                            "args": {"path": "/docs", "pattern": "report.pdf"}
                        }
                    }]}
                }]
            })))
            .mount(&mock_server)
            .await;

        let provider = GoogleProvider::new(GoogleProviderConfig {
            host: mock_server.uri(),
            api_key: "test_api_key".to_string(),
            model: "gemini-2.0-flash-exp".to_string(),
            temperature: None,
            max_tokens: Some(512),
        })?;
        let tool = Tool::new(
            "filesystem__search_files",
            "Search files",
            json!({
                "$schema": "http://json-schema.org/draft-07/schema#",
                "type": "object",
                "properties": {"path": {"type": "string"}, "pattern": {"type": "string"}},
                "additionalProperties": false
            }),
        );

        let (message, _) = provider
            .complete("system", &[Message::user().with_text("find")], &[tool])
            .await?;

        let requests = message.tool_requests();
        assert_eq!(requests.len(), 1);
        assert!(requests[0].id.starts_with("gemini_call_"));
        let call = requests[0].tool_call.as_ref().unwrap();
        assert_eq!(call.name, "filesystem__search_files");
        assert_eq!(call.arguments["pattern"], "report.pdf");
        Ok(())
    }

    #[tokio::test]
    async fn test_no_candidates_is_error() {
        let (_server, provider) = setup_mock_server(json!({
            "promptFeedback": {"blockReason": "SAFETY"}
        }))
        .await;
        let err = provider
            .complete("system", &[Message::user().with_text("hi")], &[])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("SAFETY"));
    }

    #[tokio::test]
    async fn test_empty_candidate_with_failure_reason_is_error() {
        let (_server, provider) = setup_mock_server(json!({
            "candidates": [{"finishReason": "MALFORMED_FUNCTION_CALL"}]
        }))
        .await;
        let err = provider
            .complete("system", &[Message::user().with_text("hi")], &[])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("MALFORMED_FUNCTION_CALL"));
    }

    #[tokio::test]
    async fn test_empty_candidate_with_stop_is_empty_message() -> Result<()> {
        let (_server, provider) = setup_mock_server(json!({
            "candidates": [{"content": {"role": "model"}, "finishReason": "STOP"}]
        }))
        .await;
        let (message, _) = provider
            .complete("system", &[Message::user().with_text("hi")], &[])
            .await?;
        assert!(message.content.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_safety_stop_fails_agent_run() {
        let (_server, provider) = setup_mock_server(json!({
            "candidates": [{"finishReason": "SAFETY"}]
        }))
        .await;
        let agent = Agent::new("task", Box::new(provider), Controller::new());
        let err = agent.run().await.unwrap_err();
        assert!(format!("{:#}", err).contains("SAFETY"));
    }

    async fn error_status_provider(status: u16) -> (MockServer, GoogleProvider) {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1beta/models/gemini-2.0-flash-exp:generateContent"))
            .respond_with(ResponseTemplate::new(status).set_body_string("bad things"))
            .mount(&mock_server)
            .await;
        let provider = GoogleProvider::new(GoogleProviderConfig {
            host: mock_server.uri(),
            api_key: "test_api_key".to_string(),
            model: "gemini-2.0-flash-exp".to_string(),
            temperature: None,
            max_tokens: None,
        })
        .unwrap();
        (mock_server, provider)
    }

    #[tokio::test]
    async fn test_server_error_statuses() {
        for status in [429, 503] {
            let (_server, provider) = error_status_provider(status).await;
            let err = provider
                .complete("system", &[Message::user().with_text("hi")], &[])
                .await
                .unwrap_err();
            assert!(
                err.to_string().starts_with("Server error"),
                "status {}: {}",
                status,
                err
            );
        }
    }

    #[tokio::test]
    async fn test_client_error_status_includes_body() {
        let (_server, provider) = error_status_provider(400).await;
        let err = provider
            .complete("system", &[Message::user().with_text("hi")], &[])
            .await
            .unwrap_err();
        let text = err.to_string();
        assert!(text.starts_with("Request failed: 400"));
        assert!(text.contains("bad things"));
    }

    #[test]
    fn test_clean_schema_strips_unsupported_keys() {
        let schema = json!({
            "$schema": "x",
            "type": "object",
            "additionalProperties": false,
            "properties": {
                "edits": {
                    "type": "array",
                    "items": {"type": "object", "additionalProperties": false}
                }
            }
        });
        let cleaned = clean_schema(&schema);
        assert!(cleaned.get("$schema").is_none());
        assert!(cleaned.get("additionalProperties").is_none());
        assert!(cleaned["properties"]["edits"]["items"]
            .get("additionalProperties")
            .is_none());
        assert_eq!(cleaned["type"], "object");
    }

    #[test]
    fn test_parameterless_tool_omits_parameters() -> Result<()> {
        let tools = vec![Tool::new(
            "filesystem__list_allowed_directories",
            "List allowed directories",
            json!({"type": "object", "properties": {}}),
        )];
        let spec = GoogleProvider::tools_to_gemini_spec(&tools)?;
        assert!(spec[0].get("parameters").is_none());
        Ok(())
    }

    #[test]
    fn test_function_response_uses_call_name() {
        let messages = vec![
            Message::user().with_text("go"),
            Message::assistant().with_tool_request(
                "gemini_call_7",
                Ok(ToolCall::new("filesystem__read_file", json!({"path": "a.txt"}))),
            ),
            Message::user().with_tool_response("gemini_call_7", Ok(vec![Content::text("contents")])),
        ];

        let spec = GoogleProvider::messages_to_gemini_spec(&messages);
        assert_eq!(spec.len(), 3);
        assert_eq!(spec[1]["role"], "model");
        assert_eq!(spec[1]["parts"][0]["functionCall"]["name"], "filesystem__read_file");
        assert_eq!(
            spec[2]["parts"][0]["functionResponse"],
            json!({"name": "filesystem__read_file", "response": {"content": "contents"}})
        );
    }
}
