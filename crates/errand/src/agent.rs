use anyhow::Result;
use futures::stream::BoxStream;
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

use crate::controller::Controller;
use crate::errors::{AgentError, AgentResult};
use crate::history::AgentHistory;
use crate::models::content::Content;
use crate::models::message::{Message, ToolRequest};
use crate::models::role::Role;
use crate::models::tool::ToolCall;
use crate::prompt_template::load_prompt_file;
use crate::providers::base::Provider;

pub const DEFAULT_MAX_STEPS: usize = 100;

fn default_max_steps() -> usize {
    DEFAULT_MAX_STEPS
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSettings {
    /// Upper bound on provider completions in a single run
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,
    /// Extra text appended to the system prompt
    #[serde(default)]
    pub system_prompt_extension: Option<String>,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            max_steps: DEFAULT_MAX_STEPS,
            system_prompt_extension: None,
        }
    }
}

/// Called with every message as soon as it joins the conversation during [`Agent::run`]
pub type MessageObserver = Arc<dyn Fn(&Message) + Send + Sync>;

/// Agent integrates a foundational LLM with the systems it needs to pilot
pub struct Agent {
    task: String,
    provider: Box<dyn Provider>,
    controller: Controller,
    settings: AgentSettings,
    observer: Option<MessageObserver>,
}

impl Agent {
    /// Create an agent that will work on `task` using the tools registered in `controller`
    pub fn new<S: Into<String>>(task: S, provider: Box<dyn Provider>, controller: Controller) -> Self {
        Self {
            task: task.into(),
            provider,
            controller,
            settings: AgentSettings::default(),
            observer: None,
        }
    }

    pub fn with_settings(mut self, settings: AgentSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_observer(mut self, observer: MessageObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    fn observe(&self, message: &Message) {
        if let Some(observer) = &self.observer {
            observer(message);
        }
    }

    pub fn task(&self) -> &str {
        &self.task
    }

    pub fn controller(&self) -> &Controller {
        &self.controller
    }

    /// Dispatch a single tool call to the appropriate system
    async fn dispatch_tool_call(
        &self,
        tool_call: AgentResult<ToolCall>,
    ) -> AgentResult<Vec<Content>> {
        let call = tool_call?;
        tracing::info!(tool = %call.name, "calling tool");
        let result = self.controller.dispatch(call).await;
        if let Err(e) = &result {
            tracing::warn!(error = %e, "tool call failed");
        }
        result
    }

    fn get_system_prompt(&self) -> AgentResult<String> {
        let context = json!({
            "systems": self.controller.systems_info(),
            "extension": self.settings.system_prompt_extension,
        });
        load_prompt_file("system.md", &context).map_err(|e| AgentError::Internal(e.to_string()))
    }

    /// Create a stream that yields each message as it's generated by the agent.
    /// This includes both the assistant's responses and any tool responses.
    pub async fn reply(&self, messages: &[Message]) -> Result<BoxStream<'_, Result<Message>>> {
        let mut messages = messages.to_vec();
        let tools = self.controller.tools();
        let system_prompt = self.get_system_prompt()?;

        Ok(Box::pin(async_stream::try_stream! {
            loop {
                let (response, usage) = self.provider.complete(
                    &system_prompt,
                    &messages,
                    &tools,
                ).await?;
                tracing::debug!(?usage, "completion received");

                yield response.clone();

                // Ensures the message above is delivered before potentially long-running tools start
                tokio::task::yield_now().await;

                let tool_requests: Vec<&ToolRequest> = response.content
                    .iter()
                    .filter_map(|content| content.as_tool_request())
                    .collect();

                if tool_requests.is_empty() {
                    break;
                }

                // Dispatch each in parallel but wait until all are finished
                let futures: Vec<_> = tool_requests
                    .iter()
                    .map(|request| self.dispatch_tool_call(request.tool_call.clone()))
                    .collect();
                let outputs = futures::future::join_all(futures).await;

                // Combine into one message, keyed by the original request ids
                let mut message_tool_response = Message::user();
                for (request, output) in tool_requests.iter().zip(outputs.into_iter()) {
                    message_tool_response = message_tool_response.with_tool_response(
                        request.id.clone(),
                        output,
                    );
                }

                yield message_tool_response.clone();

                messages.push(response.clone());
                messages.push(message_tool_response);
            }
        }))
    }

    /// Work on the task until the model stops calling tools or the step limit is reached
    pub async fn run(&self) -> Result<AgentHistory> {
        let max_steps = self.settings.max_steps.max(1);
        let mut messages = vec![Message::user().with_text(&self.task)];
        self.observe(&messages[0]);
        let mut steps = 0;
        let mut completed = false;

        tracing::info!(task = %self.task, systems = ?self.controller.system_names(), "starting agent run");
        let mut stream = self.reply(&messages).await?;
        while let Some(message) = stream.try_next().await? {
            let from_assistant = message.role == Role::Assistant;
            let finished = from_assistant && !message.has_tool_request();
            if from_assistant {
                steps += 1;
                tracing::info!(step = steps, tool_calls = message.tool_requests().len(), "agent step");
            }
            self.observe(&message);
            messages.push(message);

            if finished {
                completed = true;
                break;
            }
            if !from_assistant && steps >= max_steps {
                tracing::warn!(max_steps, "agent stopped at the step limit before finishing");
                break;
            }
        }

        let final_response = messages
            .iter()
            .rev()
            .find(|m| m.role == Role::Assistant)
            .map(|m| m.text())
            .filter(|text| !text.is_empty());

        Ok(AgentHistory {
            task: self.task.clone(),
            messages,
            steps,
            final_response,
            completed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::tests::MockSystem;
    use crate::models::message::MessageContent;
    use crate::providers::mock::MockProvider;
    use futures::TryStreamExt;
    use serde_json::json;

    fn agent_with_system(responses: Vec<Message>) -> Agent {
        let mut controller = Controller::new();
        controller.register(Box::new(MockSystem::new("test"))).unwrap();
        Agent::new("Echo test", Box::new(MockProvider::new(responses)), controller)
    }

    async fn collect(agent: &Agent, messages: &[Message]) -> Result<Vec<Message>> {
        let mut stream = agent.reply(messages).await?;
        let mut out = Vec::new();
        while let Some(msg) = stream.try_next().await? {
            out.push(msg);
        }
        Ok(out)
    }

    #[tokio::test]
    async fn test_simple_response() -> Result<()> {
        let response = Message::assistant().with_text("Hello!");
        let provider = MockProvider::new(vec![response.clone()]);
        let agent = Agent::new("Say hi", Box::new(provider), Controller::new());

        let messages = collect(&agent, &[Message::user().with_text("Hi")]).await?;

        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0], response);
        Ok(())
    }

    #[tokio::test]
    async fn test_tool_call() -> Result<()> {
        let agent = agent_with_system(vec![
            Message::assistant().with_tool_request(
                "1",
                Ok(ToolCall::new("test__echo", json!({"message": "test"}))),
            ),
            Message::assistant().with_text("Done!"),
        ]);

        let messages = collect(&agent, &[Message::user().with_text("Echo test")]).await?;

        // Should have three messages: tool request, response, and model text
        assert_eq!(messages.len(), 3);
        assert!(messages[0]
            .content
            .iter()
            .any(|c| matches!(c, MessageContent::ToolRequest(_))));
        assert_eq!(
            messages[1].content[0],
            MessageContent::tool_response("1", Ok(vec![Content::text("test")]))
        );
        assert_eq!(messages[2].content[0], MessageContent::text("Done!"));
        Ok(())
    }

    #[tokio::test]
    async fn test_invalid_tool() -> Result<()> {
        let agent = agent_with_system(vec![
            Message::assistant()
                .with_tool_request("1", Ok(ToolCall::new("invalid_tool", json!({})))),
            Message::assistant().with_text("Error occurred"),
        ]);

        let messages = collect(&agent, &[Message::user().with_text("Invalid tool")]).await?;

        // Should have three messages: failed tool request, fail response, and model text
        assert_eq!(messages.len(), 3);
        let response = messages[1].content[0].as_tool_response().unwrap();
        assert_eq!(
            response.tool_result,
            Err(AgentError::InvalidToolName("invalid_tool".to_string()))
        );
        assert_eq!(
            messages[2].content[0],
            MessageContent::text("Error occurred")
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_malformed_tool_request_is_returned_to_model() -> Result<()> {
        let agent = agent_with_system(vec![
            Message::assistant().with_tool_request(
                "1",
                Err(AgentError::InvalidParameters("bad json".to_string())),
            ),
            Message::assistant().with_text("Sorry"),
        ]);

        let messages = collect(&agent, &[Message::user().with_text("Go")]).await?;
        let response = messages[1].content[0].as_tool_response().unwrap();
        assert_eq!(
            response.tool_result,
            Err(AgentError::InvalidParameters("bad json".to_string()))
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_multiple_tool_calls() -> Result<()> {
        let agent = agent_with_system(vec![
            Message::assistant()
                .with_tool_request(
                    "1",
                    Ok(ToolCall::new("test__echo", json!({"message": "first"}))),
                )
                .with_tool_request(
                    "2",
                    Ok(ToolCall::new("test__echo", json!({"message": "second"}))),
                ),
            Message::assistant().with_text("All done!"),
        ]);

        let messages = collect(&agent, &[Message::user().with_text("Multiple calls")]).await?;

        // Should have three messages: tool requests, responses, and model text
        assert_eq!(messages.len(), 3);
        let ids: Vec<&str> = messages[1]
            .content
            .iter()
            .filter_map(|c| c.as_tool_response())
            .map(|r| r.id.as_str())
            .collect();
        assert_eq!(ids, vec!["1", "2"]);
        assert_eq!(messages[2].content[0], MessageContent::text("All done!"));
        Ok(())
    }

    #[tokio::test]
    async fn test_run_records_history() -> Result<()> {
        let agent = agent_with_system(vec![
            Message::assistant().with_tool_request(
                "1",
                Ok(ToolCall::new("test__echo", json!({"message": "test"}))),
            ),
            Message::assistant().with_text("Done!"),
        ]);

        let history = agent.run().await?;

        assert!(history.completed);
        assert_eq!(history.task, "Echo test");
        assert_eq!(history.steps, 2);
        assert_eq!(history.messages.len(), 4);
        assert_eq!(history.messages[0].text(), "Echo test");
        assert_eq!(history.final_response.as_deref(), Some("Done!"));
        Ok(())
    }

    #[tokio::test]
    async fn test_run_stops_at_max_steps() -> Result<()> {
        let looping: Vec<Message> = (0..10)
            .map(|i| {
                Message::assistant().with_tool_request(
                    i.to_string(),
                    Ok(ToolCall::new("test__echo", json!({"message": "again"}))),
                )
            })
            .collect();
        let provider = MockProvider::new(looping);
        let calls = provider.call_counter();

        let mut controller = Controller::new();
        controller.register(Box::new(MockSystem::new("test")))?;
        let agent = Agent::new("Loop", Box::new(provider), controller).with_settings(AgentSettings {
            max_steps: 3,
            system_prompt_extension: None,
        });

        let history = agent.run().await?;

        assert!(!history.completed);
        assert_eq!(history.steps, 3);
        assert_eq!(*calls.lock().unwrap(), 3);
        // task + 3 x (request, response)
        assert_eq!(history.messages.len(), 7);
        assert_eq!(history.final_response, None);
        Ok(())
    }

    #[tokio::test]
    async fn test_observer_sees_every_message() -> Result<()> {
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let agent = agent_with_system(vec![
            Message::assistant().with_tool_request(
                "1",
                Ok(ToolCall::new("test__echo", json!({"message": "test"}))),
            ),
            Message::assistant().with_text("Done!"),
        ])
        .with_observer(Arc::new(move |message: &Message| {
            sink.lock().unwrap().push(message.clone());
        }));

        let history = agent.run().await?;
        assert_eq!(*seen.lock().unwrap(), history.messages);
        Ok(())
    }

    #[tokio::test]
    async fn test_provider_error_fails_run() {
        struct FailingProvider;

        #[async_trait::async_trait]
        impl Provider for FailingProvider {
            async fn complete(
                &self,
                _system: &str,
                _messages: &[Message],
                _tools: &[crate::models::tool::Tool],
            ) -> Result<(Message, crate::providers::base::Usage)> {
                Err(anyhow::anyhow!("Server error: 503 Service Unavailable"))
            }
        }

        let agent = Agent::new("task", Box::new(FailingProvider), Controller::new());
        let err = agent.run().await.unwrap_err();
        assert!(err.to_string().contains("Server error"));
    }

    #[test]
    fn test_agent_settings_defaults() {
        let settings: AgentSettings = serde_json::from_value(json!({})).unwrap();
        assert_eq!(settings, AgentSettings::default());
        assert_eq!(settings.max_steps, 100);
    }
}
