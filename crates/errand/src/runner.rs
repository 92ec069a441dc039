//! One agent run from start to finish: connect every tool provider, register
//! its tools, run the agent, then disconnect whatever was connected.
//!
//! Acquisition is scoped. A client is released only if its `connect`
//! succeeded, and then exactly once, whether the run succeeds, fails part
//! way through setup, fails inside the agent, or is cancelled.
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::future::{self, Future};

use crate::agent::{Agent, AgentSettings, MessageObserver};
use crate::controller::Controller;
use crate::history::AgentHistory;
use crate::mcp::{McpClient, McpServerConfig};
use crate::models::tool::Tool;
use crate::providers::base::Provider;

/// Something that exposes tools to the agent over a connection it owns
#[async_trait]
pub trait ToolProviderClient: Send + Sync {
    fn name(&self) -> &str;

    async fn connect(&self) -> Result<()>;

    /// Add this client's tools to the controller, returning how many were added
    async fn register_to_controller(&self, controller: &mut Controller) -> Result<usize>;

    async fn disconnect(&self) -> Result<()>;
}

#[async_trait]
impl ToolProviderClient for McpClient {
    fn name(&self) -> &str {
        self.server_name()
    }

    async fn connect(&self) -> Result<()> {
        Ok(McpClient::connect(self).await?)
    }

    async fn register_to_controller(&self, controller: &mut Controller) -> Result<usize> {
        McpClient::register_to_controller(self, controller).await
    }

    async fn disconnect(&self) -> Result<()> {
        Ok(McpClient::disconnect(self).await?)
    }
}

/// Returned when the shutdown signal fires before the run finishes
#[derive(Debug, thiserror::Error)]
#[error("Run cancelled before completion")]
pub struct RunCancelled;

pub struct Runner {
    clients: Vec<Box<dyn ToolProviderClient>>,
    settings: AgentSettings,
    observer: Option<MessageObserver>,
}

impl Runner {
    pub fn new(clients: Vec<Box<dyn ToolProviderClient>>) -> Self {
        Self {
            clients,
            settings: AgentSettings::default(),
            observer: None,
        }
    }

    /// One MCP client per server; nothing is spawned until a run starts
    pub fn from_servers(servers: Vec<McpServerConfig>) -> Self {
        Self::new(
            servers
                .into_iter()
                .map(|config| Box::new(McpClient::new(config)) as Box<dyn ToolProviderClient>)
                .collect(),
        )
    }

    pub fn with_settings(mut self, settings: AgentSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Forward every message of the run to `observer` as it happens
    pub fn with_observer(mut self, observer: MessageObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn client_names(&self) -> Vec<&str> {
        self.clients.iter().map(|c| c.name()).collect()
    }

    pub async fn run(&self, task: &str, provider: Box<dyn Provider>) -> Result<AgentHistory> {
        self.run_until(task, provider, future::pending()).await
    }

    /// Like [`Runner::run`], but gives up with [`RunCancelled`] when `shutdown` completes
    pub async fn run_until<F>(
        &self,
        task: &str,
        provider: Box<dyn Provider>,
        shutdown: F,
    ) -> Result<AgentHistory>
    where
        F: Future<Output = ()> + Send,
    {
        run_agent(
            task,
            provider,
            self.settings.clone(),
            self.observer.clone(),
            &self.clients,
            shutdown,
        )
        .await
    }

    /// Connect everything, report the tools the agent would see, and disconnect
    pub async fn list_tools(&self) -> Result<Vec<Tool>> {
        self.list_tools_until(future::pending()).await
    }

    /// Like [`Runner::list_tools`], but gives up with [`RunCancelled`] when `shutdown` completes
    pub async fn list_tools_until<F>(&self, shutdown: F) -> Result<Vec<Tool>>
    where
        F: Future<Output = ()> + Send,
    {
        with_connected_clients(&self.clients, shutdown, |controller| async move {
            Ok(controller.tools())
        })
        .await
    }
}

pub async fn run_task(
    task: &str,
    provider: Box<dyn Provider>,
    settings: AgentSettings,
    clients: &[Box<dyn ToolProviderClient>],
) -> Result<AgentHistory> {
    run_task_until(task, provider, settings, clients, future::pending()).await
}

pub async fn run_task_until<F>(
    task: &str,
    provider: Box<dyn Provider>,
    settings: AgentSettings,
    clients: &[Box<dyn ToolProviderClient>],
    shutdown: F,
) -> Result<AgentHistory>
where
    F: Future<Output = ()> + Send,
{
    run_agent(task, provider, settings, None, clients, shutdown).await
}

async fn run_agent<F>(
    task: &str,
    provider: Box<dyn Provider>,
    settings: AgentSettings,
    observer: Option<MessageObserver>,
    clients: &[Box<dyn ToolProviderClient>],
    shutdown: F,
) -> Result<AgentHistory>
where
    F: Future<Output = ()> + Send,
{
    let task = task.to_string();
    with_connected_clients(clients, shutdown, move |controller| async move {
        let mut agent = Agent::new(task, provider, controller).with_settings(settings);
        if let Some(observer) = observer {
            agent = agent.with_observer(observer);
        }
        agent.run().await
    })
    .await
}

async fn with_connected_clients<T, F, Fut, S>(
    clients: &[Box<dyn ToolProviderClient>],
    shutdown: S,
    body: F,
) -> Result<T>
where
    F: FnOnce(Controller) -> Fut,
    Fut: Future<Output = Result<T>>,
    S: Future<Output = ()>,
{
    let mut connected: Vec<&dyn ToolProviderClient> = Vec::new();

    let outcome = {
        let work = async {
            let mut controller = Controller::new();
            for client in clients {
                client
                    .connect()
                    .await
                    .with_context(|| format!("Failed to connect to `{}`", client.name()))?;
                connected.push(client.as_ref());

                client
                    .register_to_controller(&mut controller)
                    .await
                    .with_context(|| format!("Failed to register tools of `{}`", client.name()))?;
            }
            body(controller).await
        };

        tokio::select! {
            result = work => result,
            _ = shutdown => {
                tracing::warn!("shutdown requested, abandoning run");
                Err(RunCancelled.into())
            }
        }
    };

    release(&connected).await;
    outcome
}

async fn release(connected: &[&dyn ToolProviderClient]) {
    for client in connected.iter().rev() {
        if let Err(e) = client.disconnect().await {
            tracing::warn!(client = %client.name(), error = %e, "failed to disconnect");
        }
    }
}
