use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

use super::error::{McpError, McpResult};
use super::protocol::{
    initialize_params, CallToolResult, Implementation, Incoming, InitializeResult,
    JsonRpcRequest, JsonRpcResponse, ListToolsResult, McpContent, METHOD_NOT_FOUND,
};
use super::system::McpSystem;
use crate::controller::Controller;
use crate::models::content::Content;
use crate::models::tool::Tool;
use crate::systems::System;

const CLIENT_NAME: &str = "errand";
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// How to launch one MCP tool server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpServerConfig {
    /// Name the server's tools are registered under
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl McpServerConfig {
    pub fn new<N: Into<String>, C: Into<String>>(name: N, command: C, args: Vec<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            args,
            env: HashMap::new(),
        }
    }

    /// The reference filesystem server, scoped to a single root directory
    pub fn filesystem<S: Into<String>>(root: S) -> Self {
        Self::new(
            "filesystem",
            "npx",
            vec![
                "-y".to_string(),
                "@modelcontextprotocol/server-filesystem".to_string(),
                root.into(),
            ],
        )
    }
}

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

struct Connection {
    writer: BoxedWriter,
    reader: Lines<BufReader<BoxedReader>>,
    child: Option<Child>,
    next_id: u64,
    server: InitializeResult,
}

impl Connection {
    async fn send(&mut self, message: &impl Serialize) -> McpResult<()> {
        let mut line = serde_json::to_string(message)?;
        line.push('\n');
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn request(&mut self, method: &str, params: Option<Value>) -> McpResult<Value> {
        self.next_id += 1;
        let id = self.next_id;
        tracing::debug!(id, method, "mcp request");
        self.send(&JsonRpcRequest::new(id, method, params)).await?;

        loop {
            let line = self.reader.next_line().await?.ok_or(McpError::Closed)?;
            if line.trim().is_empty() {
                continue;
            }

            let incoming = match Incoming::parse(&line) {
                Ok(incoming) => incoming,
                Err(e) => {
                    tracing::debug!(error = %e, "ignoring non JSON-RPC output: {}", line);
                    continue;
                }
            };

            match incoming {
                Incoming::Response(response) if response.id == Some(json!(id)) => {
                    if let Some(err) = response.error {
                        return Err(McpError::Rpc {
                            code: err.code,
                            message: err.message,
                        });
                    }
                    return Ok(response.result.unwrap_or(Value::Null));
                }
                Incoming::Response(response) => {
                    tracing::debug!(id = ?response.id, "ignoring response for another request");
                }
                Incoming::Request { id, method } => {
                    let reply = if method == "ping" {
                        JsonRpcResponse::success(id, json!({}))
                    } else {
                        JsonRpcResponse::failure(
                            id,
                            METHOD_NOT_FOUND,
                            format!("Method not supported by client: {}", method),
                        )
                    };
                    self.send(&reply).await?;
                }
                Incoming::Notification { method } => {
                    tracing::debug!(method, "mcp notification");
                }
            }
        }
    }

    async fn notify(&mut self, method: &str, params: Option<Value>) -> McpResult<()> {
        self.send(&JsonRpcRequest::notification(method, params)).await
    }

    /// Close stdin so the server can exit on its own, then make sure it has
    async fn shutdown(self) -> McpResult<()> {
        let Connection {
            mut writer, child, ..
        } = self;
        // Errors here only mean the pipe is already gone
        let _ = writer.shutdown().await;
        drop(writer);

        if let Some(mut child) = child {
            match tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await {
                Ok(status) => {
                    let status = status?;
                    tracing::debug!(%status, "mcp server exited");
                }
                Err(_) => {
                    tracing::debug!("mcp server did not exit in time, killing it");
                    child.kill().await?;
                }
            }
        }
        Ok(())
    }
}

struct Inner {
    config: McpServerConfig,
    connection: Mutex<Option<Connection>>,
}

/// A client for one MCP tool server
///
/// Cloning is cheap and clones share the same connection. Constructing a client
/// has no side effects; the server process is only started by [`McpClient::connect`].
/// A child process left running when the last clone is dropped is killed.
#[derive(Clone)]
pub struct McpClient {
    inner: Arc<Inner>,
}

impl McpClient {
    pub fn new(config: McpServerConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                connection: Mutex::new(None),
            }),
        }
    }

    pub fn server_name(&self) -> &str {
        &self.inner.config.name
    }

    pub fn config(&self) -> &McpServerConfig {
        &self.inner.config
    }

    pub async fn is_connected(&self) -> bool {
        self.inner.connection.lock().await.is_some()
    }

    /// Server identity reported during the handshake
    pub async fn server_info(&self) -> Option<Implementation> {
        let guard = self.inner.connection.lock().await;
        guard.as_ref().map(|conn| conn.server.server_info.clone())
    }

    /// Usage instructions the server offered during the handshake, if any
    pub async fn instructions(&self) -> Option<String> {
        let guard = self.inner.connection.lock().await;
        guard.as_ref().and_then(|conn| conn.server.instructions.clone())
    }

    /// Spawn the server process and perform the MCP initialize handshake
    pub async fn connect(&self) -> McpResult<()> {
        let config = &self.inner.config;
        let mut guard = self.inner.connection.lock().await;
        if guard.is_some() {
            return Err(McpError::AlreadyConnected(config.name.clone()));
        }

        tracing::info!(server = %config.name, command = %config.command, args = ?config.args, "starting mcp server");
        let mut child = Command::new(&config.command)
            .args(&config.args)
            .envs(&config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| McpError::Spawn {
                command: config.command.clone(),
                source,
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| McpError::Protocol("server stdin was not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| McpError::Protocol("server stdout was not captured".to_string()))?;

        // On handshake failure the connection is dropped here, which kills the child
        let connection = Self::handshake(Box::new(stdout), Box::new(stdin), Some(child)).await?;
        tracing::info!(
            server = %config.name,
            remote = %connection.server.server_info.name,
            version = %connection.server.server_info.version,
            "mcp server connected"
        );
        *guard = Some(connection);
        Ok(())
    }

    /// Attach to a server over an already-open byte stream instead of spawning one
    pub async fn connect_with_io<R, W>(&self, reader: R, writer: W) -> McpResult<()>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let mut guard = self.inner.connection.lock().await;
        if guard.is_some() {
            return Err(McpError::AlreadyConnected(self.inner.config.name.clone()));
        }
        *guard = Some(Self::handshake(Box::new(reader), Box::new(writer), None).await?);
        Ok(())
    }

    async fn handshake(
        reader: BoxedReader,
        writer: BoxedWriter,
        child: Option<Child>,
    ) -> McpResult<Connection> {
        let mut connection = Connection {
            writer,
            reader: BufReader::new(reader).lines(),
            child,
            next_id: 0,
            server: InitializeResult::default(),
        };

        let result = connection
            .request(
                "initialize",
                Some(initialize_params(CLIENT_NAME, env!("CARGO_PKG_VERSION"))),
            )
            .await?;
        connection.server = serde_json::from_value(result)?;
        connection.notify("notifications/initialized", None).await?;
        Ok(connection)
    }

    async fn request(&self, method: &str, params: Option<Value>) -> McpResult<Value> {
        let mut guard = self.inner.connection.lock().await;
        let connection = guard
            .as_mut()
            .ok_or_else(|| McpError::NotConnected(self.inner.config.name.clone()))?;
        connection.request(method, params).await
    }

    /// List every tool the server offers, following pagination
    pub async fn list_tools(&self) -> McpResult<Vec<Tool>> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let params = cursor.as_ref().map(|c| json!({ "cursor": c }));
            let page: ListToolsResult =
                serde_json::from_value(self.request("tools/list", params).await?)?;
            tools.extend(page.tools.into_iter().map(Tool::from));
            match page.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => break,
            }
        }
        tracing::debug!(server = %self.server_name(), count = tools.len(), "listed tools");
        Ok(tools)
    }

    /// Invoke a tool; a result flagged `isError` becomes [`McpError::ToolFailed`]
    pub async fn call_tool(&self, name: &str, arguments: Value) -> McpResult<Vec<Content>> {
        tracing::debug!(server = %self.server_name(), tool = name, "calling tool");
        let result: CallToolResult = serde_json::from_value(
            self.request(
                "tools/call",
                Some(json!({ "name": name, "arguments": arguments })),
            )
            .await?,
        )?;

        let contents: Vec<Content> = result
            .content
            .into_iter()
            .map(McpContent::into_content)
            .collect();

        if result.is_error {
            let message = contents
                .iter()
                .filter_map(Content::as_text)
                .collect::<Vec<_>>()
                .join("\n");
            return Err(McpError::ToolFailed(message));
        }
        Ok(contents)
    }

    /// Register this server's tools into the controller, returning how many were added
    pub async fn register_to_controller(&self, controller: &mut Controller) -> Result<usize> {
        let system = McpSystem::from_client(self)
            .await
            .with_context(|| format!("Failed to list tools of MCP server `{}`", self.server_name()))?;
        let count = system.tools().len();
        controller.register(Box::new(system))?;
        tracing::info!(server = %self.server_name(), tools = count, "registered mcp tools");
        Ok(count)
    }

    /// Close the connection and reap the server process; a no-op when not connected
    pub async fn disconnect(&self) -> McpResult<()> {
        let connection = self.inner.connection.lock().await.take();
        match connection {
            Some(connection) => {
                tracing::info!(server = %self.server_name(), "disconnecting mcp server");
                connection.shutdown().await
            }
            None => Ok(()),
        }
    }
}
