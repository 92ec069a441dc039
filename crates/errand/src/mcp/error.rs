use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum McpError {
    #[error("Failed to spawn MCP server `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("MCP transport I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("MCP serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("MCP protocol error: {0}")]
    Protocol(String),

    #[error("MCP Error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("MCP server `{0}` is not connected")]
    NotConnected(String),

    #[error("MCP server `{0}` is already connected")]
    AlreadyConnected(String),

    #[error("MCP server closed the connection")]
    Closed,

    #[error("{0}")]
    ToolFailed(String),
}

pub type McpResult<T> = Result<T, McpError>;
