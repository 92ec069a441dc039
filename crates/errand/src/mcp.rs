//! Client side of the Model Context Protocol over the stdio transport
//!
//! A tool server is spawned as a child process and spoken to with
//! newline-delimited JSON-RPC 2.0 on its stdin/stdout.
pub mod client;
pub mod error;
pub mod protocol;
pub mod system;

pub use client::{McpClient, McpServerConfig};
pub use error::McpError;
pub use system::McpSystem;
