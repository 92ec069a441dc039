//! These models represent the objects passed around by the agent
//!
//! There are several related formats we need to interact with:
//! - gemini contents/function declarations, sent from the agent to the LLM
//! - openai messages/tools, sent from the agent to the LLM
//! - anthropic messages/tools, sent from the agent to the LLM
//! - MCP tool listings and call results, exchanged with tool servers
//!
//! We always immediately convert those data models into the internal structs
//! using to/from helpers. Because of the need for compatibility, the internal
//! models are not an exact match to any of these formats.
pub mod content;
pub mod message;
pub mod role;
pub mod tool;
