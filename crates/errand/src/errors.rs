use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors surfaced to the model as part of a tool request or tool response
#[non_exhaustive]
#[derive(Error, Debug, Clone, Deserialize, Serialize, PartialEq)]
pub enum AgentError {
    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("Tool execution failed: {0}")]
    ExecutionError(String),

    #[error("Invalid tool name: {0}")]
    InvalidToolName(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type AgentResult<T> = Result<T, AgentError>;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required environment variable: {env_var}")]
    MissingEnvVar { env_var: String },

    #[error("Unknown provider: {0}")]
    UnknownProvider(String),

    #[error("Configuration error: {0}")]
    Other(#[from] config::ConfigError),
}

/// Convert a dotted config field path into the environment variable that sets it
pub fn to_env_var(field_path: &str) -> String {
    format!(
        "ERRAND_{}",
        field_path.to_uppercase().replace('.', "__")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_env_var() {
        assert_eq!(to_env_var("provider.type"), "ERRAND_PROVIDER__TYPE");
        assert_eq!(to_env_var("agent.max_steps"), "ERRAND_AGENT__MAX_STEPS");
        assert_eq!(to_env_var("model"), "ERRAND_MODEL");
    }

    #[test]
    fn test_agent_error_round_trips_through_json() {
        let error = AgentError::ExecutionError("disk full".to_string());
        let encoded = serde_json::to_string(&error).unwrap();
        let decoded: AgentError = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, error);
        assert_eq!(decoded.to_string(), "Tool execution failed: disk full");
    }
}
