use std::fmt;

pub const GOOGLE_HOST: &str = "https://generativelanguage.googleapis.com";
pub const GOOGLE_MODEL: &str = "gemini-2.0-flash-exp";
pub const OPENAI_HOST: &str = "https://api.openai.com";
pub const OPENAI_MODEL: &str = "gpt-4o";
pub const ANTHROPIC_HOST: &str = "https://api.anthropic.com";
pub const ANTHROPIC_MODEL: &str = "claude-3-5-sonnet-latest";

/// Unified enum to wrap different provider configurations
#[derive(Debug, Clone)]
pub enum ProviderConfig {
    Google(GoogleProviderConfig),
    OpenAi(OpenAiProviderConfig),
    Anthropic(AnthropicProviderConfig),
}

#[derive(Clone)]
pub struct GoogleProviderConfig {
    pub host: String,
    pub api_key: String,
    pub model: String,
    pub temperature: Option<f32>,
    pub max_tokens: Option<i32>,
}

#[derive(Clone)]
pub struct OpenAiProviderConfig {
    pub host: String,
    pub api_key: String,
    pub model: String,
    pub temperature: Option<f32>,
    pub max_tokens: Option<i32>,
}

#[derive(Clone)]
pub struct AnthropicProviderConfig {
    pub host: String,
    pub api_key: String,
    pub model: String,
    pub temperature: Option<f32>,
    pub max_tokens: Option<i32>,
}

// Keys stay out of logs
macro_rules! redacted_debug {
    ($name:ident) => {
        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_struct(stringify!($name))
                    .field("host", &self.host)
                    .field("api_key", &"<redacted>")
                    .field("model", &self.model)
                    .field("temperature", &self.temperature)
                    .field("max_tokens", &self.max_tokens)
                    .finish()
            }
        }
    };
}

redacted_debug!(GoogleProviderConfig);
redacted_debug!(OpenAiProviderConfig);
redacted_debug!(AnthropicProviderConfig);
