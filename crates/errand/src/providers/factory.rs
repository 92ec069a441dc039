use super::{
    anthropic::AnthropicProvider, base::Provider, configs::ProviderConfig,
    google::GoogleProvider, openai::OpenAiProvider,
};
use anyhow::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderType {
    Google,
    OpenAi,
    Anthropic,
}

impl ProviderConfig {
    pub fn provider_type(&self) -> ProviderType {
        match self {
            ProviderConfig::Google(_) => ProviderType::Google,
            ProviderConfig::OpenAi(_) => ProviderType::OpenAi,
            ProviderConfig::Anthropic(_) => ProviderType::Anthropic,
        }
    }
}

pub fn get_provider(config: ProviderConfig) -> Result<Box<dyn Provider>> {
    match config {
        ProviderConfig::Google(google_config) => Ok(Box::new(GoogleProvider::new(google_config)?)),
        ProviderConfig::OpenAi(openai_config) => Ok(Box::new(OpenAiProvider::new(openai_config)?)),
        ProviderConfig::Anthropic(anthropic_config) => {
            Ok(Box::new(AnthropicProvider::new(anthropic_config)?))
        }
    }
}
