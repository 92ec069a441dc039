use config::{Config, Environment, File};
use serde::Deserialize;
use std::env;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::agent::AgentSettings;
use crate::errors::{to_env_var, ConfigError};
use crate::mcp::McpServerConfig;
use crate::providers::configs::{
    AnthropicProviderConfig, GoogleProviderConfig, OpenAiProviderConfig, ProviderConfig,
    ANTHROPIC_HOST, ANTHROPIC_MODEL, GOOGLE_HOST, GOOGLE_MODEL, OPENAI_HOST, OPENAI_MODEL,
};
use crate::providers::factory::ProviderType;

pub const ENV_PREFIX: &str = "ERRAND";

#[derive(Clone, Deserialize)]
#[serde(rename_all = "lowercase", tag = "type")]
pub enum ProviderSettings {
    Google {
        #[serde(default = "default_google_host")]
        host: String,
        #[serde(default)]
        api_key: Option<String>,
        #[serde(default = "default_google_model")]
        model: String,
        #[serde(default)]
        temperature: Option<f32>,
        #[serde(default)]
        max_tokens: Option<i32>,
    },
    OpenAi {
        #[serde(default = "default_openai_host")]
        host: String,
        #[serde(default)]
        api_key: Option<String>,
        #[serde(default = "default_openai_model")]
        model: String,
        #[serde(default)]
        temperature: Option<f32>,
        #[serde(default)]
        max_tokens: Option<i32>,
    },
    Anthropic {
        #[serde(default = "default_anthropic_host")]
        host: String,
        #[serde(default)]
        api_key: Option<String>,
        #[serde(default = "default_anthropic_model")]
        model: String,
        #[serde(default)]
        temperature: Option<f32>,
        #[serde(default)]
        max_tokens: Option<i32>,
    },
}

impl ProviderSettings {
    pub fn provider_type(&self) -> ProviderType {
        match self {
            ProviderSettings::Google { .. } => ProviderType::Google,
            ProviderSettings::OpenAi { .. } => ProviderType::OpenAi,
            ProviderSettings::Anthropic { .. } => ProviderType::Anthropic,
        }
    }

    /// Environment variable the credential is read from when not configured explicitly
    pub fn credential_env_var(&self) -> &'static str {
        match self {
            ProviderSettings::Google { .. } => "GOOGLE_API_KEY",
            ProviderSettings::OpenAi { .. } => "OPENAI_API_KEY",
            ProviderSettings::Anthropic { .. } => "ANTHROPIC_API_KEY",
        }
    }

    pub fn model(&self) -> &str {
        match self {
            ProviderSettings::Google { model, .. }
            | ProviderSettings::OpenAi { model, .. }
            | ProviderSettings::Anthropic { model, .. } => model,
        }
    }

    fn host(&self) -> &str {
        match self {
            ProviderSettings::Google { host, .. }
            | ProviderSettings::OpenAi { host, .. }
            | ProviderSettings::Anthropic { host, .. } => host,
        }
    }

    fn api_key(&self) -> Option<&str> {
        match self {
            ProviderSettings::Google { api_key, .. }
            | ProviderSettings::OpenAi { api_key, .. }
            | ProviderSettings::Anthropic { api_key, .. } => api_key.as_deref(),
        }
    }

    fn resolve_api_key(&self) -> Result<String, ConfigError> {
        if let Some(key) = self.api_key().filter(|k| !k.is_empty()) {
            return Ok(key.to_string());
        }
        let env_var = self.credential_env_var();
        match env::var(env_var) {
            Ok(key) if !key.is_empty() => Ok(key),
            _ => Err(ConfigError::MissingEnvVar {
                env_var: env_var.to_string(),
            }),
        }
    }

    /// Convert to a provider config, reading the credential from the environment if needed
    pub fn into_config(self) -> Result<ProviderConfig, ConfigError> {
        let api_key = self.resolve_api_key()?;
        Ok(match self {
            ProviderSettings::Google {
                host,
                model,
                temperature,
                max_tokens,
                ..
            } => ProviderConfig::Google(GoogleProviderConfig {
                host,
                api_key,
                model,
                temperature,
                max_tokens,
            }),
            ProviderSettings::OpenAi {
                host,
                model,
                temperature,
                max_tokens,
                ..
            } => ProviderConfig::OpenAi(OpenAiProviderConfig {
                host,
                api_key,
                model,
                temperature,
                max_tokens,
            }),
            ProviderSettings::Anthropic {
                host,
                model,
                temperature,
                max_tokens,
                ..
            } => ProviderConfig::Anthropic(AnthropicProviderConfig {
                host,
                api_key,
                model,
                temperature,
                max_tokens,
            }),
        })
    }
}

impl fmt::Debug for ProviderSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderSettings")
            .field("type", &self.provider_type())
            .field("host", &self.host())
            .field("api_key", &self.api_key().map(|_| "<redacted>"))
            .field("model", &self.model())
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub provider: ProviderSettings,
    #[serde(default)]
    pub agent: AgentSettings,
    /// MCP servers to start; the filesystem server is used when empty
    #[serde(default)]
    pub servers: Vec<McpServerConfig>,
    /// Root directory for the default filesystem server
    #[serde(default)]
    pub filesystem_root: Option<String>,
}

impl Settings {
    /// Layer defaults, the config file and `ERRAND_*` environment variables
    ///
    /// An explicit `config_path` must exist; the default location is optional.
    pub fn load(config_path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder().set_default("provider.type", "google")?;

        match config_path {
            Some(path) => {
                builder = builder.add_source(File::from(path).required(true));
            }
            None => {
                if let Some(path) = default_config_path() {
                    builder = builder.add_source(File::from(path).required(false));
                }
            }
        }

        let config = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        // Handle missing field errors specially
        match config.try_deserialize::<Self>() {
            Ok(settings) => Ok(settings),
            Err(err) => {
                tracing::debug!("Configuration error: {:?}", &err);

                let error_str = err.to_string();
                if error_str.starts_with("missing field") {
                    // Extract field name from error message "missing field `type`"
                    let field = error_str
                        .trim_start_matches("missing field `")
                        .trim_end_matches('`');
                    Err(ConfigError::MissingEnvVar {
                        env_var: to_env_var(field),
                    })
                } else if let config::ConfigError::NotFound(field) = &err {
                    Err(ConfigError::MissingEnvVar {
                        env_var: to_env_var(field),
                    })
                } else if error_str.contains("unknown variant") {
                    Err(ConfigError::UnknownProvider(error_str))
                } else {
                    Err(ConfigError::Other(err))
                }
            }
        }
    }

    /// Absolute root for the default filesystem server, with `~` expanded
    pub fn filesystem_root(&self) -> PathBuf {
        let raw = self.filesystem_root.as_deref().unwrap_or(".");
        let expanded = PathBuf::from(shellexpand::tilde(raw).into_owned());
        if expanded.is_absolute() {
            expanded
        } else {
            env::current_dir()
                .map(|cwd| cwd.join(&expanded))
                .unwrap_or(expanded)
        }
    }

    /// The servers to connect, in order
    pub fn mcp_servers(&self) -> Vec<McpServerConfig> {
        if self.servers.is_empty() {
            vec![McpServerConfig::filesystem(
                self.filesystem_root().to_string_lossy(),
            )]
        } else {
            self.servers.clone()
        }
    }
}

/// `<config dir>/errand/config.toml`, e.g. `~/.config/errand/config.toml` on Linux
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("errand").join("config.toml"))
}

fn default_google_host() -> String {
    GOOGLE_HOST.to_string()
}

fn default_google_model() -> String {
    GOOGLE_MODEL.to_string()
}

fn default_openai_host() -> String {
    OPENAI_HOST.to_string()
}

fn default_openai_model() -> String {
    OPENAI_MODEL.to_string()
}

fn default_anthropic_host() -> String {
    ANTHROPIC_HOST.to_string()
}

fn default_anthropic_model() -> String {
    ANTHROPIC_MODEL.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::fs;

    const CREDENTIAL_VARS: [&str; 3] = ["GOOGLE_API_KEY", "OPENAI_API_KEY", "ANTHROPIC_API_KEY"];

    fn clean_env() {
        for (key, _) in env::vars() {
            if key.starts_with("ERRAND_") {
                env::remove_var(&key);
            }
        }
        for key in CREDENTIAL_VARS {
            env::remove_var(key);
        }
    }

    fn empty_config_file() -> tempfile::NamedTempFile {
        tempfile::Builder::new().suffix(".toml").tempfile().unwrap()
    }

    #[test]
    #[serial]
    fn test_default_settings() {
        clean_env();
        let file = empty_config_file();

        let settings = Settings::load(Some(file.path())).unwrap();

        assert_eq!(settings.provider.provider_type(), ProviderType::Google);
        assert_eq!(settings.provider.model(), "gemini-2.0-flash-exp");
        assert_eq!(settings.agent.max_steps, 100);
        assert!(settings.servers.is_empty());

        let servers = settings.mcp_servers();
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].name, "filesystem");
        assert_eq!(servers[0].command, "npx");
        assert!(Path::new(&servers[0].args[2]).is_absolute());
    }

    #[test]
    #[serial]
    fn test_environment_override() {
        clean_env();
        env::set_var("ERRAND_PROVIDER__TYPE", "openai");
        env::set_var("ERRAND_PROVIDER__HOST", "https://custom.openai.com");
        env::set_var("ERRAND_PROVIDER__MODEL", "gpt-4o-mini");
        env::set_var("ERRAND_PROVIDER__TEMPERATURE", "0.7");
        env::set_var("ERRAND_PROVIDER__MAX_TOKENS", "2000");
        env::set_var("ERRAND_AGENT__MAX_STEPS", "12");
        env::set_var("OPENAI_API_KEY", "test-key");
        let file = empty_config_file();

        let settings = Settings::load(Some(file.path())).unwrap();
        assert_eq!(settings.agent.max_steps, 12);

        match settings.provider.into_config().unwrap() {
            ProviderConfig::OpenAi(config) => {
                assert_eq!(config.host, "https://custom.openai.com");
                assert_eq!(config.api_key, "test-key");
                assert_eq!(config.model, "gpt-4o-mini");
                assert_eq!(config.temperature, Some(0.7));
                assert_eq!(config.max_tokens, Some(2000));
            }
            other => panic!("Expected OpenAI provider, got {:?}", other),
        }

        clean_env();
    }

    #[test]
    #[serial]
    fn test_missing_credential() {
        clean_env();
        let file = empty_config_file();

        let settings = Settings::load(Some(file.path())).unwrap();
        match settings.provider.into_config() {
            Err(ConfigError::MissingEnvVar { env_var }) => assert_eq!(env_var, "GOOGLE_API_KEY"),
            other => panic!("Expected missing GOOGLE_API_KEY, got {:?}", other),
        }
    }

    #[test]
    #[serial]
    fn test_explicit_key_wins_over_environment() {
        clean_env();
        env::set_var("ERRAND_PROVIDER__TYPE", "anthropic");
        env::set_var("ERRAND_PROVIDER__API_KEY", "from-config");
        env::set_var("ANTHROPIC_API_KEY", "from-env");
        let file = empty_config_file();

        let settings = Settings::load(Some(file.path())).unwrap();
        let debug = format!("{:?}", settings.provider);
        assert!(!debug.contains("from-config"));

        match settings.provider.into_config().unwrap() {
            ProviderConfig::Anthropic(config) => assert_eq!(config.api_key, "from-config"),
            other => panic!("Expected Anthropic provider, got {:?}", other),
        }

        clean_env();
    }

    #[test]
    #[serial]
    fn test_config_file_servers() {
        clean_env();
        let file = empty_config_file();
        fs::write(
            file.path(),
            r#"
filesystem_root = "~/Documents"

[provider]
type = "google"
model = "gemini-1.5-pro"

[agent]
max_steps = 25
system_prompt_extension = "Be brief."

[[servers]]
name = "filesystem"
command = "npx"
args = ["-y", "@modelcontextprotocol/server-filesystem", "/srv/docs"]

[[servers]]
name = "github"
command = "npx"
args = ["-y", "@modelcontextprotocol/server-github"]
env = { GITHUB_PERSONAL_ACCESS_TOKEN = "token" }
"#,
        )
        .unwrap();

        let settings = Settings::load(Some(file.path())).unwrap();
        assert_eq!(settings.provider.model(), "gemini-1.5-pro");
        assert_eq!(settings.agent.max_steps, 25);
        assert_eq!(
            settings.agent.system_prompt_extension.as_deref(),
            Some("Be brief.")
        );

        let servers = settings.mcp_servers();
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[1].name, "github");
        assert_eq!(
            servers[1].env.values().next().map(String::as_str),
            Some("token")
        );
        assert!(!settings.filesystem_root().starts_with("~"));
    }

    #[test]
    #[serial]
    fn test_filesystem_root_from_environment() {
        clean_env();
        env::set_var("ERRAND_FILESYSTEM_ROOT", "/srv/reports");
        let file = empty_config_file();

        let settings = Settings::load(Some(file.path())).unwrap();
        assert_eq!(settings.filesystem_root(), PathBuf::from("/srv/reports"));
        assert_eq!(settings.mcp_servers()[0].args[2], "/srv/reports");

        clean_env();
    }

    #[test]
    #[serial]
    fn test_unknown_provider() {
        clean_env();
        env::set_var("ERRAND_PROVIDER__TYPE", "databricks");
        let file = empty_config_file();

        let result = Settings::load(Some(file.path()));
        assert!(matches!(result, Err(ConfigError::UnknownProvider(_))));

        clean_env();
    }

    #[test]
    #[serial]
    fn test_missing_explicit_config_file() {
        clean_env();
        let dir = tempfile::tempdir().unwrap();
        let result = Settings::load(Some(&dir.path().join("missing.toml")));
        assert!(result.is_err());
    }
}
