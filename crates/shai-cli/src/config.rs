//! Configuration file support

use serde::{Deserialize, Serialize};
use shai_llm::ProviderModels;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Read(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Configuration for shai
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Default provider
    pub provider: Option<String>,
    /// Default model to use
    pub model: Option<String>,
    /// Endpoint override for the selected provider
    pub base_url: Option<String>,
    /// Replaces the built-in system prompt
    pub system_prompt: Option<String>,
    pub max_function_rounds: Option<usize>,
    pub parallel_function_calls: Option<bool>,
    /// Print token usage and cost after each exchange
    pub show_cost: Option<bool>,
    /// API keys by provider name (alternative to environment variables)
    pub api_keys: BTreeMap<String, String>,
    /// Model and pricing overrides by provider name
    pub providers: BTreeMap<String, ProviderModels>,
}

impl Config {
    /// Get the config directory
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("shai")
    }

    /// Get the config file path
    pub fn config_path() -> PathBuf {
        if let Ok(path) = std::env::var("SHAI_CONFIG_PATH") {
            return PathBuf::from(path);
        }
        Self::config_dir().join("config.toml")
    }

    /// Load config from the default location, falling back to defaults
    pub fn load() -> Self {
        let path = Self::config_path();
        if !path.exists() {
            return Self::default();
        }

        match Self::load_from(&path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Warning: {}", e);
                Self::default()
            }
        }
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Write the commented example config if no file exists yet
    pub fn init() -> std::io::Result<PathBuf> {
        let path = Self::config_path();
        Self::init_at(&path)?;
        Ok(path)
    }

    fn init_at(path: &Path) -> std::io::Result<()> {
        if path.exists() {
            return Ok(());
        }
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        fs::write(path, example_config())
    }

    /// API key for a provider from the config file.
    ///
    /// The provider's environment variable is consulted when this is `None`.
    pub fn api_key(&self, provider: &str) -> Option<&str> {
        self.api_keys
            .get(provider)
            .map(String::as_str)
            .filter(|k| !k.is_empty())
    }
}

/// Generate example config content
pub fn example_config() -> &'static str {
    r#"# shai configuration file
# Place at ~/.config/shai/config.toml (Linux) or set SHAI_CONFIG_PATH

# Default provider (openai, anthropic, groq, openrouter, ollama)
provider = "openai"

# Default model; falls back to the provider's default when unset
# model = "gpt-4o-mini"

# Endpoint override, e.g. for a local proxy
# base_url = "http://localhost:8080/v1"

# Function-call rounds allowed per turn
max_function_rounds = 8

# Run the function calls of one round concurrently
parallel_function_calls = false

# Print token usage and cost after each exchange
show_cost = false

# API keys (optional - environment variables are used otherwise)
[api_keys]
# openai = "sk-..."
# anthropic = "sk-ant-..."

# Model and pricing overrides, USD per million tokens
# [providers.openai]
# default = "gpt-4o"
# models = [
#     { name = "GPT-4o", value = "gpt-4o", pricing = { input = 2.5, output = 10.0 } },
# ]
"#
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_example_config_parses() {
        let config: Config = toml::from_str(example_config()).unwrap();
        assert_eq!(config.provider.as_deref(), Some("openai"));
        assert_eq!(config.max_function_rounds, Some(8));
        assert_eq!(config.show_cost, Some(false));
        assert!(config.api_keys.is_empty());
        assert!(config.providers.is_empty());
    }

    #[test]
    fn test_missing_fields_default() {
        let config: Config = toml::from_str("model = \"llama3.2\"").unwrap();
        assert_eq!(config.model.as_deref(), Some("llama3.2"));
        assert_eq!(config.provider, None);
        assert_eq!(config.parallel_function_calls, None);
    }

    #[test]
    fn test_provider_overrides() {
        let config: Config = toml::from_str(
            r#"
            [api_keys]
            groq = "gsk-test"
            openai = ""

            [providers.groq]
            default = "mixtral"
            models = [
                { name = "Mixtral", value = "mixtral", pricing = { input = 0.2, output = 0.4 } },
            ]
            "#,
        )
        .unwrap();

        assert_eq!(config.api_key("groq"), Some("gsk-test"));
        assert_eq!(config.api_key("openai"), None);
        assert_eq!(config.api_key("anthropic"), None);

        let groq = &config.providers["groq"];
        assert_eq!(groq.default, "mixtral");
        assert_eq!(groq.find("mixtral").map(|m| m.pricing.output), Some(0.4));
    }

    #[test]
    fn test_load_from_reports_parse_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "provider = [").unwrap();

        assert!(matches!(
            Config::load_from(&path),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_init_writes_example_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        Config::init_at(&path).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), example_config());

        fs::write(&path, "provider = \"ollama\"").unwrap();
        Config::init_at(&path).unwrap();
        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.provider.as_deref(), Some("ollama"));
    }
}
