//! Configuration file support

use murmur_ai::{Api, Model, ReasoningLevel, StreamOptions};
use murmur_agent::{DEFAULT_MAX_TOOL_ROUNDS, TurnConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Configuration for murmur
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Default provider (openai, deepseek, anthropic, google, ollama, ...)
    pub provider: Option<String>,
    /// Default model to use
    pub model: Option<String>,
    /// Endpoint override, e.g. a local OpenAI-compatible server
    pub base_url: Option<String>,
    /// API key (alternative to environment variables)
    pub api_key: Option<String>,
    /// Environment variable to read the API key from
    pub api_key_env: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    /// Default reasoning level (off, minimal, low, medium, high)
    pub reasoning_level: Option<String>,
    pub system_prompt: Option<String>,
    /// Custom system prompt file path, used when `system_prompt` is unset
    pub system_prompt_file: Option<String>,
    pub max_tool_rounds: Option<u32>,
    /// Extra markers that start a model's reasoning inside the answer
    pub reasoning_open_markers: Vec<String>,
    /// Extra markers that end a model's reasoning inside the answer
    pub reasoning_close_markers: Vec<String>,
    /// Content before the first close marker is reasoning, for servers that
    /// drop the open tag
    pub reasoning_before_close: bool,
}

impl Config {
    /// Get the config directory
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("murmur")
    }

    /// Get the config file path
    pub fn config_path() -> PathBuf {
        if let Ok(path) = std::env::var("MURMUR_CONFIG_PATH") {
            return PathBuf::from(path);
        }
        Self::config_dir().join("config.toml")
    }

    /// Load config from the default path
    pub fn load() -> Self {
        Self::load_from(&Self::config_path())
    }

    /// Load config from `path`; a missing or broken file yields the defaults
    pub fn load_from(path: &Path) -> Self {
        if !path.exists() {
            return Self::default();
        }

        match fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => config,
                Err(e) => {
                    tracing::warn!("Failed to parse config file {}: {}", path.display(), e);
                    Self::default()
                }
            },
            Err(e) => {
                tracing::warn!("Failed to read config file {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    /// Save config to file
    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let content = toml::to_string_pretty(self).map_err(std::io::Error::other)?;
        fs::write(path, content)
    }

    /// Create a default config file if it doesn't exist
    pub fn init() -> std::io::Result<PathBuf> {
        let path = Self::config_path();
        if path.exists() {
            return Ok(path);
        }

        let default_config = Config {
            provider: Some("openai".to_string()),
            model: Some("gpt-4o-mini".to_string()),
            reasoning_level: Some("off".to_string()),
            max_tool_rounds: Some(DEFAULT_MAX_TOOL_ROUNDS),
            ..Default::default()
        };

        default_config.save(&path)?;
        Ok(path)
    }

    /// Wire family for the configured provider
    pub fn api(&self) -> anyhow::Result<Api> {
        let provider = self.provider.as_deref().unwrap_or("openai");
        Api::parse(provider).ok_or_else(|| anyhow::anyhow!("Unknown provider: {}", provider))
    }

    /// Model to talk to, on the provider's endpoint unless overridden
    pub fn model(&self) -> anyhow::Result<Model> {
        let api = self.api()?;
        let provider = self.provider.as_deref().unwrap_or("openai");
        let id = self
            .model
            .clone()
            .unwrap_or_else(|| "gpt-4o-mini".to_string());

        let mut model = Model::new(id, api);
        if let Some(url) = self
            .base_url
            .as_deref()
            .or_else(|| provider_base_url(provider))
        {
            model = model.with_base_url(url);
        }
        if let Some(max_tokens) = self.max_tokens {
            model.max_tokens = max_tokens;
        }
        Ok(model.with_reasoning(self.reasoning() != ReasoningLevel::Off))
    }

    pub fn reasoning(&self) -> ReasoningLevel {
        self.reasoning_level
            .as_deref()
            .map(ReasoningLevel::parse)
            .unwrap_or_default()
    }

    /// API key from the config, then the configured env var. `None` lets the
    /// backend fall back to its family's conventional variable.
    pub fn api_key(&self) -> Option<String> {
        if self.api_key.is_some() {
            return self.api_key.clone();
        }
        self.api_key_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
    }

    /// System prompt text, reading `system_prompt_file` when needed
    pub fn system_prompt(&self) -> anyhow::Result<Option<String>> {
        if let Some(prompt) = &self.system_prompt {
            return Ok(Some(prompt.clone()));
        }
        match &self.system_prompt_file {
            Some(file) => Ok(Some(fs::read_to_string(expand_home(file))?)),
            None => Ok(None),
        }
    }

    /// Settings of one turn
    pub fn turn_config(&self) -> anyhow::Result<TurnConfig> {
        let options = StreamOptions {
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            reasoning: self.reasoning(),
        };
        let mut config = TurnConfig::new(self.model()?)
            .with_options(options)
            .with_max_tool_rounds(self.max_tool_rounds.unwrap_or(DEFAULT_MAX_TOOL_ROUNDS));
        if let Some(prompt) = self.system_prompt()? {
            config = config.with_system_prompt(prompt);
        }
        for marker in &self.reasoning_open_markers {
            config = config.with_open_marker(marker.clone());
        }
        for marker in &self.reasoning_close_markers {
            config = config.with_close_marker(marker.clone());
        }
        Ok(config.with_reasoning_before_close(self.reasoning_before_close))
    }
}

/// Endpoints of OpenAI-compatible vendors
fn provider_base_url(provider: &str) -> Option<&'static str> {
    match provider.to_lowercase().as_str() {
        "deepseek" => Some("https://api.deepseek.com/v1"),
        "openrouter" => Some("https://openrouter.ai/api/v1"),
        "groq" => Some("https://api.groq.com/openai/v1"),
        "xai" => Some("https://api.x.ai/v1"),
        "perplexity" => Some("https://api.perplexity.ai"),
        "ollama" => Some("http://localhost:11434/v1"),
        _ => None,
    }
}

fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(rest),
        None => PathBuf::from(path),
    }
}

/// Generate example config content
pub fn example_config() -> &'static str {
    r####"# murmur configuration file
# Place at ~/.config/murmur/config.toml or point MURMUR_CONFIG_PATH at it

# Provider (openai, deepseek, openrouter, groq, xai, perplexity, ollama, anthropic, google)
provider = "openai"

# Model identifier sent to the backend
model = "gpt-4o-mini"

# Endpoint override (optional)
# base_url = "http://localhost:8000/v1"

# API key (optional - environment variables are preferred)
# api_key = "sk-..."
# api_key_env = "DEEPSEEK_API_KEY"

# temperature = 0.7
# max_tokens = 4096

# Reasoning level (off, minimal, low, medium, high)
reasoning_level = "off"

# system_prompt = "You are a helpful assistant."
# system_prompt_file = "~/.config/murmur/system_prompt.txt"

# Tool rounds per turn before tool syntax is left as text
max_tool_rounds = 8

# Extra markers some models print around their reasoning
# reasoning_open_markers = ["###Thinking"]
# reasoning_close_markers = ["<|end_of_thought|>", "###Response"]

# Treat everything before the first close marker as reasoning, for servers
# that strip the opening <think> tag
# reasoning_before_close = true
"####
}
