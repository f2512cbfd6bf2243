//! Core types for backend interactions

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Supported backend wire families
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Api {
    /// OpenAI-style `/chat/completions` (OpenAI, DeepSeek, OpenRouter, Ollama, vLLM, ...)
    OpenAICompletions,
    AnthropicMessages,
    GoogleGenerativeAI,
}

impl Api {
    /// Parse a family from a provider or api name as found in config files
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "openai" | "openai-completions" | "deepseek" | "openrouter" | "ollama" | "groq"
            | "xai" | "perplexity" | "custom" => Some(Api::OpenAICompletions),
            "anthropic" | "anthropic-messages" => Some(Api::AnthropicMessages),
            "google" | "gemini" | "google-generative-ai" => Some(Api::GoogleGenerativeAI),
            _ => None,
        }
    }

    /// Default base URL for the family's canonical vendor
    pub fn default_base_url(&self) -> &'static str {
        match self {
            Api::OpenAICompletions => "https://api.openai.com/v1",
            Api::AnthropicMessages => "https://api.anthropic.com",
            Api::GoogleGenerativeAI => "https://generativelanguage.googleapis.com/v1beta",
        }
    }

    /// Environment variable conventionally holding the API key
    pub fn api_key_env_var(&self) -> &'static str {
        match self {
            Api::OpenAICompletions => "OPENAI_API_KEY",
            Api::AnthropicMessages => "ANTHROPIC_API_KEY",
            Api::GoogleGenerativeAI => "GOOGLE_API_KEY",
        }
    }
}

/// Model definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Model {
    /// Model identifier sent to the backend (e.g., "deepseek-reasoner")
    pub id: String,
    /// Wire family to use
    pub api: Api,
    /// Base URL for API calls
    pub base_url: String,
    /// Whether the model supports reasoning/thinking
    pub reasoning: bool,
    /// Maximum output tokens
    pub max_tokens: u32,
    /// Additional headers for API calls
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

impl Model {
    /// Create a model on the family's default endpoint
    pub fn new(id: impl Into<String>, api: Api) -> Self {
        Self {
            id: id.into(),
            api,
            base_url: api.default_base_url().to_string(),
            reasoning: false,
            max_tokens: 8192,
            headers: HashMap::new(),
        }
    }

    /// Override the base URL
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Mark the model as reasoning-capable
    pub fn with_reasoning(mut self, reasoning: bool) -> Self {
        self.reasoning = reasoning;
        self
    }
}

/// Token usage information
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    /// Reasoning tokens, when the backend reports them separately
    pub thoughts_tokens: u32,
    pub total_tokens: u32,
}

impl Usage {
    /// Add another usage record to this one
    pub fn accumulate(&mut self, other: &Usage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.thoughts_tokens += other.thoughts_tokens;
        self.total_tokens += other.total_tokens;
    }

    /// Fill `total_tokens` from its parts when the backend never reported it
    pub fn with_derived_total(mut self) -> Self {
        if self.total_tokens == 0 {
            self.total_tokens = self.prompt_tokens + self.completion_tokens;
        }
        self
    }
}

/// Message roles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// Content parts in messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Content {
    /// Text content
    Text { text: String },
    /// Attachment (base64 encoded)
    Image { data: String, mime_type: String },
    /// Reasoning transcript of an assistant message
    Thinking { thinking: String },
    /// Outcome of a tool invocation requested by the assistant
    ToolResult {
        call_id: String,
        tool_name: String,
        arguments: serde_json::Value,
        output: serde_json::Value,
        #[serde(default)]
        is_error: bool,
    },
}

impl Content {
    /// Create text content
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    /// Create image content from base64 data
    pub fn image(data: impl Into<String>, mime_type: impl Into<String>) -> Self {
        Self::Image {
            data: data.into(),
            mime_type: mime_type.into(),
        }
    }

    /// Create thinking content
    pub fn thinking(thinking: impl Into<String>) -> Self {
        Self::Thinking {
            thinking: thinking.into(),
        }
    }

    /// Get text if this is text content
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text { text } => Some(text),
            _ => None,
        }
    }

    /// Render this part as plain text for backends that only accept text.
    ///
    /// Reasoning is never sent back to a backend; attachments have no text form.
    pub fn prompt_text(&self) -> Option<String> {
        match self {
            Self::Text { text } => Some(text.clone()),
            Self::ToolResult {
                tool_name,
                output,
                is_error,
                ..
            } => {
                let status = if *is_error { "error" } else { "ok" };
                let body = match output {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                Some(format!("[[tool_result:{} {}]]\n{}", tool_name, status, body))
            }
            Self::Thinking { .. } | Self::Image { .. } => None,
        }
    }
}

/// A single conversation message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: Vec<Content>,
    #[serde(default)]
    pub timestamp: i64,
}

impl Message {
    /// Create a message with arbitrary content
    pub fn new(role: Role, content: Vec<Content>) -> Self {
        Self {
            role,
            content,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Create a system message
    pub fn system(text: impl Into<String>) -> Self {
        Self::new(Role::System, vec![Content::text(text)])
    }

    /// Create a user message with text content
    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, vec![Content::text(text)])
    }

    /// Create an assistant message with text content
    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, vec![Content::text(text)])
    }

    /// Get combined text content
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|c| c.as_text())
            .collect::<Vec<_>>()
            .join("")
    }

    /// Combined text form of every part that has one, joined by blank lines
    pub fn prompt_text(&self) -> String {
        self.content
            .iter()
            .filter_map(|c| c.prompt_text())
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    /// Whether the message carries anything worth keeping in history
    pub fn has_meaningful_content(&self) -> bool {
        self.content.iter().any(|c| match c {
            Content::Text { text } => !text.trim().is_empty(),
            Content::Thinking { thinking } => !thinking.trim().is_empty(),
            Content::Image { .. } | Content::ToolResult { .. } => true,
        })
    }
}

/// Context for a backend request
#[derive(Debug, Clone, Default)]
pub struct Context {
    /// System prompt
    pub system_prompt: Option<String>,
    /// Conversation messages
    pub messages: Vec<Message>,
}

impl Context {
    /// Create a new context with a system prompt
    pub fn with_system(system_prompt: impl Into<String>) -> Self {
        Self {
            system_prompt: Some(system_prompt.into()),
            messages: vec![],
        }
    }

    /// Add a message to the context
    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    /// System prompt merged with any system-role messages in the history
    pub fn merged_system_prompt(&self) -> Option<String> {
        let mut parts: Vec<String> = self.system_prompt.iter().cloned().collect();
        parts.extend(
            self.messages
                .iter()
                .filter(|m| m.role == Role::System)
                .map(|m| m.text()),
        );
        let parts: Vec<String> = parts.into_iter().filter(|p| !p.trim().is_empty()).collect();
        if parts.is_empty() {
            None
        } else {
            Some(parts.join("\n\n"))
        }
    }

    /// Non-system messages, in order
    pub fn dialogue(&self) -> impl Iterator<Item = &Message> {
        self.messages.iter().filter(|m| m.role != Role::System)
    }
}

/// Sampling options for streaming requests
#[derive(Debug, Clone, Default)]
pub struct StreamOptions {
    /// Maximum tokens to generate
    pub max_tokens: Option<u32>,
    /// Temperature (0.0 - 2.0)
    pub temperature: Option<f32>,
    /// Reasoning/thinking effort
    pub reasoning: ReasoningLevel,
}

/// Reasoning/thinking level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ReasoningLevel {
    #[default]
    Off,
    Minimal,
    Low,
    Medium,
    High,
}

impl ReasoningLevel {
    /// Parse a level name, defaulting to `Off` for anything unknown
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "minimal" => ReasoningLevel::Minimal,
            "low" => ReasoningLevel::Low,
            "medium" => ReasoningLevel::Medium,
            "high" => ReasoningLevel::High,
            _ => ReasoningLevel::Off,
        }
    }

    /// Token budget for backends that take an explicit thinking budget
    pub fn thinking_budget(&self) -> Option<u32> {
        match self {
            ReasoningLevel::Off => None,
            ReasoningLevel::Minimal => Some(1024),
            ReasoningLevel::Low => Some(2048),
            ReasoningLevel::Medium => Some(8192),
            ReasoningLevel::High => Some(16384),
        }
    }

    /// `reasoning_effort` value for OpenAI-compatible backends
    pub fn effort(&self) -> Option<&'static str> {
        match self {
            ReasoningLevel::Off => None,
            ReasoningLevel::Minimal | ReasoningLevel::Low => Some("low"),
            ReasoningLevel::Medium => Some("medium"),
            ReasoningLevel::High => Some("high"),
        }
    }
}
