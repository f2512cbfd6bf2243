//! OpenAI-compatible Chat Completions backend
//!
//! Covers OpenAI itself and the many servers that copy its streaming shape
//! (DeepSeek, OpenRouter, Ollama, vLLM, Perplexity). Reasoning shows up as
//! `reasoning_content` or `reasoning` on the delta, or inline in the content
//! between `<think>` tags.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::{Backend, apply_model_headers, header_value, parse_payload, sse_stream};
use crate::{
    error::{Error, Result},
    stream::{
        Delta, FinishReason, Normalizer, RawItem, RawStream, ReasoningBoundary, SearchSource,
        UsageReport,
    },
    types::{Api, Content, Context, Model, Role, StreamOptions},
};

/// OpenAI-compatible API client
pub struct OpenAIProvider {
    client: reqwest::Client,
    api_key: String,
}

impl OpenAIProvider {
    /// Create a new provider with an API key (may be empty for local servers)
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
        }
    }

    /// Create from environment variable
    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY").map_err(|_| Error::InvalidApiKey)?;
        Ok(Self::new(api_key))
    }

    fn build_request(
        &self,
        model: &Model,
        context: &Context,
        options: &StreamOptions,
    ) -> OpenAIRequest {
        let mut messages = Vec::new();

        if let Some(system_prompt) = context.merged_system_prompt() {
            messages.push(OpenAIMessage {
                role: "system".to_string(),
                content: MessageContent::Text(system_prompt),
            });
        }

        for msg in context.dialogue() {
            if let Some(converted) = convert_message(msg.role, &msg.content) {
                messages.push(converted);
            }
        }

        let reasoning_effort = if model.reasoning {
            options.reasoning.effort().map(str::to_string)
        } else {
            None
        };

        OpenAIRequest {
            model: model.id.clone(),
            messages,
            stream: true,
            stream_options: StreamOptionsBody {
                include_usage: true,
            },
            max_tokens: options.max_tokens.or(Some(model.max_tokens)),
            temperature: options.temperature,
            reasoning_effort,
        }
    }
}

#[async_trait]
impl Backend for OpenAIProvider {
    fn api(&self) -> Api {
        Api::OpenAICompletions
    }

    fn normalizer(&self) -> Box<dyn Normalizer> {
        Box::new(OpenAINormalizer::new(ReasoningBoundary::think_tags()))
    }

    async fn open(
        &self,
        model: &Model,
        context: &Context,
        options: &StreamOptions,
        cancel: CancellationToken,
    ) -> Result<RawStream> {
        let request = self.build_request(model, context, options);
        let url = format!("{}/chat/completions", model.base_url);
        tracing::debug!("OpenAI-compatible API URL: {}", url);

        let mut headers = reqwest::header::HeaderMap::new();
        if !self.api_key.is_empty() {
            headers.insert(
                "Authorization",
                header_value(&format!("Bearer {}", self.api_key))?,
            );
        }
        headers.insert("content-type", header_value("application/json")?);
        apply_model_headers(&mut headers, model);

        let request_builder = self.client.post(&url).headers(headers).json(&request);
        sse_stream(request_builder, cancel)
    }
}

fn convert_message(role: Role, content: &[Content]) -> Option<OpenAIMessage> {
    let has_images = content.iter().any(|c| matches!(c, Content::Image { .. }));

    let body = if has_images {
        let parts: Vec<serde_json::Value> = content
            .iter()
            .filter_map(|c| match c {
                Content::Image { data, mime_type } => Some(serde_json::json!({
                    "type": "image_url",
                    "image_url": { "url": format!("data:{};base64,{}", mime_type, data) }
                })),
                other => other
                    .prompt_text()
                    .map(|text| serde_json::json!({ "type": "text", "text": text })),
            })
            .collect();
        MessageContent::Parts(parts)
    } else {
        let text = content
            .iter()
            .filter_map(|c| c.prompt_text())
            .collect::<Vec<_>>()
            .join("\n\n");
        if text.is_empty() {
            return None;
        }
        MessageContent::Text(text)
    };

    Some(OpenAIMessage {
        role: role.as_str().to_string(),
        content: body,
    })
}

/// Normalizer for OpenAI-style `chat.completion.chunk` payloads
pub struct OpenAINormalizer {
    boundary: ReasoningBoundary,
    finished: bool,
    citations_sent: bool,
}

impl OpenAINormalizer {
    pub fn new(boundary: ReasoningBoundary) -> Self {
        Self {
            boundary,
            finished: false,
            citations_sent: false,
        }
    }
}

impl Normalizer for OpenAINormalizer {
    fn normalize(&mut self, item: &RawItem) -> Result<Vec<Delta>> {
        let data = item.data.trim();
        if data.is_empty() {
            return Ok(vec![]);
        }
        if data == "[DONE]" {
            if self.finished {
                return Ok(vec![]);
            }
            self.finished = true;
            return Ok(vec![Delta::Finish(FinishReason::Stop)]);
        }

        let chunk: StreamChunk = parse_payload(data)?;
        if let Some(error) = chunk.error {
            return Err(Error::api(
                error.error_type.unwrap_or_else(|| "error".to_string()),
                error.message,
            ));
        }

        let mut deltas = Vec::new();

        if let Some(citations) = chunk.citations {
            if !self.citations_sent && !citations.is_empty() {
                self.citations_sent = true;
                deltas.push(Delta::SearchResults {
                    results: serde_json::Value::Array(citations),
                    source: SearchSource::Perplexity,
                });
            }
        }

        for choice in chunk.choices {
            let reasoning = choice
                .delta
                .reasoning_content
                .or_else(|| choice.delta.reasoning.and_then(|r| r.as_str().map(String::from)));
            if let Some(reasoning) = reasoning {
                if !reasoning.is_empty() {
                    deltas.push(Delta::Reasoning(reasoning));
                }
            }

            if let Some(content) = choice.delta.content {
                if !content.is_empty() {
                    deltas.push(Delta::Text(content));
                }
            }

            let citations: Vec<serde_json::Value> = choice
                .delta
                .annotations
                .into_iter()
                .filter(|a| a.get("type").and_then(|t| t.as_str()) == Some("url_citation"))
                .collect();
            if !citations.is_empty() {
                deltas.push(Delta::SearchResults {
                    results: serde_json::Value::Array(citations),
                    source: SearchSource::OpenAI,
                });
            }

            if let Some(reason) = choice.finish_reason {
                if !self.finished {
                    self.finished = true;
                    deltas.push(Delta::Finish(FinishReason::parse(&reason)));
                }
            }
        }

        if let Some(usage) = chunk.usage {
            deltas.push(Delta::Usage(UsageReport {
                prompt_tokens: usage.prompt_tokens,
                completion_tokens: usage.completion_tokens,
                thoughts_tokens: usage
                    .completion_tokens_details
                    .and_then(|d| d.reasoning_tokens),
                total_tokens: usage.total_tokens,
            }));
        }

        Ok(deltas)
    }

    fn reasoning_boundary(&self) -> ReasoningBoundary {
        self.boundary.clone()
    }
}

// Request types

#[derive(Debug, Serialize)]
struct OpenAIRequest {
    model: String,
    messages: Vec<OpenAIMessage>,
    stream: bool,
    stream_options: StreamOptionsBody,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reasoning_effort: Option<String>,
}

#[derive(Debug, Serialize)]
struct StreamOptionsBody {
    include_usage: bool,
}

#[derive(Debug, Serialize)]
struct OpenAIMessage {
    role: String,
    content: MessageContent,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum MessageContent {
    Text(String),
    Parts(Vec<serde_json::Value>),
}

// Streaming response types

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<StreamUsage>,
    #[serde(default)]
    citations: Option<Vec<serde_json::Value>>,
    #[serde(default)]
    error: Option<ErrorBody>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    content: Option<String>,
    reasoning_content: Option<String>,
    reasoning: Option<serde_json::Value>,
    #[serde(default)]
    annotations: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct StreamUsage {
    prompt_tokens: Option<u32>,
    completion_tokens: Option<u32>,
    total_tokens: Option<u32>,
    completion_tokens_details: Option<CompletionTokensDetails>,
}

#[derive(Debug, Deserialize)]
struct CompletionTokensDetails {
    reasoning_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: String,
    #[serde(rename = "type")]
    error_type: Option<String>,
}
