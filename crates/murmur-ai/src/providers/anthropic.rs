//! Anthropic Messages API backend

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::{Backend, apply_model_headers, header_value, parse_payload, sse_stream};
use crate::{
    error::{Error, Result},
    stream::{Delta, FinishReason, Normalizer, RawItem, RawStream, SearchSource, UsageReport},
    types::{Api, Content, Context, Model, StreamOptions},
};

/// Smallest `budget_tokens` the Messages API accepts
const MIN_THINKING_BUDGET: u32 = 1024;

/// Anthropic API client
pub struct AnthropicProvider {
    client: reqwest::Client,
    api_key: String,
}

impl AnthropicProvider {
    /// Create a new Anthropic provider with an API key
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
        }
    }

    /// Create from environment variable
    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("ANTHROPIC_API_KEY").map_err(|_| Error::InvalidApiKey)?;
        Ok(Self::new(api_key))
    }

    fn build_request(
        &self,
        model: &Model,
        context: &Context,
        options: &StreamOptions,
    ) -> AnthropicRequest {
        let messages = context
            .dialogue()
            .filter_map(|msg| {
                let blocks: Vec<serde_json::Value> = msg
                    .content
                    .iter()
                    .filter_map(|c| match c {
                        Content::Image { data, mime_type } => Some(serde_json::json!({
                            "type": "image",
                            "source": {
                                "type": "base64",
                                "media_type": mime_type,
                                "data": data
                            }
                        })),
                        other => other
                            .prompt_text()
                            .filter(|t| !t.is_empty())
                            .map(|text| serde_json::json!({ "type": "text", "text": text })),
                    })
                    .collect();
                if blocks.is_empty() {
                    None
                } else {
                    Some(AnthropicMessage {
                        role: msg.role.as_str().to_string(),
                        content: serde_json::Value::Array(blocks),
                    })
                }
            })
            .collect();

        let max_tokens = options.max_tokens.unwrap_or(model.max_tokens);
        let thinking = if model.reasoning {
            options
                .reasoning
                .thinking_budget()
                .and_then(|budget| thinking_config(budget, max_tokens))
        } else {
            None
        };

        AnthropicRequest {
            model: model.id.clone(),
            messages,
            max_tokens,
            stream: true,
            system: context.merged_system_prompt(),
            // Extended thinking rejects a custom temperature.
            temperature: if thinking.is_some() {
                None
            } else {
                options.temperature
            },
            thinking,
        }
    }
}

#[async_trait]
impl Backend for AnthropicProvider {
    fn api(&self) -> Api {
        Api::AnthropicMessages
    }

    fn normalizer(&self) -> Box<dyn Normalizer> {
        Box::new(AnthropicNormalizer::default())
    }

    async fn open(
        &self,
        model: &Model,
        context: &Context,
        options: &StreamOptions,
        cancel: CancellationToken,
    ) -> Result<RawStream> {
        let request = self.build_request(model, context, options);
        let url = format!("{}/v1/messages", model.base_url);
        tracing::debug!("Anthropic API URL: {}", url);

        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert("x-api-key", header_value(&self.api_key)?);
        headers.insert("accept", header_value("text/event-stream")?);
        headers.insert("content-type", header_value("application/json")?);
        headers.insert("anthropic-version", header_value("2023-06-01")?);
        apply_model_headers(&mut headers, model);

        let request_builder = self.client.post(&url).headers(headers).json(&request);
        sse_stream(request_builder, cancel)
    }
}

/// Normalizer for Anthropic's named SSE events
#[derive(Debug, Default)]
pub struct AnthropicNormalizer {
    finished: bool,
}

impl Normalizer for AnthropicNormalizer {
    fn normalize(&mut self, item: &RawItem) -> Result<Vec<Delta>> {
        if item.data.trim().is_empty() {
            return Ok(vec![]);
        }
        let event: StreamEvent = parse_payload(&item.data)?;
        let event_type = item.event.as_deref().unwrap_or(event.event_type.as_str());

        let mut deltas = Vec::new();
        match event_type {
            "message_start" => {
                if let Some(usage) = event.message.and_then(|m| m.usage) {
                    deltas.push(Delta::Usage(usage.report()));
                }
            }
            "content_block_start" => {
                if let Some(block) = event.content_block {
                    if block.block_type == "web_search_tool_result" {
                        if let Some(results) = block.content {
                            deltas.push(Delta::SearchResults {
                                results,
                                source: SearchSource::Anthropic,
                            });
                        }
                    }
                }
            }
            "content_block_delta" => {
                if let Some(delta) = event.delta {
                    match delta.delta_type.as_deref() {
                        Some("text_delta") => {
                            if let Some(text) = delta.text.filter(|t| !t.is_empty()) {
                                deltas.push(Delta::Text(text));
                            }
                        }
                        Some("thinking_delta") => {
                            if let Some(thinking) = delta.thinking.filter(|t| !t.is_empty()) {
                                deltas.push(Delta::Reasoning(thinking));
                            }
                        }
                        _ => {}
                    }
                }
            }
            "message_delta" => {
                if let Some(usage) = event.usage {
                    deltas.push(Delta::Usage(usage.report()));
                }
                if let Some(reason) = event.delta.and_then(|d| d.stop_reason) {
                    if !self.finished {
                        self.finished = true;
                        deltas.push(Delta::Finish(FinishReason::parse(&reason)));
                    }
                }
            }
            "message_stop" => {
                if !self.finished {
                    self.finished = true;
                    deltas.push(Delta::Finish(FinishReason::Stop));
                }
            }
            "error" => {
                let error = event.error.unwrap_or(ApiError {
                    error_type: "error".to_string(),
                    message: item.data.clone(),
                });
                return Err(Error::api(error.error_type, error.message));
            }
            _ => {}
        }

        Ok(deltas)
    }
}

// ============================================================================
// Request types
// ============================================================================

#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    messages: Vec<AnthropicMessage>,
    max_tokens: u32,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    thinking: Option<ThinkingConfig>,
}

#[derive(Debug, Serialize)]
struct ThinkingConfig {
    #[serde(rename = "type")]
    thinking_type: String,
    budget_tokens: u32,
}

#[derive(Debug, Serialize)]
struct AnthropicMessage {
    role: String,
    content: serde_json::Value,
}

// ============================================================================
// Response event types
// ============================================================================

#[derive(Debug, Deserialize)]
struct StreamEvent {
    #[serde(rename = "type", default)]
    event_type: String,
    message: Option<MessageInfo>,
    content_block: Option<ContentBlockInfo>,
    delta: Option<DeltaInfo>,
    usage: Option<UsageInfo>,
    error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
struct MessageInfo {
    usage: Option<UsageInfo>,
}

#[derive(Debug, Deserialize)]
struct UsageInfo {
    input_tokens: Option<u32>,
    output_tokens: Option<u32>,
}

impl UsageInfo {
    fn report(&self) -> UsageReport {
        UsageReport {
            prompt_tokens: self.input_tokens,
            completion_tokens: self.output_tokens,
            ..Default::default()
        }
    }
}

#[derive(Debug, Deserialize)]
struct ContentBlockInfo {
    #[serde(rename = "type")]
    block_type: String,
    content: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct DeltaInfo {
    #[serde(rename = "type")]
    delta_type: Option<String>,
    text: Option<String>,
    thinking: Option<String>,
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(rename = "type")]
    error_type: String,
    message: String,
}

/// The budget must be at least 1024 tokens and below `max_tokens`; thinking is
/// skipped when `max_tokens` leaves no room for that.
fn thinking_config(budget: u32, max_tokens: u32) -> Option<ThinkingConfig> {
    let budget_tokens = budget.min(max_tokens.saturating_sub(1));
    if budget_tokens < MIN_THINKING_BUDGET {
        tracing::debug!(
            "max_tokens {} too small for extended thinking, sending without it",
            max_tokens
        );
        return None;
    }
    Some(ThinkingConfig {
        thinking_type: "enabled".to_string(),
        budget_tokens,
    })
}
