//! Google Generative AI (Gemini) backend

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::{Backend, apply_model_headers, header_value, parse_payload, sse_stream};
use crate::{
    error::{Error, Result},
    stream::{Delta, FinishReason, Normalizer, RawItem, RawStream, SearchSource, UsageReport},
    types::{Api, Content, Context, Model, Role, StreamOptions},
};

/// Google Generative AI client
pub struct GoogleProvider {
    client: reqwest::Client,
    api_key: String,
}

impl GoogleProvider {
    /// Create a new Google provider with an API key
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
        }
    }

    /// Create from environment variable
    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("GOOGLE_API_KEY")
            .or_else(|_| std::env::var("GEMINI_API_KEY"))
            .map_err(|_| Error::InvalidApiKey)?;
        Ok(Self::new(api_key))
    }

    fn build_request(
        &self,
        model: &Model,
        context: &Context,
        options: &StreamOptions,
    ) -> GeminiRequest {
        let contents = context
            .dialogue()
            .filter_map(|msg| {
                let parts: Vec<GeminiPart> = msg
                    .content
                    .iter()
                    .filter_map(|c| match c {
                        Content::Image { data, mime_type } => Some(GeminiPart::InlineData {
                            inline_data: InlineData {
                                mime_type: mime_type.clone(),
                                data: data.clone(),
                            },
                        }),
                        other => other
                            .prompt_text()
                            .filter(|t| !t.is_empty())
                            .map(|text| GeminiPart::Text { text }),
                    })
                    .collect();
                if parts.is_empty() {
                    return None;
                }
                let role = match msg.role {
                    Role::Assistant => "model",
                    _ => "user",
                };
                Some(GeminiContent {
                    role: Some(role.to_string()),
                    parts,
                })
            })
            .collect();

        let system_instruction = context.merged_system_prompt().map(|prompt| GeminiContent {
            role: None,
            parts: vec![GeminiPart::Text { text: prompt }],
        });

        let thinking_config = if model.reasoning {
            Some(ThinkingConfig {
                include_thoughts: true,
                thinking_budget: options.reasoning.thinking_budget(),
            })
        } else {
            None
        };

        GeminiRequest {
            contents,
            system_instruction,
            generation_config: GenerationConfig {
                max_output_tokens: options.max_tokens.or(Some(model.max_tokens)),
                temperature: options.temperature,
                thinking_config,
            },
        }
    }
}

#[async_trait]
impl Backend for GoogleProvider {
    fn api(&self) -> Api {
        Api::GoogleGenerativeAI
    }

    fn normalizer(&self) -> Box<dyn Normalizer> {
        Box::new(GeminiNormalizer::default())
    }

    async fn open(
        &self,
        model: &Model,
        context: &Context,
        options: &StreamOptions,
        cancel: CancellationToken,
    ) -> Result<RawStream> {
        let request = self.build_request(model, context, options);
        let url = format!(
            "{}/models/{}:streamGenerateContent?alt=sse",
            model.base_url, model.id
        );
        tracing::debug!("Gemini API URL: {}", url);

        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert("content-type", header_value("application/json")?);
        headers.insert("x-goog-api-key", header_value(&self.api_key)?);
        apply_model_headers(&mut headers, model);

        let request_builder = self.client.post(&url).headers(headers).json(&request);
        sse_stream(request_builder, cancel)
    }
}

/// Normalizer for `streamGenerateContent` responses
#[derive(Debug, Default)]
pub struct GeminiNormalizer {
    finished: bool,
}

impl Normalizer for GeminiNormalizer {
    fn normalize(&mut self, item: &RawItem) -> Result<Vec<Delta>> {
        let data = item.data.trim();
        if data.is_empty() || data == "[DONE]" {
            return Ok(vec![]);
        }

        let response: GeminiStreamResponse = parse_payload(data)?;
        if let Some(error) = response.error {
            return Err(Error::api(
                error.status.unwrap_or_else(|| "error".to_string()),
                error.message,
            ));
        }

        let mut deltas = Vec::new();
        for candidate in response.candidates {
            if let Some(content) = candidate.content {
                for part in content.parts {
                    let Some(text) = part.text.filter(|t| !t.is_empty()) else {
                        continue;
                    };
                    if part.thought {
                        deltas.push(Delta::Reasoning(text));
                    } else {
                        deltas.push(Delta::Text(text));
                    }
                }
            }

            if let Some(grounding) = candidate.grounding_metadata {
                deltas.push(Delta::SearchResults {
                    results: grounding,
                    source: SearchSource::Gemini,
                });
            }

            if let Some(reason) = candidate.finish_reason {
                if !self.finished {
                    self.finished = true;
                    deltas.push(Delta::Finish(FinishReason::parse(&reason)));
                }
            }
        }

        if let Some(usage) = response.usage_metadata {
            deltas.push(Delta::Usage(UsageReport {
                prompt_tokens: usage.prompt_token_count,
                completion_tokens: usage.candidates_token_count,
                thoughts_tokens: usage.thoughts_token_count,
                total_tokens: usage.total_token_count,
            }));
        }

        Ok(deltas)
    }
}

// Request types

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<GeminiContent>,
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize)]
struct GeminiContent {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum GeminiPart {
    Text {
        text: String,
    },
    InlineData {
        #[serde(rename = "inlineData")]
        inline_data: InlineData,
    },
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    mime_type: String,
    data: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    thinking_config: Option<ThinkingConfig>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ThinkingConfig {
    include_thoughts: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    thinking_budget: Option<u32>,
}

// Response types

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiStreamResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
    usage_metadata: Option<GeminiUsage>,
    error: Option<GeminiError>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiCandidate {
    content: Option<GeminiResponseContent>,
    finish_reason: Option<String>,
    grounding_metadata: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct GeminiResponseContent {
    #[serde(default)]
    parts: Vec<GeminiResponsePart>,
}

#[derive(Debug, Deserialize)]
struct GeminiResponsePart {
    text: Option<String>,
    #[serde(default)]
    thought: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiUsage {
    prompt_token_count: Option<u32>,
    candidates_token_count: Option<u32>,
    thoughts_token_count: Option<u32>,
    total_token_count: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct GeminiError {
    message: String,
    status: Option<String>,
}
