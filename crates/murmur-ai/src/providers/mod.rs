//! Backend implementations, one per wire family

pub mod anthropic;
pub mod google;
pub mod openai;

use std::sync::Arc;

use async_stream::stream;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest_eventsource::{Event, EventSource};
use tokio_util::sync::CancellationToken;

use crate::{
    Api, Context, Error, Model, Result, StreamOptions,
    stream::{Normalizer, RawItem, RawStream},
};

/// A remote language-model service exposing a streaming completion capability
#[async_trait]
pub trait Backend: Send + Sync {
    /// Wire family this backend speaks
    fn api(&self) -> Api;

    /// A fresh normalizer for one stream opened by this backend
    fn normalizer(&self) -> Box<dyn Normalizer>;

    /// Open one stream. Cancelling `cancel` stops network I/O; the stream then ends.
    async fn open(
        &self,
        model: &Model,
        context: &Context,
        options: &StreamOptions,
        cancel: CancellationToken,
    ) -> Result<RawStream>;
}

/// Get an API key from the provided value or the environment
pub fn get_api_key(provided: Option<&str>, env_var: &str) -> Result<String> {
    if let Some(key) = provided {
        return Ok(key.to_string());
    }

    std::env::var(env_var).map_err(|_| Error::InvalidApiKey)
}

/// Build the backend for a model's wire family
pub fn backend_for(model: &Model, api_key: Option<&str>) -> Result<Arc<dyn Backend>> {
    let backend: Arc<dyn Backend> = match model.api {
        Api::OpenAICompletions => {
            // Local servers (Ollama, vLLM) usually run without a key.
            let key = get_api_key(api_key, model.api.api_key_env_var()).unwrap_or_default();
            Arc::new(openai::OpenAIProvider::new(key))
        }
        Api::AnthropicMessages => Arc::new(anthropic::AnthropicProvider::new(get_api_key(
            api_key,
            model.api.api_key_env_var(),
        )?)),
        Api::GoogleGenerativeAI => {
            let key = get_api_key(api_key, model.api.api_key_env_var())
                .or_else(|_| get_api_key(None, "GEMINI_API_KEY"))?;
            Arc::new(google::GoogleProvider::new(key))
        }
    };
    Ok(backend)
}

/// Copy model-specific headers onto a request
pub(crate) fn apply_model_headers(headers: &mut reqwest::header::HeaderMap, model: &Model) {
    for (key, value) in &model.headers {
        if let (Ok(name), Ok(val)) = (
            key.parse::<reqwest::header::HeaderName>(),
            value.parse::<reqwest::header::HeaderValue>(),
        ) {
            headers.insert(name, val);
        }
    }
}

/// Parse a header value we construct ourselves
pub(crate) fn header_value(value: &str) -> Result<reqwest::header::HeaderValue> {
    value
        .parse()
        .map_err(|_| Error::InvalidConfig(format!("invalid header value: {}", value)))
}

/// Turn an SSE request into a raw item stream that stops on cancellation
pub(crate) fn sse_stream(
    request: reqwest::RequestBuilder,
    cancel: CancellationToken,
) -> Result<RawStream> {
    let mut event_source = EventSource::new(request)
        .map_err(|e| Error::Sse(format!("Failed to create event source: {}", e)))?;
    // A finished completion must not be replayed.
    event_source.set_retry_policy(Box::new(reqwest_eventsource::retry::Never));

    Ok(Box::pin(stream! {
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::debug!("Stream cancelled, closing event source");
                    event_source.close();
                    return;
                }
                next = event_source.next() => next,
            };

            match next {
                None => return,
                Some(Ok(Event::Open)) => {}
                Some(Ok(Event::Message(msg))) => {
                    let event = if msg.event.is_empty() || msg.event == "message" {
                        None
                    } else {
                        Some(msg.event)
                    };
                    yield Ok(RawItem { event, data: msg.data });
                }
                Some(Err(reqwest_eventsource::Error::StreamEnded)) => {
                    event_source.close();
                    return;
                }
                Some(Err(reqwest_eventsource::Error::InvalidStatusCode(status, response))) => {
                    let body = response.text().await.unwrap_or_default();
                    event_source.close();
                    yield Err(Error::from_status(status.as_u16(), body));
                    return;
                }
                Some(Err(reqwest_eventsource::Error::Transport(e))) => {
                    event_source.close();
                    yield Err(Error::Http(e));
                    return;
                }
                Some(Err(e)) => {
                    event_source.close();
                    yield Err(Error::Sse(e.to_string()));
                    return;
                }
            }
        }
    }))
}

/// Parse a JSON payload, reporting the offending data on failure
pub(crate) fn parse_payload<T: serde::de::DeserializeOwned>(data: &str) -> Result<T> {
    serde_json::from_str(data).map_err(|e| {
        let preview: String = data.chars().take(200).collect();
        Error::UnexpectedResponse(format!("{} in payload: {}", e, preview))
    })
}
