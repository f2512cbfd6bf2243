//! Scripted in-memory backend and tools for tests

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_stream::stream;
use async_trait::async_trait;
use murmur_ai::{
    Api, Backend, Context, Delta, Error, FinishReason, Model, Normalizer, RawItem, RawStream,
    ReasoningBoundary, SearchSource, StreamOptions, UsageReport,
};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use crate::chunk::Chunk;
use crate::tool::{Tool, ToolError};

/// One scripted step of a backend stream
pub(crate) enum Step {
    /// A raw item, normalized by [`ScriptNormalizer`]
    Item(Value),
    Wait(Duration),
    Fail(Error),
    /// Produce nothing more until cancelled
    Hang,
}

pub(crate) fn reasoning(text: &str) -> Step {
    Step::Item(json!({ "reasoning": text }))
}

pub(crate) fn content(text: &str) -> Step {
    Step::Item(json!({ "content": text }))
}

pub(crate) fn usage(prompt: u32, completion: u32) -> Step {
    Step::Item(json!({ "usage": { "prompt": prompt, "completion": completion } }))
}

pub(crate) fn finish() -> Step {
    Step::Item(json!({ "finish": "stop" }))
}

pub(crate) fn wait_ms(ms: u64) -> Step {
    Step::Wait(Duration::from_millis(ms))
}

/// Backend that replays one script per opened stream
pub(crate) struct ScriptedBackend {
    segments: Mutex<VecDeque<Vec<Step>>>,
    open_failures: Mutex<VecDeque<Error>>,
    boundary: ReasoningBoundary,
    contexts: Mutex<Vec<Context>>,
}

impl ScriptedBackend {
    pub(crate) fn new(segments: Vec<Vec<Step>>) -> Self {
        Self {
            segments: Mutex::new(segments.into()),
            open_failures: Mutex::new(VecDeque::new()),
            boundary: ReasoningBoundary::fields_only(),
            contexts: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn with_boundary(mut self, boundary: ReasoningBoundary) -> Self {
        self.boundary = boundary;
        self
    }

    /// Fail the next `open` with `error`
    pub(crate) fn with_open_failure(self, error: Error) -> Self {
        self.open_failures.lock().push_back(error);
        self
    }

    /// Contexts of every `open` call, in order
    pub(crate) fn contexts(&self) -> Vec<Context> {
        self.contexts.lock().clone()
    }
}

#[async_trait]
impl Backend for ScriptedBackend {
    fn api(&self) -> Api {
        Api::OpenAICompletions
    }

    fn normalizer(&self) -> Box<dyn Normalizer> {
        Box::new(ScriptNormalizer {
            boundary: self.boundary.clone(),
        })
    }

    async fn open(
        &self,
        _model: &Model,
        context: &Context,
        _options: &StreamOptions,
        cancel: CancellationToken,
    ) -> murmur_ai::Result<RawStream> {
        self.contexts.lock().push(context.clone());
        let failure = self.open_failures.lock().pop_front();
        if let Some(error) = failure {
            return Err(error);
        }
        let steps = self.segments.lock().pop_front().unwrap_or_default();

        Ok(Box::pin(stream! {
            for step in steps {
                match step {
                    Step::Item(value) => yield Ok(RawItem::data(value.to_string())),
                    Step::Wait(duration) => tokio::time::sleep(duration).await,
                    Step::Fail(error) => {
                        yield Err(error);
                        return;
                    }
                    Step::Hang => {
                        cancel.cancelled().await;
                        return;
                    }
                }
            }
        }))
    }
}

/// Normalizer for the scripted JSON items
pub(crate) struct ScriptNormalizer {
    boundary: ReasoningBoundary,
}

impl Normalizer for ScriptNormalizer {
    fn normalize(&mut self, item: &RawItem) -> murmur_ai::Result<Vec<Delta>> {
        let value: Value = serde_json::from_str(&item.data)?;
        let mut deltas = Vec::new();
        if let Some(text) = value["reasoning"].as_str() {
            deltas.push(Delta::Reasoning(text.to_string()));
        }
        if let Some(text) = value["content"].as_str() {
            deltas.push(Delta::Text(text.to_string()));
        }
        if let Some(results) = value.get("search") {
            deltas.push(Delta::SearchResults {
                results: results.clone(),
                source: SearchSource::Perplexity,
            });
        }
        if let Some(usage) = value.get("usage") {
            let field = |name: &str| usage[name].as_u64().map(|v| v as u32);
            deltas.push(Delta::Usage(UsageReport {
                prompt_tokens: field("prompt"),
                completion_tokens: field("completion"),
                thoughts_tokens: None,
                total_tokens: field("total"),
            }));
        }
        if let Some(reason) = value["finish"].as_str() {
            deltas.push(Delta::Finish(FinishReason::parse(reason)));
        }
        Ok(deltas)
    }

    fn reasoning_boundary(&self) -> ReasoningBoundary {
        self.boundary.clone()
    }
}

/// Returns its arguments
pub(crate) struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }
    fn description(&self) -> &str {
        "Echo the arguments back"
    }
    fn parameters_schema(&self) -> Value {
        json!({ "type": "object" })
    }
    async fn execute(
        &self,
        _call_id: &str,
        arguments: Value,
        _cancel: CancellationToken,
    ) -> Result<Value, ToolError> {
        Ok(arguments)
    }
}

/// Runs until cancelled
pub(crate) struct StallTool;

#[async_trait]
impl Tool for StallTool {
    fn name(&self) -> &str {
        "stall"
    }
    fn description(&self) -> &str {
        "Never finishes"
    }
    fn parameters_schema(&self) -> Value {
        json!({ "type": "object" })
    }
    async fn execute(
        &self,
        _call_id: &str,
        _arguments: Value,
        cancel: CancellationToken,
    ) -> Result<Value, ToolError> {
        cancel.cancelled().await;
        Err(ToolError::Cancelled)
    }
}

/// A sink that records every chunk
pub(crate) fn collector() -> (Arc<Mutex<Vec<Chunk>>>, impl Fn(Chunk) + Send + Sync + 'static) {
    let chunks = Arc::new(Mutex::new(Vec::new()));
    let sink_chunks = Arc::clone(&chunks);
    (chunks, move |chunk: Chunk| sink_chunks.lock().push(chunk))
}

/// Concatenated `TextDelta` texts
pub(crate) fn text_of(chunks: &[Chunk]) -> String {
    chunks
        .iter()
        .filter_map(|c| match c {
            Chunk::TextDelta { text } => Some(text.as_str()),
            _ => None,
        })
        .collect()
}

pub(crate) fn test_model() -> Model {
    Model::new("scripted", Api::OpenAICompletions).with_base_url("http://localhost")
}
