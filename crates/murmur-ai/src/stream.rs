//! Raw backend items, canonical deltas and the normalizer contract

use crate::{Result, types::Usage};
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use tokio_stream::Stream;

/// One item exactly as a backend delivered it (an SSE event, or a JSON line)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawItem {
    /// SSE event name, when the backend uses named events
    pub event: Option<String>,
    /// Payload, usually a JSON document
    pub data: String,
}

impl RawItem {
    /// An unnamed data item
    pub fn data(data: impl Into<String>) -> Self {
        Self {
            event: None,
            data: data.into(),
        }
    }

    /// A named SSE event
    pub fn event(event: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            event: Some(event.into()),
            data: data.into(),
        }
    }
}

/// A finite, non-restartable stream of raw backend items
pub type RawStream = Pin<Box<dyn Stream<Item = Result<RawItem>> + Send>>;

/// Why the backend stopped generating
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ContentFilter,
    /// Backend-native tool use (we only act on text-embedded calls)
    ToolUse,
    Other,
}

impl FinishReason {
    /// Map the many vendor spellings onto one vocabulary
    pub fn parse(reason: &str) -> Self {
        match reason.to_ascii_lowercase().as_str() {
            "stop" | "end_turn" | "stop_sequence" | "eos" => FinishReason::Stop,
            "length" | "max_tokens" => FinishReason::Length,
            "content_filter" | "safety" | "recitation" | "blocklist" | "prohibited_content" => {
                FinishReason::ContentFilter
            }
            "tool_calls" | "tool_use" | "function_call" => FinishReason::ToolUse,
            _ => FinishReason::Other,
        }
    }
}

/// Where a batch of web-search results came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchSource {
    /// Top-level `citations` array (Perplexity and compatible proxies)
    Perplexity,
    /// `annotations` of type `url_citation` on OpenAI deltas
    OpenAI,
    /// Gemini `groundingMetadata`
    Gemini,
    /// Anthropic `web_search_tool_result` blocks
    Anthropic,
}

/// Token counts reported by a backend; `None` means "not reported in this item"
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsageReport {
    pub prompt_tokens: Option<u32>,
    pub completion_tokens: Option<u32>,
    pub thoughts_tokens: Option<u32>,
    pub total_tokens: Option<u32>,
}

impl UsageReport {
    /// Overwrite the fields this report carries (last write wins)
    pub fn apply_to(&self, usage: &mut Usage) {
        if let Some(v) = self.prompt_tokens {
            usage.prompt_tokens = v;
        }
        if let Some(v) = self.completion_tokens {
            usage.completion_tokens = v;
        }
        if let Some(v) = self.thoughts_tokens {
            usage.thoughts_tokens = v;
        }
        if let Some(v) = self.total_tokens {
            usage.total_tokens = v;
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == UsageReport::default()
    }
}

/// Canonical partial delta produced by a normalizer
#[derive(Debug, Clone, PartialEq)]
pub enum Delta {
    /// Text from a dedicated reasoning field
    Reasoning(String),
    /// Text from the ordinary content field
    Text(String),
    Usage(UsageReport),
    Finish(FinishReason),
    SearchResults {
        results: serde_json::Value,
        source: SearchSource,
    },
}

/// Declarative end-of-reasoning predicate for a backend family.
///
/// Some backends never use a reasoning field: the reasoning arrives inline in
/// the content, wrapped in an open/close marker pair, the reasoning field
/// stops and a close marker shows up in the content, or the content simply
/// starts with reasoning and a close marker ends it (no open marker at all).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReasoningBoundary {
    /// Markers that, at the very start of the content, open an inline reasoning block
    pub open_markers: Vec<String>,
    /// Markers inside the content that end reasoning
    pub close_markers: Vec<String>,
    /// Content before the first close marker is reasoning even without an
    /// open marker. Such content is held back until a close marker shows up.
    pub reasoning_before_close: bool,
}

impl ReasoningBoundary {
    /// No inline markers: only dedicated reasoning fields count
    pub fn fields_only() -> Self {
        Self::default()
    }

    /// `<think>`/`<thinking>` tags, used by DeepSeek-R1, QwQ and friends behind
    /// OpenAI-compatible servers
    pub fn think_tags() -> Self {
        Self {
            open_markers: vec!["<think>".into(), "<thinking>".into()],
            close_markers: vec!["</think>".into(), "</thinking>".into()],
            reasoning_before_close: false,
        }
    }

    /// Add an extra open marker (e.g. a `###Thinking` header)
    pub fn with_open_marker(mut self, marker: impl Into<String>) -> Self {
        let marker = marker.into();
        if !marker.is_empty() && !self.open_markers.contains(&marker) {
            self.open_markers.push(marker);
        }
        self
    }

    /// Add an extra close marker (e.g. a control token a particular model emits)
    pub fn with_close_marker(mut self, marker: impl Into<String>) -> Self {
        let marker = marker.into();
        if !marker.is_empty() && !self.close_markers.contains(&marker) {
            self.close_markers.push(marker);
        }
        self
    }

    /// Treat leading content as reasoning until a close marker, for servers
    /// that strip the open tag (DeepSeek-R1 behind some hosts)
    pub fn with_reasoning_before_close(mut self, enabled: bool) -> Self {
        self.reasoning_before_close = enabled;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.open_markers.is_empty() && self.close_markers.is_empty()
    }
}

/// Turns one backend family's raw items into canonical deltas.
///
/// One instance is created per stream; implementations may keep state across
/// items of that stream. Unknown fields must be ignored.
pub trait Normalizer: Send {
    /// Normalize one raw item. Errors are transport errors (bad envelope,
    /// backend-reported failure).
    fn normalize(&mut self, item: &RawItem) -> Result<Vec<Delta>>;

    /// How this family signals the end of reasoning inside content
    fn reasoning_boundary(&self) -> ReasoningBoundary {
        ReasoningBoundary::fields_only()
    }
}
