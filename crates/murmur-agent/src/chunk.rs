//! Canonical chunk types and sinks

use murmur_ai::{SearchSource, Usage};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::metrics::Metrics;

/// How a turn ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishStatus {
    Completed,
    Paused,
    Cancelled,
}

/// Result of one tool invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "value", rename_all = "snake_case")]
pub enum ToolOutcome {
    Result(serde_json::Value),
    Error(String),
}

impl ToolOutcome {
    pub fn is_error(&self) -> bool {
        matches!(self, ToolOutcome::Error(_))
    }

    /// The value handed back to the backend, and whether it is an error
    pub fn to_output(&self) -> (serde_json::Value, bool) {
        match self {
            ToolOutcome::Result(value) => (value.clone(), false),
            ToolOutcome::Error(message) => (serde_json::Value::String(message.clone()), true),
        }
    }
}

/// Events emitted to the caller while a turn runs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Chunk {
    /// Reasoning text; `elapsed_ms` counts from the start of the thinking phase
    ThinkingDelta { text: String, elapsed_ms: u64 },

    /// The thinking phase closed
    ThinkingComplete { full_text: String, elapsed_ms: u64 },

    /// Answer text
    TextDelta { text: String },

    /// Concatenation of every `TextDelta` of the turn
    TextComplete { full_text: String },

    /// A complete tool call was detected in the answer text
    ToolCallRequested {
        raw_text: String,
        index: usize,
        tool_name: String,
        arguments: serde_json::Value,
    },

    /// A tool call finished
    ToolCallResult {
        tool_name: String,
        index: usize,
        outcome: ToolOutcome,
    },

    /// The backend attached web-search results
    WebSearchComplete {
        results: serde_json::Value,
        source: SearchSource,
    },

    /// The turn ended
    BlockComplete {
        usage: Usage,
        metrics: Metrics,
        status: FinishStatus,
    },

    /// The turn failed
    Error {
        message: String,
        usage: Usage,
        metrics: Metrics,
    },
}

impl Chunk {
    /// Check if this is a terminal event
    pub fn is_terminal(&self) -> bool {
        matches!(self, Chunk::BlockComplete { .. } | Chunk::Error { .. })
    }
}

/// Receives chunks as they are produced. Delivery is one-way; a sink never
/// influences the turn.
pub trait ChunkSink: Send + Sync {
    fn emit(&self, chunk: Chunk);
}

impl<F> ChunkSink for F
where
    F: Fn(Chunk) + Send + Sync,
{
    fn emit(&self, chunk: Chunk) {
        self(chunk)
    }
}

impl ChunkSink for mpsc::UnboundedSender<Chunk> {
    fn emit(&self, chunk: Chunk) {
        // A dropped receiver means nobody is listening any more.
        let _ = self.send(chunk);
    }
}
