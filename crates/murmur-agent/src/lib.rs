//! murmur-agent: Streaming turn orchestration
//!
//! This crate turns backend streams into one ordered chunk stream per
//! assistant turn: reasoning is split from the answer, inline tool calls are
//! executed and the model is resumed with their results, and every turn ends
//! with exactly one terminal chunk.

pub mod chunk;
pub mod classifier;
pub mod control;
pub mod error;
pub mod interpreter;
pub mod metrics;
pub mod orchestrator;
pub mod tool;

#[cfg(test)]
mod testing;

pub use chunk::{Chunk, ChunkSink, FinishStatus, ToolOutcome};
pub use classifier::{Phase, PhaseClassifier, PhaseEvent};
pub use control::{PauseSwitch, TurnHandle};
pub use error::{Error, Result};
pub use interpreter::{Scan, ToolCall, ToolCallInterpreter, parse_arguments, tool_instructions};
pub use metrics::{Metrics, MetricsCollector};
pub use orchestrator::{
    DEFAULT_MAX_TOOL_ROUNDS, Orchestrator, RetryConfig, TurnConfig, TurnOutcome,
};
pub use tool::{BoxedTool, Tool, ToolError, ToolExecutor, ToolRegistry, ToolResponse, ToolSpec};
