//! murmur-ai: backend streaming layer
//!
//! Opens streaming completions against remote language-model backends and
//! normalizes each vendor's stream items into one canonical delta vocabulary.

pub mod error;
pub mod providers;
pub mod stream;
pub mod types;

pub use error::{Error, Result};
pub use providers::{Backend, backend_for};
pub use stream::{
    Delta, FinishReason, Normalizer, RawItem, RawStream, ReasoningBoundary, SearchSource,
    UsageReport,
};
pub use types::*;
