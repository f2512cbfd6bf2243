//! Demo tools the binary offers to the model

mod clock;
mod read;

pub use clock::ClockTool;
pub use read::ReadTool;

use murmur_agent::ToolRegistry;
use std::sync::Arc;

/// Registry with every demo tool
pub fn registry() -> ToolRegistry {
    ToolRegistry::new()
        .with(Arc::new(ClockTool::new()))
        .with(Arc::new(ReadTool::new()))
}
