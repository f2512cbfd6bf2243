//! Current time tool

use async_trait::async_trait;
use chrono::{FixedOffset, Utc};
use murmur_agent::{Tool, ToolError};
use serde_json::json;
use tokio_util::sync::CancellationToken;

/// Tool reporting the current date and time
pub struct ClockTool;

impl ClockTool {
    pub fn new() -> Self {
        Self
    }
}

impl Default for ClockTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for ClockTool {
    fn name(&self) -> &str {
        "clock"
    }

    fn description(&self) -> &str {
        "Get the current date and time, optionally shifted to a UTC offset in hours."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "utc_offset": {
                    "type": "number",
                    "description": "Offset from UTC in hours, e.g. -5 or 5.5 (default: 0)"
                }
            },
            "required": []
        })
    }

    async fn execute(
        &self,
        _call_id: &str,
        arguments: serde_json::Value,
        _cancel: CancellationToken,
    ) -> Result<serde_json::Value, ToolError> {
        let hours = arguments
            .get("utc_offset")
            .and_then(|v| v.as_f64())
            .unwrap_or(0.0);
        let offset = FixedOffset::east_opt((hours * 3600.0).round() as i32)
            .ok_or_else(|| ToolError::Failed(format!("Invalid UTC offset: {}", hours)))?;

        let now = Utc::now().with_timezone(&offset);
        Ok(json!({
            "iso8601": now.to_rfc3339(),
            "weekday": now.format("%A").to_string(),
            "unix": now.timestamp(),
        }))
    }
}
