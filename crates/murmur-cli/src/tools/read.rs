//! File reading tool

use async_trait::async_trait;
use murmur_agent::{Tool, ToolError};
use serde_json::json;
use std::path::PathBuf;
use tokio::fs;
use tokio_util::sync::CancellationToken;

const MAX_LINES: usize = 200;
const MAX_LINE_LENGTH: usize = 2000;

/// Tool for reading text files
pub struct ReadTool;

impl ReadTool {
    pub fn new() -> Self {
        Self
    }
}

impl Default for ReadTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for ReadTool {
    fn name(&self) -> &str {
        "read"
    }

    fn description(&self) -> &str {
        "Read lines of a text file. For large files, use offset and limit."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Path to the file to read (relative or absolute)"
                },
                "offset": {
                    "type": "integer",
                    "description": "Line number to start reading from (1-indexed)"
                },
                "limit": {
                    "type": "integer",
                    "description": "Maximum number of lines to read"
                }
            },
            "required": ["path"]
        })
    }

    async fn execute(
        &self,
        _call_id: &str,
        arguments: serde_json::Value,
        cancel: CancellationToken,
    ) -> Result<serde_json::Value, ToolError> {
        let path_str = arguments
            .get("path")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolError::InvalidArguments("Missing 'path' argument".into()))?;

        let path = match path_str.strip_prefix("~/") {
            Some(stripped) => dirs::home_dir()
                .map(|home| home.join(stripped))
                .unwrap_or_else(|| PathBuf::from(path_str)),
            None => PathBuf::from(path_str),
        };

        let content = tokio::select! {
            _ = cancel.cancelled() => return Err(ToolError::Cancelled),
            read = fs::read_to_string(&path) => read
                .map_err(|e| ToolError::Failed(format!("Failed to read {}: {}", path.display(), e)))?,
        };

        let lines: Vec<&str> = content.lines().collect();
        let total_lines = lines.len();

        let offset = arguments
            .get("offset")
            .and_then(|v| v.as_u64())
            .map(|o| (o as usize).saturating_sub(1)) // 1-indexed to 0-indexed
            .unwrap_or(0);
        let limit = arguments
            .get("limit")
            .and_then(|v| v.as_u64())
            .map(|l| l as usize)
            .unwrap_or(MAX_LINES);

        if offset >= total_lines && total_lines > 0 {
            return Err(ToolError::Failed(format!(
                "Offset {} is beyond end of file ({} lines total)",
                offset + 1,
                total_lines
            )));
        }

        let end = (offset + limit).min(total_lines);
        let text = lines[offset.min(end)..end]
            .iter()
            .map(|line| match line.char_indices().nth(MAX_LINE_LENGTH) {
                Some((cut, _)) => &line[..cut],
                None => line,
            })
            .collect::<Vec<_>>()
            .join("\n");

        Ok(json!({
            "path": path.display().to_string(),
            "text": text,
            "total_lines": total_lines,
            "truncated": end < total_lines,
        }))
    }
}
