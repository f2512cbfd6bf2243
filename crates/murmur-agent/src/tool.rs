//! Tool trait, registry and execution capability

use async_trait::async_trait;
use murmur_ai::Content;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::chunk::ToolOutcome;

/// Why a tool invocation failed
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ToolError {
    #[error("Tool not found: {0}")]
    UnknownTool(String),

    #[error("Tool argument validation failed:\n{0}")]
    InvalidArguments(String),

    #[error("{0}")]
    Failed(String),

    #[error("Tool execution cancelled")]
    Cancelled,
}

/// Name, description and parameter schema of a tool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON Schema for parameters
    pub parameters: serde_json::Value,
}

/// Trait for executable tools
#[async_trait]
pub trait Tool: Send + Sync {
    /// Tool name, as written in `[[tool:NAME(...)]]`
    fn name(&self) -> &str;

    /// Tool description for the model
    fn description(&self) -> &str;

    /// JSON Schema for parameters
    fn parameters_schema(&self) -> serde_json::Value;

    /// Execute the tool with the given arguments
    async fn execute(
        &self,
        call_id: &str,
        arguments: serde_json::Value,
        cancel: CancellationToken,
    ) -> Result<serde_json::Value, ToolError>;
}

/// Type alias for a shared tool
pub type BoxedTool = Arc<dyn Tool>;

/// The capability the orchestrator uses to run tool calls
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    /// Tools to advertise in the system prompt
    fn specs(&self) -> Vec<ToolSpec>;

    async fn execute(
        &self,
        call_id: &str,
        tool_name: &str,
        arguments: serde_json::Value,
        cancel: CancellationToken,
    ) -> Result<serde_json::Value, ToolError>;
}

/// A set of tools with cached argument validators
#[derive(Default)]
pub struct ToolRegistry {
    tools: Vec<BoxedTool>,
    /// Cached compiled JSON schema validators keyed by tool name
    schema_cache: HashMap<String, Arc<jsonschema::Validator>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`ToolRegistry::add`]
    pub fn with(mut self, tool: BoxedTool) -> Self {
        self.add(tool);
        self
    }

    /// Add a tool, replacing any tool with the same name
    pub fn add(&mut self, tool: BoxedTool) {
        self.tools.retain(|t| t.name() != tool.name());
        self.cache_tool_schema(&tool);
        self.tools.push(tool);
    }

    /// Compile and cache the JSON schema validator for a tool.
    fn cache_tool_schema(&mut self, tool: &BoxedTool) {
        let schema = tool.parameters_schema();
        match jsonschema::validator_for(&schema) {
            Ok(validator) => {
                self.schema_cache
                    .insert(tool.name().to_string(), Arc::new(validator));
            }
            Err(e) => {
                self.schema_cache.remove(tool.name());
                tracing::warn!(
                    "Invalid tool parameter schema for '{}', skipping validation: {}",
                    tool.name(),
                    e
                );
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&BoxedTool> {
        self.tools.iter().find(|t| t.name() == name)
    }

    /// Get tool names
    pub fn names(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.name()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

#[async_trait]
impl ToolExecutor for ToolRegistry {
    fn specs(&self) -> Vec<ToolSpec> {
        self.tools
            .iter()
            .map(|t| ToolSpec {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.parameters_schema(),
            })
            .collect()
    }

    async fn execute(
        &self,
        call_id: &str,
        tool_name: &str,
        arguments: serde_json::Value,
        cancel: CancellationToken,
    ) -> Result<serde_json::Value, ToolError> {
        let tool = self
            .get(tool_name)
            .ok_or_else(|| ToolError::UnknownTool(tool_name.to_string()))?;

        if let Some(validator) = self.schema_cache.get(tool_name) {
            if let Some(err) = validate_with_validator(&arguments, validator) {
                return Err(ToolError::InvalidArguments(err));
            }
        }

        tool.execute(call_id, arguments, cancel).await
    }
}

/// Validate tool arguments using a pre-compiled validator.
/// Returns `Some(error_message)` if validation fails, `None` if valid.
fn validate_with_validator(
    args: &serde_json::Value,
    validator: &jsonschema::Validator,
) -> Option<String> {
    let errors: Vec<String> = validator
        .iter_errors(args)
        .map(|e| {
            let path = e.instance_path.to_string();
            if path.is_empty() {
                e.to_string()
            } else {
                format!("{}: {}", path, e)
            }
        })
        .collect();

    if errors.is_empty() {
        None
    } else {
        Some(errors.join("\n"))
    }
}

/// One executed tool call, handed to the controller once its segment drained
#[derive(Debug, Clone, PartialEq)]
pub struct ToolResponse {
    pub call_id: String,
    pub tool_name: String,
    pub arguments: serde_json::Value,
    pub outcome: ToolOutcome,
    /// Index of the call in the turn's answer text
    pub source_index: usize,
}

impl ToolResponse {
    /// History representation of this response
    pub fn to_content(&self) -> Content {
        let (output, is_error) = self.outcome.to_output();
        Content::ToolResult {
            call_id: self.call_id.clone(),
            tool_name: self.tool_name.clone(),
            arguments: self.arguments.clone(),
            output,
            is_error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct PathTool;

    #[async_trait]
    impl Tool for PathTool {
        fn name(&self) -> &str {
            "stat"
        }
        fn description(&self) -> &str {
            "Stat a path"
        }
        fn parameters_schema(&self) -> serde_json::Value {
            json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string" },
                    "count": { "type": "integer" }
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
            if cancel.is_cancelled() {
                return Err(ToolError::Cancelled);
            }
            Ok(json!({ "path": arguments["path"], "size": 42 }))
        }
    }

    struct LooseTool;

    #[async_trait]
    impl Tool for LooseTool {
        fn name(&self) -> &str {
            "loose"
        }
        fn description(&self) -> &str {
            "Has a broken schema"
        }
        fn parameters_schema(&self) -> serde_json::Value {
            json!({"type": "not_a_real_type"})
        }
        async fn execute(
            &self,
            _call_id: &str,
            arguments: serde_json::Value,
            _cancel: CancellationToken,
        ) -> Result<serde_json::Value, ToolError> {
            Ok(arguments)
        }
    }

    fn registry() -> ToolRegistry {
        ToolRegistry::new()
            .with(Arc::new(PathTool))
            .with(Arc::new(LooseTool))
    }

    #[tokio::test]
    async fn test_execute_valid_arguments() {
        let result = registry()
            .execute("c1", "stat", json!({"path": "/tmp"}), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result, json!({"path": "/tmp", "size": 42}));
    }

    #[tokio::test]
    async fn test_missing_required_argument() {
        let err = registry()
            .execute("c1", "stat", json!({"count": 5}), CancellationToken::new())
            .await
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("validation failed"), "got: {}", msg);
        assert!(msg.contains("path"), "should mention missing field, got: {}", msg);
    }

    #[tokio::test]
    async fn test_wrong_type_reports_path() {
        let err = registry()
            .execute("c1", "stat", json!({"path": "/x", "count": "many"}), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments(ref m) if m.contains("/count")));
    }

    #[tokio::test]
    async fn test_unknown_tool() {
        let err = registry()
            .execute("c1", "nope", json!({}), CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err, ToolError::UnknownTool("nope".into()));
    }

    #[tokio::test]
    async fn test_invalid_schema_skips_validation() {
        let result = registry()
            .execute("c1", "loose", json!({"anything": true}), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result, json!({"anything": true}));
    }

    #[test]
    fn test_specs_and_replacement() {
        let mut reg = registry();
        reg.add(Arc::new(PathTool));
        assert_eq!(reg.names(), vec!["loose", "stat"]);
        let specs = reg.specs();
        assert_eq!(specs[1].description, "Stat a path");
    }

    #[test]
    fn test_response_to_content() {
        let response = ToolResponse {
            call_id: "c9".into(),
            tool_name: "stat".into(),
            arguments: json!({"path": "/"}),
            outcome: ToolOutcome::Error("denied".into()),
            source_index: 2,
        };
        let Content::ToolResult { output, is_error, .. } = response.to_content() else {
            panic!("expected a tool result");
        };
        assert!(is_error);
        assert_eq!(output, json!("denied"));
    }
}
