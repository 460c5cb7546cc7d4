use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::ids::SessionId;
use crate::rpc::LogLevel;

/// Receives progress messages emitted by a running tool.
pub trait ToolNotifier: Send + Sync {
    fn log(&self, level: LogLevel, message: &str);
}

/// Discards every message.
pub struct NoopNotifier;

impl ToolNotifier for NoopNotifier {
    fn log(&self, _level: LogLevel, _message: &str) {}
}

/// Context available to tools during execution.
pub struct ToolContext {
    pub session_id: SessionId,
    /// Cancelled when the owning session closes.
    pub abort_signal: CancellationToken,
    pub notifier: Arc<dyn ToolNotifier>,
}

impl ToolContext {
    /// Context with no progress sink and a fresh abort token.
    pub fn detached(session_id: SessionId) -> Self {
        Self {
            session_id,
            abort_signal: CancellationToken::new(),
            notifier: Arc::new(NoopNotifier),
        }
    }

    pub fn info(&self, message: &str) {
        self.notifier.log(LogLevel::Info, message);
    }
}

/// Result returned by a tool execution. `is_error` results are still a
/// successful protocol exchange; the client sees the text and an error flag.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ToolResult {
    pub content: String,
    pub is_error: bool,
}

impl ToolResult {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: true,
        }
    }
}

/// Tool definition advertised through `tools/list`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// Trait implemented by each tool.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn input_schema(&self) -> serde_json::Value;

    async fn execute(
        &self,
        args: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolResult, ToolError>;

    fn to_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            input_schema: self.input_schema(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("execution failed: {0}")]
    ExecutionFailed(String),
    #[error("timeout after {0:?}")]
    Timeout(Duration),
    #[error("cancelled")]
    Cancelled,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn definition_uses_camel_case_schema_key() {
        let def = ToolDefinition {
            name: "read_file".into(),
            description: "Read".into(),
            input_schema: serde_json::json!({"type": "object"}),
        };
        let json = serde_json::to_value(&def).unwrap();
        assert_eq!(json["inputSchema"]["type"], "object");
        assert!(json.get("input_schema").is_none());
    }

    #[test]
    fn tool_error_display() {
        let err = ToolError::InvalidArguments("repoUrl is required".into());
        assert_eq!(err.to_string(), "invalid arguments: repoUrl is required");

        let err = ToolError::Timeout(Duration::from_secs(60));
        assert!(err.to_string().contains("60"));
    }

    #[test]
    fn result_constructors() {
        assert!(!ToolResult::text("ok").is_error);
        assert!(ToolResult::error("nope").is_error);
    }
}
