//! Repository introspection tools. Every call clones into its own workspace,
//! which is removed again when the call returns.

use std::sync::Arc;

use async_trait::async_trait;
use buildspace_core::tools::{Tool, ToolContext, ToolError, ToolResult};
use serde_json::{json, Map, Value};

use crate::workspace::{Workspace, WorkspaceAcquirer, WorkspaceError};

fn map_workspace_error(err: WorkspaceError) -> ToolError {
    match err {
        WorkspaceError::InvalidUrl(_) | WorkspaceError::InvalidPath(_) => {
            ToolError::InvalidArguments(err.to_string())
        }
        WorkspaceError::Cancelled(_) => ToolError::Cancelled,
        other => ToolError::ExecutionFailed(other.to_string()),
    }
}

fn required_str<'a>(args: &'a Value, key: &str) -> Result<&'a str, ToolError> {
    args.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| ToolError::InvalidArguments(format!("{key} is required")))
}

async fn clone_for(
    acquirer: &WorkspaceAcquirer,
    args: &Value,
    ctx: &ToolContext,
) -> Result<Workspace, ToolError> {
    let repo_url = required_str(args, "repoUrl")?;
    ctx.info(&format!("Cloning {repo_url}"));
    acquirer
        .acquire(repo_url, &ctx.abort_signal)
        .await
        .map_err(map_workspace_error)
}

fn to_pretty_json(value: &Value) -> Result<String, ToolError> {
    serde_json::to_string_pretty(value).map_err(|e| ToolError::ExecutionFailed(e.to_string()))
}

pub struct AnalyzeProjectTool {
    acquirer: Arc<WorkspaceAcquirer>,
}

impl AnalyzeProjectTool {
    pub fn new(acquirer: Arc<WorkspaceAcquirer>) -> Self {
        Self { acquirer }
    }
}

#[async_trait]
impl Tool for AnalyzeProjectTool {
    fn name(&self) -> &str {
        "analyze_project"
    }

    fn description(&self) -> &str {
        "Analyze the structure of a git repository"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["repoUrl"],
            "properties": {
                "repoUrl": { "type": "string", "description": "Git URL of the repository to analyze" }
            }
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolResult, ToolError> {
        let workspace = clone_for(&self.acquirer, &args, ctx).await?;
        let max = self.acquirer.config().max_tree_entries;
        let tree = workspace.list_tree(max).await.map_err(map_workspace_error)?;

        if tree.truncated {
            ctx.notifier.log(
                buildspace_core::rpc::LogLevel::Warning,
                &format!("Tree listing stopped after {max} entries"),
            );
        }
        tracing::debug!(
            repo_url = workspace.url(),
            entries = tree.entry_count(),
            truncated = tree.truncated,
            "Tree listed"
        );
        Ok(ToolResult::text(to_pretty_json(&tree.to_json())?))
    }
}

pub struct ReadFileTool {
    acquirer: Arc<WorkspaceAcquirer>,
}

impl ReadFileTool {
    pub fn new(acquirer: Arc<WorkspaceAcquirer>) -> Self {
        Self { acquirer }
    }
}

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read a file from a git repository"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["repoUrl", "filePath"],
            "properties": {
                "repoUrl": { "type": "string", "description": "Git URL of the repository" },
                "filePath": { "type": "string", "description": "Path relative to the repository root" }
            }
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolResult, ToolError> {
        let file_path = required_str(&args, "filePath")?;
        let workspace = clone_for(&self.acquirer, &args, ctx).await?;
        let content = workspace
            .read_file(file_path)
            .await
            .map_err(map_workspace_error)?;
        Ok(ToolResult::text(content.into_text()))
    }
}

pub struct ReadFilesTool {
    acquirer: Arc<WorkspaceAcquirer>,
}

impl ReadFilesTool {
    pub fn new(acquirer: Arc<WorkspaceAcquirer>) -> Self {
        Self { acquirer }
    }
}

#[async_trait]
impl Tool for ReadFilesTool {
    fn name(&self) -> &str {
        "read_files"
    }

    fn description(&self) -> &str {
        "Read multiple files from a git repository"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["repoUrl", "filePaths"],
            "properties": {
                "repoUrl": { "type": "string", "description": "Git URL of the repository" },
                "filePaths": {
                    "type": "array",
                    "items": { "type": "string" },
                    "description": "Paths relative to the repository root"
                }
            }
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolResult, ToolError> {
        let paths: Vec<String> = args
            .get("filePaths")
            .and_then(Value::as_array)
            .ok_or_else(|| ToolError::InvalidArguments("filePaths is required".into()))?
            .iter()
            .map(|p| {
                p.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| ToolError::InvalidArguments("filePaths must be strings".into()))
            })
            .collect::<Result<_, _>>()?;

        let workspace = clone_for(&self.acquirer, &args, ctx).await?;

        // One bad path must not hide the others.
        let mut results = Map::new();
        for path in paths {
            let text = match workspace.read_file(&path).await {
                Ok(content) => content.into_text(),
                Err(e) => format!("Error: {e}"),
            };
            results.insert(path, Value::String(text));
        }
        Ok(ToolResult::text(to_pretty_json(&Value::Object(results))?))
    }
}
