pub mod learning;
pub mod repo;

use std::sync::Arc;

use crate::plan_source::PlanSource;
use crate::registry::ToolRegistry;
use crate::workspace::WorkspaceAcquirer;

use learning::PlanBinding;

/// Tools for a learning session bound to `plan_id`.
pub fn create_learning_registry(plan_id: &str, source: Arc<dyn PlanSource>) -> ToolRegistry {
    let binding = PlanBinding::new(plan_id, source);
    let mut registry = ToolRegistry::new();

    registry.register(Arc::new(learning::GetLearningPlanTool(binding.clone())));
    registry.register(Arc::new(learning::GetCurrentMilestoneTool(binding.clone())));
    registry.register(Arc::new(learning::GetSocraticGuidanceTool(binding.clone())));
    registry.register(Arc::new(learning::GetMilestoneDetailsTool(binding.clone())));
    registry.register(Arc::new(learning::GetProgressTool(binding)));

    registry
}

/// Tools for a repository-analysis session.
pub fn create_repository_registry(acquirer: Arc<WorkspaceAcquirer>) -> ToolRegistry {
    let mut registry = ToolRegistry::new();

    registry.register(Arc::new(repo::AnalyzeProjectTool::new(Arc::clone(&acquirer))));
    registry.register(Arc::new(repo::ReadFileTool::new(Arc::clone(&acquirer))));
    registry.register(Arc::new(repo::ReadFilesTool::new(acquirer)));

    registry
}
