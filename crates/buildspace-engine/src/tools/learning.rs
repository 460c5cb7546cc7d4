//! Learning-plan tools. Each call fetches the plan fresh from the backend, so
//! milestone progress made elsewhere shows up immediately.

use std::fmt::Write as _;
use std::sync::Arc;

use async_trait::async_trait;
use buildspace_core::plan::{LearningPlan, Milestone};
use buildspace_core::tools::{Tool, ToolContext, ToolError, ToolResult};
use serde_json::{json, Value};

use crate::plan_source::PlanSource;

const PROGRESS_BAR_WIDTH: usize = 20;

/// Plan id of the owning session plus the source to load it from.
#[derive(Clone)]
pub struct PlanBinding {
    plan_id: String,
    source: Arc<dyn PlanSource>,
}

impl PlanBinding {
    pub fn new(plan_id: impl Into<String>, source: Arc<dyn PlanSource>) -> Self {
        Self {
            plan_id: plan_id.into(),
            source,
        }
    }

    pub fn plan_id(&self) -> &str {
        &self.plan_id
    }

    async fn load(&self) -> Result<LearningPlan, ToolError> {
        self.source.fetch(&self.plan_id).await.map_err(|e| {
            tracing::warn!(plan_id = %self.plan_id, error = %e, "Plan fetch failed");
            ToolError::ExecutionFailed(format!("Failed to fetch learning plan: {e}"))
        })
    }
}

fn no_arguments() -> Value {
    json!({ "type": "object", "properties": {} })
}

pub struct GetLearningPlanTool(pub PlanBinding);

#[async_trait]
impl Tool for GetLearningPlanTool {
    fn name(&self) -> &str {
        "get_learning_plan"
    }

    fn description(&self) -> &str {
        "Get the full learning plan with all milestones and context"
    }

    fn input_schema(&self) -> Value {
        no_arguments()
    }

    async fn execute(&self, _args: Value, _ctx: &ToolContext) -> Result<ToolResult, ToolError> {
        let plan = self.0.load().await?;
        Ok(ToolResult::text(format_plan_context(&plan)))
    }
}

pub struct GetCurrentMilestoneTool(pub PlanBinding);

#[async_trait]
impl Tool for GetCurrentMilestoneTool {
    fn name(&self) -> &str {
        "get_current_milestone"
    }

    fn description(&self) -> &str {
        "Get the current/next milestone the user should be working on"
    }

    fn input_schema(&self) -> Value {
        no_arguments()
    }

    async fn execute(&self, _args: Value, _ctx: &ToolContext) -> Result<ToolResult, ToolError> {
        let plan = self.0.load().await?;
        Ok(ToolResult::text(format_current_milestone(&plan)))
    }
}

pub struct GetSocraticGuidanceTool(pub PlanBinding);

#[async_trait]
impl Tool for GetSocraticGuidanceTool {
    fn name(&self) -> &str {
        "get_socratic_guidance"
    }

    fn description(&self) -> &str {
        "Get Socratic guidance for the current milestone to help guide learning"
    }

    fn input_schema(&self) -> Value {
        no_arguments()
    }

    async fn execute(&self, _args: Value, _ctx: &ToolContext) -> Result<ToolResult, ToolError> {
        let plan = self.0.load().await?;
        Ok(ToolResult::text(socratic_prompt(&plan)))
    }
}

pub struct GetMilestoneDetailsTool(pub PlanBinding);

#[async_trait]
impl Tool for GetMilestoneDetailsTool {
    fn name(&self) -> &str {
        "get_milestone_details"
    }

    fn description(&self) -> &str {
        "Get detailed information about a specific milestone"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["sequenceNumber"],
            "properties": {
                "sequenceNumber": {
                    "type": "integer",
                    "description": "Milestone number, e.g. 2 for M2"
                }
            }
        })
    }

    async fn execute(&self, args: Value, _ctx: &ToolContext) -> Result<ToolResult, ToolError> {
        let sequence_number = sequence_number_arg(&args)?;
        let plan = self.0.load().await?;
        Ok(ToolResult::text(format_milestone_details(&plan, sequence_number)))
    }
}

pub struct GetProgressTool(pub PlanBinding);

#[async_trait]
impl Tool for GetProgressTool {
    fn name(&self) -> &str {
        "get_progress"
    }

    fn description(&self) -> &str {
        "Get progress summary for the learning plan"
    }

    fn input_schema(&self) -> Value {
        no_arguments()
    }

    async fn execute(&self, _args: Value, _ctx: &ToolContext) -> Result<ToolResult, ToolError> {
        let plan = self.0.load().await?;
        Ok(ToolResult::text(format_progress(&plan)))
    }
}

/// Accepts `2` and `2.0`; anything else is an argument error.
fn sequence_number_arg(args: &Value) -> Result<u32, ToolError> {
    let value = args
        .get("sequenceNumber")
        .ok_or_else(|| ToolError::InvalidArguments("sequenceNumber is required".into()))?;
    let number = value
        .as_u64()
        .or_else(|| value.as_f64().filter(|f| f.fract() == 0.0 && *f >= 0.0).map(|f| f as u64))
        .ok_or_else(|| {
            ToolError::InvalidArguments("sequenceNumber must be a non-negative integer".into())
        })?;
    u32::try_from(number)
        .map_err(|_| ToolError::InvalidArguments("sequenceNumber is out of range".into()))
}

pub fn format_plan_context(plan: &LearningPlan) -> String {
    let mut out = String::from("=== LEARNING PLAN CONTEXT ===\n");
    let _ = writeln!(out, "Project: {}", plan.project_name);
    let _ = writeln!(out, "Description: {}", plan.project_description);
    let _ = writeln!(out, "Duration: {} days", plan.duration_days);
    let _ = writeln!(out, "Skill Level: {}\n", plan.skill_level);

    out.push_str("Milestones:\n");
    for m in &plan.milestones {
        let status = if m.completed { "✅ DONE" } else { "⏳ PENDING" };
        let _ = writeln!(out, "M{} [{}]: {}", m.sequence_number, status, m.title);
        let _ = writeln!(out, "  → {}", m.description);
    }
    out
}

pub fn format_current_milestone(plan: &LearningPlan) -> String {
    match plan.current_milestone() {
        Some(m) => format!(
            "Current Milestone: M{}\n\nTitle: {}\nDescription: {}\nStatus: ⏳ In Progress\n",
            m.sequence_number, m.title, m.description
        ),
        None => "🎉 All milestones completed! No current milestone.".to_string(),
    }
}

pub fn format_milestone_details(plan: &LearningPlan, sequence_number: u32) -> String {
    let Some(m) = plan.milestone(sequence_number) else {
        return format!("Milestone M{sequence_number} not found in the learning plan.");
    };

    let mut out = format!("Milestone M{}\n{}\n\n", m.sequence_number, "=".repeat(51));
    let _ = writeln!(out, "Title: {}", m.title);
    let status = if m.completed { "✅ Completed" } else { "⏳ Pending" };
    let _ = writeln!(out, "Status: {status}");
    let _ = writeln!(out, "Description: {}\n", m.description);
    out.push_str("Learning Context:\n");
    let _ = writeln!(out, "- Project: {}", plan.project_name);
    let _ = writeln!(out, "- Skill Level: {}", plan.skill_level);
    let _ = writeln!(out, "- Overall Duration: {} days", plan.duration_days);
    out
}

pub fn format_progress(plan: &LearningPlan) -> String {
    let completed = plan.completed_count();
    let total = plan.milestones.len();
    let percentage = plan.progress_percentage();

    let mut out = String::from("Progress Report\n===============\n\n");
    let _ = writeln!(out, "Project: {}", plan.project_name);
    let _ = writeln!(
        out,
        "Completed: {completed} / {total} milestones ({percentage}%)\n"
    );
    let _ = writeln!(out, "Progress Bar: {}\n", progress_bar(percentage));

    if plan.is_complete() {
        out.push_str("🎉 Congratulations! You've completed all milestones!\n");
    } else if let Some(next) = plan.current_milestone() {
        let _ = writeln!(out, "Next Up: M{} - {}", next.sequence_number, next.title);
    } else {
        out.push_str("No milestones in this plan yet.\n");
    }
    out
}

fn progress_bar(percentage: u32) -> String {
    let filled = ((percentage as f64 / 100.0) * PROGRESS_BAR_WIDTH as f64).round() as usize;
    let filled = filled.min(PROGRESS_BAR_WIDTH);
    format!(
        "[{}{}]",
        "█".repeat(filled),
        "░".repeat(PROGRESS_BAR_WIDTH - filled)
    )
}

pub fn socratic_prompt(plan: &LearningPlan) -> String {
    let mut out = String::from(
        "You are a Socratic tutor helping a developer learn through guided questioning and discovery.\n\n",
    );
    out.push_str(&format_plan_context(plan));
    out.push('\n');

    match plan.current_milestone() {
        Some(Milestone {
            sequence_number,
            title,
            description,
            ..
        }) => {
            let _ = writeln!(out, "Current Milestone: M{sequence_number} - {title}");
            let _ = writeln!(out, "Description: {description}\n");
            out.push_str("GUIDANCE APPROACH:\n");
            out.push_str("1. Ask clarifying questions\n");
            out.push_str("2. Guide discovery through questions\n");
            out.push_str("3. Provide hints, not solutions\n");
            out.push_str("4. Celebrate progress\n");
            out.push_str("5. Connect work to objectives\n");
        }
        None => out.push_str("All milestones have been completed! 🎉\n"),
    }
    out
}
