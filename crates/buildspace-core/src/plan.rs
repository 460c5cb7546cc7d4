//! Learning-plan model and the permissive parser for the backend's plain-text
//! plan context.
//!
//! The upstream text format is not versioned, so parsing is a best-effort line
//! classifier: each recognised prefix sets one field, everything else is
//! skipped. Parsing never fails.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

static MILESTONE_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^M(\d+)\s*\[([^\]]+)\]:\s*(.+?)(?:\s*->\s*(.+))?$").expect("static regex")
});

static FIRST_NUMBER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+)").expect("static regex"));

const MILESTONES_MARKER: &str = "Milestones so far:";

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Milestone {
    pub sequence_number: u32,
    pub title: String,
    pub description: String,
    pub completed: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LearningPlan {
    pub project_name: String,
    pub project_description: String,
    pub duration_days: u32,
    pub skill_level: String,
    pub milestones: Vec<Milestone>,
}

impl LearningPlan {
    /// First milestone not yet completed.
    pub fn current_milestone(&self) -> Option<&Milestone> {
        self.milestones.iter().find(|m| !m.completed)
    }

    pub fn milestone(&self, sequence_number: u32) -> Option<&Milestone> {
        self.milestones
            .iter()
            .find(|m| m.sequence_number == sequence_number)
    }

    pub fn completed_count(&self) -> usize {
        self.milestones.iter().filter(|m| m.completed).count()
    }

    /// Rounded completion percentage; an empty plan counts as 0%.
    pub fn progress_percentage(&self) -> u32 {
        let total = self.milestones.len();
        if total == 0 {
            return 0;
        }
        ((self.completed_count() as f64 / total as f64) * 100.0).round() as u32
    }

    pub fn is_complete(&self) -> bool {
        !self.milestones.is_empty() && self.completed_count() == self.milestones.len()
    }
}

/// Parse the plan-context text returned by the backend.
pub fn parse_plan_context(text: &str) -> LearningPlan {
    let mut plan = LearningPlan::default();
    let mut in_milestones = false;

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(rest) = line.strip_prefix("Project:") {
            plan.project_name = rest.trim().to_string();
        } else if let Some(rest) = line.strip_prefix("Description:") {
            plan.project_description = rest.trim().to_string();
        } else if line.starts_with("Duration:") {
            plan.duration_days = FIRST_NUMBER
                .captures(line)
                .and_then(|c| c[1].parse().ok())
                .unwrap_or(0);
        } else if let Some(rest) = line.strip_prefix("Skill Level:") {
            plan.skill_level = rest.trim().to_string();
        } else if line.contains(MILESTONES_MARKER) {
            in_milestones = true;
        } else if in_milestones && line.starts_with('M') {
            if let Some(milestone) = parse_milestone_line(line) {
                plan.milestones.push(milestone);
            }
        }
    }

    plan
}

fn parse_milestone_line(line: &str) -> Option<Milestone> {
    let caps = MILESTONE_LINE.captures(line)?;
    let sequence_number = caps[1].parse().ok()?;
    let status = caps[2].trim();
    Some(Milestone {
        sequence_number,
        title: caps[3].trim().to_string(),
        description: caps
            .get(4)
            .map(|m| m.as_str().trim().to_string())
            .unwrap_or_default(),
        completed: status.eq_ignore_ascii_case("DONE"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const TODO_APP: &str = "Project: Todo App\nDuration: 5 days\nSkill Level: Beginner\nMilestones so far:\nM1 [DONE]: Setup -> Initialize repo\nM2 [PENDING]: API -> Build REST endpoints\n";

    #[test]
    fn parses_todo_app_plan() {
        let plan = parse_plan_context(TODO_APP);
        assert_eq!(plan.project_name, "Todo App");
        assert_eq!(plan.duration_days, 5);
        assert_eq!(plan.skill_level, "Beginner");
        assert_eq!(plan.milestones.len(), 2);

        let m1 = &plan.milestones[0];
        assert_eq!(m1.sequence_number, 1);
        assert_eq!(m1.title, "Setup");
        assert_eq!(m1.description, "Initialize repo");
        assert!(m1.completed);

        assert!(!plan.milestones[1].completed);
        assert_eq!(plan.current_milestone().unwrap().sequence_number, 2);
    }

    #[test]
    fn parses_backend_header_and_lines_without_description() {
        let text = "=== LEARNING PLAN CONTEXT ===\nProject: Chat\nDescription: Realtime chat\nDuration: 14 days\nSkill Level: Intermediate\n\nMilestones so far:\nM1 [DONE]: Sockets\nM2 [PENDING]: Rooms\n";
        let plan = parse_plan_context(text);
        assert_eq!(plan.project_description, "Realtime chat");
        assert_eq!(plan.duration_days, 14);
        assert_eq!(plan.milestones.len(), 2);
        assert_eq!(plan.milestones[1].title, "Rooms");
        assert_eq!(plan.milestones[1].description, "");
    }

    #[test]
    fn skips_malformed_lines() {
        let text = "Milestones so far:\nM1 DONE Setup\nMx [DONE]: Bad\nM3 [done]: Lowercase -> ok\nnot a milestone\n";
        let plan = parse_plan_context(text);
        assert_eq!(plan.milestones.len(), 1);
        assert_eq!(plan.milestones[0].sequence_number, 3);
        assert!(plan.milestones[0].completed);
    }

    #[test]
    fn milestone_lines_before_marker_are_ignored() {
        let plan = parse_plan_context("M1 [DONE]: Early -> ignored\n");
        assert!(plan.milestones.is_empty());
    }

    #[test]
    fn garbage_input_yields_empty_plan() {
        let plan = parse_plan_context("\u{0}\u{1}random\n:::\nDuration: unknown\n");
        assert_eq!(plan, LearningPlan::default());
        assert_eq!(plan.progress_percentage(), 0);
        assert!(!plan.is_complete());
    }

    #[test]
    fn progress_rounds() {
        let plan = parse_plan_context(
            "Milestones so far:\nM1 [DONE]: a -> a\nM2 [PENDING]: b -> b\nM3 [PENDING]: c -> c\n",
        );
        assert_eq!(plan.completed_count(), 1);
        assert_eq!(plan.progress_percentage(), 33);
        assert_eq!(plan.milestone(3).unwrap().title, "c");
        assert!(plan.milestone(9).is_none());
    }
}
