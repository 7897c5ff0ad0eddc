use chrono::{DateTime, Utc};
use nuptial_core::{Category, TaskRequest};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Goal of a desire. Priority order is fixed: budget distribution first,
/// then the mandatory categories in declaration order, corrections last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "goal", content = "category")]
pub enum GoalKind {
    DistributeBudget,
    Find(Category),
    CorrectError(Category),
}

impl GoalKind {
    pub fn priority(&self) -> i32 {
        match self {
            GoalKind::DistributeBudget => 100,
            GoalKind::Find(Category::Venue) => 90,
            GoalKind::Find(Category::Catering) => 80,
            GoalKind::Find(Category::Decor) => 70,
            GoalKind::CorrectError(Category::Venue) => 50,
            GoalKind::CorrectError(Category::Catering) => 40,
            GoalKind::CorrectError(Category::Decor) => 30,
        }
    }

    /// The category this goal searches for, if any.
    pub fn category(&self) -> Option<Category> {
        match self {
            GoalKind::DistributeBudget => None,
            GoalKind::Find(c) | GoalKind::CorrectError(c) => Some(*c),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            GoalKind::DistributeBudget => "distribute_budget",
            GoalKind::Find(Category::Venue) => "find_venue",
            GoalKind::Find(Category::Catering) => "find_catering",
            GoalKind::Find(Category::Decor) => "find_decor",
            GoalKind::CorrectError(_) => "correct_error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DesireStatus {
    Active,
    Satisfied,
    Abandoned,
}

/// A goal the planner is pursuing. Created when a belief gap is detected,
/// satisfied when a matching intention completes, abandoned after
/// exhausting retries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Desire {
    pub id: Uuid,
    pub goal: GoalKind,
    pub priority: i32,
    pub status: DesireStatus,
    /// Index into the session's error history when this desire was created
    /// to recover from a failure.
    pub parent_error: Option<usize>,
}

impl Desire {
    pub fn new(goal: GoalKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            goal,
            priority: goal.priority(),
            status: DesireStatus::Active,
            parent_error: None,
        }
    }

    pub fn correction(category: Category, parent_error: usize) -> Self {
        let goal = GoalKind::CorrectError(category);
        Self {
            id: Uuid::new_v4(),
            goal,
            priority: goal.priority(),
            status: DesireStatus::Active,
            parent_error: Some(parent_error),
        }
    }
}

/// A committed plan to pursue one desire; destroyed on completion.
#[derive(Debug, Clone)]
pub struct Intention {
    pub id: Uuid,
    pub desire_id: Uuid,
    pub task: TaskRequest,
    pub attempt: u32,
    pub deadline: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_order_is_fixed() {
        let mut goals = vec![
            GoalKind::CorrectError(Category::Venue),
            GoalKind::Find(Category::Decor),
            GoalKind::Find(Category::Venue),
            GoalKind::DistributeBudget,
            GoalKind::Find(Category::Catering),
        ];
        goals.sort_by_key(|g| std::cmp::Reverse(g.priority()));
        assert_eq!(
            goals,
            vec![
                GoalKind::DistributeBudget,
                GoalKind::Find(Category::Venue),
                GoalKind::Find(Category::Catering),
                GoalKind::Find(Category::Decor),
                GoalKind::CorrectError(Category::Venue),
            ]
        );
    }

    #[test]
    fn test_correction_tie_break_follows_declaration_order() {
        assert!(
            GoalKind::CorrectError(Category::Venue).priority()
                > GoalKind::CorrectError(Category::Catering).priority()
        );
        assert!(
            GoalKind::CorrectError(Category::Catering).priority()
                > GoalKind::CorrectError(Category::Decor).priority()
        );
    }
}
