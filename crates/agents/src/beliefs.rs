use chrono::{DateTime, Utc};
use nuptial_core::{BudgetAllocation, Category, Criteria, TaskResult};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Done,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub task_kind: String,
    pub detail: String,
    pub retry_count: u32,
    pub at: DateTime<Utc>,
}

/// The planner's world model for one session: fixed schema for the known
/// keys plus a typed extension map for anything else. Owned exclusively by
/// the planner; mutated only through these update operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BeliefState {
    pub criteria: Criteria,
    pub allocation: Option<BudgetAllocation>,
    /// Categories flagged for relaxed search after floor scaling.
    pub relaxed: Vec<Category>,
    /// Minimum-spend floors learned from NotFound failures or record data.
    pub floors: Vec<(Category, f64)>,
    results: HashMap<Category, TaskResult>,
    status: HashMap<Category, TaskStatus>,
    pub budget_status: TaskStatus,
    pub errors: Vec<ErrorRecord>,
    #[serde(default)]
    pub extra: serde_json::Map<String, serde_json::Value>,
    pub updated_at: DateTime<Utc>,
    /// Message ids already merged; redelivery of an applied message is a
    /// no-op (at-least-once bus).
    applied: HashSet<Uuid>,
}

impl BeliefState {
    pub fn new(criteria: Criteria) -> Self {
        let status = Category::ALL
            .iter()
            .map(|c| (*c, TaskStatus::Pending))
            .collect();
        Self {
            criteria,
            allocation: None,
            relaxed: Vec::new(),
            floors: Vec::new(),
            results: HashMap::new(),
            status,
            budget_status: TaskStatus::Pending,
            errors: Vec::new(),
            extra: serde_json::Map::new(),
            updated_at: Utc::now(),
            applied: HashSet::new(),
        }
    }

    /// Returns false when the message was already applied. Callers must
    /// skip the merge in that case. Record an id only once its merge has
    /// fully landed, so a redelivery can repeat a half-finished one.
    pub fn mark_applied(&mut self, message_id: Uuid) -> bool {
        self.applied.insert(message_id)
    }

    pub fn is_applied(&self, message_id: Uuid) -> bool {
        self.applied.contains(&message_id)
    }

    pub fn status(&self, category: Category) -> TaskStatus {
        self.status
            .get(&category)
            .copied()
            .unwrap_or(TaskStatus::Pending)
    }

    pub fn set_status(&mut self, category: Category, status: TaskStatus) {
        self.status.insert(category, status);
        self.updated_at = Utc::now();
    }

    pub fn result(&self, category: Category) -> Option<&TaskResult> {
        self.results.get(&category)
    }

    /// Last-write-wins per category.
    pub fn set_result(&mut self, category: Category, result: TaskResult) {
        self.results.insert(category, result);
        self.status.insert(category, TaskStatus::Done);
        self.updated_at = Utc::now();
    }

    /// Allocations are produced by the budget algorithm only; the merge
    /// here just installs its output.
    pub fn set_allocation(&mut self, allocation: BudgetAllocation, relaxed: Vec<Category>) {
        self.allocation = Some(allocation);
        self.relaxed = relaxed;
        self.budget_status = TaskStatus::Done;
        self.updated_at = Utc::now();
    }

    /// Raise (never lower) the learned floor for a category.
    pub fn learn_floor(&mut self, category: Category, floor: f64) {
        match self.floors.iter_mut().find(|(c, _)| *c == category) {
            Some((_, existing)) => *existing = existing.max(floor),
            None => self.floors.push((category, floor)),
        }
        self.updated_at = Utc::now();
    }

    pub fn record_error(&mut self, task_kind: &str, detail: &str, retry_count: u32) -> usize {
        self.errors.push(ErrorRecord {
            task_kind: task_kind.to_string(),
            detail: detail.to_string(),
            retry_count,
            at: Utc::now(),
        });
        self.updated_at = Utc::now();
        self.errors.len() - 1
    }

    pub fn is_complete(&self) -> bool {
        Category::ALL
            .iter()
            .all(|c| self.status(*c) == TaskStatus::Done)
    }

    pub fn pending_categories(&self) -> Vec<Category> {
        Category::ALL
            .iter()
            .copied()
            .filter(|c| self.status(*c) != TaskStatus::Done)
            .collect()
    }

    pub fn budget_used(&self) -> f64 {
        self.results.values().map(|r| r.chosen.price).sum()
    }

    /// Chosen-candidate prices per resolved category.
    pub fn committed_spend(&self) -> Vec<(Category, f64)> {
        self.results
            .iter()
            .map(|(category, result)| (*category, result.chosen.price))
            .collect()
    }

    /// Compact progress view: completion per category, error count, spend.
    pub fn summary(&self) -> serde_json::Value {
        let completed: serde_json::Map<String, serde_json::Value> = Category::ALL
            .iter()
            .map(|c| {
                (
                    c.as_str().to_string(),
                    serde_json::Value::Bool(self.status(*c) == TaskStatus::Done),
                )
            })
            .collect();
        serde_json::json!({
            "completed": completed,
            "errors": self.errors.len(),
            "budget_used": self.budget_used(),
            "updated_at": self.updated_at.to_rfc3339(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nuptial_core::{ProviderRecord, RecordState};

    fn criteria() -> Criteria {
        serde_json::from_str(r#"{"presupuesto_total": 50000, "guest_count": 100}"#).unwrap()
    }

    fn sample_result(category: Category, price: f64) -> TaskResult {
        TaskResult {
            category,
            chosen: ProviderRecord {
                id: format!("{}-1", category),
                category,
                name: "X".to_string(),
                price,
                fields: serde_json::Map::new(),
                last_verified: Utc::now(),
                quality_score: 0.8,
                state: RecordState::Fresh,
                version: 0,
            },
            alternatives: vec![],
            narrative: String::new(),
        }
    }

    #[test]
    fn test_mark_applied_is_idempotent() {
        let mut beliefs = BeliefState::new(criteria());
        let id = Uuid::new_v4();
        assert!(!beliefs.is_applied(id));
        assert!(beliefs.mark_applied(id));
        assert!(beliefs.is_applied(id));
        assert!(!beliefs.mark_applied(id));
    }

    #[test]
    fn test_completion_tracking() {
        let mut beliefs = BeliefState::new(criteria());
        assert!(!beliefs.is_complete());
        for c in Category::ALL {
            beliefs.set_result(c, sample_result(c, 1000.0));
        }
        assert!(beliefs.is_complete());
        assert!(beliefs.pending_categories().is_empty());
        assert_eq!(beliefs.budget_used(), 3000.0);
    }

    #[test]
    fn test_learn_floor_never_lowers() {
        let mut beliefs = BeliefState::new(criteria());
        beliefs.learn_floor(Category::Venue, 10000.0);
        beliefs.learn_floor(Category::Venue, 8000.0);
        assert_eq!(beliefs.floors, vec![(Category::Venue, 10000.0)]);
        beliefs.learn_floor(Category::Venue, 12000.0);
        assert_eq!(beliefs.floors, vec![(Category::Venue, 12000.0)]);
    }
}
