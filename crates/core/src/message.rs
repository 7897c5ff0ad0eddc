use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::criteria::Criteria;
use crate::types::{BudgetAllocation, Category, TaskResult};

/// Well-known topic names. Each agent consumes exactly one topic; the
/// `sender` field of a message names the topic replies go back to.
pub mod topic {
    pub const PLANNER: &str = "planner";
    pub const USER: &str = "user";
    pub const VENUE: &str = "agent.venue";
    pub const CATERING: &str = "agent.catering";
    pub const DECOR: &str = "agent.decor";
    pub const BUDGET: &str = "agent.budget";
    pub const MONITORING: &str = "monitoring";
    pub const DEAD_LETTER: &str = "dead_letter";

    pub fn for_category(category: super::Category) -> &'static str {
        match category {
            super::Category::Venue => VENUE,
            super::Category::Catering => CATERING,
            super::Category::Decor => DECOR,
        }
    }
}

/// The bus envelope. `correlation_id` links a request to its eventual
/// response and to its trace-log entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub topic: String,
    pub sender: String,
    pub correlation_id: Uuid,
    pub payload: Payload,
    pub timestamp_ms: i64,
    /// Delivery attempt, bumped by the serve loop on redelivery.
    #[serde(default)]
    pub attempt: u32,
}

impl Message {
    pub fn new(topic: &str, sender: &str, correlation_id: Uuid, payload: Payload) -> Self {
        Self {
            id: Uuid::new_v4(),
            topic: topic.to_string(),
            sender: sender.to_string(),
            correlation_id,
            payload,
            timestamp_ms: Utc::now().timestamp_millis(),
            attempt: 0,
        }
    }
}

/// Typed message bodies carried over the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Payload {
    /// A user request seeding a planning session.
    UserRequest {
        session_id: String,
        criteria: Criteria,
    },
    /// Work dispatched by the planner to a specialized agent.
    Task(TaskRequest),
    /// Successful category search outcome.
    TaskDone {
        task_id: Uuid,
        session_id: String,
        result: TaskResult,
    },
    /// Budget distribution outcome.
    BudgetDone {
        task_id: Uuid,
        session_id: String,
        allocation: BudgetAllocation,
        #[serde(default)]
        relaxed: Vec<Category>,
    },
    /// Explicit failure from an agent or a synthetic one from the bus.
    TaskFailed(TaskFailure),
    /// Crawler freshness alert on the monitoring topic.
    FreshnessAlert {
        fresh: usize,
        stale: usize,
        missing: usize,
        fresh_ratio: f64,
        by_category: Vec<(Category, usize)>,
    },
    /// Session cancellation; pending intentions are dropped.
    Abort { session_id: String },
    /// Final (possibly partial) plan, published on the user topic.
    PlanReady {
        session_id: String,
        plan: crate::types::Plan,
    },
}

/// Input contract of every specialized agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRequest {
    pub task_id: Uuid,
    pub session_id: String,
    pub goal: TaskGoal,
    pub criteria: Criteria,
    pub budget_hint: f64,
    /// Fractional headroom over `budget_hint` a candidate may cost.
    pub tolerance: f64,
}

/// What a task asks for: either one category search or a (re)distribution
/// of the whole budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum TaskGoal {
    Search { category: Category },
    DistributeBudget {
        /// Floors learned from prior NotFound failures, per category.
        floors: Vec<(Category, f64)>,
        /// Category whose search failed, if this is a reallocation.
        failing: Option<Category>,
        current: Option<BudgetAllocation>,
        /// Prices already committed by resolved categories; a reallocation
        /// only shifts allocation above these.
        #[serde(default)]
        committed: Vec<(Category, f64)>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    NotFound,
    Validation,
    Timeout,
    BudgetExceeded,
    Internal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskFailure {
    pub task_id: Uuid,
    pub session_id: String,
    pub category: Option<Category>,
    pub reason: FailureReason,
    pub detail: String,
    /// Cheapest candidate seen before filtering failed, if any. Feeds the
    /// budget distributor's minimum-spend floors.
    #[serde(default)]
    pub min_candidate_price: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_round_trip() {
        let failure = Payload::TaskFailed(TaskFailure {
            task_id: Uuid::new_v4(),
            session_id: "s1".to_string(),
            category: Some(Category::Venue),
            reason: FailureReason::NotFound,
            detail: "no candidate within budget".to_string(),
            min_candidate_price: Some(12000.0),
        });
        let text = serde_json::to_string(&failure).unwrap();
        assert!(text.contains("\"kind\":\"task_failed\""));
        assert!(text.contains("\"reason\":\"not_found\""));
        let back: Payload = serde_json::from_str(&text).unwrap();
        match back {
            Payload::TaskFailed(f) => assert_eq!(f.reason, FailureReason::NotFound),
            other => panic!("unexpected payload: {:?}", other),
        }
    }

    #[test]
    fn test_topic_for_category() {
        assert_eq!(topic::for_category(Category::Venue), topic::VENUE);
        assert_eq!(topic::for_category(Category::Decor), topic::DECOR);
    }
}
