pub mod bdi;
pub mod beliefs;
pub mod budget;
pub mod generation;
pub mod planner;
pub mod specialized;

pub use bdi::{Desire, DesireStatus, GoalKind, Intention};
pub use beliefs::{BeliefState, TaskStatus};
pub use budget::BudgetDistributorAgent;
pub use generation::GenerationService;
pub use planner::{Phase, PlannerAgent};
pub use specialized::SpecializedAgent;
