pub mod config;
pub mod criteria;
pub mod error;
pub mod message;
pub mod types;

pub use config::CoreConfig;
pub use criteria::{CategoryCriteria, Criteria};
pub use error::{Error, Result};
pub use message::{topic, FailureReason, Message, Payload, TaskFailure, TaskRequest};
pub use types::{
    BudgetAllocation, Category, Plan, PlanEntry, ProviderRecord, RecordState, TaskResult,
};
