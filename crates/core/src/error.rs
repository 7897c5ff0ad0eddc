use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Budget exceeded: {0}")]
    BudgetExceeded(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Enrichment error: {0}")]
    Enrichment(String),

    #[error("Session error: {0}")]
    Session(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Bus error: {0}")]
    Bus(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether the owning component may retry the failed operation.
    /// `Validation` and `BudgetExceeded` are user-visible and never retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::NotFound(_) | Error::Timeout(_) | Error::Enrichment(_) | Error::Bus(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
