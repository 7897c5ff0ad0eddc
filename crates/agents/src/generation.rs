use async_trait::async_trait;
use nuptial_core::{Criteria, ProviderRecord, Result};

/// Narrow interface to the external generation/retrieval backend. Callers
/// wrap every invocation in a timeout and apply the standard retry policy;
/// the service is never retried indefinitely.
#[async_trait]
pub trait GenerationService: Send + Sync {
    /// Produce a recommendation narrative for the top candidates. Free text
    /// only; implementations must not alter the structured candidates.
    async fn generate(&self, criteria: &Criteria, candidates: &[ProviderRecord]) -> Result<String>;

    /// Retrieve provider references matching a query.
    async fn retrieve(&self, query: &str) -> Result<Vec<ProviderRecord>>;
}
