use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Recognized configuration surface for the orchestration core. Every field
/// has a serde default so a partial (or absent) config file works.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct CoreConfig {
    /// Delivery/dispatch retries before a message or intention is given up.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Exponential backoff base delay.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Backoff cap (`dmax`).
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Uniform jitter bound added to each backoff delay.
    #[serde(default = "default_jitter_ms")]
    pub jitter_ms: u64,
    /// Deadline for one dispatched intention.
    #[serde(default = "default_deadline_secs")]
    pub deadline_secs: u64,
    /// Fractional headroom over a category's budget hint a candidate may cost.
    #[serde(default = "default_budget_tolerance")]
    pub budget_tolerance: f64,
    /// Fraction of under-budget headroom shifted into a failing category.
    #[serde(default = "default_reallocation_fraction")]
    pub reallocation_fraction: f64,
    /// Proportional baseline weights for venue/catering/decor.
    #[serde(default = "default_category_weights")]
    pub category_weights: [f64; 3],
    /// Age past which a provider record counts as stale.
    #[serde(default = "default_freshness_threshold_days")]
    pub freshness_threshold_days: i64,
    /// Fresh-record ratio below which the crawler raises a FreshnessAlert.
    #[serde(default = "default_alert_fresh_ratio")]
    pub alert_fresh_ratio: f64,
    /// Normal sweep cadence.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Accelerated cadence while freshness is below the alert threshold.
    #[serde(default = "default_static_sweep_interval_secs")]
    pub static_sweep_interval_secs: u64,
    /// Concurrent enrichment jobs per sweep.
    #[serde(default = "default_enrich_concurrency")]
    pub enrich_concurrency: usize,
    /// External generation/search call timeout.
    #[serde(default = "default_external_timeout_secs")]
    pub external_timeout_secs: u64,
    /// Idle sessions past this age are torn down.
    #[serde(default = "default_session_ttl_secs")]
    pub session_ttl_secs: u64,
    /// Candidates returned alongside the chosen one.
    #[serde(default = "default_top_k")]
    pub top_k: usize,
}

fn default_max_retries() -> u32 {
    3
}
fn default_base_delay_ms() -> u64 {
    200
}
fn default_max_delay_ms() -> u64 {
    5000
}
fn default_jitter_ms() -> u64 {
    100
}
fn default_deadline_secs() -> u64 {
    30
}
fn default_budget_tolerance() -> f64 {
    0.15
}
fn default_reallocation_fraction() -> f64 {
    0.10
}
fn default_category_weights() -> [f64; 3] {
    [1.0 / 3.0, 1.0 / 3.0, 1.0 / 3.0]
}
fn default_freshness_threshold_days() -> i64 {
    60
}
fn default_alert_fresh_ratio() -> f64 {
    0.5
}
fn default_sweep_interval_secs() -> u64 {
    6 * 60 * 60
}
fn default_static_sweep_interval_secs() -> u64 {
    30 * 60
}
fn default_enrich_concurrency() -> usize {
    4
}
fn default_external_timeout_secs() -> u64 {
    20
}
fn default_session_ttl_secs() -> u64 {
    24 * 60 * 60
}
fn default_top_k() -> usize {
    3
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter_ms: default_jitter_ms(),
            deadline_secs: default_deadline_secs(),
            budget_tolerance: default_budget_tolerance(),
            reallocation_fraction: default_reallocation_fraction(),
            category_weights: default_category_weights(),
            freshness_threshold_days: default_freshness_threshold_days(),
            alert_fresh_ratio: default_alert_fresh_ratio(),
            sweep_interval_secs: default_sweep_interval_secs(),
            static_sweep_interval_secs: default_static_sweep_interval_secs(),
            enrich_concurrency: default_enrich_concurrency(),
            external_timeout_secs: default_external_timeout_secs(),
            session_ttl_secs: default_session_ttl_secs(),
            top_k: default_top_k(),
        }
    }
}

impl CoreConfig {
    pub fn deadline(&self) -> Duration {
        Duration::from_secs(self.deadline_secs)
    }

    pub fn external_timeout(&self) -> Duration {
        Duration::from_secs(self.external_timeout_secs)
    }

    pub fn session_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.session_ttl_secs as i64)
    }
}
