use nuptial_core::CoreConfig;
use rand::Rng;
use std::time::Duration;

/// Exponential backoff with cap and uniform jitter:
/// `min(base * 2^attempt, dmax) + uniform(0..=jitter)`.
pub fn delay_for_attempt(attempt: u32, cfg: &CoreConfig) -> Duration {
    let exp = cfg
        .base_delay_ms
        .saturating_mul(1u64.checked_shl(attempt).unwrap_or(u64::MAX));
    let capped = exp.min(cfg.max_delay_ms);
    let jitter = if cfg.jitter_ms > 0 {
        rand::thread_rng().gen_range(0..=cfg.jitter_ms)
    } else {
        0
    };
    Duration::from_millis(capped + jitter)
}
