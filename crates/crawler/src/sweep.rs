use chrono::{Duration as ChronoDuration, Utc};
use futures::future::join_all;
use nuptial_bus::{delay_for_attempt, MessageBus};
use nuptial_core::{Category, CoreConfig, Error, Payload, ProviderRecord, RecordState, Result};
use nuptial_storage::{ProviderStore, RecordPatch};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::state::classify;

/// Refreshes one record from an external source. `Ok(None)` means the
/// provider could not be found externally; the record is flagged Missing
/// but kept.
#[async_trait::async_trait]
pub trait ExternalSearch: Send + Sync {
    async fn refresh(&self, record: &ProviderRecord) -> Result<Option<RecordPatch>>;
}

/// Outcome of one sweep pass over the whole store.
#[derive(Debug, Clone, Serialize)]
pub struct SweepReport {
    pub fresh: usize,
    pub stale: usize,
    pub missing: usize,
    /// Records successfully refreshed this pass.
    pub enriched: usize,
    /// Non-fresh (stale + missing) records per category.
    pub by_category: Vec<(Category, usize)>,
    pub fresh_ratio: f64,
    pub alerted: bool,
}

/// Background enrichment service. Periodically scans the provider store,
/// reclassifies record states, refreshes stale and missing records through
/// the external search under a concurrency bound, and raises a freshness
/// alert on the monitoring topic when too few records are fresh.
pub struct CrawlerService {
    store: Arc<dyn ProviderStore>,
    search: Arc<dyn ExternalSearch>,
    bus: Arc<MessageBus>,
    cfg: CoreConfig,
    /// Set while freshness is below the alert threshold; sweeps run at the
    /// shorter static-phase interval until it recovers.
    static_phase: AtomicBool,
}

impl CrawlerService {
    pub fn new(
        store: Arc<dyn ProviderStore>,
        search: Arc<dyn ExternalSearch>,
        bus: Arc<MessageBus>,
        cfg: CoreConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            search,
            bus,
            cfg,
            static_phase: AtomicBool::new(false),
        })
    }

    pub fn is_static_phase(&self) -> bool {
        self.static_phase.load(Ordering::Relaxed)
    }

    pub async fn run_loop(self: Arc<Self>, mut shutdown: tokio::sync::broadcast::Receiver<()>) {
        info!(
            interval_secs = self.cfg.sweep_interval_secs,
            "CrawlerService started"
        );
        if let Err(e) = self.sweep().await {
            error!(error = %e, "Initial sweep failed");
        }
        loop {
            let period = if self.is_static_phase() {
                std::time::Duration::from_secs(self.cfg.static_sweep_interval_secs)
            } else {
                std::time::Duration::from_secs(self.cfg.sweep_interval_secs)
            };
            tokio::select! {
                _ = tokio::time::sleep(period) => {
                    if let Err(e) = self.sweep().await {
                        error!(error = %e, "Sweep failed");
                    }
                }
                _ = shutdown.recv() => {
                    info!("CrawlerService shutting down");
                    break;
                }
            }
        }
    }

    /// One full pass: classify, enrich stale/missing records, recount, and
    /// alert if the fresh fraction dropped below the threshold.
    pub async fn sweep(&self) -> Result<SweepReport> {
        let now = Utc::now();
        let threshold = ChronoDuration::days(self.cfg.freshness_threshold_days);

        for category in Category::ALL {
            for record in self.store.all(category).await? {
                let state = classify(&record, now, threshold);
                if state != record.state {
                    self.store.mark_state(&record.id, state).await?;
                }
            }
        }
        // Re-read after marking so each work item carries the version the
        // CAS patch must match.
        let mut work: Vec<ProviderRecord> = Vec::new();
        for category in Category::ALL {
            for record in self.store.all(category).await? {
                if record.state != RecordState::Fresh {
                    work.push(record);
                }
            }
        }

        let queued = work.len();
        let semaphore = Arc::new(Semaphore::new(self.cfg.enrich_concurrency.max(1)));
        let outcomes = join_all(work.into_iter().map(|record| {
            let semaphore = Arc::clone(&semaphore);
            async move {
                let Ok(_permit) = semaphore.acquire().await else {
                    return false;
                };
                self.enrich(record).await
            }
        }))
        .await;
        let enriched = outcomes.iter().filter(|ok| **ok).count();

        // Recount after enrichment so the alert reflects the new state.
        let (mut fresh, mut stale, mut missing) = (0usize, 0usize, 0usize);
        let mut by_category = Vec::with_capacity(Category::ALL.len());
        for category in Category::ALL {
            let mut non_fresh = 0usize;
            for record in self.store.all(category).await? {
                match classify(&record, Utc::now(), threshold) {
                    RecordState::Fresh => fresh += 1,
                    RecordState::Stale => {
                        stale += 1;
                        non_fresh += 1;
                    }
                    RecordState::Missing => {
                        missing += 1;
                        non_fresh += 1;
                    }
                }
            }
            by_category.push((category, non_fresh));
        }

        let total = fresh + stale + missing;
        let fresh_ratio = if total > 0 {
            fresh as f64 / total as f64
        } else {
            1.0
        };
        let alerted = fresh_ratio < self.cfg.alert_fresh_ratio;
        if alerted {
            warn!(
                fresh,
                stale, missing, fresh_ratio, "Freshness below threshold, alerting"
            );
            self.bus.publish(
                nuptial_core::topic::MONITORING,
                "crawler",
                Uuid::new_v4(),
                Payload::FreshnessAlert {
                    fresh,
                    stale,
                    missing,
                    fresh_ratio,
                    by_category: by_category.clone(),
                },
            );
        }
        let was_static = self.static_phase.swap(alerted, Ordering::Relaxed);
        if was_static && !alerted {
            info!(fresh_ratio, "Freshness recovered, leaving static phase");
        }

        info!(queued, enriched, fresh, stale, missing, "Sweep complete");
        Ok(SweepReport {
            fresh,
            stale,
            missing,
            enriched,
            by_category,
            fresh_ratio,
            alerted,
        })
    }

    /// Refresh one record. Success applies a versioned patch and the record
    /// becomes Fresh; a confirmed no-match flags it Missing. A transient
    /// outage is retried and otherwise leaves the state for the next sweep.
    async fn enrich(&self, record: ProviderRecord) -> bool {
        match self.refresh_with_retry(&record).await {
            Ok(Some(mut patch)) => {
                if patch.last_verified.is_none() {
                    patch.last_verified = Some(Utc::now());
                }
                match self
                    .store
                    .compare_and_update(&record.id, record.version, patch)
                    .await
                {
                    Ok(true) => {
                        debug!(record_id = %record.id, "Record enriched");
                        true
                    }
                    Ok(false) => {
                        debug!(record_id = %record.id, "Concurrent update, patch skipped");
                        false
                    }
                    Err(e) => {
                        warn!(record_id = %record.id, error = %e, "Patch write failed");
                        false
                    }
                }
            }
            Ok(None) => {
                debug!(record_id = %record.id, "No external match, flagging missing");
                self.flag_missing(&record.id).await;
                false
            }
            Err(e) => {
                // An outage is no evidence the provider vanished; the
                // record keeps its state until the next sweep.
                warn!(record_id = %record.id, error = %e, "Enrichment gave up, state unchanged");
                false
            }
        }
    }

    /// External call under the retry policy the bus uses for delivery: a
    /// timeout or retryable error backs off and tries again, up to the
    /// configured bound.
    async fn refresh_with_retry(&self, record: &ProviderRecord) -> Result<Option<RecordPatch>> {
        let mut attempt = 0u32;
        loop {
            let outcome = tokio::time::timeout(
                self.cfg.external_timeout(),
                self.search.refresh(record),
            )
            .await;
            let err = match outcome {
                Ok(Ok(patch)) => return Ok(patch),
                Ok(Err(e)) if !e.is_retryable() => return Err(e),
                Ok(Err(e)) => e,
                Err(_) => Error::Timeout(format!("external search for {}", record.id)),
            };
            if attempt >= self.cfg.max_retries {
                return Err(err);
            }
            debug!(record_id = %record.id, attempt, error = %err, "External search failed, retrying");
            tokio::time::sleep(delay_for_attempt(attempt, &self.cfg)).await;
            attempt += 1;
        }
    }

    async fn flag_missing(&self, record_id: &str) {
        if let Err(e) = self.store.mark_state(record_id, RecordState::Missing).await {
            warn!(record_id, error = %e, "Failed to flag record missing");
        }
    }
}
