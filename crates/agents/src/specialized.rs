use async_trait::async_trait;
use nuptial_bus::{MessageBus, MessageHandler};
use nuptial_core::message::TaskGoal;
use nuptial_core::{
    Category, CoreConfig, Error, FailureReason, Message, Payload, Result, TaskFailure,
    TaskRequest, TaskResult,
};
use nuptial_storage::{ProviderStore, RecordFilter};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::generation::GenerationService;

const WEIGHT_BUDGET: f64 = 0.4;
const WEIGHT_CRITERIA: f64 = 0.4;
const WEIGHT_QUALITY: f64 = 0.2;

/// What a search produced: a ranked result, or the reason nothing
/// qualified plus the cheapest mandatory-complete price seen.
#[derive(Debug)]
enum SearchOutcome {
    Found(TaskResult),
    NoCandidates {
        detail: String,
        min_candidate_price: Option<f64>,
    },
}

/// Stateless-per-request category worker. Reads the provider store, ranks
/// candidates by weighted fit, asks the generation service for a
/// narrative, and replies on the requester's topic. One instance per
/// category variant (venue, catering, decor).
pub struct SpecializedAgent {
    category: Category,
    store: Arc<dyn ProviderStore>,
    generation: Arc<dyn GenerationService>,
    bus: Arc<MessageBus>,
    cfg: CoreConfig,
}

impl SpecializedAgent {
    pub fn new(
        category: Category,
        store: Arc<dyn ProviderStore>,
        generation: Arc<dyn GenerationService>,
        bus: Arc<MessageBus>,
        cfg: CoreConfig,
    ) -> Self {
        Self {
            category,
            store,
            generation,
            bus,
            cfg,
        }
    }

    /// Core search: filter by mandatory fields, restrictions, and budget
    /// ceiling, then rank. An empty candidate set is a business outcome,
    /// not an error, and carries the cheapest price seen so the planner
    /// can learn a spend floor.
    async fn search(&self, req: &TaskRequest) -> Result<SearchOutcome> {
        let criteria = req.criteria.category(self.category);
        let ceiling = req.budget_hint * (1.0 + req.tolerance);
        let filter = RecordFilter {
            mandatory_fields: criteria.obligatorios.clone(),
            max_price: Some(ceiling),
            restrictions: criteria.restrictions.clone(),
        };
        let candidates = self.store.get(self.category, &filter).await?;
        if candidates.is_empty() {
            // Price of the cheapest mandatory-complete record, ignoring the
            // budget ceiling, hints at the minimum viable spend.
            let unbounded = RecordFilter {
                max_price: None,
                ..filter
            };
            let min_price = self
                .store
                .get(self.category, &unbounded)
                .await?
                .iter()
                .map(|r| r.price)
                .fold(f64::INFINITY, f64::min);
            return Ok(SearchOutcome::NoCandidates {
                detail: format!("no {} candidate under {:.2}", self.category, ceiling),
                min_candidate_price: min_price.is_finite().then_some(min_price),
            });
        }

        let mut ranked: Vec<(f64, _)> = candidates
            .into_iter()
            .map(|r| (self.fit_score(&r, req), r))
            .collect();
        ranked.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

        let chosen = ranked[0].1.clone();
        let alternatives: Vec<_> = ranked
            .iter()
            .skip(1)
            .take(self.cfg.top_k)
            .map(|(_, r)| r.clone())
            .collect();

        let mut top = vec![chosen.clone()];
        top.extend(alternatives.iter().cloned());
        let narrative = tokio::time::timeout(
            self.cfg.external_timeout(),
            self.generation.generate(&req.criteria, &top),
        )
        .await
        .map_err(|_| Error::Timeout("generation service".to_string()))??;

        debug!(
            category = %self.category,
            chosen = %chosen.id,
            alternatives = alternatives.len(),
            "Search complete"
        );
        Ok(SearchOutcome::Found(TaskResult {
            category: self.category,
            chosen,
            alternatives,
            narrative,
        }))
    }

    fn fit_score(&self, record: &nuptial_core::ProviderRecord, req: &TaskRequest) -> f64 {
        let budget = if req.budget_hint > 0.0 {
            (1.0 - (record.price - req.budget_hint).abs() / req.budget_hint).clamp(0.0, 1.0)
        } else {
            0.0
        };
        let criteria = req.criteria.category(self.category);
        let overlap = {
            let mut matched = 0usize;
            let mut total = 0usize;
            for (key, wanted) in criteria.extras.iter() {
                total += 1;
                match record.fields.get(key) {
                    Some(serde_json::Value::Array(items)) if items.contains(wanted) => matched += 1,
                    Some(have) if have == wanted => matched += 1,
                    _ => {}
                }
            }
            if total > 0 {
                matched as f64 / total as f64
            } else {
                1.0
            }
        };
        WEIGHT_BUDGET * budget + WEIGHT_CRITERIA * overlap + WEIGHT_QUALITY * record.quality_score
    }

}

#[async_trait]
impl MessageHandler for SpecializedAgent {
    async fn handle(&self, msg: &Message) -> Result<()> {
        let Payload::Task(req) = &msg.payload else {
            debug!(message_id = %msg.id, "Ignoring non-task payload");
            return Ok(());
        };
        match &req.goal {
            TaskGoal::Search { category } if *category == self.category => {}
            other => {
                return Err(Error::Validation(format!(
                    "{} agent received mismatched goal {:?}",
                    self.category, other
                )))
            }
        }

        // Timeouts and store errors propagate as delivery failures: the
        // serve loop retries with backoff and dead-letters on exhaustion.
        match self.search(req).await? {
            SearchOutcome::Found(result) => {
                info!(
                    category = %self.category,
                    session_id = %req.session_id,
                    chosen = %result.chosen.id,
                    "Task done"
                );
                self.bus.publish(
                    &msg.sender,
                    &msg.topic,
                    msg.correlation_id,
                    Payload::TaskDone {
                        task_id: req.task_id,
                        session_id: req.session_id.clone(),
                        result,
                    },
                );
            }
            SearchOutcome::NoCandidates {
                detail,
                min_candidate_price,
            } => {
                // Business failure: reply explicitly rather than letting the
                // bus retry a search that cannot succeed unchanged.
                warn!(
                    category = %self.category,
                    session_id = %req.session_id,
                    detail = %detail,
                    "No candidate found"
                );
                self.bus.publish(
                    &msg.sender,
                    &msg.topic,
                    msg.correlation_id,
                    Payload::TaskFailed(TaskFailure {
                        task_id: req.task_id,
                        session_id: req.session_id.clone(),
                        category: Some(self.category),
                        reason: FailureReason::NotFound,
                        min_candidate_price,
                        detail,
                    }),
                );
            }
        }
        Ok(())
    }
}
