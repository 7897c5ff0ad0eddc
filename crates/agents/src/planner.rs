use async_trait::async_trait;
use chrono::Utc;
use nuptial_bus::{MessageBus, MessageHandler};
use nuptial_core::message::TaskGoal;
use nuptial_core::{
    topic, BudgetAllocation, Category, CoreConfig, Criteria, Error, FailureReason, Message,
    Payload, Plan, PlanEntry, Result, TaskFailure, TaskRequest,
};
use nuptial_storage::{SessionEvent, SessionStore};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bdi::{Desire, DesireStatus, GoalKind, Intention};
use crate::beliefs::{BeliefState, TaskStatus};

/// BDI control-loop phase for one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Perceiving,
    Deliberating,
    Acting,
    Monitoring,
    Done,
    Failed,
}

struct SessionState {
    beliefs: BeliefState,
    desires: Vec<Desire>,
    intentions: Vec<Intention>,
    phase: Phase,
    /// Dispatch attempts per desire; an intention that fails carries its
    /// count forward into the next one for the same desire.
    attempts: HashMap<Uuid, u32>,
    /// Budget reallocations already spent per failing category.
    reallocations: HashMap<Category, u32>,
    warnings: Vec<String>,
    plan: Option<Plan>,
}

impl SessionState {
    fn desire_mut(&mut self, id: Uuid) -> Option<&mut Desire> {
        self.desires.iter_mut().find(|d| d.id == id)
    }

    fn intention_pos(&self, task_id: Uuid) -> Option<usize> {
        self.intentions.iter().position(|i| i.task.task_id == task_id)
    }
}

/// The BDI controller. Owns per-session beliefs/desires/intentions,
/// dispatches task requests over the bus, consumes results, drives budget
/// reallocation and error recovery, and emits the final plan.
pub struct PlannerAgent {
    bus: Arc<MessageBus>,
    memory: Arc<SessionStore>,
    cfg: CoreConfig,
    sessions: Mutex<HashMap<String, SessionState>>,
}

impl PlannerAgent {
    pub fn new(bus: Arc<MessageBus>, memory: Arc<SessionStore>, cfg: CoreConfig) -> Arc<Self> {
        Arc::new(Self {
            bus,
            memory,
            cfg,
            sessions: Mutex::new(HashMap::new()),
        })
    }

    /// Seed a new session from user criteria and run the first BDI cycle.
    pub async fn start_session(&self, criteria: Criteria) -> Result<String> {
        let session_id = Uuid::new_v4().to_string();
        self.start_session_with_id(&session_id, criteria).await?;
        Ok(session_id)
    }

    pub async fn start_session_with_id(&self, session_id: &str, criteria: Criteria) -> Result<()> {
        let criteria = criteria.normalized();
        criteria.validate()?;
        self.memory.create(session_id)?;
        self.memory.append(
            session_id,
            SessionEvent::BeliefUpdate {
                key: "criteria".to_string(),
                value: serde_json::to_value(&criteria)?,
            },
        )?;

        let beliefs = BeliefState::new(criteria);
        let mut desires = vec![Desire::new(GoalKind::DistributeBudget)];
        desires.extend(Category::ALL.iter().map(|c| Desire::new(GoalKind::Find(*c))));

        let state = SessionState {
            beliefs,
            desires,
            intentions: Vec::new(),
            phase: Phase::Idle,
            attempts: HashMap::new(),
            reallocations: HashMap::new(),
            warnings: Vec::new(),
            plan: None,
        };
        info!(session_id, "Session started");
        // Register before dispatching so a fast reply cannot observe an
        // unknown session.
        let mut sessions = self.sessions.lock().await;
        let state = sessions.entry(session_id.to_string()).or_insert(state);
        self.run_cycle(session_id, state)
    }

    /// Session abort: pending intentions are removed from dispatch and any
    /// in-flight results for the session will be discarded on arrival.
    pub async fn abort_session(&self, session_id: &str) -> Result<()> {
        let mut sessions = self.sessions.lock().await;
        if sessions.remove(session_id).is_some() {
            info!(session_id, "Session aborted, pending intentions dropped");
        }
        self.memory.clear(session_id)
    }

    /// The final plan, once the session reached Done or Failed.
    pub async fn plan(&self, session_id: &str) -> Option<Plan> {
        self.sessions
            .lock()
            .await
            .get(session_id)
            .and_then(|s| s.plan.clone())
    }

    pub async fn phase(&self, session_id: &str) -> Option<Phase> {
        self.sessions.lock().await.get(session_id).map(|s| s.phase)
    }

    /// Expire overdue intentions. Called periodically; an expired intention
    /// is handled like an explicit timeout failure.
    pub async fn check_deadlines(&self) {
        let now = Utc::now();
        let mut expired: Vec<(String, TaskFailure)> = Vec::new();
        {
            let sessions = self.sessions.lock().await;
            for (session_id, state) in sessions.iter() {
                for intention in &state.intentions {
                    if intention.deadline < now {
                        expired.push((
                            session_id.clone(),
                            TaskFailure {
                                task_id: intention.task.task_id,
                                session_id: session_id.clone(),
                                category: intention.task_category(),
                                reason: FailureReason::Timeout,
                                detail: "intention deadline expired".to_string(),
                                min_candidate_price: None,
                            },
                        ));
                    }
                }
            }
        }
        for (session_id, failure) in expired {
            warn!(session_id = %session_id, task_id = %failure.task_id, "Intention deadline expired");
            if let Err(e) = self.handle_failure(&failure).await {
                warn!(error = %e, "Deadline recovery failed");
            }
        }
    }

    /// Tear down idle sessions past the TTL.
    pub async fn expire_sessions(&self) -> Result<Vec<String>> {
        let expired = self.memory.expire(self.cfg.session_ttl())?;
        let mut sessions = self.sessions.lock().await;
        for id in &expired {
            sessions.remove(id);
        }
        Ok(expired)
    }

    // ── Deliberating / Acting ───────────────────────────────────────────

    /// Deliberate and act until the session either waits on a dispatched
    /// intention or terminates.
    fn run_cycle(&self, session_id: &str, state: &mut SessionState) -> Result<()> {
        loop {
            state.phase = Phase::Deliberating;
            match self.select_desire(state) {
                Some(desire_id) => {
                    state.phase = Phase::Acting;
                    self.act(session_id, state, desire_id)?;
                    // Independent category searches may run concurrently;
                    // the next pass decides whether more can dispatch.
                    continue;
                }
                None => {
                    if !state.intentions.is_empty() {
                        state.phase = Phase::Monitoring;
                        return Ok(());
                    }
                    return self.finish(session_id, state);
                }
            }
        }
    }

    /// Highest-priority active desire whose dependencies are satisfied and
    /// which has no live intention.
    fn select_desire(&self, state: &SessionState) -> Option<Uuid> {
        // A distribution in flight changes every search's budget hint;
        // hold further dispatches until it lands.
        if state
            .intentions
            .iter()
            .any(|i| matches!(i.task.goal, TaskGoal::DistributeBudget { .. }))
        {
            return None;
        }
        let mut candidates: Vec<&Desire> = state
            .desires
            .iter()
            .filter(|d| d.status == DesireStatus::Active)
            .filter(|d| !state.intentions.iter().any(|i| i.desire_id == d.id))
            .filter(|d| match d.goal {
                GoalKind::DistributeBudget => true,
                // Budget must be allocated before any category search.
                GoalKind::Find(_) | GoalKind::CorrectError(_) => state.beliefs.allocation.is_some(),
            })
            .collect();
        candidates.sort_by_key(|d| std::cmp::Reverse(d.priority));
        candidates.first().map(|d| d.id)
    }

    fn act(&self, session_id: &str, state: &mut SessionState, desire_id: Uuid) -> Result<()> {
        let desire = state
            .desires
            .iter()
            .find(|d| d.id == desire_id)
            .ok_or_else(|| Error::Session(format!("desire {} vanished", desire_id)))?;
        let goal = desire.goal;
        let attempt = state.attempts.get(&desire_id).copied().unwrap_or(0) + 1;
        state.attempts.insert(desire_id, attempt);

        let task_id = Uuid::new_v4();
        let (target, task) = match goal {
            GoalKind::DistributeBudget => (
                topic::BUDGET,
                TaskRequest {
                    task_id,
                    session_id: session_id.to_string(),
                    goal: TaskGoal::DistributeBudget {
                        floors: state.beliefs.floors.clone(),
                        failing: None,
                        current: None,
                        committed: Vec::new(),
                    },
                    criteria: state.beliefs.criteria.clone(),
                    budget_hint: state.beliefs.criteria.presupuesto_total,
                    tolerance: self.cfg.budget_tolerance,
                },
            ),
            GoalKind::Find(category) | GoalKind::CorrectError(category) => {
                let allocation = state.beliefs.allocation.ok_or_else(|| {
                    Error::Session("category search dispatched without allocation".to_string())
                })?;
                // Corrections and flagged categories search with relaxed
                // budget tolerance.
                let relaxed = matches!(goal, GoalKind::CorrectError(_))
                    || state.beliefs.relaxed.contains(&category);
                let tolerance = if relaxed {
                    self.cfg.budget_tolerance * 2.0
                } else {
                    self.cfg.budget_tolerance
                };
                (
                    topic::for_category(category),
                    TaskRequest {
                        task_id,
                        session_id: session_id.to_string(),
                        goal: TaskGoal::Search { category },
                        criteria: state.beliefs.criteria.clone(),
                        budget_hint: allocation.get(category),
                        tolerance,
                    },
                )
            }
        };

        if let Some(category) = goal.category() {
            state.beliefs.set_status(category, TaskStatus::InProgress);
        } else {
            state.beliefs.budget_status = TaskStatus::InProgress;
        }
        self.memory.append(
            session_id,
            SessionEvent::Decision {
                description: format!("dispatch {} (attempt {})", goal.as_str(), attempt),
            },
        )?;

        debug!(session_id, goal = goal.as_str(), attempt, task_id = %task_id, "Dispatching intention");
        self.bus
            .publish(target, topic::PLANNER, task_id, Payload::Task(task.clone()));
        state.intentions.push(Intention {
            id: Uuid::new_v4(),
            desire_id,
            task,
            attempt,
            deadline: Utc::now() + chrono::Duration::from_std(self.cfg.deadline()).unwrap_or_default(),
        });
        Ok(())
    }

    // ── Perceiving / Monitoring ─────────────────────────────────────────

    async fn handle_budget_done(
        &self,
        msg_id: Uuid,
        task_id: Uuid,
        session_id: &str,
        allocation: BudgetAllocation,
        relaxed: Vec<Category>,
    ) -> Result<()> {
        let mut sessions = self.sessions.lock().await;
        let Some(state) = sessions.get_mut(session_id) else {
            debug!(session_id, "Result for unknown session discarded");
            return Ok(());
        };
        if state.beliefs.is_applied(msg_id) {
            // Already merged; a redelivery means a later step failed, so
            // re-enter the cycle instead of stalling the session.
            debug!(session_id, %msg_id, "Duplicate delivery, re-entering cycle");
            return self.run_cycle(session_id, state);
        }
        let Some(pos) = state.intention_pos(task_id) else {
            debug!(session_id, %task_id, "Stale budget result discarded");
            return Ok(());
        };
        // Log before the merge: a failed write leaves the intention live
        // so the redelivery repeats the whole merge.
        self.memory.append(
            session_id,
            SessionEvent::BeliefUpdate {
                key: "allocation".to_string(),
                value: serde_json::to_value(allocation)?,
            },
        )?;
        let intention = state.intentions.remove(pos);
        state.phase = Phase::Perceiving;

        let from_reallocation = matches!(
            &intention.task.goal,
            TaskGoal::DistributeBudget { failing: Some(_), .. }
        );
        state.beliefs.set_allocation(allocation, relaxed.clone());
        if let Some(desire) = state.desire_mut(intention.desire_id) {
            desire.status = DesireStatus::Satisfied;
        }
        for category in &relaxed {
            state.warnings.push(if from_reallocation {
                format!(
                    "{} budget raised by reallocation, searching with relaxed tolerance",
                    category
                )
            } else {
                format!("{} floor unmet, searching relaxed", category)
            });
        }
        state.beliefs.mark_applied(msg_id);
        info!(session_id, total = allocation.total(), "Budget allocated");
        self.run_cycle(session_id, state)
    }

    async fn handle_task_done(
        &self,
        msg_id: Uuid,
        task_id: Uuid,
        session_id: &str,
        result: nuptial_core::TaskResult,
    ) -> Result<()> {
        let mut sessions = self.sessions.lock().await;
        let Some(state) = sessions.get_mut(session_id) else {
            debug!(session_id, "Result for unknown session discarded");
            return Ok(());
        };
        if state.beliefs.is_applied(msg_id) {
            debug!(session_id, %msg_id, "Duplicate delivery, re-entering cycle");
            return self.run_cycle(session_id, state);
        }
        let Some(pos) = state.intention_pos(task_id) else {
            debug!(session_id, %task_id, "Stale task result discarded");
            return Ok(());
        };
        let category = result.category;
        // Log before the merge: a failed write leaves the intention live
        // so the redelivery repeats the whole merge.
        self.memory.append(
            session_id,
            SessionEvent::BeliefUpdate {
                key: category.as_str().to_string(),
                value: serde_json::json!({
                    "chosen": result.chosen.id,
                    "price": result.chosen.price,
                }),
            },
        )?;
        let intention = state.intentions.remove(pos);
        state.phase = Phase::Perceiving;

        info!(session_id, category = %category, chosen = %result.chosen.id, "Category resolved");
        state.beliefs.set_result(category, result);
        if let Some(desire) = state.desire_mut(intention.desire_id) {
            desire.status = DesireStatus::Satisfied;
        }
        state.beliefs.mark_applied(msg_id);
        self.run_cycle(session_id, state)
    }

    async fn handle_failure(&self, failure: &TaskFailure) -> Result<()> {
        let mut sessions = self.sessions.lock().await;
        let Some(state) = sessions.get_mut(&failure.session_id) else {
            debug!(session_id = %failure.session_id, "Failure for unknown session discarded");
            return Ok(());
        };
        let session_id = failure.session_id.clone();
        let Some(pos) = state.intention_pos(failure.task_id) else {
            debug!(session_id, task_id = %failure.task_id, "Stale failure discarded");
            // A redelivery of an already-handled failure still advances
            // the session if an earlier dispatch did not land.
            return self.run_cycle(&session_id, state);
        };
        let desire_id = state.intentions[pos].desire_id;
        let desire_goal = state
            .desires
            .iter()
            .find(|d| d.id == desire_id)
            .map(|d| d.goal)
            .ok_or_else(|| Error::Session("failed intention without desire".to_string()))?;
        // Log before the merge: a failed write leaves the intention live
        // so the redelivery repeats the whole merge.
        self.memory.append(
            &session_id,
            SessionEvent::TaskError {
                task_kind: desire_goal.as_str().to_string(),
                detail: failure.detail.clone(),
                retry_count: state.intentions[pos].attempt,
            },
        )?;
        let intention = state.intentions.remove(pos);
        state.phase = Phase::Perceiving;

        let error_index = state.beliefs.record_error(
            desire_goal.as_str(),
            &failure.detail,
            intention.attempt,
        );

        match failure.reason {
            // Malformed criteria: user-visible, never retried.
            FailureReason::Validation => {
                self.abandon(state, intention.desire_id, error_index);
                state
                    .warnings
                    .push(format!("{}: {}", desire_goal.as_str(), failure.detail));
            }
            // Floors unsatisfiable: surfaced as a warning, category stays
            // unresolved.
            FailureReason::BudgetExceeded => {
                self.abandon(state, intention.desire_id, error_index);
                state
                    .warnings
                    .push(format!("{}: {}", desire_goal.as_str(), failure.detail));
            }
            FailureReason::NotFound => {
                if let Some(floor) = failure.min_candidate_price {
                    if let Some(category) = failure.category {
                        state.beliefs.learn_floor(category, floor);
                    }
                }
                self.recover_not_found(&session_id, state, intention, error_index)?;
            }
            FailureReason::Timeout | FailureReason::Internal => {
                // Recoverable: re-enter Acting with attempt + 1 while the
                // retry budget lasts.
                let attempts = state.attempts.get(&intention.desire_id).copied().unwrap_or(0);
                if attempts < self.cfg.max_retries {
                    debug!(session_id, goal = desire_goal.as_str(), attempts, "Retrying intention");
                } else {
                    self.abandon(state, intention.desire_id, error_index);
                }
            }
        }
        self.run_cycle(&session_id, state)
    }

    /// NotFound recovery: shift budget headroom into the failing category
    /// (bounded by max_retries), then let the still-active desire re-enter
    /// Acting once the new allocation lands.
    fn recover_not_found(
        &self,
        session_id: &str,
        state: &mut SessionState,
        intention: Intention,
        error_index: usize,
    ) -> Result<()> {
        let Some(category) = intention.task_category() else {
            // A budget-distribution task itself reported NotFound.
            self.abandon(state, intention.desire_id, error_index);
            return Ok(());
        };
        let rounds = state.reallocations.entry(category).or_insert(0);
        let allocation = state.beliefs.allocation;
        if *rounds < self.cfg.max_retries {
            if let Some(current) = allocation {
                *rounds += 1;
                info!(
                    session_id,
                    category = %category,
                    round = *rounds,
                    "Requesting budget reallocation after NotFound"
                );
                let task_id = Uuid::new_v4();
                let task = TaskRequest {
                    task_id,
                    session_id: session_id.to_string(),
                    goal: TaskGoal::DistributeBudget {
                        floors: state.beliefs.floors.clone(),
                        failing: Some(category),
                        current: Some(current),
                        committed: state.beliefs.committed_spend(),
                    },
                    criteria: state.beliefs.criteria.clone(),
                    budget_hint: state.beliefs.criteria.presupuesto_total,
                    tolerance: self.cfg.budget_tolerance,
                };
                // A fresh budget desire; the failing category's own desire
                // stays active and re-dispatches after BudgetDone.
                let desire = Desire::new(GoalKind::DistributeBudget);
                let desire_id = desire.id;
                state.desires.push(desire);
                state.attempts.insert(desire_id, 1);
                self.bus
                    .publish(topic::BUDGET, topic::PLANNER, task_id, Payload::Task(task.clone()));
                state.intentions.push(Intention {
                    id: Uuid::new_v4(),
                    desire_id,
                    task,
                    attempt: 1,
                    deadline: Utc::now()
                        + chrono::Duration::from_std(self.cfg.deadline()).unwrap_or_default(),
                });
                return Ok(());
            }
        }
        self.abandon(state, intention.desire_id, error_index);
        Ok(())
    }

    /// Abandon a desire after exhausting retries. A failed Find desire
    /// spawns a correction desire; a failed correction marks the category
    /// permanently unresolved.
    fn abandon(&self, state: &mut SessionState, desire_id: Uuid, error_index: usize) {
        let Some(desire) = state.desire_mut(desire_id) else {
            return;
        };
        if desire.status == DesireStatus::Abandoned {
            return;
        }
        desire.status = DesireStatus::Abandoned;
        let goal = desire.goal;
        match goal {
            GoalKind::Find(category) => {
                warn!(category = %category, "Desire abandoned, creating correction desire");
                state.desires.push(Desire::correction(category, error_index));
            }
            GoalKind::CorrectError(category) => {
                warn!(category = %category, "Correction exhausted, category unresolved");
                state.beliefs.set_status(category, TaskStatus::Failed);
                state
                    .warnings
                    .push(format!("{} unresolved after exhausting corrections", category));
            }
            GoalKind::DistributeBudget => {
                state
                    .warnings
                    .push("budget distribution failed".to_string());
            }
        }
    }

    // ── Done / Failed ───────────────────────────────────────────────────

    /// No dispatchable desire and no live intention: project beliefs into
    /// the final plan. Unresolved categories are flagged, never dropped.
    fn finish(&self, session_id: &str, state: &mut SessionState) -> Result<()> {
        if state.plan.is_some() {
            return Ok(());
        }
        // Category desires that never became dispatchable (e.g. budget
        // distribution abandoned) are surfaced as unresolved too.
        let stranded: Vec<Category> = state
            .desires
            .iter_mut()
            .filter(|d| d.status == DesireStatus::Active)
            .filter_map(|d| {
                d.status = DesireStatus::Abandoned;
                d.goal.category()
            })
            .collect();
        for category in stranded {
            state.beliefs.set_status(category, TaskStatus::Failed);
            state
                .beliefs
                .record_error("planner", "dependency never satisfied", 0);
            state
                .warnings
                .push(format!("{} unresolved: budget never allocated", category));
        }

        let entry = |category: Category, state: &SessionState| match state.beliefs.result(category)
        {
            Some(result) => PlanEntry::Resolved {
                result: result.clone(),
            },
            None => PlanEntry::Unresolved {
                reason: state
                    .beliefs
                    .errors
                    .iter()
                    .rev()
                    .find(|e| e.task_kind.contains(category.as_str()) || e.task_kind == "correct_error")
                    .map(|e| e.detail.clone())
                    .unwrap_or_else(|| "no result produced".to_string()),
            },
        };
        let plan = Plan {
            session_id: session_id.to_string(),
            venue: entry(Category::Venue, state),
            catering: entry(Category::Catering, state),
            decor: entry(Category::Decor, state),
            budget: state.beliefs.allocation.unwrap_or_default(),
            warnings: state.warnings.clone(),
        };
        let all_resolved = Category::ALL.iter().all(|c| plan.entry(*c).is_resolved());
        state.phase = if all_resolved { Phase::Done } else { Phase::Failed };
        info!(
            session_id,
            resolved = all_resolved,
            warnings = plan.warnings.len(),
            "Plan emitted"
        );
        self.memory
            .append(session_id, SessionEvent::PlanEmitted { plan: plan.clone() })?;
        self.bus.publish(
            topic::USER,
            topic::PLANNER,
            Uuid::new_v4(),
            Payload::PlanReady {
                session_id: session_id.to_string(),
                plan: plan.clone(),
            },
        );
        state.plan = Some(plan);
        Ok(())
    }
}

impl Intention {
    fn task_category(&self) -> Option<Category> {
        match self.task.goal {
            TaskGoal::Search { category } => Some(category),
            TaskGoal::DistributeBudget { .. } => None,
        }
    }
}

#[async_trait]
impl MessageHandler for PlannerAgent {
    async fn handle(&self, msg: &Message) -> Result<()> {
        match &msg.payload {
            Payload::UserRequest {
                session_id,
                criteria,
            } => self.start_session_with_id(session_id, criteria.clone()).await,
            Payload::BudgetDone {
                task_id,
                session_id,
                allocation,
                relaxed,
            } => {
                self.handle_budget_done(msg.id, *task_id, session_id, *allocation, relaxed.clone())
                    .await
            }
            Payload::TaskDone {
                task_id,
                session_id,
                result,
            } => {
                self.handle_task_done(msg.id, *task_id, session_id, result.clone())
                    .await
            }
            Payload::TaskFailed(failure) => self.handle_failure(failure).await,
            Payload::Abort { session_id } => self.abort_session(session_id).await,
            other => {
                debug!(message_id = %msg.id, payload = ?other, "Planner ignoring payload");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::BudgetDistributorAgent;
    use crate::generation::GenerationService;
    use crate::specialized::SpecializedAgent;
    use nuptial_core::{ProviderRecord, RecordState, TaskResult};
    use nuptial_storage::MemoryProviderStore;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::broadcast;

    struct EchoGeneration;

    #[async_trait]
    impl GenerationService for EchoGeneration {
        async fn generate(
            &self,
            _criteria: &Criteria,
            candidates: &[ProviderRecord],
        ) -> Result<String> {
            Ok(format!("recommended {}", candidates[0].name))
        }

        async fn retrieve(&self, _query: &str) -> Result<Vec<ProviderRecord>> {
            Ok(vec![])
        }
    }

    fn record(id: &str, category: Category, price: f64, fields: serde_json::Value) -> ProviderRecord {
        ProviderRecord {
            id: id.to_string(),
            category,
            name: id.to_string(),
            price,
            fields: fields.as_object().cloned().unwrap_or_default(),
            last_verified: Utc::now(),
            quality_score: 0.8,
            state: RecordState::Fresh,
            version: 0,
        }
    }

    fn criteria(total: f64) -> Criteria {
        serde_json::from_str::<Criteria>(&format!(
            r#"{{"presupuesto_total": {}, "guest_count": 100}}"#,
            total
        ))
        .unwrap()
    }

    fn fast_cfg() -> CoreConfig {
        CoreConfig {
            max_retries: 3,
            base_delay_ms: 1,
            max_delay_ms: 2,
            jitter_ms: 0,
            deadline_secs: 30,
            ..CoreConfig::default()
        }
    }

    struct Harness {
        _bus: Arc<MessageBus>,
        planner: Arc<PlannerAgent>,
        _dir: tempfile::TempDir,
        _shutdown: broadcast::Sender<()>,
    }

    /// Full wiring: planner + budget distributor + three category agents
    /// over one bus and an in-memory store.
    async fn harness(records: Vec<ProviderRecord>) -> Harness {
        let cfg = fast_cfg();
        let bus = MessageBus::new(cfg.clone());
        let store = Arc::new(MemoryProviderStore::new());
        store.seed(records).await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        let memory = Arc::new(SessionStore::new(dir.path()).unwrap());
        let planner = PlannerAgent::new(Arc::clone(&bus), memory, cfg.clone());
        let (shutdown, _) = broadcast::channel(1);

        bus.serve(
            topic::BUDGET,
            BudgetDistributorAgent::new(Arc::clone(&bus), cfg.clone()),
            shutdown.subscribe(),
        );
        for category in Category::ALL {
            bus.serve(
                topic::for_category(category),
                SpecializedAgent::new(
                    category,
                    Arc::clone(&store) as _,
                    Arc::new(EchoGeneration),
                    Arc::clone(&bus),
                    cfg.clone(),
                ),
                shutdown.subscribe(),
            );
        }
        bus.serve(topic::PLANNER, Arc::clone(&planner), shutdown.subscribe());

        Harness {
            _bus: bus,
            planner,
            _dir: dir,
            _shutdown: shutdown,
        }
    }

    async fn wait_for_plan(h: &Harness, session_id: &str) -> Plan {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(plan) = h.planner.plan(session_id).await {
                    return plan;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("plan not emitted in time")
    }

    fn full_catalog() -> Vec<ProviderRecord> {
        vec![
            record("v1", Category::Venue, 15000.0, json!({"capacity": 150})),
            record("c1", Category::Catering, 14000.0, json!({"services": ["buffet"]})),
            record("d1", Category::Decor, 9000.0, json!({"style": "classic"})),
        ]
    }

    #[tokio::test]
    async fn test_happy_path_reaches_done_with_no_warnings() {
        let h = harness(full_catalog()).await;
        let session_id = h.planner.start_session(criteria(50000.0)).await.unwrap();
        let plan = wait_for_plan(&h, &session_id).await;

        assert_eq!(h.planner.phase(&session_id).await, Some(Phase::Done));
        for category in Category::ALL {
            assert!(plan.entry(category).is_resolved(), "{} unresolved", category);
        }
        assert!(plan.warnings.is_empty());
        assert!(plan.budget.total() <= 50000.0 + 1e-6);
    }

    #[tokio::test]
    async fn test_not_found_triggers_reallocation_then_success() {
        // Venue costs more than its equal-thirds share of 30000 (10000 *
        // 1.15 ceiling = 11500) but fits after headroom shifts in.
        let mut records = full_catalog();
        records[0] = record("v1", Category::Venue, 12400.0, json!({"capacity": 150}));
        records[1] = record("c1", Category::Catering, 8000.0, json!({}));
        records[2] = record("d1", Category::Decor, 6000.0, json!({}));
        let h = harness(records).await;
        let session_id = h.planner.start_session(criteria(30000.0)).await.unwrap();
        let plan = wait_for_plan(&h, &session_id).await;

        assert!(plan.entry(Category::Venue).is_resolved());
        assert!(plan.budget.total() <= 30000.0 + 1e-6);
        // Venue got more than the equal-thirds baseline.
        assert!(plan.budget.venue > 10000.0);
        // Resolved categories keep enough allocation to cover their own
        // chosen candidate even after the shift.
        for category in [Category::Catering, Category::Decor] {
            if let PlanEntry::Resolved { result } = plan.entry(category) {
                assert!(
                    plan.budget.get(category) + 1e-6 >= result.chosen.price,
                    "{} allocation fell below its chosen price",
                    category
                );
            }
        }
        // The recovery is reported as a reallocation, not a floor problem.
        assert!(plan.warnings.iter().any(|w| w.contains("reallocation")));
        assert!(
            plan.warnings.iter().all(|w| !w.contains("floor unmet")),
            "warnings: {:?}",
            plan.warnings
        );
    }

    #[tokio::test]
    async fn test_unresolvable_category_yields_partial_plan() {
        // No decor record at all: decor must end Unresolved, the others
        // resolve, and the failure is flagged, not silent.
        let records = vec![
            record("v1", Category::Venue, 9000.0, json!({"capacity": 150})),
            record("c1", Category::Catering, 8000.0, json!({})),
        ];
        let h = harness(records).await;
        let session_id = h.planner.start_session(criteria(30000.0)).await.unwrap();
        let plan = wait_for_plan(&h, &session_id).await;

        assert_eq!(h.planner.phase(&session_id).await, Some(Phase::Failed));
        assert!(plan.entry(Category::Venue).is_resolved());
        assert!(plan.entry(Category::Catering).is_resolved());
        assert!(!plan.entry(Category::Decor).is_resolved());
        assert!(plan
            .warnings
            .iter()
            .any(|w| w.contains("decor")), "warnings: {:?}", plan.warnings);
    }

    #[tokio::test]
    async fn test_validation_error_surfaces_immediately() {
        let h = harness(full_catalog()).await;
        let bad = criteria(0.0);
        match h.planner.start_session(bad).await {
            Err(Error::Validation(_)) => {}
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_duplicate_result_delivery_is_idempotent() {
        let h = harness(full_catalog()).await;
        let session_id = h.planner.start_session(criteria(50000.0)).await.unwrap();
        let plan = wait_for_plan(&h, &session_id).await;
        let venue_price = match plan.entry(Category::Venue) {
            PlanEntry::Resolved { result } => result.chosen.price,
            _ => panic!("venue should be resolved"),
        };

        // Redeliver a fabricated duplicate of the venue result; the belief
        // and the emitted plan must not change.
        let dup = Message::new(
            topic::PLANNER,
            topic::VENUE,
            Uuid::new_v4(),
            Payload::TaskDone {
                task_id: Uuid::new_v4(),
                session_id: session_id.clone(),
                result: TaskResult {
                    category: Category::Venue,
                    chosen: record("v9", Category::Venue, 1.0, json!({})),
                    alternatives: vec![],
                    narrative: String::new(),
                },
            },
        );
        h.planner.handle(&dup).await.unwrap();
        let after = h.planner.plan(&session_id).await.unwrap();
        match after.entry(Category::Venue) {
            PlanEntry::Resolved { result } => assert_eq!(result.chosen.price, venue_price),
            _ => panic!("venue should stay resolved"),
        }
    }

    #[tokio::test]
    async fn test_abort_discards_late_results() {
        let h = harness(full_catalog()).await;
        let session_id = h.planner.start_session(criteria(50000.0)).await.unwrap();
        h.planner.abort_session(&session_id).await.unwrap();
        assert_eq!(h.planner.phase(&session_id).await, None);

        // A late result for the dead session is discarded without error.
        let late = Message::new(
            topic::PLANNER,
            topic::VENUE,
            Uuid::new_v4(),
            Payload::TaskDone {
                task_id: Uuid::new_v4(),
                session_id: session_id.clone(),
                result: TaskResult {
                    category: Category::Venue,
                    chosen: record("v1", Category::Venue, 100.0, json!({})),
                    alternatives: vec![],
                    narrative: String::new(),
                },
            },
        );
        h.planner.handle(&late).await.unwrap();
        assert!(h.planner.plan(&session_id).await.is_none());
    }

    #[tokio::test]
    async fn test_retry_bound_abandons_exactly_once() {
        // No records and an empty store: venue fails NotFound, burns its
        // reallocation rounds, gets abandoned, correction also fails, and
        // the desire set shows exactly one abandoned Find(venue).
        let h = harness(vec![]).await;
        let session_id = h.planner.start_session(criteria(30000.0)).await.unwrap();
        let _ = wait_for_plan(&h, &session_id).await;

        let sessions = h.planner.sessions.lock().await;
        let state = sessions.get(&session_id).unwrap();
        let abandoned_finds = state
            .desires
            .iter()
            .filter(|d| {
                d.goal == GoalKind::Find(Category::Venue) && d.status == DesireStatus::Abandoned
            })
            .count();
        assert_eq!(abandoned_finds, 1);
        // Nothing for venue is still active or in flight.
        assert!(state
            .desires
            .iter()
            .filter(|d| d.goal.category() == Some(Category::Venue))
            .all(|d| d.status != DesireStatus::Active));
        assert!(state.intentions.is_empty());
    }

    #[tokio::test]
    async fn test_result_redelivery_after_log_failure_resumes_session() {
        // A result whose session-log write fails must leave the intention
        // live, so the bus redelivery of the same message can repeat the
        // merge instead of being dropped as a duplicate.
        let cfg = fast_cfg();
        let bus = MessageBus::new(cfg.clone());
        let dir = tempfile::tempdir().unwrap();
        let memory = Arc::new(SessionStore::new(dir.path()).unwrap());
        let planner = PlannerAgent::new(Arc::clone(&bus), memory, cfg);

        // No served agents: every reply below is delivered by hand.
        let mut budget_rx = bus.subscribe(topic::BUDGET);
        let mut venue_rx = bus.subscribe(topic::VENUE);
        let session_id = planner.start_session(criteria(30000.0)).await.unwrap();

        let budget_task = match budget_rx.recv().await.unwrap().payload {
            Payload::Task(req) => req,
            other => panic!("unexpected payload: {:?}", other),
        };
        let mut allocation = BudgetAllocation::default();
        for category in Category::ALL {
            allocation.set(category, 10000.0);
        }
        planner
            .handle(&Message::new(
                topic::PLANNER,
                topic::BUDGET,
                budget_task.task_id,
                Payload::BudgetDone {
                    task_id: budget_task.task_id,
                    session_id: session_id.clone(),
                    allocation,
                    relaxed: vec![],
                },
            ))
            .await
            .unwrap();

        let venue_task = match venue_rx.recv().await.unwrap().payload {
            Payload::Task(req) => req,
            other => panic!("unexpected payload: {:?}", other),
        };
        let done = Message::new(
            topic::PLANNER,
            topic::VENUE,
            venue_task.task_id,
            Payload::TaskDone {
                task_id: venue_task.task_id,
                session_id: session_id.clone(),
                result: TaskResult {
                    category: Category::Venue,
                    chosen: record("v1", Category::Venue, 9000.0, json!({})),
                    alternatives: vec![],
                    narrative: String::new(),
                },
            },
        );

        // Break the session log for the first delivery only.
        let log = dir.path().join(format!("{}.jsonl", session_id));
        let contents = std::fs::read(&log).unwrap();
        std::fs::remove_file(&log).unwrap();
        assert!(planner.handle(&done).await.is_err());
        std::fs::write(&log, contents).unwrap();

        // Redelivering the very same message completes the merge.
        planner.handle(&done).await.unwrap();
        let sessions = planner.sessions.lock().await;
        let state = sessions.get(&session_id).unwrap();
        assert_eq!(state.beliefs.status(Category::Venue), TaskStatus::Done);
        assert!(state.intention_pos(venue_task.task_id).is_none());
    }
}
