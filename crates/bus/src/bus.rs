use chrono::Utc;
use nuptial_core::message::TaskGoal;
use nuptial_core::{topic, CoreConfig, FailureReason, Message, Payload, TaskFailure};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backoff::delay_for_attempt;

/// A handler invoked by a serve loop for each delivered message. Returning
/// `Err` triggers redelivery with backoff.
#[async_trait::async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, msg: &Message) -> nuptial_core::Result<()>;
}

// Lets a shared agent be served directly.
#[async_trait::async_trait]
impl<T: MessageHandler> MessageHandler for Arc<T> {
    async fn handle(&self, msg: &Message) -> nuptial_core::Result<()> {
        (**self).handle(msg).await
    }
}

/// One subscriber's lazy, ordered view of a topic.
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<Message>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Message> {
        self.rx.try_recv().ok()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceKind {
    Published,
    DeliveryAttempt { attempt: u32 },
    DeadLettered,
}

/// Immutable trace-log entry; every publish and delivery attempt is
/// recorded and queryable by correlation_id.
#[derive(Debug, Clone)]
pub struct TraceEvent {
    pub correlation_id: Uuid,
    pub message_id: Uuid,
    pub topic: String,
    pub kind: TraceKind,
    pub timestamp_ms: i64,
}

struct BusInner {
    subscribers: HashMap<String, Vec<mpsc::UnboundedSender<Message>>>,
}

/// Topic-based asynchronous delivery between agents. FIFO per topic,
/// at-least-once per subscriber, no cross-topic ordering.
pub struct MessageBus {
    inner: Mutex<BusInner>,
    trace: Mutex<Vec<TraceEvent>>,
    cfg: CoreConfig,
}

impl MessageBus {
    pub fn new(cfg: CoreConfig) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(BusInner {
                subscribers: HashMap::new(),
            }),
            trace: Mutex::new(Vec::new()),
            cfg,
        })
    }

    pub fn config(&self) -> &CoreConfig {
        &self.cfg
    }

    /// Publish a payload on a topic. Returns the envelope's message id.
    /// Publish order is delivery order for every subscriber of the topic.
    pub fn publish(
        &self,
        topic: &str,
        sender: &str,
        correlation_id: Uuid,
        payload: Payload,
    ) -> Uuid {
        let msg = Message::new(topic, sender, correlation_id, payload);
        let id = msg.id;
        self.record(TraceEvent {
            correlation_id,
            message_id: id,
            topic: topic.to_string(),
            kind: TraceKind::Published,
            timestamp_ms: Utc::now().timestamp_millis(),
        });
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(subs) = inner.subscribers.get_mut(topic) {
            subs.retain(|tx| tx.send(msg.clone()).is_ok());
        } else {
            debug!(topic, "No subscribers for topic");
        }
        id
    }

    /// Register a new subscriber on a topic. Messages published after this
    /// call are delivered in publish order.
    pub fn subscribe(&self, topic: &str) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.subscribers.entry(topic.to_string()).or_default().push(tx);
        Subscription { rx }
    }

    /// All trace events recorded for a correlation id, in order.
    pub fn trace(&self, correlation_id: Uuid) -> Vec<TraceEvent> {
        self.trace
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|e| e.correlation_id == correlation_id)
            .cloned()
            .collect()
    }

    fn record(&self, event: TraceEvent) {
        self.trace
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event);
    }

    /// Spawn a sequential serve loop for one subscriber. Handler errors are
    /// retried with exponential backoff up to `max_retries`; exhausted
    /// messages go to the dead-letter topic and the sender receives a
    /// synthetic timeout failure.
    pub fn serve<H: MessageHandler>(
        self: &Arc<Self>,
        topic_name: &str,
        handler: H,
        mut shutdown: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        let bus = Arc::clone(self);
        let topic_name = topic_name.to_string();
        let mut sub = bus.subscribe(&topic_name);
        tokio::spawn(async move {
            info!(topic = %topic_name, "Serve loop started");
            loop {
                tokio::select! {
                    msg = sub.recv() => {
                        let Some(msg) = msg else { break };
                        bus.deliver(&topic_name, &handler, msg).await;
                    }
                    _ = shutdown.recv() => {
                        info!(topic = %topic_name, "Serve loop shutting down");
                        break;
                    }
                }
            }
        })
    }

    async fn deliver<H: MessageHandler>(&self, topic_name: &str, handler: &H, msg: Message) {
        let max = self.cfg.max_retries.max(1);
        for attempt in 0..max {
            let mut delivery = msg.clone();
            delivery.attempt = attempt + 1;
            self.record(TraceEvent {
                correlation_id: delivery.correlation_id,
                message_id: delivery.id,
                topic: topic_name.to_string(),
                kind: TraceKind::DeliveryAttempt {
                    attempt: delivery.attempt,
                },
                timestamp_ms: Utc::now().timestamp_millis(),
            });
            match handler.handle(&delivery).await {
                Ok(()) => return,
                Err(e) => {
                    warn!(
                        topic = %topic_name,
                        message_id = %delivery.id,
                        attempt = delivery.attempt,
                        error = %e,
                        "Handler failed"
                    );
                    if attempt + 1 < max {
                        tokio::time::sleep(delay_for_attempt(attempt, &self.cfg)).await;
                    }
                }
            }
        }
        self.dead_letter(topic_name, msg);
    }

    fn dead_letter(&self, topic_name: &str, msg: Message) {
        warn!(
            topic = %topic_name,
            message_id = %msg.id,
            correlation_id = %msg.correlation_id,
            "Delivery exhausted, routing to dead letter"
        );
        self.record(TraceEvent {
            correlation_id: msg.correlation_id,
            message_id: msg.id,
            topic: topic::DEAD_LETTER.to_string(),
            kind: TraceKind::DeadLettered,
            timestamp_ms: Utc::now().timestamp_millis(),
        });
        self.publish(
            topic::DEAD_LETTER,
            topic_name,
            msg.correlation_id,
            msg.payload.clone(),
        );
        // Surface a synthetic timeout to the sender so a waiting planner
        // can apply its own retry policy instead of hanging.
        if msg.sender != topic_name {
            if let Some(failure) = synthetic_failure(&msg) {
                self.publish(
                    &msg.sender,
                    topic::DEAD_LETTER,
                    msg.correlation_id,
                    Payload::TaskFailed(failure),
                );
            }
        }
    }
}

fn synthetic_failure(msg: &Message) -> Option<TaskFailure> {
    match &msg.payload {
        Payload::Task(req) => {
            let category = match &req.goal {
                TaskGoal::Search { category } => Some(*category),
                TaskGoal::DistributeBudget { .. } => None,
            };
            Some(TaskFailure {
                task_id: req.task_id,
                session_id: req.session_id.clone(),
                category,
                reason: FailureReason::Timeout,
                detail: format!("delivery to {} exhausted retries", msg.topic),
                min_candidate_price: None,
            })
        }
        _ => None,
    }
}
