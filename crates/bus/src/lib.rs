pub mod backoff;
pub mod bus;

pub use backoff::delay_for_attempt;
pub use bus::{MessageBus, MessageHandler, Subscription, TraceEvent, TraceKind};
