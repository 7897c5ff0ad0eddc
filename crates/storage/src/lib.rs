pub mod provider_store;
pub mod session;

pub use provider_store::{MemoryProviderStore, ProviderStore, RecordFilter, RecordPatch};
pub use session::{SessionEvent, SessionStore};
