pub mod state;
pub mod sweep;

pub use state::classify;
pub use sweep::{CrawlerService, ExternalSearch, SweepReport};
