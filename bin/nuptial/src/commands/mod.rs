pub mod plan;
pub mod providers;
pub mod sweep;
