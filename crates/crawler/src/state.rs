use chrono::{DateTime, Duration, Utc};
use nuptial_core::criteria::default_mandatory;
use nuptial_core::{ProviderRecord, RecordState};

/// Classify a record from its mandatory-field completeness and the age of
/// `last_verified`. A record flagged `Missing` by a failed enrichment stays
/// `Missing` until an enrichment succeeds, regardless of age.
pub fn classify(record: &ProviderRecord, now: DateTime<Utc>, threshold: Duration) -> RecordState {
    let mandatory: Vec<String> = default_mandatory(record.category)
        .iter()
        .map(|s| s.to_string())
        .collect();
    if !record.has_mandatory(&mandatory) {
        return RecordState::Missing;
    }
    if record.state == RecordState::Missing {
        return RecordState::Missing;
    }
    if now - record.last_verified > threshold {
        RecordState::Stale
    } else {
        RecordState::Fresh
    }
}
