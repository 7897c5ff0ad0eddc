//! Canned service implementations so the binary runs without network
//! access: a template narrative generator and a seed-file-backed external
//! search.

use async_trait::async_trait;
use chrono::Utc;
use nuptial_agents::GenerationService;
use nuptial_core::{Criteria, ProviderRecord, Result};
use nuptial_crawler::ExternalSearch;
use nuptial_storage::RecordPatch;
use std::collections::HashMap;
use std::fs;
use std::path::Path;

pub fn load_records(path: &Path) -> anyhow::Result<Vec<ProviderRecord>> {
    let text = fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("cannot read {}: {}", path.display(), e))?;
    let records: Vec<ProviderRecord> = serde_json::from_str(&text)
        .map_err(|e| anyhow::anyhow!("invalid provider file {}: {}", path.display(), e))?;
    Ok(records)
}

/// Template-based narrative generator.
pub struct StaticGeneration;

#[async_trait]
impl GenerationService for StaticGeneration {
    async fn generate(&self, criteria: &Criteria, candidates: &[ProviderRecord]) -> Result<String> {
        let names: Vec<&str> = candidates.iter().map(|c| c.name.as_str()).collect();
        Ok(match names.split_first() {
            Some((first, rest)) if rest.is_empty() => format!(
                "For a {} wedding with {} guests, {} is the standout option.",
                criteria.style, criteria.guest_count, first
            ),
            Some((first, rest)) => format!(
                "For a {} wedding with {} guests, {} is the strongest fit; also worth a look: {}.",
                criteria.style,
                criteria.guest_count,
                first,
                rest.join(", ")
            ),
            None => "No candidates to compare.".to_string(),
        })
    }

    async fn retrieve(&self, _query: &str) -> Result<Vec<ProviderRecord>> {
        Ok(Vec::new())
    }
}

/// External search backed by the seed file: a known record id refreshes
/// from its seed entry, anything else counts as not found.
pub struct SeedSearch {
    seeds: HashMap<String, ProviderRecord>,
}

impl SeedSearch {
    pub fn new(records: &[ProviderRecord]) -> Self {
        Self {
            seeds: records.iter().map(|r| (r.id.clone(), r.clone())).collect(),
        }
    }
}

#[async_trait]
impl ExternalSearch for SeedSearch {
    async fn refresh(&self, record: &ProviderRecord) -> Result<Option<RecordPatch>> {
        Ok(self.seeds.get(&record.id).map(|seed| RecordPatch {
            fields: seed.fields.clone(),
            price: Some(seed.price),
            quality_score: Some(seed.quality_score),
            last_verified: Some(Utc::now()),
        }))
    }
}
