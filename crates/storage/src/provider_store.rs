use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nuptial_core::{Category, Error, ProviderRecord, RecordState, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

/// Candidate filter applied on read. Records in `Missing` state or lacking
/// any mandatory field are never returned.
#[derive(Debug, Clone, Default)]
pub struct RecordFilter {
    pub mandatory_fields: Vec<String>,
    pub max_price: Option<f64>,
    /// Restriction fields matched against record fields: exact string match
    /// or membership when the record field is a list.
    pub restrictions: serde_json::Map<String, serde_json::Value>,
}

impl RecordFilter {
    pub fn matches(&self, record: &ProviderRecord) -> bool {
        if record.state == RecordState::Missing {
            return false;
        }
        if !record.has_mandatory(&self.mandatory_fields) {
            return false;
        }
        if let Some(max) = self.max_price {
            if record.price > max {
                return false;
            }
        }
        self.restrictions.iter().all(|(key, wanted)| {
            match (record.fields.get(key), wanted) {
                (Some(serde_json::Value::Array(items)), wanted) => items.contains(wanted),
                (Some(have), wanted) => have == wanted,
                (None, _) => false,
            }
        })
    }
}

/// Field updates applied by an enrichment pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecordPatch {
    pub fields: serde_json::Map<String, serde_json::Value>,
    pub price: Option<f64>,
    pub quality_score: Option<f64>,
    pub last_verified: Option<DateTime<Utc>>,
}

/// Read/write access to crawled provider records. Specialized agents only
/// read; the crawler is the sole writer.
#[async_trait]
pub trait ProviderStore: Send + Sync {
    async fn get(&self, category: Category, filter: &RecordFilter) -> Result<Vec<ProviderRecord>>;

    /// Every record in a category, regardless of state (sweep input).
    async fn all(&self, category: Category) -> Result<Vec<ProviderRecord>>;

    async fn upsert(&self, record: ProviderRecord) -> Result<()>;

    async fn mark_state(&self, record_id: &str, state: RecordState) -> Result<()>;

    /// Record-scoped compare-and-set: applies the patch (and marks the
    /// record Fresh) only when `expected_version` still matches, so two
    /// concurrent sweeps cannot double-write the same record. Returns
    /// whether the patch was applied.
    async fn compare_and_update(
        &self,
        record_id: &str,
        expected_version: u64,
        patch: RecordPatch,
    ) -> Result<bool>;
}

/// In-memory store used by the runtime and tests; the persistence engine
/// behind the trait is out of scope.
#[derive(Default)]
pub struct MemoryProviderStore {
    records: RwLock<HashMap<String, ProviderRecord>>,
}

impl MemoryProviderStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn seed(&self, records: Vec<ProviderRecord>) -> Result<()> {
        for record in records {
            self.upsert(record).await?;
        }
        Ok(())
    }

    pub async fn get_record(&self, record_id: &str) -> Result<ProviderRecord> {
        self.records
            .read()
            .await
            .get(record_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("record {}", record_id)))
    }
}

#[async_trait]
impl ProviderStore for MemoryProviderStore {
    async fn get(&self, category: Category, filter: &RecordFilter) -> Result<Vec<ProviderRecord>> {
        let records = self.records.read().await;
        let mut out: Vec<ProviderRecord> = records
            .values()
            .filter(|r| r.category == category && filter.matches(r))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(out)
    }

    async fn all(&self, category: Category) -> Result<Vec<ProviderRecord>> {
        let records = self.records.read().await;
        let mut out: Vec<ProviderRecord> = records
            .values()
            .filter(|r| r.category == category)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(out)
    }

    async fn upsert(&self, mut record: ProviderRecord) -> Result<()> {
        let mut records = self.records.write().await;
        if let Some(existing) = records.get(&record.id) {
            record.version = existing.version + 1;
        }
        records.insert(record.id.clone(), record);
        Ok(())
    }

    async fn mark_state(&self, record_id: &str, state: RecordState) -> Result<()> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(record_id)
            .ok_or_else(|| Error::NotFound(format!("record {}", record_id)))?;
        record.state = state;
        record.version += 1;
        Ok(())
    }

    async fn compare_and_update(
        &self,
        record_id: &str,
        expected_version: u64,
        patch: RecordPatch,
    ) -> Result<bool> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(record_id)
            .ok_or_else(|| Error::NotFound(format!("record {}", record_id)))?;
        if record.version != expected_version {
            debug!(
                record_id,
                expected_version,
                actual = record.version,
                "CAS conflict, skipping patch"
            );
            return Ok(false);
        }
        for (k, v) in patch.fields {
            record.fields.insert(k, v);
        }
        if let Some(price) = patch.price {
            record.price = price;
        }
        if let Some(score) = patch.quality_score {
            record.quality_score = score;
        }
        record.last_verified = patch.last_verified.unwrap_or_else(Utc::now);
        record.state = RecordState::Fresh;
        record.version += 1;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(id: &str, category: Category, price: f64) -> ProviderRecord {
        ProviderRecord {
            id: id.to_string(),
            category,
            name: id.to_string(),
            price,
            fields: serde_json::Map::new(),
            last_verified: Utc::now(),
            quality_score: 0.7,
            state: RecordState::Fresh,
            version: 0,
        }
    }

    #[tokio::test]
    async fn test_filter_excludes_missing_mandatory_field() {
        let store = MemoryProviderStore::new();
        let mut complete = record("d1", Category::Decor, 900.0);
        complete
            .fields
            .insert("floral_arrangements".to_string(), json!(["roses"]));
        let incomplete = record("d2", Category::Decor, 800.0);
        store.seed(vec![complete, incomplete]).await.unwrap();

        let filter = RecordFilter {
            mandatory_fields: vec!["price".to_string(), "floral_arrangements".to_string()],
            ..RecordFilter::default()
        };
        let got = store.get(Category::Decor, &filter).await.unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].id, "d1");
    }

    #[tokio::test]
    async fn test_filter_excludes_missing_state() {
        let store = MemoryProviderStore::new();
        store.seed(vec![record("v1", Category::Venue, 100.0)]).await.unwrap();
        store.mark_state("v1", RecordState::Missing).await.unwrap();
        let got = store
            .get(Category::Venue, &RecordFilter::default())
            .await
            .unwrap();
        assert!(got.is_empty());
    }

    #[tokio::test]
    async fn test_restriction_list_membership() {
        let store = MemoryProviderStore::new();
        let mut r = record("c1", Category::Catering, 50.0);
        r.fields
            .insert("dietary_options".to_string(), json!(["vegan", "halal"]));
        store.seed(vec![r]).await.unwrap();

        let mut restrictions = serde_json::Map::new();
        restrictions.insert("dietary_options".to_string(), json!("vegan"));
        let filter = RecordFilter {
            restrictions,
            ..RecordFilter::default()
        };
        assert_eq!(store.get(Category::Catering, &filter).await.unwrap().len(), 1);

        let mut restrictions = serde_json::Map::new();
        restrictions.insert("dietary_options".to_string(), json!("kosher"));
        let filter = RecordFilter {
            restrictions,
            ..RecordFilter::default()
        };
        assert!(store.get(Category::Catering, &filter).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_compare_and_update_version_conflict() {
        let store = MemoryProviderStore::new();
        store.seed(vec![record("v1", Category::Venue, 100.0)]).await.unwrap();

        let patch = RecordPatch {
            quality_score: Some(0.9),
            ..RecordPatch::default()
        };
        assert!(store.compare_and_update("v1", 0, patch.clone()).await.unwrap());
        // Second writer holding the stale version loses.
        assert!(!store.compare_and_update("v1", 0, patch).await.unwrap());
        let got = store.all(Category::Venue).await.unwrap();
        assert_eq!(got[0].quality_score, 0.9);
    }
}
