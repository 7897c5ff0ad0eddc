use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Provider categories the planner coordinates. Declaration order is also
/// the fixed deliberation/tie-break order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Venue,
    Catering,
    Decor,
}

impl Category {
    pub const ALL: [Category; 3] = [Category::Venue, Category::Catering, Category::Decor];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Venue => "venue",
            Category::Catering => "catering",
            Category::Decor => "decor",
        }
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a crawled record. `Missing` records are kept in the
/// store but never returned as candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordState {
    Fresh,
    Stale,
    Missing,
}

/// A crawled provider entry (venue, caterer, or decorator).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderRecord {
    pub id: String,
    pub category: Category,
    pub name: String,
    pub price: f64,
    /// Free-form extension fields (capacity, services, dietary_options, ...).
    #[serde(default)]
    pub fields: serde_json::Map<String, serde_json::Value>,
    pub last_verified: DateTime<Utc>,
    pub quality_score: f64,
    #[serde(default = "default_record_state")]
    pub state: RecordState,
    /// Bumped on every write; used for compare-and-set updates.
    #[serde(default)]
    pub version: u64,
}

fn default_record_state() -> RecordState {
    RecordState::Fresh
}

impl ProviderRecord {
    /// A record missing any mandatory field for its category is never a
    /// candidate. `price` is an intrinsic field and always present.
    pub fn has_mandatory(&self, mandatory: &[String]) -> bool {
        mandatory
            .iter()
            .all(|f| f == "price" || self.fields.contains_key(f))
    }

    pub fn field_str(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(|v| v.as_str())
    }

    pub fn field_f64(&self, name: &str) -> Option<f64> {
        self.fields.get(name).and_then(|v| v.as_f64())
    }

    /// Minimum-spend floor declared by the provider, if any
    /// (e.g. a `decor_price.minimum_spend` style field).
    pub fn minimum_spend(&self) -> Option<f64> {
        if let Some(v) = self.field_f64("minimum_spend") {
            return Some(v);
        }
        self.fields
            .values()
            .filter_map(|v| v.get("minimum_spend").and_then(|m| m.as_f64()))
            .next()
    }
}

/// Per-category budget split. The planner never lets
/// `venue + catering + decor` exceed the total budget.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct BudgetAllocation {
    pub venue: f64,
    pub catering: f64,
    pub decor: f64,
}

impl BudgetAllocation {
    pub fn total(&self) -> f64 {
        self.venue + self.catering + self.decor
    }

    pub fn get(&self, category: Category) -> f64 {
        match category {
            Category::Venue => self.venue,
            Category::Catering => self.catering,
            Category::Decor => self.decor,
        }
    }

    pub fn set(&mut self, category: Category, amount: f64) {
        match category {
            Category::Venue => self.venue = amount,
            Category::Catering => self.catering = amount,
            Category::Decor => self.decor = amount,
        }
    }

    /// Scale every share down proportionally so the sum fits under `cap`.
    /// No-op when already within the cap.
    pub fn scaled_to(&self, cap: f64) -> BudgetAllocation {
        let total = self.total();
        if total <= cap || total <= 0.0 {
            return *self;
        }
        let factor = cap / total;
        BudgetAllocation {
            venue: self.venue * factor,
            catering: self.catering * factor,
            decor: self.decor * factor,
        }
    }
}

/// Structured outcome of one category search.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub category: Category,
    pub chosen: ProviderRecord,
    #[serde(default)]
    pub alternatives: Vec<ProviderRecord>,
    /// Free-text recommendation from the generation service. Informational
    /// only; never alters the structured candidate.
    #[serde(default)]
    pub narrative: String,
}

/// One category slot in the final plan. Categories that could not be
/// resolved are flagged explicitly, never silently dropped.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum PlanEntry {
    Resolved { result: TaskResult },
    Unresolved { reason: String },
}

impl PlanEntry {
    pub fn is_resolved(&self) -> bool {
        matches!(self, PlanEntry::Resolved { .. })
    }
}

/// The aggregated, best-effort output of a planning session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub session_id: String,
    pub venue: PlanEntry,
    pub catering: PlanEntry,
    pub decor: PlanEntry,
    pub budget: BudgetAllocation,
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl Plan {
    pub fn entry(&self, category: Category) -> &PlanEntry {
        match category {
            Category::Venue => &self.venue,
            Category::Catering => &self.catering,
            Category::Decor => &self.decor,
        }
    }
}
