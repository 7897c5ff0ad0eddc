use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::Category;

const DEFAULT_STYLE: &str = "classic";

/// Per-category search criteria: the mandatory-field list that drives
/// candidate filtering, plus free-form optional fields.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CategoryCriteria {
    /// Field names a provider record must define to be eligible.
    #[serde(default)]
    pub obligatorios: Vec<String>,
    /// Restriction fields matched against record fields (exact string or
    /// list-membership match).
    #[serde(default)]
    pub restrictions: serde_json::Map<String, serde_json::Value>,
    /// Everything else (atmosphere, services, meal_types, ...).
    #[serde(flatten)]
    pub extras: serde_json::Map<String, serde_json::Value>,
}

/// The published criteria schema consumed as `TaskRequest.criteria`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Criteria {
    pub presupuesto_total: f64,
    #[serde(default)]
    pub guest_count: u32,
    #[serde(default)]
    pub style: String,
    #[serde(default)]
    pub venue: CategoryCriteria,
    #[serde(default)]
    pub catering: CategoryCriteria,
    #[serde(default)]
    pub decor: CategoryCriteria,
}

impl Criteria {
    pub fn category(&self, category: Category) -> &CategoryCriteria {
        match category {
            Category::Venue => &self.venue,
            Category::Catering => &self.catering,
            Category::Decor => &self.decor,
        }
    }

    fn category_mut(&mut self, category: Category) -> &mut CategoryCriteria {
        match category {
            Category::Venue => &mut self.venue,
            Category::Catering => &mut self.catering,
            Category::Decor => &mut self.decor,
        }
    }

    /// Fill schema defaults: mandatory-field lists per category and the
    /// default style. Missing `obligatorios` means the schema defaults,
    /// not "no mandatory fields".
    pub fn normalized(mut self) -> Criteria {
        if self.style.is_empty() {
            self.style = DEFAULT_STYLE.to_string();
        }
        for category in Category::ALL {
            let defaults = default_mandatory(category);
            let cc = self.category_mut(category);
            if cc.obligatorios.is_empty() {
                cc.obligatorios = defaults.iter().map(|s| s.to_string()).collect();
            }
        }
        self
    }

    /// Malformed criteria are surfaced immediately and never retried.
    pub fn validate(&self) -> Result<()> {
        if !self.presupuesto_total.is_finite() || self.presupuesto_total <= 0.0 {
            return Err(Error::Validation(format!(
                "presupuesto_total must be positive, got {}",
                self.presupuesto_total
            )));
        }
        if self.guest_count == 0 {
            return Err(Error::Validation(
                "guest_count must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Schema-default mandatory fields per category. Used both when filling
/// in criteria defaults and when the crawler checks record completeness.
pub fn default_mandatory(category: Category) -> &'static [&'static str] {
    match category {
        Category::Venue => &["price", "capacity"],
        Category::Catering => &["price"],
        Category::Decor => &["price"],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_criteria() -> Criteria {
        Criteria {
            presupuesto_total: 50000.0,
            guest_count: 120,
            style: String::new(),
            venue: CategoryCriteria::default(),
            catering: CategoryCriteria::default(),
            decor: CategoryCriteria::default(),
        }
    }

    #[test]
    fn test_normalized_fills_defaults() {
        let c = base_criteria().normalized();
        assert_eq!(c.style, "classic");
        assert_eq!(c.venue.obligatorios, vec!["price", "capacity"]);
        assert_eq!(c.catering.obligatorios, vec!["price"]);
        assert_eq!(c.decor.obligatorios, vec!["price"]);
    }

    #[test]
    fn test_normalized_keeps_explicit_mandatory() {
        let mut c = base_criteria();
        c.decor.obligatorios = vec!["price".to_string(), "floral_arrangements".to_string()];
        let c = c.normalized();
        assert_eq!(c.decor.obligatorios.len(), 2);
    }

    #[test]
    fn test_validate_rejects_bad_budget() {
        let mut c = base_criteria();
        c.presupuesto_total = 0.0;
        assert!(matches!(c.validate(), Err(Error::Validation(_))));
    }

    #[test]
    fn test_criteria_json_shape() {
        let json = r#"{
            "presupuesto_total": 30000,
            "guest_count": 80,
            "style": "rustic",
            "venue": {"obligatorios": ["price", "capacity"], "atmosphere": "outdoor"}
        }"#;
        let c: Criteria = serde_json::from_str(json).unwrap();
        assert_eq!(c.presupuesto_total, 30000.0);
        assert_eq!(
            c.venue.extras.get("atmosphere").and_then(|v| v.as_str()),
            Some("outdoor")
        );
    }
}
