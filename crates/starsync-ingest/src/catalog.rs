//! Reference tables loaded from `rules/catalog.yaml`.
//!
//! The catalog is read-only for the lifetime of a run. Anything a batch learns
//! (new customers, newly categorized products) lives in the resolver's own state.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use starsync_core::CustomerSegment;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Catalog {
    #[serde(default)]
    pub customers: Vec<KnownCustomer>,
    /// Variant spelling -> canonical customer name.
    #[serde(default)]
    pub customer_aliases: BTreeMap<String, String>,
    /// Canonical product name -> variant spellings.
    #[serde(default)]
    pub product_spellings: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub products: Vec<KnownProduct>,
    #[serde(default)]
    pub fuzzy_family: Option<FuzzyFamily>,
    #[serde(default)]
    pub sequential_family: Option<SequentialFamily>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KnownCustomer {
    pub name: String,
    pub customer_id: String,
    #[serde(default)]
    pub segment: String,
}

impl KnownCustomer {
    pub fn segment(&self) -> CustomerSegment {
        CustomerSegment::from_label(&self.segment)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct KnownProduct {
    pub name: String,
    pub unit: String,
    pub item_code: String,
    pub category_code: String,
    pub category_name: String,
}

/// Product family categorized by keyword-restricted word overlap (mushrooms).
#[derive(Debug, Clone, Deserialize)]
pub struct FuzzyFamily {
    pub marker: String,
    pub subtypes: Vec<Subtype>,
    /// Sub-types whose keyword alone selects the first known entry with the same unit.
    #[serde(default)]
    pub direct_subtypes: Vec<String>,
    #[serde(default = "default_keyword_bonus")]
    pub keyword_bonus: f64,
    #[serde(default = "default_min_score")]
    pub min_score: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Subtype {
    pub keyword: String,
    #[serde(default)]
    pub aliases: Vec<String>,
}

impl Subtype {
    /// Whether `lowered` (an already lower-cased name) mentions this sub-type.
    pub fn mentioned_in(&self, lowered: &str) -> bool {
        lowered.contains(&self.keyword.to_lowercase())
            || self
                .aliases
                .iter()
                .any(|alias| lowered.contains(&alias.to_lowercase()))
    }
}

/// Product family that receives a fresh per-run sequential item code (vegetables).
#[derive(Debug, Clone, Deserialize)]
pub struct SequentialFamily {
    pub marker: String,
    pub category_code: String,
    pub category_name: String,
    pub code_prefix: String,
}

fn default_keyword_bonus() -> f64 {
    0.3
}

fn default_min_score() -> f64 {
    0.3
}

impl Catalog {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("parsing catalog yaml")
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_workspace_root(root: &Path) -> Result<Self> {
        Self::from_path(root.join("rules").join("catalog.yaml"))
    }

    pub fn canonical_customer<'a>(&'a self, name: &'a str) -> &'a str {
        self.customer_aliases
            .get(name)
            .map(String::as_str)
            .unwrap_or(name)
    }

    pub fn canonical_product<'a>(&'a self, name: &'a str) -> &'a str {
        self.product_spellings
            .iter()
            .find(|(_, variants)| variants.iter().any(|v| v == name))
            .map(|(canonical, _)| canonical.as_str())
            .unwrap_or(name)
    }
}

/// Whether `name` belongs to the family introduced by `marker`: the name starts with
/// the marker or carries it as a whole word (e.g. "Grey Oyster Mushroom").
pub fn belongs_to_family(marker: &str, name: &str) -> bool {
    let marker = marker.trim().to_lowercase();
    if marker.is_empty() {
        return false;
    }
    let lowered = name.trim().to_lowercase();
    if lowered.starts_with(&marker) {
        return true;
    }
    let padded = format!(" {} ", lowered.split_whitespace().collect::<Vec<_>>().join(" "));
    padded.contains(&format!(" {marker} "))
}

#[cfg(test)]
mod tests {
    use super::*;

    const YAML: &str = r#"
customers:
  - { name: "Co-op mart", customer_id: CU009, segment: "Siêu thị" }
customer_aliases:
  Coopmart: "Co-op mart"
product_spellings:
  "Tiêu hột": ["Tiếu hột", "Tiến bột"]
fuzzy_family:
  marker: "nấm"
  subtypes:
    - { keyword: "bào ngư" }
"#;

    #[test]
    fn loads_yaml_with_defaults() {
        let catalog = Catalog::from_yaml_str(YAML).expect("catalog");
        assert_eq!(catalog.customers[0].segment(), CustomerSegment::Supermarket);
        assert_eq!(catalog.canonical_customer("Coopmart"), "Co-op mart");
        assert_eq!(catalog.canonical_customer("Unknown"), "Unknown");
        assert_eq!(catalog.canonical_product("Tiến bột"), "Tiêu hột");
        let family = catalog.fuzzy_family.expect("family");
        assert_eq!(family.keyword_bonus, 0.3);
        assert_eq!(family.min_score, 0.3);
        assert!(catalog.sequential_family.is_none());
    }

    #[test]
    fn family_marker_matches_prefix_or_whole_word() {
        assert!(belongs_to_family("nấm", "Nấm Rơm tươi"));
        assert!(belongs_to_family("mushroom", "Grey Oyster Mushroom"));
        assert!(!belongs_to_family("rau", "Nấm Rơm"));
        assert!(!belongs_to_family("", "anything"));
    }
}
