//! Core domain model for the star-schema order warehouse.

use std::fmt;

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "starsync-core";

/// Customer segment as persisted in `Dim_Customer.PhanKhucKhachHang`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum CustomerSegment {
    Store,
    Supermarket,
    #[default]
    Other,
}

impl CustomerSegment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Store => "Store",
            Self::Supermarket => "Supermarket",
            Self::Other => "Other",
        }
    }

    /// Coerces any label into a valid segment. Source data uses both the English
    /// labels and the Vietnamese headings; everything else becomes `Other`.
    pub fn from_label(label: &str) -> Self {
        match label.trim() {
            "Store" | "Cửa hàng" => Self::Store,
            "Supermarket" | "Siêu thị" => Self::Supermarket,
            _ => Self::Other,
        }
    }
}

impl fmt::Display for CustomerSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Validates a free-text segment label, returning the canonical label.
///
/// Idempotent: a canonical label maps to itself.
pub fn validate_segment(label: &str) -> &'static str {
    CustomerSegment::from_label(label).as_str()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomerEntry {
    pub customer_id: String,
    pub name: String,
    pub segment: CustomerSegment,
}

/// Persisted identity of a product row: `(MaMatHang, DonViTinh)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProductKey {
    pub item_code: String,
    pub unit: String,
}

impl ProductKey {
    pub fn new(item_code: impl Into<String>, unit: impl Into<String>) -> Self {
        Self {
            item_code: item_code.into(),
            unit: unit.into(),
        }
    }
}

impl fmt::Display for ProductKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.item_code, self.unit)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductEntry {
    pub item_code: String,
    pub unit: String,
    pub name: String,
    pub category_code: Option<String>,
    pub category_name: Option<String>,
}

impl ProductEntry {
    pub fn key(&self) -> ProductKey {
        ProductKey::new(self.item_code.clone(), self.unit.clone())
    }

    pub fn is_categorized(&self) -> bool {
        self.category_code.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DateEntry {
    pub date: NaiveDate,
    pub year: i32,
    pub month: u32,
    pub day: u32,
    pub quarter: u32,
}

impl DateEntry {
    pub fn from_date(date: NaiveDate) -> Self {
        let month = date.month();
        Self {
            date,
            year: date.year(),
            month,
            day: date.day(),
            quarter: (month - 1) / 3 + 1,
        }
    }
}

/// A quantity or price after numeric repair.
///
/// `Unrepairable` keeps the cleaned source text so it can be reported verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Measure {
    Repaired(i64),
    Unrepairable(String),
}

impl Measure {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Repaired(v) => Some(*v),
            Self::Unrepairable(_) => None,
        }
    }
}

impl fmt::Display for Measure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Repaired(v) => write!(f, "{v}"),
            Self::Unrepairable(raw) => write!(f, "{raw:?}"),
        }
    }
}

/// Category attributes carried by a flat input row that already knows its product code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceCategory {
    pub item_code: String,
    pub category_code: Option<String>,
    pub category_name: Option<String>,
}

/// One line item after field normalization. Transient: consumed once by the resolver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedOrderLine {
    pub order_code: String,
    /// Normalized date text (`dd/mm/yyyy` when the source phrase was recognized).
    pub order_date: String,
    pub customer_name: String,
    pub product_name: String,
    pub unit: String,
    pub quantity: Measure,
    pub unit_price: Measure,
    pub line_total: Option<i64>,
    #[serde(default)]
    pub segment_hint: Option<String>,
    #[serde(default)]
    pub source_category: Option<SourceCategory>,
    /// Position of the originating row in the input document, for reporting.
    pub source_row: usize,
}

impl NormalizedOrderLine {
    pub fn total_is_computable(&self) -> bool {
        self.line_total.is_some()
    }
}

/// Natural dedup key of a fact row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FactKey {
    pub order_code: String,
    pub item_code: String,
    pub unit: String,
    pub order_date: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactOrderLine {
    /// Assigned by storage; `None` until persisted.
    pub id: Option<i64>,
    pub order_code: String,
    pub customer_id: String,
    pub item_code: String,
    pub unit: String,
    pub order_date: NaiveDate,
    pub quantity: Option<i64>,
    pub unit_price: Option<f64>,
    pub line_total: Option<f64>,
}

impl FactOrderLine {
    pub fn key(&self) -> FactKey {
        FactKey {
            order_code: self.order_code.clone(),
            item_code: self.item_code.clone(),
            unit: self.unit.clone(),
            order_date: self.order_date,
        }
    }

    pub fn product_key(&self) -> ProductKey {
        ProductKey::new(self.item_code.clone(), self.unit.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    MalformedBlock,
    InputValidation,
    Categorization,
    PossibleCustomerAlias,
    DimensionConflict,
    UnresolvedReference,
    NonComputableTotal,
}

impl IssueKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MalformedBlock => "malformed_block",
            Self::InputValidation => "input_validation",
            Self::Categorization => "categorization",
            Self::PossibleCustomerAlias => "possible_customer_alias",
            Self::DimensionConflict => "dimension_conflict",
            Self::UnresolvedReference => "unresolved_reference",
            Self::NonComputableTotal => "non_computable_total",
        }
    }

    /// Whether rows carrying this issue are excluded from the fact output.
    pub fn drops_row(&self) -> bool {
        matches!(
            self,
            Self::MalformedBlock | Self::InputValidation | Self::UnresolvedReference
        )
    }
}

/// Row-level problem recovered locally and aggregated into the run summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowIssue {
    pub kind: IssueKind,
    pub row: Option<usize>,
    pub detail: String,
}

impl RowIssue {
    pub fn new(kind: IssueKind, row: Option<usize>, detail: impl Into<String>) -> Self {
        Self {
            kind,
            row,
            detail: detail.into(),
        }
    }
}

/// Parses the normalized `dd/mm/yyyy` date text, also accepting ISO `yyyy-mm-dd`.
pub fn parse_order_date(text: &str) -> Option<NaiveDate> {
    let text = text.trim();
    NaiveDate::parse_from_str(text, "%d/%m/%Y")
        .or_else(|_| NaiveDate::parse_from_str(text, "%Y-%m-%d"))
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_validation_coerces_unknown_labels() {
        assert_eq!(validate_segment("Store"), "Store");
        assert_eq!(validate_segment("Wholesale"), "Other");
        assert_eq!(validate_segment("Siêu thị"), "Supermarket");
        assert_eq!(validate_segment(validate_segment("Supermarket")), "Supermarket");
    }

    #[test]
    fn date_entry_derives_quarter() {
        let d = NaiveDate::from_ymd_opt(2024, 3, 31).unwrap();
        let entry = DateEntry::from_date(d);
        assert_eq!((entry.year, entry.month, entry.day, entry.quarter), (2024, 3, 31, 1));
        let d = NaiveDate::from_ymd_opt(2024, 10, 1).unwrap();
        assert_eq!(DateEntry::from_date(d).quarter, 4);
    }

    #[test]
    fn order_dates_parse_day_first() {
        assert_eq!(
            parse_order_date("05/03/2024"),
            NaiveDate::from_ymd_opt(2024, 3, 5)
        );
        assert_eq!(
            parse_order_date("2024-03-05"),
            NaiveDate::from_ymd_opt(2024, 3, 5)
        );
        assert_eq!(parse_order_date("ngày mai"), None);
        assert_eq!(parse_order_date("31/02/2024"), None);
    }
}
