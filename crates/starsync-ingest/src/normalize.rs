//! Field normalizer: scalar repair and order-code derivation.

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;
use sha2::{Digest, Sha256};
use starsync_core::{validate_segment, Measure, NormalizedOrderLine, SourceCategory};

use crate::catalog::Catalog;
use crate::{FlatRow, RawOrderBlock, RawValue};

pub const ORDER_CODE_TAG: &str = "DH-";
const ORDER_CODE_HEX_LEN: usize = 8;
const PRICE_SCALE_THRESHOLD: i64 = 10_000;
const PRICE_SCALE_FACTOR: i64 = 1_000;

fn date_phrase_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)(\d{1,2})\s*tháng\s*(\d{1,2})\s*năm\s*(\d{4})")
            .expect("date phrase regex is valid")
    })
}

fn parenthetical_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\s*\(.*?\)").expect("parenthetical regex is valid"))
}

/// Rewrites a localized phrase such as "ngày 5 tháng 3 năm 2024" to `05/03/2024`.
/// Unrecognized text is returned trimmed but otherwise unchanged.
pub fn normalize_date(text: &str) -> String {
    let Some(caps) = date_phrase_regex().captures(text) else {
        return text.trim().to_string();
    };
    let day: u32 = caps[1].parse().unwrap_or_default();
    let month: u32 = caps[2].parse().unwrap_or_default();
    format!("{day:02}/{month:02}/{}", &caps[3])
}

pub fn normalize_customer_name(catalog: &Catalog, raw: &str) -> String {
    let name = raw.split('(').next().unwrap_or_default().trim();
    catalog.canonical_customer(name).to_string()
}

pub fn normalize_product_name(catalog: &Catalog, raw: &str) -> String {
    let stripped = parenthetical_regex().replace_all(raw, "");
    let name = stripped.trim();
    catalog.canonical_product(name).to_string()
}

fn raw_text(raw: &RawValue) -> String {
    match raw {
        RawValue::Int(v) => v.to_string(),
        RawValue::Float(v) => (v.trunc() as i64).to_string(),
        RawValue::Text(s) => s.clone(),
    }
}

/// Repairs a transcribed quantity: strip separators, keep the two leading digits.
///
/// Text that is empty or not purely digits after cleaning is returned as
/// `Measure::Unrepairable` with the cleaned text.
pub fn repair_number(raw: &RawValue) -> Measure {
    let cleaned: String = raw_text(raw)
        .chars()
        .filter(|c| !matches!(c, '.' | ',') && !c.is_whitespace())
        .collect();
    if cleaned.is_empty() || !cleaned.chars().all(|c| c.is_ascii_digit()) {
        return Measure::Unrepairable(cleaned);
    }
    let leading: String = cleaned.chars().take(2).collect();
    match leading.parse::<i64>() {
        Ok(value) => Measure::Repaired(value),
        Err(_) => Measure::Unrepairable(cleaned),
    }
}

/// Numeric repair followed by the omitted-thousands correction for prices.
pub fn repair_price(raw: &RawValue) -> Measure {
    match repair_number(raw) {
        Measure::Repaired(v) if v < PRICE_SCALE_THRESHOLD => Measure::Repaired(v * PRICE_SCALE_FACTOR),
        other => other,
    }
}

fn repair_optional(raw: Option<&RawValue>, price: bool) -> Measure {
    let empty = RawValue::Text(String::new());
    let raw = raw.unwrap_or(&empty);
    if price {
        repair_price(raw)
    } else {
        repair_number(raw)
    }
}

pub fn line_total(quantity: &Measure, unit_price: &Measure) -> Option<i64> {
    quantity.as_int()?.checked_mul(unit_price.as_int()?)
}

/// Deterministic order code for a `(date, customer)` pair.
pub fn order_code(date: &str, customer: &str) -> String {
    let combined = format!("{date}-{customer}").to_lowercase();
    let digest = hex::encode(Sha256::digest(combined.as_bytes()));
    format!(
        "{ORDER_CODE_TAG}{}",
        digest[..ORDER_CODE_HEX_LEN].to_ascii_uppercase()
    )
}

/// Batch-scoped cache in front of [`order_code`].
#[derive(Debug, Default)]
pub struct OrderCoder {
    cache: HashMap<(String, String), String>,
    hits: usize,
}

impl OrderCoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn code_for(&mut self, date: &str, customer: &str) -> String {
        let key = (date.to_string(), customer.to_string());
        if let Some(code) = self.cache.get(&key) {
            self.hits += 1;
            return code.clone();
        }
        let code = order_code(date, customer);
        self.cache.insert(key, code.clone());
        code
    }

    pub fn cache_hits(&self) -> usize {
        self.hits
    }

    pub fn distinct_orders(&self) -> usize {
        self.cache.len()
    }
}

/// Turns raw blocks or flat rows into [`NormalizedOrderLine`]s for one batch.
pub struct FieldNormalizer<'a> {
    catalog: &'a Catalog,
    coder: OrderCoder,
    next_row: usize,
}

impl<'a> FieldNormalizer<'a> {
    pub fn new(catalog: &'a Catalog) -> Self {
        Self {
            catalog,
            coder: OrderCoder::new(),
            next_row: 0,
        }
    }

    pub fn coder(&self) -> &OrderCoder {
        &self.coder
    }

    fn take_row(&mut self) -> usize {
        let row = self.next_row;
        self.next_row += 1;
        row
    }

    pub fn normalize_block(&mut self, block: &RawOrderBlock) -> Vec<NormalizedOrderLine> {
        let order_date = normalize_date(block.header.date.as_deref().unwrap_or_default());
        let customer_name =
            normalize_customer_name(self.catalog, block.header.customer.as_deref().unwrap_or_default());
        let order_code = self.coder.code_for(&order_date, &customer_name);

        let mut lines = Vec::with_capacity(block.items.len());
        for item in &block.items {
            let quantity = repair_optional(item.quantity.as_ref(), false);
            let unit_price = repair_optional(item.unit_price.as_ref(), true);
            let line_total = line_total(&quantity, &unit_price);
            let source_row = self.take_row();
            lines.push(NormalizedOrderLine {
                order_code: order_code.clone(),
                order_date: order_date.clone(),
                customer_name: customer_name.clone(),
                product_name: normalize_product_name(
                    self.catalog,
                    item.product.as_deref().unwrap_or_default(),
                ),
                unit: item.unit.as_deref().unwrap_or_default().trim().to_string(),
                quantity,
                unit_price,
                line_total,
                segment_hint: None,
                source_category: None,
                source_row,
            });
        }
        lines
    }

    pub fn normalize_flat_row(&mut self, row: &FlatRow) -> NormalizedOrderLine {
        let order_date = normalize_date(row.date.as_deref().unwrap_or_default());
        let customer_name =
            normalize_customer_name(self.catalog, row.customer.as_deref().unwrap_or_default());
        let order_code = match row.order_code.as_deref().map(str::trim) {
            Some(code) if !code.is_empty() => code.to_string(),
            _ => self.coder.code_for(&order_date, &customer_name),
        };
        let quantity = repair_optional(row.quantity.as_ref(), false);
        let unit_price = repair_optional(row.unit_price.as_ref(), true);
        let line_total = line_total(&quantity, &unit_price);
        let source_category = row
            .item_code
            .as_deref()
            .map(str::trim)
            .filter(|code| !code.is_empty())
            .map(|code| SourceCategory {
                item_code: code.to_string(),
                category_code: row.category_code.clone().filter(|c| !c.trim().is_empty()),
                category_name: row.category_name.clone().filter(|c| !c.trim().is_empty()),
            });

        NormalizedOrderLine {
            order_code,
            order_date,
            customer_name,
            product_name: normalize_product_name(self.catalog, row.product.as_deref().unwrap_or_default()),
            unit: row.unit.as_deref().unwrap_or_default().trim().to_string(),
            quantity,
            unit_price,
            line_total,
            segment_hint: row.segment.as_deref().map(|s| validate_segment(s).to_string()),
            source_category,
            source_row: self.take_row(),
        }
    }
}
