//! Fact materialization: join resolved lines against persisted dimension keys.

use std::collections::{HashMap, HashSet};

use chrono::NaiveDate;
use starsync_core::{
    CustomerEntry, DateEntry, FactKey, FactOrderLine, IssueKind, Measure, ProductEntry, ProductKey,
    RowIssue,
};
use tracing::{debug, warn};

use crate::resolve::ResolvedLine;

/// Keys visible in storage after the dimension merge.
#[derive(Debug, Clone, Default)]
pub struct KeySets {
    /// Persisted customer id -> the name it belongs to.
    pub customers: HashMap<String, String>,
    pub products: HashSet<ProductKey>,
    pub dates: HashSet<NaiveDate>,
}

impl KeySets {
    pub fn from_rows(customers: &[CustomerEntry], products: &[ProductEntry], dates: &[DateEntry]) -> Self {
        Self {
            customers: customers
                .iter()
                .map(|c| (c.customer_id.clone(), c.name.clone()))
                .collect(),
            products: products.iter().map(ProductEntry::key).collect(),
            dates: dates.iter().map(|d| d.date).collect(),
        }
    }

    fn missing_reference(&self, line: &ResolvedLine) -> Option<String> {
        let owner = self.customers.get(&line.customer_id);
        if owner != Some(&line.line.customer_name) {
            Some(format!("customer {} ({:?})", line.customer_id, line.line.customer_name))
        } else if !self.products.contains(&line.product) {
            Some(format!("product {}", line.product))
        } else if !self.dates.contains(&line.date) {
            Some(format!("date {}", line.date))
        } else {
            None
        }
    }
}

#[derive(Debug, Default)]
pub struct Materialized {
    pub facts: Vec<FactOrderLine>,
    pub issues: Vec<RowIssue>,
}

fn measure_as_f64(measure: &Measure) -> Option<f64> {
    measure.as_int().map(|v| v as f64)
}

/// Builds one fact per resolved line. Lines with a dangling key are dropped and
/// reported; lines with a non-numeric measure are kept with a null total.
pub fn materialize(lines: &[ResolvedLine], keys: &KeySets) -> Materialized {
    let mut out = Materialized::default();
    for resolved in lines {
        let line = &resolved.line;
        if let Some(reference) = keys.missing_reference(resolved) {
            warn!(row = line.source_row, %reference, "dropping line with unresolved reference");
            out.issues.push(RowIssue::new(
                IssueKind::UnresolvedReference,
                Some(line.source_row),
                format!("{} / {}: no persisted {reference}", line.order_code, line.product_name),
            ));
            continue;
        }
        if !line.total_is_computable() {
            out.issues.push(RowIssue::new(
                IssueKind::NonComputableTotal,
                Some(line.source_row),
                format!(
                    "{} / {}: quantity {:?}, unit price {:?}",
                    line.order_code,
                    line.product_name,
                    line.quantity.to_string(),
                    line.unit_price.to_string()
                ),
            ));
        }
        out.facts.push(FactOrderLine {
            id: None,
            order_code: line.order_code.clone(),
            customer_id: resolved.customer_id.clone(),
            item_code: resolved.product.item_code.clone(),
            unit: resolved.product.unit.clone(),
            order_date: resolved.date,
            quantity: line.quantity.as_int(),
            unit_price: measure_as_f64(&line.unit_price),
            line_total: line.line_total.map(|v| v as f64),
        });
    }
    debug!(facts = out.facts.len(), dropped = out.issues.iter().filter(|i| i.kind.drops_row()).count(), "materialized facts");
    out
}

/// Drops facts whose key is already persisted or repeated earlier in the batch.
pub fn skip_persisted(facts: Vec<FactOrderLine>, persisted: &HashSet<FactKey>) -> (Vec<FactOrderLine>, usize) {
    let mut seen = HashSet::new();
    let before = facts.len();
    let kept: Vec<_> = facts
        .into_iter()
        .filter(|fact| {
            let key = fact.key();
            !persisted.contains(&key) && seen.insert(key)
        })
        .collect();
    let skipped = before - kept.len();
    (kept, skipped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use starsync_core::{CustomerSegment, NormalizedOrderLine};

    fn resolved(customer_id: &str, price: Measure) -> ResolvedLine {
        let quantity = Measure::Repaired(3);
        let line_total = quantity
            .as_int()
            .zip(price.as_int())
            .map(|(q, p)| q * p);
        ResolvedLine {
            line: NormalizedOrderLine {
                order_code: "DH-1A2B3C4D".into(),
                order_date: "01/01/2024".into(),
                customer_name: "Acme".into(),
                product_name: "Ớt".into(),
                unit: "hộp".into(),
                quantity,
                unit_price: price,
                line_total,
                segment_hint: None,
                source_category: None,
                source_row: 4,
            },
            date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            customer_id: customer_id.into(),
            product: ProductKey::new("OT", "hộp"),
        }
    }

    fn keys() -> KeySets {
        KeySets::from_rows(
            &[CustomerEntry {
                customer_id: "CU001".into(),
                name: "Acme".into(),
                segment: CustomerSegment::Store,
            }],
            &[ProductEntry {
                item_code: "OT".into(),
                unit: "hộp".into(),
                name: "Ớt".into(),
                category_code: Some("OT".into()),
                category_name: Some("Ớt".into()),
            }],
            &[DateEntry::from_date(NaiveDate::from_ymd_opt(2024, 1, 1).unwrap())],
        )
    }

    #[test]
    fn facts_carry_total_equal_to_quantity_times_price() {
        let out = materialize(&[resolved("CU001", Measure::Repaired(20_000))], &keys());
        assert!(out.issues.is_empty());
        let fact = &out.facts[0];
        assert_eq!(fact.quantity, Some(3));
        assert_eq!(fact.unit_price, Some(20_000.0));
        assert_eq!(fact.line_total, Some(60_000.0));
        assert_eq!(fact.product_key(), ProductKey::new("OT", "hộp"));
    }

    #[test]
    fn unrepairable_price_keeps_the_fact_with_null_total() {
        let out = materialize(
            &[resolved("CU001", Measure::Unrepairable("hếthàng".into()))],
            &keys(),
        );
        assert_eq!(out.facts.len(), 1);
        assert_eq!(out.facts[0].unit_price, None);
        assert_eq!(out.facts[0].line_total, None);
        assert_eq!(out.issues[0].kind, IssueKind::NonComputableTotal);
    }

    #[test]
    fn dangling_customer_is_dropped_and_reported() {
        let out = materialize(
            &[
                resolved("CU404", Measure::Repaired(20_000)),
                resolved("CU001", Measure::Repaired(20_000)),
            ],
            &keys(),
        );
        assert_eq!(out.facts.len(), 1);
        assert_eq!(out.issues.len(), 1);
        assert_eq!(out.issues[0].kind, IssueKind::UnresolvedReference);
        assert_eq!(out.issues[0].row, Some(4));
    }

    #[test]
    fn customer_id_owned_by_another_name_is_unresolved() {
        let mut line = resolved("CU001", Measure::Repaired(20_000));
        line.line.customer_name = "Beta".into();
        let out = materialize(&[line], &keys());
        assert!(out.facts.is_empty());
        assert_eq!(out.issues[0].kind, IssueKind::UnresolvedReference);
        assert!(out.issues[0].detail.contains("\"Beta\""));
    }

    #[test]
    fn skip_persisted_filters_known_and_repeated_keys() {
        let out = materialize(
            &[
                resolved("CU001", Measure::Repaired(20_000)),
                resolved("CU001", Measure::Repaired(20_000)),
            ],
            &keys(),
        );
        let (kept, skipped) = skip_persisted(out.facts.clone(), &HashSet::new());
        assert_eq!((kept.len(), skipped), (1, 1));

        let persisted: HashSet<_> = out.facts.iter().map(FactOrderLine::key).collect();
        let (kept, skipped) = skip_persisted(out.facts, &persisted);
        assert_eq!((kept.len(), skipped), (0, 2));
    }
}
