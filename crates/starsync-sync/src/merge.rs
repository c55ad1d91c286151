//! Incremental dimension merge: append what is new, never overwrite what is persisted.

use std::collections::{HashMap, HashSet};

use chrono::NaiveDate;
use starsync_core::{CustomerEntry, DateEntry, IssueKind, ProductEntry, ProductKey, RowIssue};
use starsync_storage::{StorageError, TableCounts, WarehouseStore};
use tracing::{info, info_span, warn, Instrument};

use crate::resolve::{DatedLine, DimensionCandidates};

/// Keeps the first line per `(order date, customer)` pair. This is a header-level
/// dedup: every later line sharing the pair is dropped, whatever its product.
pub fn dedup_headers(lines: Vec<DatedLine>) -> (Vec<DatedLine>, usize) {
    let mut seen: HashSet<(NaiveDate, String)> = HashSet::new();
    let before = lines.len();
    let kept: Vec<_> = lines
        .into_iter()
        .filter(|dated| seen.insert((dated.date, dated.line.customer_name.clone())))
        .collect();
    let dropped = before - kept.len();
    (kept, dropped)
}

/// Rows to append per dimension plus conflicts found against persisted rows.
#[derive(Debug, Default)]
pub struct MergePlan {
    pub customers: Vec<CustomerEntry>,
    pub products: Vec<ProductEntry>,
    pub dates: Vec<DateEntry>,
    pub conflicts: Vec<RowIssue>,
}

impl MergePlan {
    pub fn is_empty(&self) -> bool {
        self.customers.is_empty() && self.products.is_empty() && self.dates.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
pub struct MergeOutcome {
    pub inserted: TableCounts,
    pub conflicts: Vec<RowIssue>,
}

fn conflict(detail: String) -> RowIssue {
    warn!(%detail, "dimension conflict; keeping persisted row");
    RowIssue::new(IssueKind::DimensionConflict, None, detail)
}

/// Set difference `candidates - persisted` per dimension.
pub fn plan_merge(
    candidates: &DimensionCandidates,
    customers: &[CustomerEntry],
    products: &[ProductEntry],
    dates: &[DateEntry],
) -> MergePlan {
    let mut plan = MergePlan::default();

    let by_name: HashMap<&str, &CustomerEntry> =
        customers.iter().map(|c| (c.name.as_str(), c)).collect();
    let by_id: HashMap<&str, &CustomerEntry> =
        customers.iter().map(|c| (c.customer_id.as_str(), c)).collect();
    for candidate in &candidates.customers {
        match (
            by_name.get(candidate.name.as_str()),
            by_id.get(candidate.customer_id.as_str()),
        ) {
            (None, None) => plan.customers.push(candidate.clone()),
            (Some(existing), _) if *existing != candidate => plan.conflicts.push(conflict(format!(
                "customer {:?}: persisted as {} ({}), batch has {} ({})",
                candidate.name,
                existing.customer_id,
                existing.segment,
                candidate.customer_id,
                candidate.segment
            ))),
            (None, Some(existing)) => plan.conflicts.push(conflict(format!(
                "customer id {} already belongs to {:?}; batch customer {:?} not stored",
                candidate.customer_id, existing.name, candidate.name
            ))),
            _ => {}
        }
    }

    let persisted_products: HashMap<ProductKey, &ProductEntry> =
        products.iter().map(|p| (p.key(), p)).collect();
    for candidate in &candidates.products {
        match persisted_products.get(&candidate.key()) {
            None => plan.products.push(candidate.clone()),
            Some(existing) if *existing != candidate => plan.conflicts.push(conflict(format!(
                "product {}: persisted as {:?} [{}], batch has {:?} [{}]",
                candidate.key(),
                existing.name,
                existing.category_code.as_deref().unwrap_or("-"),
                candidate.name,
                candidate.category_code.as_deref().unwrap_or("-")
            ))),
            Some(_) => {}
        }
    }

    let persisted_dates: HashSet<_> = dates.iter().map(|d| d.date).collect();
    plan.dates = candidates
        .dates
        .iter()
        .filter(|d| !persisted_dates.contains(&d.date))
        .copied()
        .collect();

    plan
}

pub struct IncrementalMerger<'a> {
    store: &'a dyn WarehouseStore,
}

impl<'a> IncrementalMerger<'a> {
    pub fn new(store: &'a dyn WarehouseStore) -> Self {
        Self { store }
    }

    /// Re-reads persisted keys per dimension, then appends only the new rows.
    /// `customer_counter` is the highest customer number allocated by the batch.
    pub async fn merge(
        &self,
        candidates: &DimensionCandidates,
        customer_counter: u32,
    ) -> Result<MergeOutcome, StorageError> {
        let span = info_span!(
            "merge_dimensions",
            customers = candidates.customers.len(),
            products = candidates.products.len(),
            dates = candidates.dates.len()
        );
        async move {
            let customers = self.store.persisted_customers().await?;
            let products = self.store.persisted_products().await?;
            let dates = self.store.persisted_dates().await?;
            let plan = plan_merge(candidates, &customers, &products, &dates);

            let mut inserted = TableCounts::default();
            if !plan.customers.is_empty() {
                inserted.customers = self
                    .store
                    .append_customers(&plan.customers, customer_counter)
                    .await?;
            }
            if !plan.products.is_empty() {
                inserted.products = self.store.append_products(&plan.products).await?;
            }
            if !plan.dates.is_empty() {
                inserted.dates = self.store.append_dates(&plan.dates).await?;
            }
            info!(
                customers = inserted.customers,
                products = inserted.products,
                dates = inserted.dates,
                conflicts = plan.conflicts.len(),
                "merged dimensions"
            );
            Ok(MergeOutcome {
                inserted,
                conflicts: plan.conflicts,
            })
        }
        .instrument(span)
        .await
    }
}
