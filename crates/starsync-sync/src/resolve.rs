//! Dimension resolution: business key -> surrogate key for customers, products and dates.

use std::collections::{HashMap, HashSet};

use chrono::NaiveDate;
use sha2::{Digest, Sha256};
use starsync_core::{
    CustomerEntry, CustomerSegment, DateEntry, IssueKind, NormalizedOrderLine, ProductEntry,
    ProductKey, RowIssue,
};
use starsync_ingest::catalog::{belongs_to_family, Catalog, FuzzyFamily, SequentialFamily};
use starsync_storage::DimensionSnapshot;
use strsim::jaro_winkler;
use tracing::{debug, warn};

pub const CUSTOMER_ID_PREFIX: &str = "CU";
pub const FALLBACK_ITEM_PREFIX: &str = "SP-";
const ALIAS_REVIEW_THRESHOLD: f64 = 0.9;

/// A validated line together with its parsed calendar date.
#[derive(Debug, Clone)]
pub struct DatedLine {
    pub line: NormalizedOrderLine,
    pub date: NaiveDate,
}

#[derive(Debug, Clone)]
pub struct ResolvedLine {
    pub line: NormalizedOrderLine,
    pub date: NaiveDate,
    pub customer_id: String,
    pub product: ProductKey,
}

/// How a product's category was determined.
#[derive(Debug, Clone, PartialEq)]
pub enum Categorization {
    Exact,
    Source,
    Direct { matched: String },
    Fuzzy { matched: String, score: f64 },
    Sequential,
    Uncategorized,
}

/// Candidate dimension rows collected over a batch, unique per key, in first-seen order.
#[derive(Debug, Clone, Default)]
pub struct DimensionCandidates {
    pub customers: Vec<CustomerEntry>,
    pub products: Vec<ProductEntry>,
    pub dates: Vec<DateEntry>,
    seen_customers: HashMap<String, usize>,
    seen_products: HashMap<ProductKey, usize>,
    seen_dates: HashSet<NaiveDate>,
}

impl DimensionCandidates {
    fn push_customer(&mut self, entry: &CustomerEntry) {
        if !self.seen_customers.contains_key(&entry.name) {
            self.seen_customers
                .insert(entry.name.clone(), self.customers.len());
            self.customers.push(entry.clone());
        }
    }

    /// Returns the already-collected row when `entry` shares its key but differs.
    fn push_product(&mut self, entry: &ProductEntry) -> Option<&ProductEntry> {
        let key = entry.key();
        match self.seen_products.get(&key) {
            Some(&idx) if self.products[idx] != *entry => Some(&self.products[idx]),
            Some(_) => None,
            None => {
                self.seen_products.insert(key, self.products.len());
                self.products.push(entry.clone());
                None
            }
        }
    }

    fn push_date(&mut self, date: NaiveDate) {
        if self.seen_dates.insert(date) {
            self.dates.push(DateEntry::from_date(date));
        }
    }
}

#[derive(Debug, Default)]
pub struct Resolution {
    pub resolved: Vec<ResolvedLine>,
    pub candidates: DimensionCandidates,
    pub issues: Vec<RowIssue>,
    pub new_customers: usize,
}

fn product_lookup_key(name: &str, unit: &str) -> (String, String) {
    (name.trim().to_lowercase(), unit.trim().to_string())
}

fn customer_number(customer_id: &str) -> Option<u32> {
    customer_id
        .strip_prefix(CUSTOMER_ID_PREFIX)
        .and_then(|digits| digits.parse().ok())
}

/// Deterministic item code for a product no rule could categorize.
pub fn fallback_item_code(name: &str, unit: &str) -> String {
    let combined = format!("{}|{}", name.trim().to_lowercase(), unit.trim().to_lowercase());
    let digest = hex::encode(Sha256::digest(combined.as_bytes()));
    format!("{FALLBACK_ITEM_PREFIX}{}", digest[..6].to_ascii_uppercase())
}

fn word_set(lowered: &str) -> HashSet<&str> {
    lowered.split_whitespace().collect()
}

/// Word-overlap ratio: shared words over the larger word set.
pub fn overlap_score(a: &str, b: &str) -> f64 {
    let (a, b) = (a.to_lowercase(), b.to_lowercase());
    let (wa, wb) = (word_set(&a), word_set(&b));
    let denom = wa.len().max(wb.len());
    if denom == 0 {
        return 0.0;
    }
    wa.intersection(&wb).count() as f64 / denom as f64
}

/// Mutable per-run state: everything a batch learns lives here, never in the catalog.
#[derive(Debug)]
pub struct ResolverState {
    customers: HashMap<String, CustomerEntry>,
    /// Catalog customers whose catalog id is persisted under another name, with that owner.
    displaced_customers: HashMap<String, (CustomerEntry, String)>,
    last_customer_no: u32,
    products: HashMap<(String, String), ProductEntry>,
    /// Categorized catalog and persisted products, the only candidates for fuzzy matching.
    reference_products: Vec<ProductEntry>,
    taken_item_codes: HashSet<String>,
    sequential_next: u32,
}

impl ResolverState {
    /// Seeds from the catalog, then from persisted rows (persisted rows win).
    pub fn seed(catalog: &Catalog, snapshot: &DimensionSnapshot) -> Self {
        let id_owners: HashMap<&str, &str> = snapshot
            .customers
            .iter()
            .map(|c| (c.customer_id.as_str(), c.name.as_str()))
            .collect();
        let mut customers = HashMap::new();
        let mut displaced_customers = HashMap::new();
        for known in &catalog.customers {
            let entry = CustomerEntry {
                customer_id: known.customer_id.clone(),
                name: known.name.clone(),
                segment: known.segment(),
            };
            match id_owners.get(known.customer_id.as_str()) {
                Some(owner) if *owner != known.name => {
                    displaced_customers.insert(known.name.clone(), (entry, owner.to_string()));
                }
                _ => {
                    customers.insert(known.name.clone(), entry);
                }
            }
        }
        for persisted in &snapshot.customers {
            displaced_customers.remove(&persisted.name);
            customers.insert(persisted.name.clone(), persisted.clone());
        }
        let last_customer_no = customers
            .values()
            .filter_map(|c| customer_number(&c.customer_id))
            .chain(std::iter::once(snapshot.customer_counter))
            .max()
            .unwrap_or_default();

        let mut reference_products: Vec<ProductEntry> = catalog
            .products
            .iter()
            .map(|p| ProductEntry {
                item_code: p.item_code.clone(),
                unit: p.unit.clone(),
                name: p.name.clone(),
                category_code: Some(p.category_code.clone()),
                category_name: Some(p.category_name.clone()),
            })
            .collect();
        reference_products.extend(snapshot.products.iter().cloned());

        let mut products = HashMap::new();
        let mut taken_item_codes = HashSet::new();
        for entry in &reference_products {
            products.insert(product_lookup_key(&entry.name, &entry.unit), entry.clone());
            taken_item_codes.insert(entry.item_code.clone());
        }
        reference_products.retain(ProductEntry::is_categorized);

        Self {
            customers,
            displaced_customers,
            last_customer_no,
            products,
            reference_products,
            taken_item_codes,
            sequential_next: 1,
        }
    }

    pub fn last_customer_no(&self) -> u32 {
        self.last_customer_no
    }

    fn allocate_customer_id(&mut self) -> String {
        self.last_customer_no += 1;
        format!("{CUSTOMER_ID_PREFIX}{:03}", self.last_customer_no)
    }

    fn next_sequential_code(&mut self, prefix: &str) -> String {
        loop {
            let code = format!("{prefix}{:02}", self.sequential_next);
            self.sequential_next += 1;
            if !self.taken_item_codes.contains(&code) {
                return code;
            }
        }
    }
}

pub struct DimensionResolver<'a> {
    catalog: &'a Catalog,
    state: ResolverState,
}

impl<'a> DimensionResolver<'a> {
    pub fn new(catalog: &'a Catalog, snapshot: &DimensionSnapshot) -> Self {
        Self {
            catalog,
            state: ResolverState::seed(catalog, snapshot),
        }
    }

    pub fn state(&self) -> &ResolverState {
        &self.state
    }

    /// Resolves a customer by canonical name, allocating a new id on first sight.
    /// Returns the entry and whether it was newly allocated. A catalog customer whose
    /// catalog id is persisted under another name keeps its catalog segment but gets a new id.
    pub fn resolve_customer(&mut self, name: &str, segment_hint: Option<&str>) -> (CustomerEntry, bool) {
        if let Some(entry) = self.state.customers.get(name) {
            return (entry.clone(), false);
        }
        let segment = match self.state.displaced_customers.get(name) {
            Some((catalog_entry, _)) => catalog_entry.segment,
            None => segment_hint
                .map(CustomerSegment::from_label)
                .unwrap_or_default(),
        };
        let entry = CustomerEntry {
            customer_id: self.state.allocate_customer_id(),
            name: name.to_string(),
            segment,
        };
        debug!(customer = name, id = %entry.customer_id, "allocated customer id");
        self.state.customers.insert(name.to_string(), entry.clone());
        (entry, true)
    }

    fn alias_suspect(&self, name: &str) -> Option<(String, f64)> {
        let lowered = name.to_lowercase();
        self.state
            .customers
            .values()
            .filter(|c| c.name != name)
            .map(|c| (c.name.clone(), jaro_winkler(&lowered, &c.name.to_lowercase())))
            .filter(|(_, score)| *score >= ALIAS_REVIEW_THRESHOLD)
            .max_by(|a, b| a.1.total_cmp(&b.1))
    }

    /// Exact, then source-provided, then family rules, then the fallback code.
    pub fn resolve_product(&mut self, line: &NormalizedOrderLine) -> (ProductEntry, Categorization) {
        let key = product_lookup_key(&line.product_name, &line.unit);
        if let Some(entry) = self.state.products.get(&key) {
            return (entry.clone(), Categorization::Exact);
        }

        let (entry, via) = self.categorize_new(line);
        self.state.taken_item_codes.insert(entry.item_code.clone());
        self.state.products.insert(key, entry.clone());
        (entry, via)
    }

    fn categorize_new(&mut self, line: &NormalizedOrderLine) -> (ProductEntry, Categorization) {
        let name = line.product_name.as_str();
        let unit = line.unit.as_str();

        if let Some(source) = &line.source_category {
            return (
                ProductEntry {
                    item_code: source.item_code.clone(),
                    unit: unit.to_string(),
                    name: name.to_string(),
                    category_code: source.category_code.clone(),
                    category_name: source.category_name.clone(),
                },
                Categorization::Source,
            );
        }

        let catalog = self.catalog;
        if let Some(family) = catalog
            .fuzzy_family
            .as_ref()
            .filter(|f| belongs_to_family(&f.marker, name))
        {
            if let Some(found) = self.match_fuzzy_family(family, name, unit) {
                return found;
            }
        } else if let Some(family) = catalog
            .sequential_family
            .as_ref()
            .filter(|f| belongs_to_family(&f.marker, name))
        {
            return (self.assign_sequential(family, name, unit), Categorization::Sequential);
        }

        (
            ProductEntry {
                item_code: fallback_item_code(name, unit),
                unit: unit.to_string(),
                name: name.to_string(),
                category_code: None,
                category_name: None,
            },
            Categorization::Uncategorized,
        )
    }

    fn match_fuzzy_family(
        &self,
        family: &FuzzyFamily,
        name: &str,
        unit: &str,
    ) -> Option<(ProductEntry, Categorization)> {
        let lowered = name.to_lowercase();
        let subtype = family.subtypes.iter().find(|s| s.mentioned_in(&lowered))?;
        let keyword = subtype.keyword.to_lowercase();

        if family
            .direct_subtypes
            .iter()
            .any(|d| d.to_lowercase() == keyword)
        {
            if let Some(hit) = self
                .state
                .reference_products
                .iter()
                .find(|p| p.unit == unit && p.name.to_lowercase().contains(&keyword))
            {
                let via = Categorization::Direct {
                    matched: hit.name.clone(),
                };
                return Some((hit.clone(), via));
            }
        }

        let mut best: Option<(&ProductEntry, f64)> = None;
        for candidate in &self.state.reference_products {
            let candidate_lowered = candidate.name.to_lowercase();
            if candidate.unit != unit || !subtype.mentioned_in(&candidate_lowered) {
                continue;
            }
            let mut score = overlap_score(&lowered, &candidate_lowered);
            if candidate_lowered.contains(&keyword) {
                score += family.keyword_bonus;
            }
            if best.map_or(true, |(_, top)| score > top) {
                best = Some((candidate, score));
            }
        }

        let (matched, score) = best.filter(|(_, score)| *score > family.min_score)?;
        debug!(product = name, matched = %matched.name, score, "fuzzy categorized product");
        Some((
            matched.clone(),
            Categorization::Fuzzy {
                matched: matched.name.clone(),
                score,
            },
        ))
    }

    fn assign_sequential(&mut self, family: &SequentialFamily, name: &str, unit: &str) -> ProductEntry {
        ProductEntry {
            item_code: self.state.next_sequential_code(&family.code_prefix),
            unit: unit.to_string(),
            name: name.to_string(),
            category_code: Some(family.category_code.clone()),
            category_name: Some(family.category_name.clone()),
        }
    }

    /// Resolves every line, collecting candidate dimension rows and row issues.
    pub fn resolve(&mut self, lines: Vec<DatedLine>) -> Resolution {
        let mut out = Resolution::default();
        let mut flagged_uncategorized: HashSet<ProductKey> = HashSet::new();

        for DatedLine { line, date } in lines {
            let (customer, is_new) =
                self.resolve_customer(&line.customer_name, line.segment_hint.as_deref());
            if is_new {
                out.new_customers += 1;
                if let Some((catalog_entry, owner)) = self.state.displaced_customers.get(&customer.name) {
                    warn!(
                        customer = %customer.name,
                        catalog_id = %catalog_entry.customer_id,
                        id = %customer.customer_id,
                        "catalog customer id already persisted for another customer"
                    );
                    out.issues.push(RowIssue::new(
                        IssueKind::DimensionConflict,
                        Some(line.source_row),
                        format!(
                            "catalog id {} for {:?} already belongs to {owner:?}; allocated {}",
                            catalog_entry.customer_id, customer.name, customer.customer_id
                        ),
                    ));
                }
                if let Some((similar, score)) = self.alias_suspect(&customer.name) {
                    out.issues.push(RowIssue::new(
                        IssueKind::PossibleCustomerAlias,
                        Some(line.source_row),
                        format!(
                            "new customer {:?} resembles {similar:?} (score {score:.2})",
                            customer.name
                        ),
                    ));
                }
            }
            out.candidates.push_customer(&customer);

            let (product, _) = self.resolve_product(&line);
            if !product.is_categorized() && flagged_uncategorized.insert(product.key()) {
                warn!(product = %line.product_name, unit = %line.unit, "could not categorize product");
                out.issues.push(RowIssue::new(
                    IssueKind::Categorization,
                    Some(line.source_row),
                    format!(
                        "product {:?} ({}) is uncategorized; stored as {}",
                        line.product_name, line.unit, product.item_code
                    ),
                ));
            }
            if let Some(existing) = out.candidates.push_product(&product) {
                out.issues.push(RowIssue::new(
                    IssueKind::DimensionConflict,
                    Some(line.source_row),
                    format!(
                        "product {} is {:?} earlier in this batch but {:?} here; keeping the first",
                        product.key(),
                        existing.name,
                        product.name
                    ),
                ));
            }
            out.candidates.push_date(date);

            out.resolved.push(ResolvedLine {
                customer_id: customer.customer_id,
                product: product.key(),
                date,
                line,
            });
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use starsync_core::Measure;

    const CATALOG: &str = r#"
customers:
  - { name: "Co-op mart", customer_id: CU009, segment: "Supermarket" }
  - { name: "Acme", customer_id: CU002, segment: "Store" }
products:
  - { name: "Oyster Mushroom fresh", unit: "pack", item_code: BN01, category_code: BN, category_name: "Oyster mushroom" }
  - { name: "Oyster Mushroom dried", unit: "pack", item_code: BN02, category_code: BN, category_name: "Oyster mushroom" }
  - { name: "Shiitake Mushroom", unit: "pack", item_code: H, category_code: H, category_name: "Shiitake" }
  - { name: "Straw Mushroom fresh", unit: "kg", item_code: R01, category_code: R, category_name: "Straw mushroom" }
fuzzy_family:
  marker: "mushroom"
  subtypes:
    - { keyword: "ear-fungus" }
    - { keyword: "oyster" }
    - { keyword: "straw" }
    - { keyword: "shiitake" }
  direct_subtypes: ["shiitake"]
sequential_family:
  marker: "vegetable"
  category_code: RAU
  category_name: "Vegetables"
  code_prefix: RAU
"#;

    fn catalog() -> Catalog {
        Catalog::from_yaml_str(CATALOG).expect("catalog")
    }

    fn line(customer: &str, product: &str, unit: &str) -> NormalizedOrderLine {
        NormalizedOrderLine {
            order_code: "DH-TEST".into(),
            order_date: "01/01/2024".into(),
            customer_name: customer.into(),
            product_name: product.into(),
            unit: unit.into(),
            quantity: Measure::Repaired(1),
            unit_price: Measure::Repaired(10_000),
            line_total: Some(10_000),
            segment_hint: None,
            source_category: None,
            source_row: 0,
        }
    }

    fn dated(l: NormalizedOrderLine) -> DatedLine {
        DatedLine {
            line: l,
            date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
        }
    }

    #[test]
    fn new_customers_get_next_sequential_id_and_default_segment() {
        let catalog = catalog();
        let mut resolver = DimensionResolver::new(&catalog, &DimensionSnapshot::default());
        let (known, is_new) = resolver.resolve_customer("Co-op mart", None);
        assert!(!is_new);
        assert_eq!(known.segment, CustomerSegment::Supermarket);

        let (first, is_new) = resolver.resolve_customer("Bếp Nhà Mơ", None);
        assert!(is_new);
        assert_eq!(first.customer_id, "CU010");
        assert_eq!(first.segment, CustomerSegment::Other);

        let (again, is_new) = resolver.resolve_customer("Bếp Nhà Mơ", None);
        assert!(!is_new);
        assert_eq!(again.customer_id, "CU010");

        let (hinted, _) = resolver.resolve_customer("Big C", Some("Wholesale"));
        assert_eq!(hinted.customer_id, "CU011");
        assert_eq!(hinted.segment, CustomerSegment::Other);
    }

    #[test]
    fn persisted_counter_outranks_visible_ids() {
        let catalog = catalog();
        let snapshot = DimensionSnapshot {
            customer_counter: 40,
            ..Default::default()
        };
        let mut resolver = DimensionResolver::new(&catalog, &snapshot);
        let (entry, _) = resolver.resolve_customer("Someone", None);
        assert_eq!(entry.customer_id, "CU041");
        assert_eq!(resolver.state().last_customer_no(), 41);
    }

    #[test]
    fn fuzzy_match_picks_best_overlap_within_subtype() {
        let catalog = catalog();
        let mut resolver = DimensionResolver::new(&catalog, &DimensionSnapshot::default());
        let (entry, via) = resolver.resolve_product(&line("Acme", "Grey Oyster Mushroom", "pack"));
        assert_eq!(entry.item_code, "BN01");
        assert_eq!(entry.category_code.as_deref(), Some("BN"));
        let Categorization::Fuzzy { matched, score } = via else {
            panic!("expected fuzzy match, got {via:?}");
        };
        assert_eq!(matched, "Oyster Mushroom fresh");
        assert!(score > 0.3);

        let (again, via) = resolver.resolve_product(&line("Acme", "Grey Oyster Mushroom", "pack"));
        assert_eq!(again.item_code, "BN01");
        assert_eq!(via, Categorization::Exact);
    }

    #[test]
    fn fuzzy_match_requires_same_unit() {
        let catalog = catalog();
        let mut resolver = DimensionResolver::new(&catalog, &DimensionSnapshot::default());
        let (entry, via) = resolver.resolve_product(&line("Acme", "Grey Oyster Mushroom", "kg"));
        assert_eq!(via, Categorization::Uncategorized);
        assert!(entry.item_code.starts_with(FALLBACK_ITEM_PREFIX));
        assert_eq!(entry.category_code, None);
        assert_eq!(entry.item_code, fallback_item_code("grey oyster mushroom", "KG"));
    }

    #[test]
    fn direct_subtype_takes_first_same_unit_entry() {
        let catalog = catalog();
        let mut resolver = DimensionResolver::new(&catalog, &DimensionSnapshot::default());
        let (entry, via) = resolver.resolve_product(&line("Acme", "Dried Shiitake Mushroom", "pack"));
        assert_eq!(entry.item_code, "H");
        assert!(matches!(via, Categorization::Direct { .. }));
    }

    #[test]
    fn vegetables_get_fresh_codes_per_resolver_and_skip_taken_ones() {
        let catalog = catalog();
        let snapshot = DimensionSnapshot {
            products: vec![ProductEntry {
                item_code: "RAU01".into(),
                unit: "bunch".into(),
                name: "vegetable spinach".into(),
                category_code: Some("RAU".into()),
                category_name: Some("Vegetables".into()),
            }],
            ..Default::default()
        };
        let mut resolver = DimensionResolver::new(&catalog, &snapshot);
        let (persisted, via) = resolver.resolve_product(&line("Acme", "vegetable spinach", "bunch"));
        assert_eq!((persisted.item_code.as_str(), via), ("RAU01", Categorization::Exact));

        let (kale, via) = resolver.resolve_product(&line("Acme", "vegetable kale", "bunch"));
        assert_eq!((kale.item_code.as_str(), via), ("RAU02", Categorization::Sequential));
        let (leek, _) = resolver.resolve_product(&line("Acme", "vegetable leek", "kg"));
        assert_eq!(leek.item_code, "RAU03");
        let (kale_again, _) = resolver.resolve_product(&line("Acme", "vegetable kale", "bunch"));
        assert_eq!(kale_again.item_code, "RAU02");

        let mut fresh = DimensionResolver::new(&catalog, &DimensionSnapshot::default());
        let (kale, _) = fresh.resolve_product(&line("Acme", "vegetable kale", "bunch"));
        assert_eq!(kale.item_code, "RAU01");
    }

    #[test]
    fn resolve_collects_unique_candidates_and_reports_uncategorized() {
        let catalog = catalog();
        let mut resolver = DimensionResolver::new(&catalog, &DimensionSnapshot::default());
        let out = resolver.resolve(vec![
            dated(line("Acme", "Oyster Mushroom fresh", "pack")),
            dated(line("Acme", "Honey", "jar")),
            dated(line("Acme", "Honey", "jar")),
            dated(line("Acmee", "Oyster Mushroom fresh", "pack")),
        ]);
        assert_eq!(out.resolved.len(), 4);
        assert_eq!(out.candidates.customers.len(), 2);
        assert_eq!(out.candidates.products.len(), 2);
        assert_eq!(out.candidates.dates.len(), 1);
        assert_eq!(out.new_customers, 1);

        let kinds: Vec<_> = out.issues.iter().map(|i| i.kind).collect();
        assert_eq!(
            kinds,
            vec![IssueKind::Categorization, IssueKind::PossibleCustomerAlias]
        );
    }

    #[test]
    fn catalog_id_persisted_under_another_name_is_reallocated() {
        let catalog = catalog();
        let snapshot = DimensionSnapshot {
            customers: vec![CustomerEntry {
                customer_id: "CU002".into(),
                name: "Foo".into(),
                segment: CustomerSegment::Other,
            }],
            customer_counter: 2,
            ..Default::default()
        };
        let mut resolver = DimensionResolver::new(&catalog, &snapshot);
        let out = resolver.resolve(vec![
            dated(line("Acme", "Oyster Mushroom fresh", "pack")),
            dated(line("Acme", "Oyster Mushroom dried", "pack")),
        ]);

        let acme = &out.candidates.customers[0];
        assert_eq!(acme.name, "Acme");
        assert_eq!(acme.customer_id, "CU010");
        assert_eq!(acme.segment, CustomerSegment::Store);
        assert!(out.resolved.iter().all(|r| r.customer_id == "CU010"));
        assert_eq!(out.new_customers, 1);
        let conflicts: Vec<_> = out
            .issues
            .iter()
            .filter(|i| i.kind == IssueKind::DimensionConflict)
            .collect();
        assert_eq!(conflicts.len(), 1);
        assert!(conflicts[0].detail.contains("CU002"));

        let (foo, is_new) = resolver.resolve_customer("Foo", None);
        assert!(!is_new);
        assert_eq!(foo.customer_id, "CU002");
    }

    #[test]
    fn uncategorized_persisted_rows_are_never_match_targets() {
        let catalog = catalog();
        let stored = |name: &str, unit: &str| ProductEntry {
            item_code: fallback_item_code(name, unit),
            unit: unit.into(),
            name: name.into(),
            category_code: None,
            category_name: None,
        };
        let snapshot = DimensionSnapshot {
            products: vec![
                stored("Oyster Mushroom grey", "pack"),
                stored("Shiitake Mushroom sliced", "kg"),
            ],
            ..Default::default()
        };
        let mut resolver = DimensionResolver::new(&catalog, &snapshot);

        let (entry, via) = resolver.resolve_product(&line("Acme", "Oyster Mushroom grey large", "pack"));
        assert_eq!(entry.item_code, "BN01");
        assert!(matches!(via, Categorization::Fuzzy { .. }));

        let (entry, via) = resolver.resolve_product(&line("Acme", "Shiitake Mushroom whole", "kg"));
        assert_eq!(via, Categorization::Uncategorized);
        assert_eq!(entry.item_code, fallback_item_code("Shiitake Mushroom whole", "kg"));

        let out = resolver.resolve(vec![
            dated(line("Acme", "Oyster Mushroom grey", "pack")),
            dated(line("Acme", "Oyster Mushroom grey", "pack")),
        ]);
        let kinds: Vec<_> = out.issues.iter().map(|i| i.kind).collect();
        assert_eq!(kinds, vec![IssueKind::Categorization]);
    }

    #[test]
    fn overlap_score_uses_larger_word_set() {
        assert!((overlap_score("grey oyster mushroom", "oyster mushroom fresh") - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(overlap_score("", ""), 0.0);
    }
}
