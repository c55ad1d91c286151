//! Warehouse storage boundary: dimension/fact persistence for the star schema.

use std::collections::{BTreeSet, HashSet};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use starsync_core::{CustomerEntry, DateEntry, FactKey, FactOrderLine, ProductEntry, ProductKey};
use thiserror::Error;
use tokio::sync::Mutex;

pub mod postgres;

pub use postgres::{PgConfig, PgWarehouse};

pub const CRATE_NAME: &str = "starsync-storage";

pub const DIM_CUSTOMER: &str = "dim_customer";
pub const DIM_PRODUCT: &str = "dim_product";
pub const DIM_DATE: &str = "dim_date";
pub const FACT_ORDER: &str = "fact_order";
pub const KEY_COUNTER: &str = "etl_key_counter";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("{table}: {source}")]
    Persistence {
        table: &'static str,
        #[source]
        source: sqlx::Error,
    },
    #[error("{table}: row references missing {reference}")]
    MissingReference {
        table: &'static str,
        reference: String,
    },
    #[error("storage configuration error: {0}")]
    Config(String),
}

impl StorageError {
    pub fn persistence(table: &'static str) -> impl FnOnce(sqlx::Error) -> Self {
        move |source| Self::Persistence { table, source }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableCounts {
    pub customers: usize,
    pub products: usize,
    pub dates: usize,
    pub facts: usize,
}

/// Persisted dimension state read at the start of a batch.
#[derive(Debug, Clone, Default)]
pub struct DimensionSnapshot {
    pub customers: Vec<CustomerEntry>,
    pub products: Vec<ProductEntry>,
    pub dates: Vec<DateEntry>,
    /// Highest customer number ever allocated.
    pub customer_counter: u32,
}

/// The storage seam. Dimension appends skip rows whose key already exists;
/// they never overwrite.
#[async_trait]
pub trait WarehouseStore: Send + Sync {
    async fn persisted_customers(&self) -> Result<Vec<CustomerEntry>, StorageError>;
    async fn persisted_products(&self) -> Result<Vec<ProductEntry>, StorageError>;
    async fn persisted_dates(&self) -> Result<Vec<DateEntry>, StorageError>;
    async fn customer_counter(&self) -> Result<u32, StorageError>;

    /// Appends customers and raises the allocation counter to at least `counter`
    /// in the same unit of work. Returns the number of rows actually inserted.
    async fn append_customers(
        &self,
        rows: &[CustomerEntry],
        counter: u32,
    ) -> Result<usize, StorageError>;
    async fn append_products(&self, rows: &[ProductEntry]) -> Result<usize, StorageError>;
    async fn append_dates(&self, rows: &[DateEntry]) -> Result<usize, StorageError>;

    async fn persisted_fact_keys(&self) -> Result<HashSet<FactKey>, StorageError>;
    async fn append_facts(&self, rows: &[FactOrderLine]) -> Result<usize, StorageError>;

    async fn table_counts(&self) -> Result<TableCounts, StorageError>;

    async fn snapshot(&self) -> Result<DimensionSnapshot, StorageError> {
        Ok(DimensionSnapshot {
            customers: self.persisted_customers().await?,
            products: self.persisted_products().await?,
            dates: self.persisted_dates().await?,
            customer_counter: self.customer_counter().await?,
        })
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    customers: Vec<CustomerEntry>,
    products: Vec<ProductEntry>,
    dates: Vec<DateEntry>,
    facts: Vec<FactOrderLine>,
    customer_counter: u32,
    next_fact_id: i64,
}

/// In-process store with the same key and foreign-key rules as the SQL schema.
#[derive(Debug, Default)]
pub struct MemoryWarehouse {
    state: Mutex<MemoryState>,
}

impl MemoryWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn facts(&self) -> Vec<FactOrderLine> {
        self.state.lock().await.facts.clone()
    }

    pub async fn products(&self) -> Vec<ProductEntry> {
        self.state.lock().await.products.clone()
    }
}

#[async_trait]
impl WarehouseStore for MemoryWarehouse {
    async fn persisted_customers(&self) -> Result<Vec<CustomerEntry>, StorageError> {
        Ok(self.state.lock().await.customers.clone())
    }

    async fn persisted_products(&self) -> Result<Vec<ProductEntry>, StorageError> {
        Ok(self.state.lock().await.products.clone())
    }

    async fn persisted_dates(&self) -> Result<Vec<DateEntry>, StorageError> {
        Ok(self.state.lock().await.dates.clone())
    }

    async fn customer_counter(&self) -> Result<u32, StorageError> {
        Ok(self.state.lock().await.customer_counter)
    }

    async fn append_customers(
        &self,
        rows: &[CustomerEntry],
        counter: u32,
    ) -> Result<usize, StorageError> {
        let mut state = self.state.lock().await;
        let mut inserted = 0;
        for row in rows {
            let exists = state
                .customers
                .iter()
                .any(|c| c.customer_id == row.customer_id || c.name == row.name);
            if !exists {
                state.customers.push(row.clone());
                inserted += 1;
            }
        }
        state.customer_counter = state.customer_counter.max(counter);
        Ok(inserted)
    }

    async fn append_products(&self, rows: &[ProductEntry]) -> Result<usize, StorageError> {
        let mut state = self.state.lock().await;
        let mut inserted = 0;
        for row in rows {
            let key = row.key();
            if !state.products.iter().any(|p| p.key() == key) {
                state.products.push(row.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn append_dates(&self, rows: &[DateEntry]) -> Result<usize, StorageError> {
        let mut state = self.state.lock().await;
        let mut inserted = 0;
        for row in rows {
            if !state.dates.iter().any(|d| d.date == row.date) {
                state.dates.push(*row);
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn persisted_fact_keys(&self) -> Result<HashSet<FactKey>, StorageError> {
        Ok(self
            .state
            .lock()
            .await
            .facts
            .iter()
            .map(FactOrderLine::key)
            .collect())
    }

    async fn append_facts(&self, rows: &[FactOrderLine]) -> Result<usize, StorageError> {
        let mut state = self.state.lock().await;
        let customers: BTreeSet<&str> = state
            .customers
            .iter()
            .map(|c| c.customer_id.as_str())
            .collect();
        let products: BTreeSet<ProductKey> = state.products.iter().map(ProductEntry::key).collect();
        let dates: BTreeSet<_> = state.dates.iter().map(|d| d.date).collect();

        // The whole statement fails on the first dangling reference, like a SQL insert.
        for row in rows {
            let reference = if !customers.contains(row.customer_id.as_str()) {
                Some(format!("customer {}", row.customer_id))
            } else if !products.contains(&row.product_key()) {
                Some(format!("product {}", row.product_key()))
            } else if !dates.contains(&row.order_date) {
                Some(format!("date {}", row.order_date))
            } else {
                None
            };
            if let Some(reference) = reference {
                return Err(StorageError::MissingReference {
                    table: FACT_ORDER,
                    reference,
                });
            }
        }

        for row in rows {
            state.next_fact_id += 1;
            let mut row = row.clone();
            row.id = Some(state.next_fact_id);
            state.facts.push(row);
        }
        Ok(rows.len())
    }

    async fn table_counts(&self) -> Result<TableCounts, StorageError> {
        let state = self.state.lock().await;
        Ok(TableCounts {
            customers: state.customers.len(),
            products: state.products.len(),
            dates: state.dates.len(),
            facts: state.facts.len(),
        })
    }
}
