//! PostgreSQL implementation of [`WarehouseStore`].

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use starsync_core::{
    CustomerEntry, CustomerSegment, DateEntry, FactKey, FactOrderLine, ProductEntry,
};
use tracing::{debug, info_span, Instrument};

use crate::{
    StorageError, TableCounts, WarehouseStore, DIM_CUSTOMER, DIM_DATE, DIM_PRODUCT, FACT_ORDER,
    KEY_COUNTER,
};

const INSERT_CHUNK: usize = 500;
const CUSTOMER_COUNTER: &str = "customer";

/// Star schema DDL, in dependency order.
pub const CREATE_STATEMENTS: [&str; 5] = [
    r#"
    CREATE TABLE IF NOT EXISTS dim_customer (
        makhachhang       VARCHAR(10) PRIMARY KEY,
        tenkhachhang      VARCHAR(100) NOT NULL UNIQUE,
        phankhuckhachhang VARCHAR(50) NOT NULL
    )"#,
    r#"
    CREATE TABLE IF NOT EXISTS dim_product (
        mamathang   VARCHAR(10) NOT NULL,
        donvitinh   VARCHAR(20) NOT NULL,
        tenmathang  VARCHAR(100),
        manhomhang  VARCHAR(10),
        tennhomhang VARCHAR(100),
        PRIMARY KEY (mamathang, donvitinh)
    )"#,
    r#"
    CREATE TABLE IF NOT EXISTS dim_date (
        ngaytaodon DATE PRIMARY KEY,
        nam        INT NOT NULL,
        thang      INT NOT NULL,
        ngay       INT NOT NULL,
        quy        INT NOT NULL
    )"#,
    r#"
    CREATE TABLE IF NOT EXISTS fact_order (
        id          BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
        mataodon    VARCHAR(20) NOT NULL,
        makhachhang VARCHAR(10) NOT NULL REFERENCES dim_customer (makhachhang),
        mamathang   VARCHAR(10) NOT NULL,
        donvitinh   VARCHAR(20) NOT NULL,
        ngaytaodon  DATE NOT NULL REFERENCES dim_date (ngaytaodon),
        soluong     INT,
        dongia      NUMERIC(18, 2),
        thanhtien   NUMERIC(18, 2),
        FOREIGN KEY (mamathang, donvitinh) REFERENCES dim_product (mamathang, donvitinh)
    )"#,
    r#"
    CREATE TABLE IF NOT EXISTS etl_key_counter (
        name       VARCHAR(32) PRIMARY KEY,
        last_value INT NOT NULL
    )"#,
];

/// Fact table first so foreign keys never block the drop.
pub const DROP_STATEMENTS: [&str; 5] = [
    "DROP TABLE IF EXISTS fact_order",
    "DROP TABLE IF EXISTS dim_customer",
    "DROP TABLE IF EXISTS dim_product",
    "DROP TABLE IF EXISTS dim_date",
    "DROP TABLE IF EXISTS etl_key_counter",
];

#[derive(Debug, Clone)]
pub struct PgConfig {
    pub database_url: String,
    pub statement_timeout: Duration,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

impl PgConfig {
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            statement_timeout: Duration::from_secs(30),
            max_connections: 4,
            acquire_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PgWarehouse {
    pool: PgPool,
}

impl PgWarehouse {
    pub async fn connect(config: &PgConfig) -> Result<Self, StorageError> {
        let mut options: PgConnectOptions = config
            .database_url
            .parse()
            .map_err(|e| StorageError::Config(format!("invalid database url: {e}")))?;
        let timeout_ms = config.statement_timeout.as_millis();
        if timeout_ms > 0 {
            options = options.options([("statement_timeout", format!("{timeout_ms}ms"))]);
        }

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .acquire_timeout(config.acquire_timeout)
            .connect_with(options)
            .await
            .map_err(StorageError::persistence("connection"))?;
        Ok(Self { pool })
    }

    /// Creates the star schema. With `reset`, drops the existing tables first.
    pub async fn bootstrap(&self, reset: bool) -> Result<(), StorageError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(StorageError::persistence("bootstrap"))?;
        if reset {
            for stmt in DROP_STATEMENTS {
                sqlx::query(stmt)
                    .execute(&mut *tx)
                    .await
                    .map_err(StorageError::persistence("bootstrap"))?;
            }
        }
        for stmt in CREATE_STATEMENTS {
            sqlx::query(stmt)
                .execute(&mut *tx)
                .await
                .map_err(StorageError::persistence("bootstrap"))?;
        }
        tx.commit()
            .await
            .map_err(StorageError::persistence("bootstrap"))?;
        debug!(reset, "star schema bootstrapped");
        Ok(())
    }

    async fn count(&self, table: &'static str) -> Result<usize, StorageError> {
        let row = sqlx::query(&format!("SELECT COUNT(*) AS n FROM {table}"))
            .fetch_one(&self.pool)
            .await
            .map_err(StorageError::persistence(table))?;
        let n: i64 = row.try_get("n").map_err(StorageError::persistence(table))?;
        Ok(n.max(0) as usize)
    }
}

fn fact_insert_error(err: sqlx::Error) -> StorageError {
    let reference = err
        .as_database_error()
        .filter(|db| db.is_foreign_key_violation())
        .map(|db| db.constraint().unwrap_or("foreign key").to_string());
    match reference {
        Some(reference) => StorageError::MissingReference {
            table: FACT_ORDER,
            reference,
        },
        None => StorageError::Persistence {
            table: FACT_ORDER,
            source: err,
        },
    }
}

fn to_u32(value: i32) -> u32 {
    u32::try_from(value).unwrap_or_default()
}

#[async_trait]
impl WarehouseStore for PgWarehouse {
    async fn persisted_customers(&self) -> Result<Vec<CustomerEntry>, StorageError> {
        let rows = sqlx::query(
            "SELECT makhachhang, tenkhachhang, phankhuckhachhang FROM dim_customer ORDER BY makhachhang",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(StorageError::persistence(DIM_CUSTOMER))?;

        rows.iter()
            .map(|row| -> Result<CustomerEntry, sqlx::Error> {
                let segment: String = row.try_get("phankhuckhachhang")?;
                Ok(CustomerEntry {
                    customer_id: row.try_get("makhachhang")?,
                    name: row.try_get("tenkhachhang")?,
                    segment: CustomerSegment::from_label(&segment),
                })
            })
            .collect::<Result<_, sqlx::Error>>()
            .map_err(StorageError::persistence(DIM_CUSTOMER))
    }

    async fn persisted_products(&self) -> Result<Vec<ProductEntry>, StorageError> {
        let rows = sqlx::query(
            r#"
            SELECT mamathang, donvitinh, tenmathang, manhomhang, tennhomhang
              FROM dim_product
             ORDER BY mamathang, donvitinh
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(StorageError::persistence(DIM_PRODUCT))?;

        rows.iter()
            .map(|row| -> Result<ProductEntry, sqlx::Error> {
                let name: Option<String> = row.try_get("tenmathang")?;
                Ok(ProductEntry {
                    item_code: row.try_get("mamathang")?,
                    unit: row.try_get("donvitinh")?,
                    name: name.unwrap_or_default(),
                    category_code: row.try_get("manhomhang")?,
                    category_name: row.try_get("tennhomhang")?,
                })
            })
            .collect::<Result<_, sqlx::Error>>()
            .map_err(StorageError::persistence(DIM_PRODUCT))
    }

    async fn persisted_dates(&self) -> Result<Vec<DateEntry>, StorageError> {
        let rows = sqlx::query("SELECT ngaytaodon, nam, thang, ngay, quy FROM dim_date ORDER BY ngaytaodon")
            .fetch_all(&self.pool)
            .await
            .map_err(StorageError::persistence(DIM_DATE))?;

        rows.iter()
            .map(|row| -> Result<DateEntry, sqlx::Error> {
                Ok(DateEntry {
                    date: row.try_get("ngaytaodon")?,
                    year: row.try_get("nam")?,
                    month: to_u32(row.try_get("thang")?),
                    day: to_u32(row.try_get("ngay")?),
                    quarter: to_u32(row.try_get("quy")?),
                })
            })
            .collect::<Result<_, sqlx::Error>>()
            .map_err(StorageError::persistence(DIM_DATE))
    }

    async fn customer_counter(&self) -> Result<u32, StorageError> {
        let value: Option<i32> =
            sqlx::query_scalar("SELECT last_value FROM etl_key_counter WHERE name = $1")
                .bind(CUSTOMER_COUNTER)
                .fetch_optional(&self.pool)
                .await
                .map_err(StorageError::persistence(KEY_COUNTER))?;
        Ok(value.map(to_u32).unwrap_or_default())
    }

    async fn append_customers(
        &self,
        rows: &[CustomerEntry],
        counter: u32,
    ) -> Result<usize, StorageError> {
        let span = info_span!("append_dimension", table = DIM_CUSTOMER, candidates = rows.len());
        async {
            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(StorageError::persistence(DIM_CUSTOMER))?;
            let mut inserted = 0u64;
            for chunk in rows.chunks(INSERT_CHUNK) {
                let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
                    "INSERT INTO dim_customer (makhachhang, tenkhachhang, phankhuckhachhang) ",
                );
                qb.push_values(chunk, |mut b, row| {
                    b.push_bind(&row.customer_id)
                        .push_bind(&row.name)
                        .push_bind(row.segment.as_str());
                });
                // Unique violations (id or name) mean "already present".
                qb.push(" ON CONFLICT DO NOTHING");
                inserted += qb
                    .build()
                    .execute(&mut *tx)
                    .await
                    .map_err(StorageError::persistence(DIM_CUSTOMER))?
                    .rows_affected();
            }

            sqlx::query(
                r#"
                INSERT INTO etl_key_counter (name, last_value) VALUES ($1, $2)
                ON CONFLICT (name) DO UPDATE
                   SET last_value = GREATEST(etl_key_counter.last_value, EXCLUDED.last_value)
                "#,
            )
            .bind(CUSTOMER_COUNTER)
            .bind(i32::try_from(counter).unwrap_or(i32::MAX))
            .execute(&mut *tx)
            .await
            .map_err(StorageError::persistence(KEY_COUNTER))?;

            tx.commit()
                .await
                .map_err(StorageError::persistence(DIM_CUSTOMER))?;
            Ok::<usize, StorageError>(inserted as usize)
        }
        .instrument(span)
        .await
    }

    async fn append_products(&self, rows: &[ProductEntry]) -> Result<usize, StorageError> {
        let span = info_span!("append_dimension", table = DIM_PRODUCT, candidates = rows.len());
        async {
            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(StorageError::persistence(DIM_PRODUCT))?;
            let mut inserted = 0u64;
            for chunk in rows.chunks(INSERT_CHUNK) {
                let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
                    "INSERT INTO dim_product (mamathang, donvitinh, tenmathang, manhomhang, tennhomhang) ",
                );
                qb.push_values(chunk, |mut b, row| {
                    b.push_bind(&row.item_code)
                        .push_bind(&row.unit)
                        .push_bind(&row.name)
                        .push_bind(&row.category_code)
                        .push_bind(&row.category_name);
                });
                qb.push(" ON CONFLICT DO NOTHING");
                inserted += qb
                    .build()
                    .execute(&mut *tx)
                    .await
                    .map_err(StorageError::persistence(DIM_PRODUCT))?
                    .rows_affected();
            }
            tx.commit()
                .await
                .map_err(StorageError::persistence(DIM_PRODUCT))?;
            Ok::<usize, StorageError>(inserted as usize)
        }
        .instrument(span)
        .await
    }

    async fn append_dates(&self, rows: &[DateEntry]) -> Result<usize, StorageError> {
        let span = info_span!("append_dimension", table = DIM_DATE, candidates = rows.len());
        async {
            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(StorageError::persistence(DIM_DATE))?;
            let mut inserted = 0u64;
            for chunk in rows.chunks(INSERT_CHUNK) {
                let mut qb: QueryBuilder<Postgres> =
                    QueryBuilder::new("INSERT INTO dim_date (ngaytaodon, nam, thang, ngay, quy) ");
                qb.push_values(chunk, |mut b, row| {
                    b.push_bind(row.date)
                        .push_bind(row.year)
                        .push_bind(row.month as i32)
                        .push_bind(row.day as i32)
                        .push_bind(row.quarter as i32);
                });
                qb.push(" ON CONFLICT DO NOTHING");
                inserted += qb
                    .build()
                    .execute(&mut *tx)
                    .await
                    .map_err(StorageError::persistence(DIM_DATE))?
                    .rows_affected();
            }
            tx.commit()
                .await
                .map_err(StorageError::persistence(DIM_DATE))?;
            Ok::<usize, StorageError>(inserted as usize)
        }
        .instrument(span)
        .await
    }

    async fn persisted_fact_keys(&self) -> Result<HashSet<FactKey>, StorageError> {
        let rows = sqlx::query("SELECT DISTINCT mataodon, mamathang, donvitinh, ngaytaodon FROM fact_order")
            .fetch_all(&self.pool)
            .await
            .map_err(StorageError::persistence(FACT_ORDER))?;

        rows.iter()
            .map(|row| -> Result<FactKey, sqlx::Error> {
                let order_date: NaiveDate = row.try_get("ngaytaodon")?;
                Ok(FactKey {
                    order_code: row.try_get("mataodon")?,
                    item_code: row.try_get("mamathang")?,
                    unit: row.try_get("donvitinh")?,
                    order_date,
                })
            })
            .collect::<Result<_, sqlx::Error>>()
            .map_err(StorageError::persistence(FACT_ORDER))
    }

    async fn append_facts(&self, rows: &[FactOrderLine]) -> Result<usize, StorageError> {
        let span = info_span!("append_facts", table = FACT_ORDER, rows = rows.len());
        async {
            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(StorageError::persistence(FACT_ORDER))?;
            let mut inserted = 0u64;
            for chunk in rows.chunks(INSERT_CHUNK) {
                let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
                    "INSERT INTO fact_order (mataodon, makhachhang, mamathang, donvitinh, ngaytaodon, soluong, dongia, thanhtien) ",
                );
                qb.push_values(chunk, |mut b, row| {
                    b.push_bind(&row.order_code)
                        .push_bind(&row.customer_id)
                        .push_bind(&row.item_code)
                        .push_bind(&row.unit)
                        .push_bind(row.order_date)
                        .push_bind(row.quantity.and_then(|q| i32::try_from(q).ok()))
                        .push_bind(row.unit_price)
                        .push_unseparated("::numeric")
                        .push_bind(row.line_total)
                        .push_unseparated("::numeric");
                });
                inserted += qb
                    .build()
                    .execute(&mut *tx)
                    .await
                    .map_err(fact_insert_error)?
                    .rows_affected();
            }
            tx.commit()
                .await
                .map_err(StorageError::persistence(FACT_ORDER))?;
            Ok::<usize, StorageError>(inserted as usize)
        }
        .instrument(span)
        .await
    }

    async fn table_counts(&self) -> Result<TableCounts, StorageError> {
        Ok(TableCounts {
            customers: self.count(DIM_CUSTOMER).await?,
            products: self.count(DIM_PRODUCT).await?,
            dates: self.count(DIM_DATE).await?,
            facts: self.count(FACT_ORDER).await?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ddl_declares_composite_product_key_and_fact_foreign_keys() {
        let product = CREATE_STATEMENTS[1];
        assert!(product.contains("PRIMARY KEY (mamathang, donvitinh)"));
        let fact = CREATE_STATEMENTS[3];
        assert!(fact.contains("REFERENCES dim_customer (makhachhang)"));
        assert!(fact.contains("REFERENCES dim_product (mamathang, donvitinh)"));
        assert!(fact.contains("REFERENCES dim_date (ngaytaodon)"));
    }

    #[test]
    fn drops_fact_table_before_dimensions() {
        assert_eq!(DROP_STATEMENTS[0], "DROP TABLE IF EXISTS fact_order");
    }

    #[test]
    fn config_defaults_apply_statement_timeout() {
        let config = PgConfig::new("postgres://localhost/invoicedb");
        assert_eq!(config.statement_timeout, Duration::from_secs(30));
        assert_eq!(config.max_connections, 4);
    }
}
