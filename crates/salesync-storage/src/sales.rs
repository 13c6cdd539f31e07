//! The `sales` table: high-water-mark queries and batch appends.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use salesync_core::{max_order_id, HighWaterMark, SalesRecord};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, QueryBuilder, Transaction};
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

/// Advisory lock key taken by every serialized ingestion run.
pub const INGEST_LOCK_KEY: i64 = 0x5a1e_5000;

/// Rows per INSERT statement; keeps bind parameters well under the
/// Postgres limit of 65535.
const INSERT_CHUNK_ROWS: usize = 1_000;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("schema migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Storage the incremental loader writes to.
#[async_trait]
pub trait SalesStore: Send + Sync {
    /// Opens a batch. Nothing it appends is visible until `commit`;
    /// `rollback` (or dropping it) discards the batch.
    async fn begin(&self) -> Result<Box<dyn SalesBatch>, StoreError>;

    /// Current mark over committed rows. Does not wait for an open batch.
    async fn high_water_mark(&self) -> Result<Option<HighWaterMark>, StoreError>;

    async fn row_count(&self) -> Result<u64, StoreError>;
}

#[async_trait]
pub trait SalesBatch: Send {
    /// `MAX(occurred_at)` over stored rows.
    async fn latest_occurred_at(&mut self) -> Result<Option<NaiveDateTime>, StoreError>;

    /// Greatest order id stored at exactly `occurred_at`, in order-id order.
    async fn max_order_id_at(
        &mut self,
        occurred_at: NaiveDateTime,
    ) -> Result<Option<String>, StoreError>;

    async fn append(&mut self, rows: &[SalesRecord]) -> Result<u64, StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

/// Reads the current high-water mark inside `batch`.
pub async fn read_high_water_mark(
    batch: &mut dyn SalesBatch,
) -> Result<Option<HighWaterMark>, StoreError> {
    let Some(occurred_at) = batch.latest_occurred_at().await? else {
        return Ok(None);
    };
    let order_id = batch.max_order_id_at(occurred_at).await?;
    Ok(Some(HighWaterMark::new(occurred_at, order_id)))
}

/// Postgres-backed `sales` table.
#[derive(Debug, Clone)]
pub struct PgSalesStore {
    pool: PgPool,
    serialize_runs: bool,
}

impl PgSalesStore {
    pub async fn connect(database_url: &str, serialize_runs: bool) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .acquire_timeout(Duration::from_secs(30))
            .connect(database_url)
            .await?;
        Ok(Self::from_pool(pool, serialize_runs))
    }

    pub fn from_pool(pool: PgPool, serialize_runs: bool) -> Self {
        Self {
            pool,
            serialize_runs,
        }
    }

    /// Creates the `sales` table and its index when missing.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl SalesStore for PgSalesStore {
    async fn begin(&self) -> Result<Box<dyn SalesBatch>, StoreError> {
        let mut tx = self.pool.begin().await?;
        if self.serialize_runs {
            // Released at commit or rollback.
            sqlx::query("SELECT pg_advisory_xact_lock($1)")
                .bind(INGEST_LOCK_KEY)
                .execute(&mut *tx)
                .await?;
            debug!(key = INGEST_LOCK_KEY, "ingestion lock acquired");
        }
        Ok(Box::new(PgSalesBatch { tx }))
    }

    async fn high_water_mark(&self) -> Result<Option<HighWaterMark>, StoreError> {
        // Plain transaction, no advisory lock.
        let mut batch = Box::new(PgSalesBatch {
            tx: self.pool.begin().await?,
        });
        let mark = read_high_water_mark(batch.as_mut()).await?;
        batch.rollback().await?;
        Ok(mark)
    }

    async fn row_count(&self) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sales")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }
}

struct PgSalesBatch {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl SalesBatch for PgSalesBatch {
    async fn latest_occurred_at(&mut self) -> Result<Option<NaiveDateTime>, StoreError> {
        let latest: Option<NaiveDateTime> = sqlx::query_scalar(r#"SELECT MAX("Datetime") FROM sales"#)
            .fetch_one(&mut *self.tx)
            .await?;
        Ok(latest)
    }

    async fn max_order_id_at(
        &mut self,
        occurred_at: NaiveDateTime,
    ) -> Result<Option<String>, StoreError> {
        // MAX() on TEXT is lexical; the mark needs numeric order for numeric ids.
        let ids: Vec<Option<String>> =
            sqlx::query_scalar(r#"SELECT DISTINCT "Order_ID" FROM sales WHERE "Datetime" = $1"#)
                .bind(occurred_at)
                .fetch_all(&mut *self.tx)
                .await?;
        Ok(max_order_id(ids.iter().flatten().map(String::as_str)).map(ToString::to_string))
    }

    async fn append(&mut self, rows: &[SalesRecord]) -> Result<u64, StoreError> {
        let mut inserted = 0u64;
        for chunk in rows.chunks(INSERT_CHUNK_ROWS) {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
                r#"INSERT INTO sales ("Order_ID", "Seller", "Buyer_Name", "Buyer_NIPT", "Article_Name", "Category", "Quantity", "Article_Price", "Total_Article_Price", "Datetime", "Seller Category") "#,
            );
            builder.push_values(chunk, |mut row, record| {
                row.push_bind(record.order_id.clone())
                    .push_bind(record.seller.clone())
                    .push_bind(record.buyer_name.clone())
                    .push_bind(record.buyer_tax_id.clone())
                    .push_bind(record.article_name.clone())
                    .push_bind(record.category.clone())
                    .push_bind(record.quantity)
                    .push_bind(record.unit_price)
                    .push_bind(record.total_price)
                    .push_bind(record.occurred_at)
                    .push_bind(record.seller_category.clone());
            });
            inserted += builder.build().execute(&mut *self.tx).await?.rows_affected();
        }
        Ok(inserted)
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.rollback().await?;
        Ok(())
    }
}

fn latest_in(rows: &[SalesRecord]) -> Option<NaiveDateTime> {
    rows.iter().map(|r| r.occurred_at).max()
}

fn max_order_id_in(rows: &[SalesRecord], occurred_at: NaiveDateTime) -> Option<String> {
    max_order_id(
        rows.iter()
            .filter(|r| r.occurred_at == occurred_at)
            .map(|r| r.order_id.as_str()),
    )
    .map(ToString::to_string)
}

/// In-process store with the same batch semantics; batches are serialized.
#[derive(Debug, Clone, Default)]
pub struct MemorySalesStore {
    rows: Arc<Mutex<Vec<SalesRecord>>>,
    run_lock: Arc<Mutex<()>>,
    fail_on_append: Arc<AtomicBool>,
    rollbacks: Arc<AtomicUsize>,
}

impl MemorySalesStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rows(rows: Vec<SalesRecord>) -> Self {
        Self {
            rows: Arc::new(Mutex::new(rows)),
            ..Self::default()
        }
    }

    pub async fn snapshot(&self) -> Vec<SalesRecord> {
        self.rows.lock().await.clone()
    }

    pub fn set_fail_on_append(&self, fail: bool) {
        self.fail_on_append.store(fail, Ordering::SeqCst);
    }

    /// Batches explicitly rolled back so far.
    pub fn rollback_count(&self) -> usize {
        self.rollbacks.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SalesStore for MemorySalesStore {
    async fn begin(&self) -> Result<Box<dyn SalesBatch>, StoreError> {
        Ok(Box::new(MemorySalesBatch {
            _run: self.run_lock.clone().lock_owned().await,
            rows: self.rows.clone(),
            pending: Vec::new(),
            fail_on_append: self.fail_on_append.load(Ordering::SeqCst),
            rollbacks: self.rollbacks.clone(),
        }))
    }

    async fn high_water_mark(&self) -> Result<Option<HighWaterMark>, StoreError> {
        let rows = self.rows.lock().await;
        Ok(latest_in(&rows).map(|at| HighWaterMark::new(at, max_order_id_in(&rows, at))))
    }

    async fn row_count(&self) -> Result<u64, StoreError> {
        Ok(self.rows.lock().await.len() as u64)
    }
}

struct MemorySalesBatch {
    _run: OwnedMutexGuard<()>,
    rows: Arc<Mutex<Vec<SalesRecord>>>,
    pending: Vec<SalesRecord>,
    fail_on_append: bool,
    rollbacks: Arc<AtomicUsize>,
}

#[async_trait]
impl SalesBatch for MemorySalesBatch {
    async fn latest_occurred_at(&mut self) -> Result<Option<NaiveDateTime>, StoreError> {
        Ok(latest_in(&self.rows.lock().await))
    }

    async fn max_order_id_at(
        &mut self,
        occurred_at: NaiveDateTime,
    ) -> Result<Option<String>, StoreError> {
        Ok(max_order_id_in(&self.rows.lock().await, occurred_at))
    }

    async fn append(&mut self, rows: &[SalesRecord]) -> Result<u64, StoreError> {
        if self.fail_on_append {
            return Err(StoreError::Unavailable("append rejected".to_string()));
        }
        self.pending.extend_from_slice(rows);
        Ok(rows.len() as u64)
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let batch = *self;
        batch.rows.lock().await.extend(batch.pending);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.rollbacks.fetch_add(1, Ordering::SeqCst);
        debug!(discarded = self.pending.len(), "batch rolled back");
        Ok(())
    }
}
