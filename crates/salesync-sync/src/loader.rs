//! Appends only the rows storage has not seen yet.

use std::sync::Arc;

use salesync_core::{is_admissible, HighWaterMark, SalesRecord};
use salesync_storage::{read_high_water_mark, SalesBatch, SalesStore, StoreError};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("opening storage batch: {0}")]
    Begin(#[source] StoreError),
    #[error("reading high-water mark: {0}")]
    HighWaterMark(#[source] StoreError),
    #[error("appending {rows} rows: {source}")]
    Append {
        rows: usize,
        #[source]
        source: StoreError,
    },
    #[error("committing batch: {0}")]
    Commit(#[source] StoreError),
    #[error("rolling back batch: {0}")]
    Rollback(#[source] StoreError),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LoadOutcome {
    pub high_water_mark: Option<HighWaterMark>,
    pub candidates: usize,
    pub admitted: usize,
    pub rejected: usize,
    pub inserted: u64,
}

#[derive(Clone)]
pub struct IncrementalLoader {
    store: Arc<dyn SalesStore>,
}

impl IncrementalLoader {
    pub fn new(store: Arc<dyn SalesStore>) -> Self {
        Self { store }
    }

    pub async fn load(&self, rows: &[SalesRecord]) -> Result<LoadOutcome, LoadError> {
        load_rows(self.store.as_ref(), rows).await
    }
}

/// Admits rows past the stored high-water mark and appends them in one batch.
///
/// The mark is read inside the same batch the rows are written in. The batch
/// is rolled back when no row is admitted or when any step fails.
pub async fn load_rows(store: &dyn SalesStore, rows: &[SalesRecord]) -> Result<LoadOutcome, LoadError> {
    let mut batch = store.begin().await.map_err(LoadError::Begin)?;
    let read = read_high_water_mark(batch.as_mut()).await;
    let mark = match read {
        Ok(mark) => mark,
        Err(err) => return Err(abort(batch, LoadError::HighWaterMark(err)).await),
    };

    let admitted: Vec<SalesRecord> = rows
        .iter()
        .filter(|row| is_admissible(mark.as_ref(), row))
        .cloned()
        .collect();

    let mut outcome = LoadOutcome {
        high_water_mark: mark,
        candidates: rows.len(),
        admitted: admitted.len(),
        rejected: rows.len() - admitted.len(),
        inserted: 0,
    };
    debug!(mark = ?outcome.high_water_mark, candidates = outcome.candidates, admitted = outcome.admitted, "applied high-water mark");

    if admitted.is_empty() {
        batch.rollback().await.map_err(LoadError::Rollback)?;
        info!(candidates = outcome.candidates, "no new rows to load");
        return Ok(outcome);
    }

    let appended = batch.append(&admitted).await;
    outcome.inserted = match appended {
        Ok(inserted) => inserted,
        Err(source) => {
            let err = LoadError::Append {
                rows: admitted.len(),
                source,
            };
            return Err(abort(batch, err).await);
        }
    };
    batch.commit().await.map_err(LoadError::Commit)?;

    info!(
        candidates = outcome.candidates,
        inserted = outcome.inserted,
        rejected = outcome.rejected,
        "loaded new rows"
    );
    Ok(outcome)
}

/// Rolls back after a failed step; the step's error is the one reported.
async fn abort(batch: Box<dyn SalesBatch>, err: LoadError) -> LoadError {
    if let Err(rollback) = batch.rollback().await {
        warn!(error = %rollback, "rollback after failed load also failed");
    }
    err
}
