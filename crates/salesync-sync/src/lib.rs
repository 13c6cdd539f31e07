//! Run orchestration: fetch → archive → normalize → load, once or on a cron.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use salesync_core::HighWaterMark;
use salesync_portal::{FetchContext, PortalReportSource, ReportSource};
use salesync_report::{
    normalize_file, read_canonical_file, write_canonical_file, NormalizeReport, Normalizer, ReportLayout,
    SellerCategories,
};
use salesync_storage::{ArchivedExport, ExportArchive, PgSalesStore, SalesStore};
use serde::Serialize;
use tokio::fs;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub mod config;
pub mod loader;

pub use config::{redact_database_url, ConfigError, Secret, SyncConfig};
pub use loader::{load_rows, IncrementalLoader, LoadError, LoadOutcome};

pub const CRATE_NAME: &str = "salesync-sync";

#[derive(Debug, Clone, Serialize)]
pub struct FetchSummary {
    pub run_id: Uuid,
    pub source_id: String,
    pub fetched_at: DateTime<Utc>,
    pub raw_path: String,
    pub archived_path: String,
    pub content_hash: String,
    pub byte_size: usize,
    pub already_archived: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub fetch: FetchSummary,
    pub canonical_path: String,
    pub normalize: NormalizeReport,
    pub load: LoadOutcome,
    pub reports_dir: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct StoreStatus {
    pub high_water_mark: Option<HighWaterMark>,
    pub row_count: u64,
}

/// Logs a failed stage once and tags the error with it.
fn stage_failed(run_id: Uuid, stage: &'static str, err: impl Into<anyhow::Error>) -> anyhow::Error {
    let err = err.into();
    let message = format!("{err:#}");
    error!(%run_id, stage, error = %message, "sync stage failed");
    err.context(format!("{stage} stage failed"))
}

/// Seller categories from the configured YAML file, or the built-in table.
pub fn load_seller_categories(config: &SyncConfig) -> Result<SellerCategories> {
    match &config.seller_categories_path {
        Some(path) => SellerCategories::from_path(path)
            .with_context(|| format!("loading seller categories from {}", path.display())),
        None => Ok(SellerCategories::builtin()),
    }
}

/// Fetches one export and keeps an immutable copy of it.
pub async fn fetch_and_archive(
    source: &dyn ReportSource,
    archive: &ExportArchive,
    ctx: &FetchContext,
) -> Result<(FetchSummary, ArchivedExport)> {
    let fetched = source
        .fetch_report(ctx)
        .await
        .map_err(|e| stage_failed(ctx.run_id, "fetch", e))?;

    let archived = archive
        .archive_file(fetched.fetched_at, &fetched.source_id, &fetched.path)
        .await
        .map_err(|e| stage_failed(ctx.run_id, "archive", e))?;
    info!(
        path = %archived.relative_path.display(),
        bytes = archived.byte_size,
        already_present = archived.already_present,
        "raw export archived"
    );

    let summary = FetchSummary {
        run_id: ctx.run_id,
        source_id: fetched.source_id,
        fetched_at: fetched.fetched_at,
        raw_path: fetched.path.display().to_string(),
        archived_path: archived.absolute_path.display().to_string(),
        content_hash: archived.content_hash.clone(),
        byte_size: archived.byte_size,
        already_archived: archived.already_present,
    };
    Ok((summary, archived))
}

/// Portal fetch plus archive, without touching storage.
pub async fn fetch_once_from_config(config: &SyncConfig) -> Result<FetchSummary> {
    let source = PortalReportSource::new(config.portal_config()?);
    let archive = ExportArchive::new(config.artifacts_dir.clone());
    let ctx = FetchContext::new(Uuid::new_v4());
    let span = info_span!("fetch_run", run_id = %ctx.run_id, source = source.source_id());
    async { fetch_and_archive(&source, &archive, &ctx).await.map(|(summary, _)| summary) }
        .instrument(span)
        .await
}

pub struct SyncPipeline {
    config: SyncConfig,
    source: Box<dyn ReportSource>,
    store: Arc<dyn SalesStore>,
    archive: ExportArchive,
    normalizer: Normalizer,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig, source: Box<dyn ReportSource>, store: Arc<dyn SalesStore>) -> Result<Self> {
        let categories = load_seller_categories(&config)?;
        Ok(Self {
            archive: ExportArchive::new(config.artifacts_dir.clone()),
            normalizer: Normalizer::new(ReportLayout::default(), categories),
            config,
            source,
            store,
        })
    }

    pub fn with_normalizer(mut self, normalizer: Normalizer) -> Self {
        self.normalizer = normalizer;
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub async fn run_once(&self) -> Result<SyncRunSummary> {
        let ctx = FetchContext::new(Uuid::new_v4());
        let span = info_span!("sync_run", run_id = %ctx.run_id, source = self.source.source_id());
        self.run_with(ctx).instrument(span).await
    }

    async fn run_with(&self, ctx: FetchContext) -> Result<SyncRunSummary> {
        let run_id = ctx.run_id;
        let started_at = ctx.started_at;
        info!("sync run started");

        let (fetch, archived) = fetch_and_archive(self.source.as_ref(), &self.archive, &ctx).await?;

        let (records, normalize) = normalize_file(&self.normalizer, &archived.absolute_path)
            .map_err(|e| stage_failed(run_id, "normalize", e))?;

        let canonical_path = self
            .config
            .work_dir
            .join(format!("sales_{}_{run_id}.csv", started_at.format("%Y%m%d_%H%M%S")));
        write_canonical_file(&canonical_path, &records)
            .map_err(|e| stage_failed(run_id, "normalize", e))?;

        // The loader consumes the canonical file, not the in-memory rows.
        let canonical = read_canonical_file(&canonical_path).map_err(|e| stage_failed(run_id, "load", e))?;
        if canonical.unparseable_timestamps > 0 {
            warn!(
                skipped = canonical.unparseable_timestamps,
                path = %canonical_path.display(),
                "skipped canonical rows with unparseable Datetime"
            );
        }
        let load = loader::load_rows(self.store.as_ref(), &canonical.records)
            .await
            .map_err(|e| stage_failed(run_id, "load", e))?;

        let finished_at = Utc::now();
        let reports_dir = self.config.reports_dir.join(run_id.to_string());
        let summary = SyncRunSummary {
            run_id,
            started_at,
            finished_at,
            fetch,
            canonical_path: canonical_path.display().to_string(),
            normalize,
            load,
            reports_dir: reports_dir.display().to_string(),
        };
        write_run_summary(&reports_dir, &summary)
            .await
            .map_err(|e| stage_failed(run_id, "report", e))?;

        info!(
            emitted = summary.normalize.emitted,
            inserted = summary.load.inserted,
            elapsed_ms = (finished_at - started_at).num_milliseconds(),
            "sync run finished"
        );
        Ok(summary)
    }

    pub async fn status(&self) -> Result<StoreStatus> {
        store_status(self.store.as_ref()).await
    }
}

/// Mark and row count over committed rows; never waits for a running sync.
pub async fn store_status(store: &dyn SalesStore) -> Result<StoreStatus> {
    let high_water_mark = store
        .high_water_mark()
        .await
        .context("reading high-water mark")?;
    let row_count = store.row_count().await.context("counting stored rows")?;
    Ok(StoreStatus {
        high_water_mark,
        row_count,
    })
}

async fn write_run_summary(reports_dir: &Path, summary: &SyncRunSummary) -> Result<()> {
    fs::create_dir_all(reports_dir)
        .await
        .with_context(|| format!("creating {}", reports_dir.display()))?;
    let path = reports_dir.join("run_summary.json");
    let json = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
    fs::write(&path, json)
        .await
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

/// Connects to Postgres with the configured URL.
pub async fn connect_store(config: &SyncConfig) -> Result<PgSalesStore> {
    let url = config.database_url()?;
    info!(url = %redact_database_url(url), "connecting to sales database");
    PgSalesStore::connect(url, config.serialize_runs)
        .await
        .context("connecting to sales database")
}

/// Production wiring: portal source and Postgres store, all validated before
/// any browser session starts.
pub async fn pipeline_from_config(config: SyncConfig) -> Result<SyncPipeline> {
    let portal = config.portal_config()?;
    let store = connect_store(&config).await?;
    SyncPipeline::new(config, Box::new(PortalReportSource::new(portal)), Arc::new(store))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Completed,
    Failed,
    Skipped,
}

/// Runs one scheduled tick unless a previous run still holds `gate`.
pub async fn run_tick(pipeline: &SyncPipeline, gate: &Mutex<()>) -> TickOutcome {
    let Ok(_running) = gate.try_lock() else {
        warn!("previous sync run still in progress; skipping tick");
        return TickOutcome::Skipped;
    };
    match pipeline.run_once().await {
        Ok(summary) => {
            info!(run_id = %summary.run_id, inserted = summary.load.inserted, "scheduled sync completed");
            TickOutcome::Completed
        }
        Err(err) => {
            let message = format!("{err:#}");
            error!(error = %message, "scheduled sync failed");
            TickOutcome::Failed
        }
    }
}

pub async fn build_scheduler(pipeline: Arc<SyncPipeline>) -> Result<JobScheduler> {
    let cron = pipeline.config().sync_cron.clone();
    let gate = Arc::new(Mutex::new(()));
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
        let pipeline = pipeline.clone();
        let gate = gate.clone();
        Box::pin(async move {
            run_tick(&pipeline, &gate).await;
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}

/// Runs the pipeline on its cron until Ctrl-C.
pub async fn run_scheduled(pipeline: Arc<SyncPipeline>) -> Result<()> {
    let cron = pipeline.config().sync_cron.clone();
    let mut sched = build_scheduler(pipeline).await?;
    sched.start().await.context("starting scheduler")?;
    info!(%cron, "scheduler running");

    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    info!("shutting down scheduler");
    sched.shutdown().await.context("stopping scheduler")?;
    Ok(())
}
