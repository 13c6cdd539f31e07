use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use salesync_report::{normalize_file, read_canonical_file, write_canonical_file, Normalizer, ReportLayout};
use salesync_sync::{
    connect_store, fetch_once_from_config, load_rows, load_seller_categories, pipeline_from_config,
    run_scheduled, store_status, SyncConfig,
};
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "salesync")]
#[command(about = "Incremental sales report ingestion")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch, normalize and load one report (default).
    Sync,
    /// Download and archive one report without loading it.
    Fetch,
    /// Normalize a raw export into a canonical CSV file.
    Normalize {
        raw: PathBuf,
        #[arg(long, short)]
        output: Option<PathBuf>,
    },
    /// Load a canonical CSV file into storage.
    Load { csv: PathBuf },
    /// Create the sales table if it does not exist.
    Migrate,
    /// Print the stored high-water mark and row count.
    Status,
    /// Run `sync` on the configured cron until Ctrl-C.
    Schedule,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("SALESYNC_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("SALESYNC_LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry.with(fmt::layer().with_writer(std::io::stderr)).init();
    }
}

fn default_output(config: &SyncConfig, raw: &Path) -> PathBuf {
    let stem = raw
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("sales");
    config.work_dir.join(format!("{stem}.csv"))
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    let config = SyncConfig::from_env().context("reading configuration")?;

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync if config.scheduler_enabled => {
            info!("scheduler enabled; running on cron");
            run_scheduled(Arc::new(pipeline_from_config(config).await?)).await?;
        }
        Commands::Sync => {
            let summary = pipeline_from_config(config).await?.run_once().await?;
            println!(
                "sync complete: run_id={} emitted={} inserted={} rejected={} reports={}",
                summary.run_id,
                summary.normalize.emitted,
                summary.load.inserted,
                summary.load.rejected,
                summary.reports_dir
            );
        }
        Commands::Fetch => {
            let summary = fetch_once_from_config(&config).await?;
            println!(
                "fetch complete: run_id={} raw={} archived={}",
                summary.run_id, summary.raw_path, summary.archived_path
            );
        }
        Commands::Normalize { raw, output } => {
            let normalizer = Normalizer::new(ReportLayout::default(), load_seller_categories(&config)?);
            let (records, report) = normalize_file(&normalizer, &raw)?;
            let output = output.unwrap_or_else(|| default_output(&config, &raw));
            write_canonical_file(&output, &records)?;
            println!(
                "normalize complete: rows={} emitted={} totals_removed={} unparseable_timestamps={} missing_fields={} output={}",
                report.input_rows,
                report.emitted,
                report.totals_removed,
                report.unparseable_timestamps,
                report.missing_fields,
                output.display()
            );
        }
        Commands::Load { csv } => {
            let read = read_canonical_file(&csv)?;
            if read.unparseable_timestamps > 0 {
                warn!(skipped = read.unparseable_timestamps, "skipped rows with unparseable Datetime");
            }
            let store = connect_store(&config).await?;
            let outcome = load_rows(&store, &read.records).await?;
            println!(
                "load complete: candidates={} inserted={} rejected={}",
                outcome.candidates, outcome.inserted, outcome.rejected
            );
        }
        Commands::Migrate => {
            connect_store(&config).await?.migrate().await.context("running migrations")?;
            println!("migrations applied");
        }
        Commands::Status => {
            let store = connect_store(&config).await?;
            let status = store_status(&store).await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::Schedule => {
            run_scheduled(Arc::new(pipeline_from_config(config).await?)).await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn sync_is_the_default_command() {
        let cli = Cli::try_parse_from(["salesync"]).unwrap();
        assert!(cli.command.is_none());
    }

    #[test]
    fn normalize_takes_an_optional_output() {
        let cli = Cli::try_parse_from(["salesync", "normalize", "raport shitjes.xlsx", "-o", "out.csv"]).unwrap();
        match cli.command {
            Some(Commands::Normalize { raw, output }) => {
                assert_eq!(raw, PathBuf::from("raport shitjes.xlsx"));
                assert_eq!(output, Some(PathBuf::from("out.csv")));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
