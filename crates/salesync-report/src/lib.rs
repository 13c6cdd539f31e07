//! Report normalization: raw portal exports in, canonical sales rows out.

use std::path::{Path, PathBuf};

use salesync_core::SalesRecord;
use thiserror::Error;
use tracing::info;

pub mod canonical;
pub mod categories;
pub mod normalize;
pub mod sheet;

pub use canonical::{
    read_canonical, read_canonical_file, write_canonical, write_canonical_file, CanonicalRead,
};
pub use categories::SellerCategories;
pub use normalize::{NormalizeReport, Normalizer, ReportLayout};
pub use sheet::{Cell, RawSheet};

pub const CRATE_NAME: &str = "salesync-report";

#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("reading workbook {}: {source}", path.display())]
    Workbook {
        path: PathBuf,
        #[source]
        source: calamine::Error,
    },
    #[error("workbook {} has no worksheets", .0.display())]
    EmptyWorkbook(PathBuf),
    #[error("unexpected report layout: {0}")]
    Layout(String),
    #[error("parsing seller categories {}: {source}", path.display())]
    Categories {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

/// Reads and normalizes one raw export.
pub fn normalize_file(
    normalizer: &Normalizer,
    path: &Path,
) -> Result<(Vec<SalesRecord>, NormalizeReport), NormalizeError> {
    let sheet = RawSheet::read_path(path)?;
    let (records, report) = normalizer.normalize(&sheet)?;
    info!(
        path = %path.display(),
        input_rows = report.input_rows,
        emitted = report.emitted,
        totals_removed = report.totals_removed,
        unparseable_timestamps = report.unparseable_timestamps,
        missing_fields = report.missing_fields,
        "normalized export"
    );
    Ok((records, report))
}
