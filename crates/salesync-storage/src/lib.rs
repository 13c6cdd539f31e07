//! Persistence plumbing for salesync: the sales table, raw export archive and
//! download watching.

use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

pub mod sales;
pub mod watch;

pub use sales::{
    read_high_water_mark, MemorySalesStore, PgSalesStore, SalesBatch, SalesStore, StoreError,
};
pub use watch::{DownloadState, FilePattern, Observation, SeenFile, StableFile, StableFileWait, WaitError};

pub const CRATE_NAME: &str = "salesync-storage";

/// A raw export kept in the archive.
#[derive(Debug, Clone)]
pub struct ArchivedExport {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    /// The same bytes were already archived under this path.
    pub already_present: bool,
}

/// Immutable, content-addressed copies of every downloaded report.
#[derive(Debug, Clone)]
pub struct ExportArchive {
    root: PathBuf,
}

impl ExportArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(bytes))
    }

    /// `<YYYYmmdd_HHMMSS>/<source>/<sha256>.<ext>` under the archive root.
    pub fn layout_path(
        fetched_at: DateTime<Utc>,
        source: &str,
        content_hash: &str,
        extension: &str,
    ) -> PathBuf {
        let ext = match extension.trim().trim_start_matches('.') {
            "" => "bin",
            ext => ext,
        };
        PathBuf::from(fetched_at.format("%Y%m%d_%H%M%S").to_string())
            .join(source)
            .join(format!("{content_hash}.{ext}"))
    }

    /// Archives a downloaded file, keeping its extension.
    pub async fn archive_file(
        &self,
        fetched_at: DateTime<Utc>,
        source: &str,
        path: &Path,
    ) -> anyhow::Result<ArchivedExport> {
        let bytes = fs::read(path)
            .await
            .with_context(|| format!("reading downloaded export {}", path.display()))?;
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();
        self.archive_bytes(fetched_at, source, &extension, &bytes).await
    }

    /// Writes bytes through a temp file and an atomic rename; identical
    /// content for the same stamp and source is stored once.
    pub async fn archive_bytes(
        &self,
        fetched_at: DateTime<Utc>,
        source: &str,
        extension: &str,
        bytes: &[u8],
    ) -> anyhow::Result<ArchivedExport> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path = Self::layout_path(fetched_at, source, &content_hash, extension);
        let absolute_path = self.root.join(&relative_path);
        let parent = absolute_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());

        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating archive directory {}", parent.display()))?;

        let archived = |already_present| ArchivedExport {
            content_hash: content_hash.clone(),
            relative_path: relative_path.clone(),
            absolute_path: absolute_path.clone(),
            byte_size: bytes.len(),
            already_present,
        };

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking archive path {}", absolute_path.display()))?
        {
            debug!(path = %absolute_path.display(), "export already archived");
            return Ok(archived(true));
        }

        let temp_path = parent.join(format!(".{}.partial", Uuid::new_v4()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing {}", temp_path.display()))?;
        file.sync_all()
            .await
            .with_context(|| format!("syncing {}", temp_path.display()))?;
        drop(file);

        match fs::rename(&temp_path, &absolute_path).await {
            Ok(()) => Ok(archived(false)),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let _ = fs::remove_file(&temp_path).await;
                Ok(archived(true))
            }
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!(
                        "moving {} into place at {}",
                        temp_path.display(),
                        absolute_path.display()
                    )
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn fetched_at() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-03-05T06:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn hash_is_sha256_hex() {
        assert_eq!(
            ExportArchive::sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn layout_groups_by_stamp_and_source() {
        let path = ExportArchive::layout_path(fetched_at(), "portal", "abc", ".xlsx");
        assert_eq!(path, PathBuf::from("20240305_060000/portal/abc.xlsx"));
        let path = ExportArchive::layout_path(fetched_at(), "portal", "abc", "");
        assert_eq!(path, PathBuf::from("20240305_060000/portal/abc.bin"));
    }

    #[tokio::test]
    async fn archiving_same_file_twice_keeps_one_copy() {
        let dir = tempdir().unwrap();
        let download = dir.path().join("raport shitjes 05.xlsx");
        std::fs::write(&download, b"PK fake workbook").unwrap();
        let archive = ExportArchive::new(dir.path().join("artifacts"));

        let first = archive.archive_file(fetched_at(), "portal", &download).await.unwrap();
        let second = archive.archive_file(fetched_at(), "portal", &download).await.unwrap();

        assert!(!first.already_present);
        assert!(second.already_present);
        assert_eq!(first.absolute_path, second.absolute_path);
        assert_eq!(first.absolute_path.extension().unwrap(), "xlsx");
        assert_eq!(std::fs::read(&first.absolute_path).unwrap(), b"PK fake workbook");
        assert!(download.exists(), "source download must be left in place");
    }
}
