//! Waiting for a browser download to land and stop growing.
//!
//! A directory is polled at a fixed interval and every poll is folded into a
//! [`DownloadState`]: `Pending → Writing → Stable`, or `TimedOut` once the
//! deadline passes.

use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use thiserror::Error;
use tokio::fs;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Suffixes browsers use while a download is still in flight.
const PARTIAL_SUFFIXES: [&str; 3] = [".crdownload", ".part", ".tmp"];

/// Case-insensitive `<prefix>*.<extension>` file name match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePattern {
    prefix: String,
    extension: String,
}

impl FilePattern {
    pub fn new(prefix: &str, extension: &str) -> Self {
        Self {
            prefix: prefix.to_lowercase(),
            extension: extension.trim().trim_start_matches('.').to_lowercase(),
        }
    }

    pub fn matches(&self, file_name: &str) -> bool {
        let lower = file_name.to_lowercase();
        !is_partial(&lower)
            && lower.starts_with(&self.prefix)
            && lower.ends_with(&format!(".{}", self.extension))
    }
}

impl std::fmt::Display for FilePattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}*.{}", self.prefix, self.extension)
    }
}

fn is_partial(lower_name: &str) -> bool {
    PARTIAL_SUFFIXES.iter().any(|s| lower_name.ends_with(s))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeenFile {
    pub path: PathBuf,
    pub size: u64,
}

/// What one directory poll saw.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Observation {
    /// Newest complete file matching the pattern.
    pub candidate: Option<SeenFile>,
    /// Any in-flight download.
    pub partial: Option<SeenFile>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadState {
    Pending,
    Writing {
        path: PathBuf,
        size: u64,
        stable_polls: u32,
    },
    Stable {
        path: PathBuf,
        size: u64,
    },
    TimedOut,
}

impl DownloadState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stable { .. } | Self::TimedOut)
    }

    /// Folds one poll into the state.
    ///
    /// A candidate becomes `Stable` after its non-zero size is unchanged for
    /// `required_stable_polls` consecutive polls with no partial file around.
    pub fn advance(self, observation: Observation, required_stable_polls: u32) -> Self {
        if self.is_terminal() {
            return self;
        }
        let required = required_stable_polls.max(1);

        match (observation.candidate, observation.partial) {
            (Some(seen), Some(_)) => Self::Writing {
                path: seen.path,
                size: seen.size,
                stable_polls: 0,
            },
            (Some(seen), None) => {
                let stable_polls = match &self {
                    Self::Writing { path, size, stable_polls }
                        if *path == seen.path && *size == seen.size && seen.size > 0 =>
                    {
                        stable_polls + 1
                    }
                    _ => 0,
                };
                if stable_polls >= required {
                    Self::Stable {
                        path: seen.path,
                        size: seen.size,
                    }
                } else {
                    Self::Writing {
                        path: seen.path,
                        size: seen.size,
                        stable_polls,
                    }
                }
            }
            (None, Some(partial)) => Self::Writing {
                path: partial.path,
                size: partial.size,
                stable_polls: 0,
            },
            (None, None) => Self::Pending,
        }
    }

    /// Deadline reached; a stable result is kept.
    pub fn expire(self) -> Self {
        match self {
            Self::Stable { .. } => self,
            _ => Self::TimedOut,
        }
    }
}

/// A download that stopped changing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StableFile {
    pub path: PathBuf,
    pub size: u64,
}

#[derive(Debug, Error)]
pub enum WaitError {
    #[error("no stable {pattern} file in {} after {timeout:?} (last seen: {last_seen})", dir.display())]
    TimedOut {
        dir: PathBuf,
        pattern: String,
        timeout: Duration,
        last_seen: String,
    },
    #[error("scanning download directory {}: {source}", dir.display())]
    Io {
        dir: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Reusable wait-for-stable-file primitive.
#[derive(Debug, Clone)]
pub struct StableFileWait {
    pub dir: PathBuf,
    pub pattern: FilePattern,
    pub poll_interval: Duration,
    pub timeout: Duration,
    pub required_stable_polls: u32,
    /// Files last modified before this instant are ignored.
    pub newer_than: Option<SystemTime>,
}

impl StableFileWait {
    pub fn new(dir: impl Into<PathBuf>, pattern: FilePattern) -> Self {
        Self {
            dir: dir.into(),
            pattern,
            poll_interval: Duration::from_secs(1),
            timeout: Duration::from_secs(180),
            required_stable_polls: 2,
            newer_than: None,
        }
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn required_stable_polls(mut self, polls: u32) -> Self {
        self.required_stable_polls = polls;
        self
    }

    pub fn newer_than(mut self, cutoff: SystemTime) -> Self {
        self.newer_than = Some(cutoff);
        self
    }

    pub async fn wait(&self) -> Result<StableFile, WaitError> {
        let deadline = Instant::now() + self.timeout;
        let mut state = DownloadState::Pending;

        loop {
            let observation = observe_dir(&self.dir, &self.pattern, self.newer_than)
                .await
                .map_err(|source| WaitError::Io {
                    dir: self.dir.clone(),
                    source,
                })?;
            let next = state.clone().advance(observation, self.required_stable_polls);
            if next != state {
                debug!(dir = %self.dir.display(), state = ?next, "download state changed");
            }
            state = next;

            if let DownloadState::Stable { path, size } = &state {
                info!(path = %path.display(), size, "download is stable");
                return Ok(StableFile {
                    path: path.clone(),
                    size: *size,
                });
            }

            if Instant::now() >= deadline {
                let last_seen = match &state {
                    DownloadState::Writing { path, size, .. } => {
                        format!("{} ({size} bytes)", path.display())
                    }
                    _ => "nothing".to_string(),
                };
                let expired = state.expire();
                warn!(dir = %self.dir.display(), pattern = %self.pattern, state = ?expired, "download wait timed out");
                return Err(WaitError::TimedOut {
                    dir: self.dir.clone(),
                    pattern: self.pattern.to_string(),
                    timeout: self.timeout,
                    last_seen,
                });
            }

            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

/// Scans `dir` once. A missing directory observes as empty.
pub async fn observe_dir(
    dir: &Path,
    pattern: &FilePattern,
    newer_than: Option<SystemTime>,
) -> io::Result<Observation> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Observation::default()),
        Err(err) => return Err(err),
    };

    let mut candidate: Option<(SystemTime, SeenFile)> = None;
    let mut partial = None;

    while let Some(entry) = entries.next_entry().await? {
        let metadata = match entry.metadata().await {
            Ok(m) if m.is_file() => m,
            // Vanished between listing and stat, or not a regular file.
            _ => continue,
        };
        let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        if newer_than.is_some_and(|cutoff| modified < cutoff) {
            continue;
        }

        let name = entry.file_name().to_string_lossy().to_lowercase();
        let seen = SeenFile {
            path: entry.path(),
            size: metadata.len(),
        };
        if is_partial(&name) {
            partial = Some(seen);
        } else if pattern.matches(&name)
            && candidate.as_ref().map_or(true, |(at, _)| modified > *at)
        {
            candidate = Some((modified, seen));
        }
    }

    Ok(Observation {
        candidate: candidate.map(|(_, seen)| seen),
        partial,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn seen(path: &str, size: u64) -> Option<SeenFile> {
        Some(SeenFile {
            path: PathBuf::from(path),
            size,
        })
    }

    #[test]
    fn pattern_is_case_insensitive_and_skips_partials() {
        let pattern = FilePattern::new("raport shitjes", "xlsx");
        assert!(pattern.matches("Raport Shitjes 2024-03-05.XLSX"));
        assert!(!pattern.matches("raport shitjes 2024.xlsx.crdownload"));
        assert!(!pattern.matches("other.xlsx"));
        assert!(!pattern.matches("raport shitjes.csv"));
    }

    #[test]
    fn growing_file_is_not_stable_until_it_stops() {
        let mut state = DownloadState::Pending;
        for size in [10, 20, 30] {
            state = state.advance(
                Observation {
                    candidate: seen("/d/r.xlsx", size),
                    partial: None,
                },
                2,
            );
            assert!(matches!(state, DownloadState::Writing { stable_polls: 0, .. }));
        }
        let still = Observation {
            candidate: seen("/d/r.xlsx", 30),
            partial: None,
        };
        state = state.advance(still.clone(), 2);
        assert!(matches!(state, DownloadState::Writing { stable_polls: 1, .. }));
        state = state.advance(still, 2);
        assert_eq!(
            state,
            DownloadState::Stable {
                path: PathBuf::from("/d/r.xlsx"),
                size: 30
            }
        );
    }

    #[test]
    fn partial_download_keeps_state_writing() {
        let obs = Observation {
            candidate: seen("/d/r.xlsx", 30),
            partial: seen("/d/r.xlsx.crdownload", 5),
        };
        let mut state = DownloadState::Pending;
        for _ in 0..5 {
            state = state.advance(obs.clone(), 1);
        }
        assert!(matches!(state, DownloadState::Writing { .. }));

        let only_partial = Observation {
            candidate: None,
            partial: seen("/d/Unconfirmed 1.crdownload", 5),
        };
        assert!(matches!(
            DownloadState::Pending.advance(only_partial, 1),
            DownloadState::Writing { .. }
        ));
    }

    #[test]
    fn empty_file_never_counts_as_stable() {
        let obs = Observation {
            candidate: seen("/d/r.xlsx", 0),
            partial: None,
        };
        let mut state = DownloadState::Pending;
        for _ in 0..4 {
            state = state.advance(obs.clone(), 1);
        }
        assert!(!state.is_terminal());
    }

    #[test]
    fn expiry_keeps_stable_and_times_out_everything_else() {
        let stable = DownloadState::Stable {
            path: PathBuf::from("/d/r.xlsx"),
            size: 1,
        };
        assert_eq!(stable.clone().expire(), stable);
        assert_eq!(DownloadState::Pending.expire(), DownloadState::TimedOut);
        assert_eq!(
            DownloadState::TimedOut.advance(
                Observation {
                    candidate: seen("/d/r.xlsx", 1),
                    partial: None
                },
                1
            ),
            DownloadState::TimedOut
        );
    }

    #[tokio::test]
    async fn wait_returns_settled_download() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("ignored.txt"), b"x").unwrap();
        std::fs::write(dir.path().join("raport shitjes 1.xlsx"), b"workbook").unwrap();

        let found = StableFileWait::new(dir.path(), FilePattern::new("raport shitjes", "xlsx"))
            .poll_interval(Duration::from_millis(10))
            .timeout(Duration::from_secs(5))
            .required_stable_polls(2)
            .wait()
            .await
            .unwrap();

        assert_eq!(found.path, dir.path().join("raport shitjes 1.xlsx"));
        assert_eq!(found.size, 8);
    }

    #[tokio::test]
    async fn wait_times_out_without_a_match() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("raport shitjes 1.xlsx.crdownload"), b"half").unwrap();

        let err = StableFileWait::new(dir.path(), FilePattern::new("raport shitjes", "xlsx"))
            .poll_interval(Duration::from_millis(10))
            .timeout(Duration::from_millis(60))
            .wait()
            .await
            .unwrap_err();

        match err {
            WaitError::TimedOut { last_seen, .. } => assert!(last_seen.contains("crdownload")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn files_older_than_the_cutoff_are_ignored() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("raport shitjes old.xlsx"), b"yesterday").unwrap();

        let result = StableFileWait::new(dir.path(), FilePattern::new("raport shitjes", "xlsx"))
            .poll_interval(Duration::from_millis(10))
            .timeout(Duration::from_millis(50))
            .newer_than(SystemTime::now() + Duration::from_secs(3600))
            .wait()
            .await;

        assert!(matches!(result, Err(WaitError::TimedOut { .. })));
    }

    #[tokio::test]
    async fn missing_directory_observes_as_empty() {
        let dir = tempdir().unwrap();
        let obs = observe_dir(
            &dir.path().join("not-created-yet"),
            &FilePattern::new("raport", "xlsx"),
            None,
        )
        .await
        .unwrap();
        assert_eq!(obs, Observation::default());
    }
}
