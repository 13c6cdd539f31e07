//! Report sources: the reporting portal driven over WebDriver, and local files.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fantoccini::error::{CmdError, NewSessionError};
use fantoccini::{Client, ClientBuilder, Locator};
use salesync_storage::{FilePattern, StableFileWait, WaitError};
use serde_json::{json, Map, Value as JsonValue};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "salesync-portal";

pub const PORTAL_SOURCE_ID: &str = "portal";
pub const LOCAL_SOURCE_ID: &str = "local";

const TENANT_FIELD: &str = "input[name='nipt']";
const USERNAME_FIELD: &str = "input[name='username']";
const PASSWORD_FIELD: &str = "input[formcontrolname='password']";
const LOGIN_BUTTON: &str = "//button[contains(., 'Login')]";
const EXPORT_BUTTON: &str = "//button[contains(., 'Shkarko raportin')]";

const LOGIN_POLL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchContext {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
}

impl FetchContext {
    pub fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            started_at: Utc::now(),
        }
    }
}

/// A raw spreadsheet on local disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedReport {
    pub source_id: String,
    pub path: PathBuf,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("could not start a WebDriver session at {url}: {source}")]
    Session {
        url: String,
        #[source]
        source: NewSessionError,
    },
    #[error("browser step `{step}` failed: {source}")]
    Browser {
        step: &'static str,
        #[source]
        source: CmdError,
    },
    #[error("still on the login page {timeout:?} after submitting credentials")]
    LoginRejected { timeout: Duration },
    #[error(transparent)]
    Download(#[from] WaitError),
    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("report file {} does not exist", .0.display())]
    MissingFile(PathBuf),
}

fn browser(step: &'static str) -> impl FnOnce(CmdError) -> FetchError {
    move |source| FetchError::Browser { step, source }
}

/// Where raw reports come from.
#[async_trait]
pub trait ReportSource: Send + Sync {
    fn source_id(&self) -> &str;

    /// Produces exactly one raw report file, or fails.
    async fn fetch_report(&self, ctx: &FetchContext) -> Result<FetchedReport, FetchError>;
}

#[derive(Clone, PartialEq, Eq)]
pub struct PortalCredentials {
    pub tenant_id: String,
    pub username: String,
    pub password: String,
}

impl fmt::Debug for PortalCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PortalCredentials")
            .field("tenant_id", &self.tenant_id)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct PortalConfig {
    pub webdriver_url: String,
    pub login_url: String,
    pub report_url: String,
    pub credentials: PortalCredentials,
    pub download_dir: PathBuf,
    pub export_pattern: FilePattern,
    pub headless: bool,
    pub element_timeout: Duration,
    pub download_timeout: Duration,
    pub download_poll: Duration,
}

/// Logs into the portal with headless Chrome and downloads the sales export.
#[derive(Debug, Clone)]
pub struct PortalReportSource {
    config: PortalConfig,
}

impl PortalReportSource {
    pub fn new(config: PortalConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PortalConfig {
        &self.config
    }

    /// Chrome capabilities pinning downloads to `download_dir`.
    pub fn capabilities(&self, download_dir: &Path) -> Map<String, JsonValue> {
        let mut args = vec![
            "--disable-gpu",
            "--window-size=1920,1080",
            "--no-sandbox",
            "--disable-dev-shm-usage",
            "--disable-blink-features=AutomationControlled",
        ];
        if self.config.headless {
            args.insert(0, "--headless=new");
        }

        let mut caps = Map::new();
        caps.insert("pageLoadStrategy".into(), json!("eager"));
        caps.insert(
            "goog:chromeOptions".into(),
            json!({
                "args": args,
                "prefs": {
                    "download.default_directory": download_dir.display().to_string(),
                    "download.prompt_for_download": false,
                    "download.directory_upgrade": true,
                    "plugins.always_open_pdf_externally": true,
                },
            }),
        );
        caps
    }

    async fn login(&self, client: &Client) -> Result<(), FetchError> {
        let cfg = &self.config;
        let creds = &cfg.credentials;
        client
            .goto(&cfg.login_url)
            .await
            .map_err(browser("open login page"))?;

        for (step, locator, value) in [
            ("fill tenant id", Locator::Css(TENANT_FIELD), creds.tenant_id.as_str()),
            ("fill username", Locator::Css(USERNAME_FIELD), creds.username.as_str()),
            ("fill password", Locator::Css(PASSWORD_FIELD), creds.password.as_str()),
        ] {
            let field = client
                .wait()
                .at_most(cfg.element_timeout)
                .for_element(locator)
                .await
                .map_err(browser(step))?;
            field.send_keys(value).await.map_err(browser(step))?;
        }

        client
            .find(Locator::XPath(LOGIN_BUTTON))
            .await
            .map_err(browser("find login button"))?
            .click()
            .await
            .map_err(browser("submit login"))?;

        let deadline = tokio::time::Instant::now() + cfg.element_timeout;
        let login_page = cfg.login_url.trim_end_matches('/');
        loop {
            let current = client
                .current_url()
                .await
                .map_err(browser("read url after login"))?;
            if current.as_str().trim_end_matches('/') != login_page {
                debug!(url = %current, "left login page");
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(FetchError::LoginRejected {
                    timeout: cfg.element_timeout,
                });
            }
            tokio::time::sleep(LOGIN_POLL).await;
        }
    }

    async fn export(&self, client: &Client) -> Result<(), FetchError> {
        let cfg = &self.config;
        client
            .goto(&cfg.report_url)
            .await
            .map_err(browser("open report page"))?;
        client
            .wait()
            .at_most(cfg.element_timeout)
            .for_element(Locator::XPath(EXPORT_BUTTON))
            .await
            .map_err(browser("find export button"))?
            .click()
            .await
            .map_err(browser("click export button"))?;
        info!("export requested");
        Ok(())
    }

    async fn drive(
        &self,
        client: &Client,
        download_dir: &Path,
        started: SystemTime,
    ) -> Result<PathBuf, FetchError> {
        self.login(client).await?;
        info!("logged in");
        self.export(client).await?;

        let stable = StableFileWait::new(download_dir, self.config.export_pattern.clone())
            .poll_interval(self.config.download_poll)
            .timeout(self.config.download_timeout)
            .newer_than(started)
            .wait()
            .await?;
        Ok(stable.path)
    }

    async fn fetch_in_session(&self) -> Result<FetchedReport, FetchError> {
        let started = SystemTime::now();
        let io_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source| FetchError::Io { path, source }
        };
        fs::create_dir_all(&self.config.download_dir)
            .await
            .map_err(io_err(&self.config.download_dir))?;
        let download_dir = fs::canonicalize(&self.config.download_dir)
            .await
            .map_err(io_err(&self.config.download_dir))?;

        let client = ClientBuilder::native()
            .capabilities(self.capabilities(&download_dir))
            .connect(&self.config.webdriver_url)
            .await
            .map_err(|source| FetchError::Session {
                url: self.config.webdriver_url.clone(),
                source,
            })?;

        let outcome = self.drive(&client, &download_dir, started).await;
        if let Err(err) = client.close().await {
            warn!(error = %err, "closing browser session failed");
        }

        let path = outcome?;
        info!(path = %path.display(), "report downloaded");
        Ok(FetchedReport {
            source_id: PORTAL_SOURCE_ID.to_string(),
            path,
            fetched_at: Utc::now(),
        })
    }
}

#[async_trait]
impl ReportSource for PortalReportSource {
    fn source_id(&self) -> &str {
        PORTAL_SOURCE_ID
    }

    async fn fetch_report(&self, ctx: &FetchContext) -> Result<FetchedReport, FetchError> {
        let span = info_span!("portal_fetch", run_id = %ctx.run_id);
        self.fetch_in_session().instrument(span).await
    }
}

/// A report that was downloaded by hand.
#[derive(Debug, Clone)]
pub struct LocalFileSource {
    path: PathBuf,
}

impl LocalFileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ReportSource for LocalFileSource {
    fn source_id(&self) -> &str {
        LOCAL_SOURCE_ID
    }

    async fn fetch_report(&self, ctx: &FetchContext) -> Result<FetchedReport, FetchError> {
        let exists = fs::try_exists(&self.path)
            .await
            .map_err(|source| FetchError::Io {
                path: self.path.clone(),
                source,
            })?;
        if !exists {
            return Err(FetchError::MissingFile(self.path.clone()));
        }
        Ok(FetchedReport {
            source_id: LOCAL_SOURCE_ID.to_string(),
            path: self.path.clone(),
            fetched_at: ctx.started_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn config(headless: bool) -> PortalConfig {
        PortalConfig {
            webdriver_url: "http://localhost:4444".into(),
            login_url: "https://portal.example/login".into(),
            report_url: "https://portal.example/user/0/produktet/shitjet".into(),
            credentials: PortalCredentials {
                tenant_id: "K00000000X".into(),
                username: "operator".into(),
                password: "hunter2".into(),
            },
            download_dir: PathBuf::from("/tmp/downloads"),
            export_pattern: FilePattern::new("raport shitjes", "xlsx"),
            headless,
            element_timeout: Duration::from_secs(30),
            download_timeout: Duration::from_secs(180),
            download_poll: Duration::from_secs(1),
        }
    }

    #[test]
    fn capabilities_pin_download_directory() {
        let source = PortalReportSource::new(config(true));
        let caps = source.capabilities(Path::new("/srv/salesync/downloads"));
        let chrome = &caps["goog:chromeOptions"];
        assert_eq!(
            chrome["prefs"]["download.default_directory"],
            "/srv/salesync/downloads"
        );
        assert_eq!(chrome["prefs"]["download.prompt_for_download"], false);
        assert_eq!(chrome["args"][0], "--headless=new");
        assert_eq!(caps["pageLoadStrategy"], "eager");
    }

    #[test]
    fn headed_mode_drops_headless_flag() {
        let source = PortalReportSource::new(config(false));
        let caps = source.capabilities(Path::new("/d"));
        let args = caps["goog:chromeOptions"]["args"].as_array().unwrap();
        assert!(args.iter().all(|a| !a.as_str().unwrap().starts_with("--headless")));
    }

    #[test]
    fn credentials_debug_hides_password() {
        let rendered = format!("{:?}", config(true).credentials);
        assert!(rendered.contains("operator"));
        assert!(!rendered.contains("hunter2"));
    }

    #[tokio::test]
    async fn local_source_returns_existing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("raport shitjes.xlsx");
        std::fs::write(&path, b"x").unwrap();
        let ctx = FetchContext::new(Uuid::new_v4());

        let report = LocalFileSource::new(&path).fetch_report(&ctx).await.unwrap();
        assert_eq!(report.path, path);
        assert_eq!(report.source_id, LOCAL_SOURCE_ID);
        assert_eq!(report.fetched_at, ctx.started_at);
    }

    #[tokio::test]
    async fn local_source_fails_for_missing_file() {
        let dir = tempdir().unwrap();
        let ctx = FetchContext::new(Uuid::new_v4());
        let err = LocalFileSource::new(dir.path().join("nope.xlsx"))
            .fetch_report(&ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::MissingFile(_)));
    }
}
