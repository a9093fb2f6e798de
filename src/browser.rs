use std::env;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{ACCEPT, ACCEPT_LANGUAGE};
use reqwest::Url;
use tokio::process::Command;
use tracing::{debug, info};

use crate::config::{FetcherConfig, FetcherKind};
use crate::error::{Error, Result};

// ======================================================
// TRAIT
// ======================================================

/// Something that turns a search URL into page HTML.
#[async_trait]
pub trait PageSource: Send + Sync {
    fn name(&self) -> &'static str;

    async fn fetch(&self, url: &Url) -> Result<String>;
}

/// Build the configured page source.
pub fn from_config(cfg: &FetcherConfig, timezone: &str) -> Result<Box<dyn PageSource>> {
    match cfg.kind {
        FetcherKind::Chrome => Ok(Box::new(HeadlessChrome::new(cfg, timezone)?)),
        FetcherKind::Http => Ok(Box::new(HttpPage::new(cfg)?)),
    }
}

// ======================================================
// HEADLESS CHROME
// ======================================================

const CHROME_CANDIDATES: [&str; 4] = [
    "chromium",
    "chromium-browser",
    "google-chrome",
    "google-chrome-stable",
];

/// Renders the page with a headless Chromium-family browser and returns the
/// serialized DOM once the virtual time budget has elapsed.
#[derive(Debug, Clone)]
pub struct HeadlessChrome {
    binary: PathBuf,
    timezone: String,
    user_agent: String,
    virtual_time_budget_ms: u64,
    timeout: Duration,
}

impl HeadlessChrome {
    pub fn new(cfg: &FetcherConfig, timezone: &str) -> Result<Self> {
        let binary = match &cfg.chrome_bin {
            Some(bin) => bin.clone(),
            None => find_browser(env::var_os("PATH").as_deref().map(Path::new))?,
        };

        Ok(Self {
            binary,
            timezone: timezone.to_string(),
            user_agent: cfg.user_agent.clone(),
            virtual_time_budget_ms: cfg.virtual_time_budget_ms,
            timeout: Duration::from_secs(cfg.timeout_secs),
        })
    }

    pub fn args(&self, url: &Url) -> Vec<String> {
        vec![
            "--headless=new".to_string(),
            "--disable-gpu".to_string(),
            "--no-sandbox".to_string(),
            "--disable-dev-shm-usage".to_string(),
            "--hide-scrollbars".to_string(),
            "--window-size=1280,4000".to_string(),
            "--lang=fr-FR".to_string(),
            format!("--user-agent={}", self.user_agent),
            format!("--virtual-time-budget={}", self.virtual_time_budget_ms),
            "--dump-dom".to_string(),
            url.to_string(),
        ]
    }
}

#[async_trait]
impl PageSource for HeadlessChrome {
    fn name(&self) -> &'static str {
        "chrome"
    }

    async fn fetch(&self, url: &Url) -> Result<String> {
        info!(browser = %self.binary.display(), %url, "rendering search page");

        let child = Command::new(&self.binary)
            .args(self.args(url))
            .env("TZ", &self.timezone)
            .env("LANG", "fr_FR.UTF-8")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Fetch {
                url: url.to_string(),
                reason: format!("failed to start {}: {}", self.binary.display(), e),
            })?;

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(res) => res?,
            Err(_) => {
                return Err(Error::Fetch {
                    url: url.to_string(),
                    reason: format!("browser timed out after {}s", self.timeout.as_secs()),
                })
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Fetch {
                url: url.to_string(),
                reason: format!("browser exited with {}: {}", output.status, last_line(&stderr)),
            });
        }

        let html = String::from_utf8_lossy(&output.stdout).into_owned();
        if html.trim().is_empty() {
            return Err(Error::Fetch {
                url: url.to_string(),
                reason: "browser returned an empty document".to_string(),
            });
        }

        debug!(bytes = html.len(), "page rendered");
        Ok(html)
    }
}

/// First Chromium-family executable found on `path`.
pub fn find_browser(path: Option<&Path>) -> Result<PathBuf> {
    let dirs: Vec<PathBuf> = path
        .map(|p| env::split_paths(p.as_os_str()).collect())
        .unwrap_or_default();

    for candidate in CHROME_CANDIDATES {
        for dir in &dirs {
            let full = dir.join(candidate);
            if full.is_file() {
                return Ok(full);
            }
        }
    }

    Err(Error::BrowserNotFound {
        tried: CHROME_CANDIDATES.join(", "),
    })
}

fn last_line(stderr: &str) -> &str {
    stderr
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .unwrap_or("no output")
        .trim()
}

// ======================================================
// PLAIN HTTP
// ======================================================

/// Plain GET; sees only what the server renders without JavaScript.
#[derive(Debug, Clone)]
pub struct HttpPage {
    client: reqwest::Client,
}

impl HttpPage {
    pub fn new(cfg: &FetcherConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(cfg.user_agent.clone())
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl PageSource for HttpPage {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn fetch(&self, url: &Url) -> Result<String> {
        info!(%url, "fetching search page");

        let response = self
            .client
            .get(url.clone())
            .header(ACCEPT, "text/html,application/xhtml+xml")
            .header(ACCEPT_LANGUAGE, "fr-FR,fr;q=0.9")
            .send()
            .await
            .map_err(|e| Error::Fetch {
                url: url.to_string(),
                reason: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Fetch {
                url: url.to_string(),
                reason: format!("HTTP {}", status),
            });
        }

        Ok(response.text().await?)
    }
}
