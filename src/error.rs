use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to fetch {url}: {reason}")]
    Fetch { url: String, reason: String },

    #[error("No Chromium-family browser found (tried: {tried}). Set CHROME_BIN or use --fetcher http.")]
    BrowserNotFound { tried: String },

    #[error("State file {}: {source}", .path.display())]
    State {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{0}")]
    Lock(String),

    #[error("Notification via {channel} failed: {reason}")]
    Notify { channel: &'static str, reason: String },

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }
}
