use std::path::PathBuf;

use thiserror::Error;

use crate::store::Stage;

/// Errors callers need to tell apart. Orchestration code wraps these in
/// `anyhow::Error` and only downcasts where the variant changes behavior.
#[derive(Debug, Error)]
pub enum HunterError {
    #[error("converter command `{cmd}` not found; install it or set `pandoc_cmd`")]
    ConverterMissing { cmd: String },

    #[error("converter exited with {status}: {stderr}")]
    ConverterFailed { status: String, stderr: String },

    #[error("no valid payload after {tries} attempt(s): {reason}")]
    InvalidPayload { tries: u32, reason: String },

    #[error("fetch failed for {url}: {reason}")]
    Fetch { url: String, reason: String },

    #[error("navigation to {url} blocked by extension filter")]
    Blocked { url: String },

    #[error("selector `{selector}` did not appear within {secs}s")]
    SelectorTimeout { selector: String, secs: u64 },

    #[error("invalid selector `{0}`")]
    BadSelector(String),

    #[error("no page loaded; call goto first")]
    NoPage,

    #[error("completion request failed: {0}")]
    Completion(String),

    #[error("missing {stage} artifact for {key}")]
    MissingArtifact { key: String, stage: Stage },

    #[error("unsupported spreadsheet format: {0}")]
    UnsupportedSheet(PathBuf),

    #[error(transparent)]
    Config(#[from] ::config::ConfigError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

impl HunterError {
    /// Errors that will recur for every entity, so a batch should stop.
    pub fn is_fatal(&self) -> bool {
        matches!(self, HunterError::ConverterMissing { .. })
    }
}

pub type Result<T> = std::result::Result<T, HunterError>;
