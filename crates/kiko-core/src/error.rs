//! Error types for the Kiko catalog engine.
//!
//! Run-level failures are `KikoError` values returned through `Result`.
//! Per-file and per-identity failures never abort a scan; they are folded into
//! [`ScanIssue`] values and recorded on the scan run instead.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the catalog engine.
#[derive(Debug, Error)]
pub enum KikoError {
    // Network errors
    #[error("Network error: {message}")]
    Network {
        message: String,
        #[source]
        source: Option<reqwest::Error>,
    },

    #[error("Request timeout after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Rate limited by {service}, retry after {retry_after_secs:?} seconds")]
    RateLimited {
        service: String,
        retry_after_secs: Option<u64>,
    },

    #[error("Registry returned status {status} for {url}")]
    RegistryStatus { url: String, status: u16 },

    #[error("Malformed registry response: {message}")]
    MalformedResponse { message: String },

    #[error("Download failed for {url}: {message}")]
    DownloadFailed { url: String, message: String },

    // Database errors
    #[error("Database error: {message}")]
    Database {
        message: String,
        #[source]
        source: Option<rusqlite::Error>,
    },

    // File system errors
    #[error("IO error at {path:?}: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Path is not a directory: {0}")]
    NotADirectory(PathBuf),

    // Container header errors
    #[error("Invalid container header in {path}: {message}")]
    InvalidHeader { path: PathBuf, message: String },

    // Serialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    #[error("YAML error: {message}")]
    Yaml {
        message: String,
        #[source]
        source: Option<serde_yaml::Error>,
    },

    // Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("No model root directories could be resolved")]
    NoResolvableRoots,

    #[error("Scan cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(String),
}

/// Result type alias for catalog operations.
pub type Result<T> = std::result::Result<T, KikoError>;

impl From<std::io::Error> for KikoError {
    fn from(err: std::io::Error) -> Self {
        KikoError::Io {
            message: err.to_string(),
            path: None,
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for KikoError {
    fn from(err: serde_json::Error) -> Self {
        KikoError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<serde_yaml::Error> for KikoError {
    fn from(err: serde_yaml::Error) -> Self {
        KikoError::Yaml {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<rusqlite::Error> for KikoError {
    fn from(err: rusqlite::Error) -> Self {
        KikoError::Database {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<reqwest::Error> for KikoError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            KikoError::Timeout(std::time::Duration::from_secs(0))
        } else {
            KikoError::Network {
                message: err.to_string(),
                source: Some(err),
            }
        }
    }
}

impl KikoError {
    /// Create an IO error with path context.
    pub fn io_with_path(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        KikoError::Io {
            message: err.to_string(),
            path: Some(path.into()),
            source: Some(err),
        }
    }

    /// Whether a later run could reasonably succeed where this one failed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            KikoError::Network { .. } | KikoError::Timeout(_) | KikoError::RateLimited { .. }
        )
    }

    /// Whether this error ends the whole run rather than a single item.
    pub fn is_run_fatal(&self) -> bool {
        matches!(
            self,
            KikoError::Config { .. }
                | KikoError::NoResolvableRoots
                | KikoError::Cancelled
                | KikoError::Yaml { .. }
        )
    }
}

/// Category of a per-item failure recorded during a scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    FileSystem,
    IdentityComputation,
    HeaderParse,
    RemoteFetch,
    PreviewDownload,
    /// A store read or write for one path or identity failed.
    Persistence,
    Configuration,
}

impl IssueKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IssueKind::FileSystem => "file_system",
            IssueKind::IdentityComputation => "identity_computation",
            IssueKind::HeaderParse => "header_parse",
            IssueKind::RemoteFetch => "remote_fetch",
            IssueKind::PreviewDownload => "preview_download",
            IssueKind::Persistence => "persistence",
            IssueKind::Configuration => "configuration",
        }
    }
}

impl std::fmt::Display for IssueKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A degraded item: the scan went on, but this path or identity did not
/// get everything it should have.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanIssue {
    pub kind: IssueKind,
    /// The path or identity the failure belongs to.
    pub subject: String,
    pub message: String,
}

impl ScanIssue {
    pub fn new(kind: IssueKind, subject: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            subject: subject.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ScanIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}: {}", self.kind, self.subject, self.message)
    }
}
