//! Error types for loopwatch-core operations.
//!
//! Nothing here is fatal to a running watcher: transport and poll errors are
//! retried, and only their rendered message reaches the read model.

use std::path::PathBuf;

/// All errors that can occur in loopwatch-core operations.
#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    // ─────────────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Configuration file malformed: {path}: {details}")]
    ConfigMalformed { path: PathBuf, details: String },

    #[error("Configuration read failed: {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid URL {url}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("Stream URL is empty")]
    EmptyUrl,

    // ─────────────────────────────────────────────────────────────────────
    // Transport Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("HTTP request failed: {context}: {source}")]
    Http {
        context: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("HTTP {status} from {url}")]
    HttpStatus {
        url: String,
        status: reqwest::StatusCode,
    },

    #[error("Stream closed by server: {0}")]
    StreamClosed(String),

    #[error("No async runtime available: {0}")]
    Runtime(String),

    // ─────────────────────────────────────────────────────────────────────
    // Decoding Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("JSON parsing error: {context}: {source}")]
    Json {
        context: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Convenience type alias for Results using WatchError.
pub type Result<T> = std::result::Result<T, WatchError>;

impl From<WatchError> for String {
    fn from(err: WatchError) -> String {
        err.to_string()
    }
}
