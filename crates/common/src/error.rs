//! Error types for Appdex

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using Appdex Error
pub type Result<T> = std::result::Result<T, Error>;

/// Appdex error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Resource not found: {kind} with id {id}")]
    NotFound { kind: String, id: String },

    #[error("Unreadable file {path}: {reason}")]
    Unreadable { path: PathBuf, reason: String },

    #[error("No free port among {span} ports starting at {base}")]
    PortExhausted { base: u16, span: u16 },

    #[error("Port {port} is in use by {holder}")]
    PortBusy { port: u16, holder: PathBuf },

    #[error("Launch failed for {key}: {reason}")]
    LaunchFailed { key: PathBuf, reason: String },

    #[error("Page load timed out after {seconds}s: {url}")]
    CaptureTimeout { url: String, seconds: u64 },

    #[error("Capture failed: {0}")]
    Capture(String),

    #[error("No headless browser found; set capture.browser_binary")]
    BrowserNotFound,

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Shorthand for a missing indexed item
    pub fn item_not_found(id: i64) -> Self {
        Error::NotFound {
            kind: "item".to_string(),
            id: id.to_string(),
        }
    }

    /// Errors worth one more attempt. Launch failures are not: a crashed app
    /// only gets retried on the next explicit thumbnail request.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::CaptureTimeout { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_exhausted_message() {
        let err = Error::PortExhausted { base: 5000, span: 10 };
        assert_eq!(err.to_string(), "No free port among 10 ports starting at 5000");
    }

    #[test]
    fn test_transient() {
        let timeout = Error::CaptureTimeout {
            url: "http://127.0.0.1:5000/".to_string(),
            seconds: 20,
        };
        assert!(timeout.is_transient());

        let launch = Error::LaunchFailed {
            key: PathBuf::from("/tmp/app.py"),
            reason: "exited with status 1".to_string(),
        };
        assert!(!launch.is_transient());
    }
}
