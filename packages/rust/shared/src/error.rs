//! Error types for deltacrawl.
//!
//! Library crates use [`DeltaCrawlError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for run-level deltacrawl failures.
///
/// Per-URL and per-entity failures never surface here; they are recovered
/// locally and aggregated into run statistics.
#[derive(Debug, thiserror::Error)]
pub enum DeltaCrawlError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Network/HTTP error that prevents a component from starting.
    #[error("network error: {0}")]
    Network(String),

    /// Parse error (URLs, stored JSON, bridge messages).
    #[error("parse error: {message}")]
    Parse { message: String },

    /// Database or storage layer error. Always fatal for the run.
    #[error("storage error: {0}")]
    Storage(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error (unknown status, invalid record, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, DeltaCrawlError>;

impl DeltaCrawlError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a parse error from any displayable message.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Wrap any displayable storage failure.
    pub fn storage(err: impl std::fmt::Display) -> Self {
        Self::Storage(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formatting() {
        let err = DeltaCrawlError::config("no source groups configured");
        assert_eq!(err.to_string(), "config error: no source groups configured");

        let err = DeltaCrawlError::validation("unknown entity status 'gone'");
        assert!(err.to_string().contains("'gone'"));

        let err = DeltaCrawlError::storage("disk full");
        assert_eq!(err.to_string(), "storage error: disk full");
    }
}
