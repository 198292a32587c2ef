//! Error types for Harvester.
//!
//! Library crates use [`HarvesterError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.
//!
//! Early pipeline termination is not an error: nodes signal it through
//! their return value, so nothing in here should ever be caught to mean
//! "stop quietly".

use std::path::PathBuf;

/// Top-level error type for all Harvester operations.
#[derive(Debug, thiserror::Error)]
pub enum HarvesterError {
    /// Configuration loading or validation error, or a missing required handle.
    #[error("config error: {message}")]
    Config { message: String },

    /// Network/HTTP error during a crawl or download.
    #[error("network error: {0}")]
    Network(String),

    /// The remote side rejected our credentials.
    #[error("access denied: {0}")]
    AccessDenied(String),

    /// HTML parsing, pattern compilation or content extraction error.
    #[error("parse error: {message}")]
    Parse { message: String },

    /// Content store error (objects, branches, pointers).
    #[error("storage error: {0}")]
    Storage(String),

    /// The `git` executable failed or returned something unexpected.
    #[error("version control error: {0}")]
    VersionControl(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error (missing field, invalid path, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, HarvesterError>;

impl HarvesterError {
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

    /// Whether this error means the credentials were refused.
    pub fn is_access_denied(&self) -> bool {
        matches!(self, Self::AccessDenied(_))
    }
}
