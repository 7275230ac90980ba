//! Error type for the counting pipeline.
//!
//! Every failure mode is fatal: errors propagate to the current phase
//! boundary and abort the run. The kinds mirror how a failure should be
//! reported, not where it occurred.

use std::path::PathBuf;
use thiserror::Error;

/// Unified error type for the fastk library.
#[derive(Debug, Error)]
pub enum FastkError {
    /// Invalid options or an incompatible pre-existing output.
    #[error("{0}")]
    Config(String),

    /// Unusable input data (too-short sequences, malformed records).
    #[error("{0}")]
    Input(String),

    /// A resource budget cannot be met (file descriptors, run indices).
    #[error("{0}")]
    Resource(String),

    /// I/O failure with path context.
    #[error("{op} failed on '{}': {source}", path.display())]
    Io {
        /// File the operation was applied to.
        path: PathBuf,
        /// Short verb naming the operation ("open", "read", "write", ...).
        op: &'static str,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// An internal invariant was violated; indicates a bug.
    #[error("invariant violated: {0}")]
    Invariant(String),
}

impl FastkError {
    /// I/O error with path context.
    pub fn io(path: impl Into<PathBuf>, op: &'static str, source: std::io::Error) -> Self {
        FastkError::Io {
            path: path.into(),
            op,
            source,
        }
    }

    /// Configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        FastkError::Config(msg.into())
    }

    /// Input error.
    pub fn input(msg: impl Into<String>) -> Self {
        FastkError::Input(msg.into())
    }

    /// Resource error.
    pub fn resource(msg: impl Into<String>) -> Self {
        FastkError::Resource(msg.into())
    }

    /// Invariant violation.
    pub fn invariant(msg: impl Into<String>) -> Self {
        FastkError::Invariant(msg.into())
    }
}

/// Convenience alias used throughout the library.
pub type Result<T> = std::result::Result<T, FastkError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_display() {
        let err = FastkError::io(
            "/tmp/x.smer",
            "read",
            std::io::Error::new(std::io::ErrorKind::NotFound, "file not found"),
        );
        let msg = err.to_string();
        assert!(msg.contains("/tmp/x.smer"));
        assert!(msg.contains("read"));
        assert!(msg.contains("file not found"));
    }

    #[test]
    fn test_error_source_chain() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "not found");
        let err = FastkError::io("/tmp/x", "open", io_err);
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_invariant_display() {
        let err = FastkError::invariant("super-mer length out of range");
        assert!(err.to_string().contains("invariant violated"));
    }
}
