//! Error taxonomy for the tracing core.
//!
//! Validation failures (a malformed run id, a path that would escape the
//! storage root) and lookups that find nothing are distinct variants so a
//! caller such as the CLI can map them to different exit codes. Recording
//! outside a run is not an error at all and never reaches this type.

use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

/// Boxed error returned by user-registered run hooks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid run_id: {0:?}")]
    InvalidRunId(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }

    /// True for lookups that matched no run.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    /// True for rejected input (malformed id, traversal attempt).
    pub fn is_validation(&self) -> bool {
        matches!(self, Error::InvalidRunId(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_distinguishable() {
        let invalid = Error::InvalidRunId("../etc".into());
        let missing = Error::NotFound("no run matching 'abc'".into());
        assert!(invalid.is_validation());
        assert!(!invalid.is_not_found());
        assert!(missing.is_not_found());
        assert!(!missing.is_validation());
    }

    #[test]
    fn io_error_mentions_path() {
        let err = Error::io(
            "/tmp/runs/x/run.json",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        let msg = err.to_string();
        assert!(msg.contains("/tmp/runs/x/run.json"), "got: {msg}");
        assert!(msg.contains("denied"));
    }
}
