use std::path::PathBuf;

use thiserror::Error;

/// Failures surfaced by the relay core.
///
/// Only the rendered message crosses to observers, through
/// `PublishedStatus::error_message`.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Missing or invalid inputs. Not retried; needs external correction.
    #[error("{0}")]
    Configuration(String),
    /// Server or manifest not ready within the readiness budget.
    #[error("{0}")]
    StartupTimeout(String),
    /// Transcoder exited unexpectedly while running. Retried with backoff.
    #[error("ffmpeg exited with code {code}.")]
    ProcessFailure { code: i32 },
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl RelayError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether the supervisor should schedule a backoff restart for this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ProcessFailure { .. })
    }
}
