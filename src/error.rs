//! Error types for playlist-dl
//!
//! Errors are split by the boundary they are allowed to cross:
//! - [`Error`] is the run-level error returned to callers of the coordinator
//! - [`SourceError`] describes listing-service failures (always fatal for a run)
//! - [`ProcessorError`] describes failures inside one item task; these never
//!   leave the task boundary and are converted into an
//!   [`ItemOutcome`](crate::types::ItemOutcome) instead

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for playlist-dl operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for playlist-dl
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "workers")
        key: Option<String>,
    },

    /// The item source could not produce the full item list; nothing was dispatched
    #[error("item source unavailable for collection '{collection_id}': {source}")]
    SourceUnavailable {
        /// The collection identifier that was requested
        collection_id: String,
        /// The underlying listing failure
        #[source]
        source: SourceError,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Network error
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The run was cancelled before it could start
    #[error("run cancelled")]
    Cancelled,
}

impl Error {
    /// Build a [`Error::Config`] for a specific configuration key
    pub fn config(key: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Config {
            message: message.into(),
            key: Some(key.into()),
        }
    }
}

/// Listing-service errors
#[derive(Debug, Error)]
pub enum SourceError {
    /// The credential or request was rejected by the listing service
    #[error("request rejected (HTTP {status}): {message}")]
    Rejected {
        /// HTTP status code returned by the service
        status: u16,
        /// Error message reported by the service
        message: String,
    },

    /// The collection identifier does not resolve
    #[error("collection not found: {message}")]
    NotFound {
        /// Error message reported by the service
        message: String,
    },

    /// Transient server-side failure (rate limited, 5xx)
    #[error("service temporarily unavailable (HTTP {status}): {message}")]
    Unavailable {
        /// HTTP status code returned by the service
        status: u16,
        /// Error message reported by the service
        message: String,
    },

    /// Transport-level failure
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// The response could not be interpreted
    #[error("malformed response: {0}")]
    Malformed(String),

    /// The service handed back a page token it had already returned
    #[error("pagination loop detected at page token '{0}'")]
    PaginationLoop(String),
}

/// Errors raised inside a single item task
///
/// The worker pool converts these into `ItemOutcome::Failed` (or
/// `ItemOutcome::TimedOut` for download timeouts); they are never propagated.
#[derive(Debug, Error)]
pub enum ProcessorError {
    /// One interaction step did not reach its expected state in time
    #[error("step '{step}' timed out after {}s", timeout.as_secs_f64())]
    StepTimeout {
        /// Name of the interaction step
        step: String,
        /// The wait that was exceeded
        timeout: Duration,
    },

    /// The completion detector gave up waiting for the artifact
    #[error("download did not finish in time ({} file(s) still in progress)", pending.len())]
    DownloadTimeout {
        /// Files still carrying a transient marker when the detector gave up
        pending: Vec<PathBuf>,
    },

    /// The external agent could not be launched
    #[error("failed to launch external agent: {0}")]
    Launch(String),

    /// The automation protocol reported an error
    #[error("automation error during '{step}': {message}")]
    Automation {
        /// Name of the step (or protocol command) that failed
        step: String,
        /// Error reported by the agent
        message: String,
    },

    /// The item was cancelled at a step boundary
    #[error("cancelled")]
    Cancelled,

    /// I/O error while preparing or collecting the item's output
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Any other failure
    #[error("{0}")]
    Other(String),
}
