//! # playlist-dl
//!
//! Downloads every video of a playlist by driving a browser through a
//! converter site, a bounded number of items at a time.
//!
//! ## Design
//!
//! A run has four moving parts, each behind a trait so it can be replaced:
//! - **Item source** ([`source::ItemSource`]): turns a playlist id into an
//!   ordered list of [`WorkItem`]s, all pages or nothing
//! - **Item processor** ([`processor::ItemProcessor`]): triggers the download
//!   of one item into a directory
//! - **Completion detector** ([`detector::CompletionDetector`]): watches that
//!   directory until no partially written file remains
//! - **Worker pool** ([`pool::WorkerPool`]): runs at most `workers` items at
//!   once, enforces the per-item timeout and turns every error, panic or hang
//!   into exactly one [`ItemOutcome`]
//!
//! The [`RunCoordinator`] ties them together and returns a [`RunSummary`].
//!
//! ## Quick Start
//!
//! ```no_run
//! use playlist_dl::{Config, RunCoordinator};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut config = Config::default();
//!     config.source.api_key = std::env::var("API_KEY").ok();
//!     config.pool.workers = 3;
//!
//!     let coordinator = RunCoordinator::from_config(config)?;
//!     let summary = coordinator
//!         .run("PLxxxxxxxx", &CancellationToken::new())
//!         .await?;
//!
//!     println!("{summary}");
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Configuration types
pub mod config;
/// Run coordinator
pub mod coordinator;
/// Download completion detection
pub mod detector;
/// Error types
pub mod error;
/// Worker pool
pub mod pool;
/// Item processors (browser automation)
pub mod processor;
/// Retry logic with exponential backoff
pub mod retry;
/// Item sources (playlist listing)
pub mod source;
/// Core types and events
pub mod types;

// Re-export commonly used types
pub use config::Config;
pub use coordinator::RunCoordinator;
pub use detector::{CompletionDetector, DetectorOutcome, MarkerDetector};
pub use error::{Error, ProcessorError, Result, SourceError};
pub use pool::WorkerPool;
pub use processor::{AgentLease, ItemProcessor, WebDriverProcessor};
pub use source::{ItemSource, YouTubePlaylistSource};
pub use types::{Event, ItemOutcome, ItemReport, OutcomeCounts, RunSummary, SlotId, WorkItem};

use tokio_util::sync::CancellationToken;

/// Cancel `token` when the process receives a termination signal.
///
/// Spawns a background task; the returned handle can be aborted once the run
/// is over.
///
/// Listens for SIGTERM and SIGINT on Unix and for Ctrl+C elsewhere.
///
/// # Example
///
/// ```no_run
/// use playlist_dl::{RunCoordinator, cancel_on_signal};
/// use tokio_util::sync::CancellationToken;
///
/// # async fn example(coordinator: RunCoordinator) -> playlist_dl::Result<()> {
/// let cancel = CancellationToken::new();
/// let signals = cancel_on_signal(cancel.clone());
///
/// let summary = coordinator.run("PLxxxxxxxx", &cancel).await?;
/// signals.abort();
/// # Ok(())
/// # }
/// ```
pub fn cancel_on_signal(token: CancellationToken) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        wait_for_signal().await;
        tracing::warn!("Cancelling run, in-flight items will be torn down");
        token.cancel();
    })
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    // Registration can fail in restricted sandboxes; fall back to ctrl_c then
    match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
        (Ok(mut term), Ok(mut int)) => {
            let name = tokio::select! {
                _ = term.recv() => "SIGTERM",
                _ = int.recv() => "SIGINT",
            };
            tracing::info!(signal = name, "Received termination signal");
        }
        (term, int) => {
            if let Err(e) = term.as_ref().and(int.as_ref()) {
                tracing::warn!(error = %e, "Could not register signal handlers, using ctrl_c");
            }
            match tokio::signal::ctrl_c().await {
                Ok(()) => tracing::info!(signal = "ctrl_c", "Received termination signal"),
                Err(e) => tracing::error!(error = %e, "Failed to listen for Ctrl+C"),
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!(signal = "ctrl_c", "Received termination signal"),
        Err(e) => tracing::error!(error = %e, "Failed to listen for Ctrl+C"),
    }
}
