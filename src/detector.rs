//! Completion detection by observing a download directory
//!
//! The item processor returns as soon as the download has been *triggered*;
//! the browser keeps writing the file afterwards. The detector infers when the
//! artifact is final from the directory contents alone: files carrying a
//! transient marker suffix (`.part` for Firefox) are still being written, and
//! the download is complete once no marker remains.
//!
//! Each worker slot has its own directory, so a detector only ever sees the
//! files of the item it is waiting for.

use async_trait::async_trait;
use notify::event::ModifyKind;
use notify::{Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::DetectorConfig;

/// Result of waiting for an artifact
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DetectorOutcome {
    /// No transient markers remain
    Completed {
        /// Final files found in the directory
        artifacts: Vec<PathBuf>,
    },
    /// The timeout elapsed while the download was still in progress
    TimedOut {
        /// Files still carrying a transient marker
        pending: Vec<PathBuf>,
    },
    /// The wait was cancelled
    Cancelled,
}

/// Decides when an in-flight download has finished
#[async_trait]
pub trait CompletionDetector: Send + Sync {
    /// Wait until the artifact in `dir` is final, the timeout elapses, or `cancel` fires
    async fn await_completion(
        &self,
        dir: &Path,
        cancel: &CancellationToken,
    ) -> std::io::Result<DetectorOutcome>;
}

/// Snapshot of a download directory
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DirScan {
    /// Files with a transient marker suffix
    pub pending: Vec<PathBuf>,
    /// All other regular files
    pub finished: Vec<PathBuf>,
}

impl DirScan {
    /// Whether the scan shows a finished download
    pub fn is_complete(&self, require_artifact: bool) -> bool {
        self.pending.is_empty() && (!require_artifact || !self.finished.is_empty())
    }
}

/// Check whether a file name carries one of the transient marker suffixes
pub fn is_transient(path: &Path, marker_suffixes: &[String]) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|name| marker_suffixes.iter().any(|suffix| name.ends_with(suffix.as_str())))
        .unwrap_or(false)
}

/// List the regular files of `dir`, split into in-progress and final files
///
/// Subdirectories are ignored. Both lists are sorted by path.
pub async fn scan_dir(dir: &Path, marker_suffixes: &[String]) -> std::io::Result<DirScan> {
    let mut scan = DirScan::default();
    let mut entries = tokio::fs::read_dir(dir).await?;

    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_file() {
            continue;
        }
        let path = entry.path();
        if is_transient(&path, marker_suffixes) {
            scan.pending.push(path);
        } else {
            scan.finished.push(path);
        }
    }

    scan.pending.sort();
    scan.finished.sort();
    Ok(scan)
}

/// Polling detector keyed on transient marker suffixes
///
/// Scans the directory every `poll_interval`. When `watch_events` is enabled,
/// filesystem notifications for the directory trigger an extra scan between
/// ticks; if no watcher can be created the detector keeps polling.
pub struct MarkerDetector {
    config: DetectorConfig,
}

impl MarkerDetector {
    /// Create a detector from configuration
    pub fn new(config: DetectorConfig) -> Self {
        Self { config }
    }

    /// Start a non-recursive watcher on `dir`
    ///
    /// Only creations, removals and renames are forwarded; content writes to a
    /// growing `.part` file would otherwise trigger a rescan per chunk.
    fn watch(dir: &Path) -> Option<(RecommendedWatcher, mpsc::UnboundedReceiver<()>)> {
        let (tx, rx) = mpsc::unbounded_channel();

        let watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| {
                if let Ok(event) = res {
                    if matches!(
                        event.kind,
                        EventKind::Create(_) | EventKind::Remove(_) | EventKind::Modify(ModifyKind::Name(_))
                    ) {
                        tx.send(()).ok();
                    }
                }
            },
            NotifyConfig::default(),
        );

        let mut watcher = match watcher {
            Ok(w) => w,
            Err(e) => {
                tracing::debug!(error = %e, "filesystem watcher unavailable, polling only");
                return None;
            }
        };

        if let Err(e) = watcher.watch(dir, RecursiveMode::NonRecursive) {
            tracing::debug!(dir = %dir.display(), error = %e, "cannot watch directory, polling only");
            return None;
        }

        Some((watcher, rx))
    }
}

/// Wait for the next forwarded filesystem event; pends forever without a watcher
async fn next_event(events: &mut Option<mpsc::UnboundedReceiver<()>>) {
    match events {
        Some(rx) => {
            if rx.recv().await.is_none() {
                std::future::pending::<()>().await;
            }
            // Coalesce bursts into a single rescan
            while rx.try_recv().is_ok() {}
        }
        None => std::future::pending::<()>().await,
    }
}

#[async_trait]
impl CompletionDetector for MarkerDetector {
    async fn await_completion(
        &self,
        dir: &Path,
        cancel: &CancellationToken,
    ) -> std::io::Result<DetectorOutcome> {
        let deadline = Instant::now() + self.config.download_timeout;

        // The watcher must stay alive for as long as we read its channel
        let (_watcher, mut events) = match self.config.watch_events {
            true => match Self::watch(dir) {
                Some((watcher, rx)) => (Some(watcher), Some(rx)),
                None => (None, None),
            },
            false => (None, None),
        };

        loop {
            let scan = scan_dir(dir, &self.config.marker_suffixes).await?;
            if scan.is_complete(self.config.require_artifact) {
                tracing::debug!(dir = %dir.display(), files = scan.finished.len(), "download complete");
                return Ok(DetectorOutcome::Completed {
                    artifacts: scan.finished,
                });
            }

            let now = Instant::now();
            if now >= deadline {
                tracing::warn!(
                    dir = %dir.display(),
                    pending = scan.pending.len(),
                    timeout_secs = self.config.download_timeout.as_secs_f64(),
                    "download did not finish in time"
                );
                return Ok(DetectorOutcome::TimedOut {
                    pending: scan.pending,
                });
            }

            let next_scan = (now + self.config.poll_interval).min(deadline);
            tokio::select! {
                _ = cancel.cancelled() => return Ok(DetectorOutcome::Cancelled),
                _ = tokio::time::sleep_until(next_scan) => {}
                _ = next_event(&mut events) => {}
            }
        }
    }
}
