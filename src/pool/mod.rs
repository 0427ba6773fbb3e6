//! Bounded-concurrency worker pool
//!
//! The pool maps an ordered list of [`WorkItem`]s onto a fixed number of
//! slots. Items are dispatched in source order; whenever a slot frees up the
//! next queued item takes it. Every item yields exactly one [`ItemReport`]:
//!
//! - processor errors and panics are caught at the task boundary and become
//!   [`ItemOutcome::Failed`]
//! - an item still running `teardown_grace` before `item_timeout` is asked to
//!   stop so it can release its agent; at `item_timeout` whatever remains is
//!   dropped and the item becomes [`ItemOutcome::TimedOut`]
//! - a task that dies outside that isolation (its teardown panicking, say)
//!   becomes `Failed` and its slot is reused
//! - items never dispatched because the run was cancelled become
//!   `Failed { reason: "run cancelled" }`
//!
//! Items are never retried.

mod slot;

pub use slot::{merge_artifacts, slot_dir, unique_path};

use futures::FutureExt;
use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, broadcast};
use tokio::task::{Id, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::{FileCollisionAction, PoolConfig};
use crate::detector::{CompletionDetector, DetectorOutcome};
use crate::error::ProcessorError;
use crate::processor::ItemProcessor;
use crate::types::{Event, ItemOutcome, ItemReport, SlotId, WorkItem};

/// Reason recorded for items that were never dispatched
pub const RUN_CANCELLED: &str = "run cancelled";

/// Fixed-size pool of item slots
pub struct WorkerPool {
    config: PoolConfig,
    processor: Arc<dyn ItemProcessor>,
    detector: Arc<dyn CompletionDetector>,
    event_tx: broadcast::Sender<Event>,
}

/// Shared state handed to every item task
struct ItemContext {
    processor: Arc<dyn ItemProcessor>,
    detector: Arc<dyn CompletionDetector>,
    event_tx: broadcast::Sender<Event>,
    output_dir: PathBuf,
    file_collision: FileCollisionAction,
    item_timeout: Duration,
    teardown_grace: Duration,
    /// Serializes name selection and renames into the shared output directory
    merge_lock: Mutex<()>,
}

impl ItemContext {
    fn emit(&self, event: Event) {
        self.event_tx.send(event).ok();
    }
}

impl WorkerPool {
    /// Create a pool; events are published on `event_tx`
    pub fn new(
        config: PoolConfig,
        processor: Arc<dyn ItemProcessor>,
        detector: Arc<dyn CompletionDetector>,
        event_tx: broadcast::Sender<Event>,
    ) -> Self {
        Self {
            config,
            processor,
            detector,
            event_tx,
        }
    }

    /// Process every item and return one report per item
    ///
    /// Reports are in completion order, not source order; use
    /// [`ItemReport::index`] to match them to the input. The output directory
    /// must exist.
    pub async fn run(&self, items: Vec<WorkItem>, cancel: &CancellationToken) -> Vec<ItemReport> {
        let total = items.len();
        if total == 0 {
            return Vec::new();
        }

        let ctx = Arc::new(ItemContext {
            processor: Arc::clone(&self.processor),
            detector: Arc::clone(&self.detector),
            event_tx: self.event_tx.clone(),
            output_dir: self.config.output_dir.clone(),
            file_collision: self.config.file_collision,
            item_timeout: self.config.item_timeout,
            teardown_grace: self.config.teardown_grace,
            merge_lock: Mutex::new(()),
        });

        // No point creating more slots than there are items
        let slot_count = self.config.workers.clamp(1, total);
        let mut free_slots: Vec<SlotId> = (0..slot_count).rev().map(SlotId).collect();
        let mut queue: VecDeque<(usize, WorkItem)> = items.into_iter().enumerate().collect();
        let mut in_flight: HashMap<Id, (usize, WorkItem, SlotId)> = HashMap::new();
        let mut tasks = JoinSet::new();
        let mut reports = Vec::with_capacity(total);

        tracing::debug!(
            processor = self.processor.name(),
            slots = slot_count,
            items = total,
            "worker pool started"
        );

        loop {
            while !cancel.is_cancelled() && !queue.is_empty() {
                let Some(slot) = free_slots.pop() else {
                    break;
                };
                let Some((index, item)) = queue.pop_front() else {
                    free_slots.push(slot);
                    break;
                };

                tracing::info!(
                    index,
                    slot = slot.0,
                    item = %item,
                    "Processing item {} of {}: {}",
                    index + 1,
                    total,
                    item
                );
                ctx.emit(Event::ItemDispatched {
                    index,
                    item: item.clone(),
                    slot,
                });

                let handle = tasks.spawn(supervise(
                    Arc::clone(&ctx),
                    index,
                    item.clone(),
                    slot,
                    cancel.child_token(),
                ));
                in_flight.insert(handle.id(), (index, item, slot));
            }

            let report = match tasks.join_next_with_id().await {
                None => break,
                Some(Ok((id, report))) => {
                    in_flight.remove(&id);
                    report
                }
                Some(Err(e)) => {
                    let Some((index, item, slot)) = in_flight.remove(&e.id()) else {
                        tracing::error!(error = %e, "unknown item task ended abnormally");
                        continue;
                    };
                    tracing::error!(index, item = %item, error = %e, "item task ended abnormally");
                    ItemReport {
                        index,
                        item,
                        slot: Some(slot),
                        outcome: ItemOutcome::failed(format!("item task ended abnormally: {e}")),
                        artifacts: Vec::new(),
                        elapsed: Duration::ZERO,
                    }
                }
            };

            if let Some(slot) = report.slot {
                free_slots.push(slot);
            }
            log_report(&report);
            ctx.emit(Event::ItemFinished {
                report: report.clone(),
            });
            reports.push(report);
        }

        // Only reachable with items left when the run was cancelled
        for (index, item) in queue {
            let report = ItemReport {
                index,
                item,
                slot: None,
                outcome: ItemOutcome::failed(RUN_CANCELLED),
                artifacts: Vec::new(),
                elapsed: Duration::ZERO,
            };
            log_report(&report);
            ctx.emit(Event::ItemFinished {
                report: report.clone(),
            });
            reports.push(report);
        }

        for slot in 0..slot_count {
            slot::discard(&slot_dir(&self.config.output_dir, slot)).await;
        }

        reports
    }
}

/// Run one item under the pool's timeout and panic isolation
async fn supervise(
    ctx: Arc<ItemContext>,
    index: usize,
    item: WorkItem,
    slot: SlotId,
    cancel: CancellationToken,
) -> ItemReport {
    let started = Instant::now();
    let deadline = started + ctx.item_timeout;
    let stop_at = deadline - ctx.teardown_grace.min(ctx.item_timeout / 2);
    let mut work = Box::pin(
        AssertUnwindSafe(process_item(
            Arc::clone(&ctx),
            index,
            item.clone(),
            slot,
            cancel.clone(),
        ))
        .catch_unwind(),
    );

    let (outcome, artifacts) = match tokio::time::timeout_at(stop_at, &mut work).await {
        Ok(finished) => task_result(finished),
        Err(_) => {
            tracing::warn!(
                index,
                item = %item,
                timeout_secs = ctx.item_timeout.as_secs_f64(),
                "item is about to exceed its timeout, stopping it"
            );
            cancel.cancel();
            match tokio::time::timeout_at(deadline, &mut work).await {
                // Finished its download before noticing the stop request
                Ok(finished) if matches!(finished, Ok((ItemOutcome::Completed, _))) => {
                    task_result(finished)
                }
                Ok(_) => (ItemOutcome::TimedOut, Vec::new()),
                Err(_) => {
                    tracing::warn!(
                        index,
                        item = %item,
                        "item ignored the stop request, aborting"
                    );
                    (ItemOutcome::TimedOut, Vec::new())
                }
            }
        }
    };
    // Dropping an unfinished future drops its agent lease before the report goes out
    drop(work);

    ItemReport {
        index,
        item,
        slot: Some(slot),
        outcome,
        artifacts,
        elapsed: started.elapsed(),
    }
}

/// Full lifecycle of one item inside its slot directory
async fn process_item(
    ctx: Arc<ItemContext>,
    index: usize,
    item: WorkItem,
    slot: SlotId,
    cancel: CancellationToken,
) -> (ItemOutcome, Vec<PathBuf>) {
    let dir = slot_dir(&ctx.output_dir, slot.0);
    if let Err(e) = slot::prepare(&dir).await {
        return (
            ItemOutcome::failed(format!("cannot prepare slot directory: {e}")),
            Vec::new(),
        );
    }

    let result = download(&ctx, index, &item, &dir, &cancel).await;
    slot::discard(&dir).await;
    result
}

async fn download(
    ctx: &ItemContext,
    index: usize,
    item: &WorkItem,
    dir: &Path,
    cancel: &CancellationToken,
) -> (ItemOutcome, Vec<PathBuf>) {
    let lease = match ctx.processor.process(item, dir, cancel).await {
        Ok(lease) => lease,
        Err(e) => return (outcome_for(&e), Vec::new()),
    };

    tracing::debug!(index, item = %item, "download triggered, waiting for artifact");
    ctx.emit(Event::ItemAwaitingArtifact {
        index,
        item: item.clone(),
    });

    let detected = ctx.detector.await_completion(dir, cancel).await;
    lease.release().await;

    match detected {
        Ok(DetectorOutcome::Completed { artifacts }) => {
            let _merging = ctx.merge_lock.lock().await;
            match slot::merge_artifacts(&artifacts, &ctx.output_dir, ctx.file_collision).await {
                Ok(merged) => (ItemOutcome::Completed, merged),
                Err(e) => (
                    ItemOutcome::failed(format!("failed to move artifacts: {e}")),
                    Vec::new(),
                ),
            }
        }
        Ok(DetectorOutcome::TimedOut { pending }) => {
            (outcome_for(&ProcessorError::DownloadTimeout { pending }), Vec::new())
        }
        Ok(DetectorOutcome::Cancelled) => (outcome_for(&ProcessorError::Cancelled), Vec::new()),
        Err(e) => (
            ItemOutcome::failed(format!("cannot observe download directory: {e}")),
            Vec::new(),
        ),
    }
}

type TaskResult = std::thread::Result<(ItemOutcome, Vec<PathBuf>)>;

fn task_result(finished: TaskResult) -> (ItemOutcome, Vec<PathBuf>) {
    finished.unwrap_or_else(|panic| {
        (
            ItemOutcome::failed(format!("item task panicked: {}", panic_message(panic.as_ref()))),
            Vec::new(),
        )
    })
}

/// Map an item-level error to its terminal outcome
fn outcome_for(error: &ProcessorError) -> ItemOutcome {
    match error {
        ProcessorError::DownloadTimeout { .. } => ItemOutcome::TimedOut,
        other => ItemOutcome::failed(other.to_string()),
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn log_report(report: &ItemReport) {
    let elapsed_ms = report.elapsed.as_millis() as u64;
    match &report.outcome {
        ItemOutcome::Completed => tracing::info!(
            index = report.index,
            item = %report.item,
            elapsed_ms,
            files = report.artifacts.len(),
            "Downloaded {}",
            report.item
        ),
        ItemOutcome::TimedOut => tracing::warn!(
            index = report.index,
            item = %report.item,
            elapsed_ms,
            "Timed out: {}",
            report.item
        ),
        ItemOutcome::Failed { reason } => tracing::warn!(
            index = report.index,
            item = %report.item,
            elapsed_ms,
            reason = %reason,
            "Failed: {}",
            report.item
        ),
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;
