//! Core types for playlist-dl

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// One unit of work: an opaque locator handed to the item processor
///
/// Identity is the value itself. Duplicates are processed independently; the
/// pool tells them apart by their position in source order.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkItem(String);

impl WorkItem {
    /// Create a new WorkItem
    pub fn new(locator: impl Into<String>) -> Self {
        Self(locator.into())
    }

    /// The locator as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for WorkItem {
    fn from(locator: String) -> Self {
        Self(locator)
    }
}

impl From<&str> for WorkItem {
    fn from(locator: &str) -> Self {
        Self(locator.to_string())
    }
}

impl std::fmt::Display for WorkItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of a worker slot (0-based, below the configured worker count)
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SlotId(pub usize);

impl std::fmt::Display for SlotId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Terminal result of processing one WorkItem
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ItemOutcome {
    /// The artifact finished materializing
    Completed,
    /// The item exceeded its timeout, or the download never finished
    TimedOut,
    /// The item failed; the reason is kept for diagnostics
    Failed {
        /// Human-readable failure reason
        reason: String,
    },
}

impl ItemOutcome {
    /// Shorthand for a [`ItemOutcome::Failed`] outcome
    pub fn failed(reason: impl Into<String>) -> Self {
        ItemOutcome::Failed {
            reason: reason.into(),
        }
    }

    /// Whether the outcome is [`ItemOutcome::Completed`]
    pub fn is_completed(&self) -> bool {
        matches!(self, ItemOutcome::Completed)
    }
}

/// An outcome matched to the WorkItem it belongs to
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ItemReport {
    /// Position of the item in source order
    pub index: usize,
    /// The item that was processed
    pub item: WorkItem,
    /// The slot the item ran in (None if it was never dispatched)
    pub slot: Option<SlotId>,
    /// Terminal outcome
    pub outcome: ItemOutcome,
    /// Final artifacts moved into the output directory (empty unless completed)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<PathBuf>,
    /// Wall-clock time from dispatch to outcome
    #[serde(with = "duration_millis")]
    pub elapsed: Duration,
}

/// Outcome counts derived from a multiset of [`ItemOutcome`]s
///
/// Recording is a commutative fold, so the counts do not depend on the order
/// outcomes arrive in.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeCounts {
    /// Items whose artifact completed
    pub succeeded: usize,
    /// Items that timed out
    pub timed_out: usize,
    /// Items that failed
    pub failed: usize,
    /// All items with an outcome
    pub total: usize,
}

impl OutcomeCounts {
    /// Count one outcome
    pub fn record(&mut self, outcome: &ItemOutcome) {
        match outcome {
            ItemOutcome::Completed => self.succeeded += 1,
            ItemOutcome::TimedOut => self.timed_out += 1,
            ItemOutcome::Failed { .. } => self.failed += 1,
        }
        self.total += 1;
    }

    /// Fold any sequence of outcomes into counts
    pub fn from_outcomes<'a>(outcomes: impl IntoIterator<Item = &'a ItemOutcome>) -> Self {
        let mut counts = Self::default();
        for outcome in outcomes {
            counts.record(outcome);
        }
        counts
    }
}

impl std::ops::Add for OutcomeCounts {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self {
            succeeded: self.succeeded + rhs.succeeded,
            timed_out: self.timed_out + rhs.timed_out,
            failed: self.failed + rhs.failed,
            total: self.total + rhs.total,
        }
    }
}

/// Aggregated result of one run
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunSummary {
    /// The collection that was processed
    pub collection_id: String,
    /// Outcome counts
    pub counts: OutcomeCounts,
    /// Every item report, in the order outcomes arrived
    pub reports: Vec<ItemReport>,
    /// When the run started
    pub started_at: DateTime<Utc>,
    /// When the last outcome was recorded (None while the run is in progress)
    pub finished_at: Option<DateTime<Utc>>,
}

impl RunSummary {
    /// Start an empty summary for a collection
    pub fn new(collection_id: impl Into<String>) -> Self {
        Self {
            collection_id: collection_id.into(),
            counts: OutcomeCounts::default(),
            reports: Vec::new(),
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Add one item report
    pub fn record(&mut self, report: ItemReport) {
        self.counts.record(&report.outcome);
        self.reports.push(report);
    }

    /// Mark the summary as final
    pub fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }

    /// Whether every item completed
    pub fn all_succeeded(&self) -> bool {
        self.counts.succeeded == self.counts.total
    }
}

impl std::fmt::Display for RunSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} items: {} succeeded, {} timed out, {} failed",
            self.counts.total, self.counts.succeeded, self.counts.timed_out, self.counts.failed
        )
    }
}

/// Event emitted by the run coordinator and worker pool
///
/// Events are broadcast to all subscribers; see
/// [`RunCoordinator::subscribe`](crate::RunCoordinator::subscribe).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// The run started fetching items
    RunStarted {
        /// Collection identifier
        collection_id: String,
    },

    /// The item source returned the full item list
    ItemsFetched {
        /// Number of items found
        count: usize,
    },

    /// An item was handed to a free slot
    ItemDispatched {
        /// Position in source order
        index: usize,
        /// The item
        item: WorkItem,
        /// The slot it runs in
        slot: SlotId,
    },

    /// The item's external interaction finished; waiting for the artifact
    ItemAwaitingArtifact {
        /// Position in source order
        index: usize,
        /// The item
        item: WorkItem,
    },

    /// An item produced its terminal outcome
    ItemFinished {
        /// The report for the item
        report: ItemReport,
    },

    /// The run finished
    RunFinished {
        /// Final counts
        counts: OutcomeCounts,
    },
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
