//! Run coordinator: fetch the collection, run the pool, summarize

use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::detector::{CompletionDetector, MarkerDetector};
use crate::error::{Error, Result};
use crate::pool::WorkerPool;
use crate::processor::{ItemProcessor, WebDriverProcessor};
use crate::source::{self, ItemSource, YouTubePlaylistSource};
use crate::types::{Event, RunSummary};

/// Capacity of the event broadcast channel
const EVENT_CHANNEL_CAPACITY: usize = 1000;

/// Entry point for a complete run over one collection
///
/// The coordinator owns the configuration and the three pluggable components.
/// It is reusable: every [`run`](RunCoordinator::run) builds a fresh summary.
///
/// # Example
///
/// ```no_run
/// use playlist_dl::{Config, RunCoordinator};
/// use tokio_util::sync::CancellationToken;
///
/// # async fn example() -> playlist_dl::Result<()> {
/// let mut config = Config::default();
/// config.source.api_key = Some("my-api-key".to_string());
///
/// let coordinator = RunCoordinator::from_config(config)?;
/// let mut events = coordinator.subscribe();
/// tokio::spawn(async move {
///     while let Ok(event) = events.recv().await {
///         println!("{event:?}");
///     }
/// });
///
/// let summary = coordinator.run("PLxxxxxxxx", &CancellationToken::new()).await?;
/// println!("{summary}");
/// # Ok(())
/// # }
/// ```
pub struct RunCoordinator {
    config: Arc<Config>,
    source: Arc<dyn ItemSource>,
    processor: Arc<dyn ItemProcessor>,
    detector: Arc<dyn CompletionDetector>,
    event_tx: broadcast::Sender<Event>,
}

impl RunCoordinator {
    /// Create a coordinator from explicit components
    ///
    /// # Errors
    /// Returns a configuration error if `config` does not validate.
    pub fn new(
        config: Config,
        source: Arc<dyn ItemSource>,
        processor: Arc<dyn ItemProcessor>,
        detector: Arc<dyn CompletionDetector>,
    ) -> Result<Self> {
        config.validate()?;
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Ok(Self {
            config: Arc::new(config),
            source,
            processor,
            detector,
            event_tx,
        })
    }

    /// Create a coordinator with the YouTube source, the WebDriver processor
    /// and the marker detector
    ///
    /// # Errors
    /// Returns a configuration error if the API key is missing, no WebDriver
    /// server can be resolved, or `config` does not validate.
    pub fn from_config(config: Config) -> Result<Self> {
        config.validate()?;
        let source = YouTubePlaylistSource::new(&config.source, config.retry.clone())?;
        let processor = WebDriverProcessor::new(config.processor.clone())?;
        let detector = MarkerDetector::new(config.detector.clone());

        Self::new(
            config,
            Arc::new(source),
            Arc::new(processor),
            Arc::new(detector),
        )
    }

    /// Subscribe to run events
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.event_tx.subscribe()
    }

    /// The configuration this coordinator runs with
    pub fn config(&self) -> &Config {
        &self.config
    }

    fn emit(&self, event: Event) {
        self.event_tx.send(event).ok();
    }

    /// Process every item of `collection_id`
    ///
    /// Item failures are part of the summary, not errors. `cancel` stops
    /// dispatching; in-flight items are torn down and every remaining item
    /// is still reported.
    ///
    /// # Errors
    /// - [`Error::Config`] for an empty collection id
    /// - [`Error::SourceUnavailable`] if the item list cannot be fetched; no
    ///   item is dispatched in that case
    /// - [`Error::Cancelled`] if cancelled before the item list was fetched
    /// - [`Error::Io`] if the output directory cannot be created
    pub async fn run(&self, collection_id: &str, cancel: &CancellationToken) -> Result<RunSummary> {
        let collection_id = collection_id.trim();
        if collection_id.is_empty() {
            return Err(Error::config("collection_id", "must not be empty"));
        }

        let output_dir = &self.config.pool.output_dir;
        if !output_dir.exists() {
            tokio::fs::create_dir_all(output_dir).await?;
            tracing::info!(dir = %output_dir.display(), "Created output directory");
        }

        let mut summary = RunSummary::new(collection_id);
        tracing::info!(
            collection_id,
            source = self.source.name(),
            workers = self.config.pool.workers,
            "Fetching items"
        );
        self.emit(Event::RunStarted {
            collection_id: collection_id.to_string(),
        });

        let items = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::warn!(collection_id, "Run cancelled while fetching items");
                return Err(Error::Cancelled);
            }
            result = source::fetch_all(self.source.as_ref(), collection_id) => match result {
                Ok(items) => items,
                Err(e) => {
                    tracing::error!(collection_id, error = %e, "Could not fetch items, nothing dispatched");
                    return Err(e);
                }
            },
        };
        tracing::info!(collection_id, items = items.len(), "Found {} items in the collection", items.len());
        self.emit(Event::ItemsFetched { count: items.len() });

        let pool = WorkerPool::new(
            self.config.pool.clone(),
            Arc::clone(&self.processor),
            Arc::clone(&self.detector),
            self.event_tx.clone(),
        );
        for report in pool.run(items, cancel).await {
            summary.record(report);
        }
        summary.finish();

        self.emit(Event::RunFinished {
            counts: summary.counts,
        });
        tracing::info!(
            collection_id,
            succeeded = summary.counts.succeeded,
            timed_out = summary.counts.timed_out,
            failed = summary.counts.failed,
            total = summary.counts.total,
            "Run finished: {}",
            summary
        );

        Ok(summary)
    }
}
