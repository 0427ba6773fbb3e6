//! Shared fakes for playlist-dl integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use playlist_dl::config::{DetectorConfig, RetryConfig, SourceConfig};
use playlist_dl::{
    AgentLease, Config, Event, ItemProcessor, MarkerDetector, ProcessorError, RunCoordinator,
    WorkItem, YouTubePlaylistSource,
};
use serde_json::json;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path, query_param, query_param_is_missing};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// How a scripted item behaves once dispatched
#[derive(Clone, Copy, Debug)]
pub enum Script {
    /// Write `<id>.mp4` after the delay
    Download(Duration),
    /// Wait until the item is cancelled
    Hang,
    /// Fail with an automation error
    Error,
}

/// Tracks concurrently live agents
#[derive(Default)]
pub struct AgentCounter {
    pub live: AtomicUsize,
    pub peak: AtomicUsize,
    pub launched: AtomicUsize,
}

struct CountedLease(Arc<AgentCounter>);

impl CountedLease {
    fn acquire(agents: &Arc<AgentCounter>) -> Self {
        let live = agents.live.fetch_add(1, Ordering::SeqCst) + 1;
        agents.peak.fetch_max(live, Ordering::SeqCst);
        agents.launched.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(agents))
    }
}

impl Drop for CountedLease {
    fn drop(&mut self) {
        self.0.live.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl AgentLease for CountedLease {
    async fn release(self: Box<Self>) {}
}

/// Processor whose behavior is scripted per video id
pub struct ScriptedProcessor {
    scripts: HashMap<String, Script>,
    pub agents: Arc<AgentCounter>,
}

impl ScriptedProcessor {
    pub fn new(scripts: &[(&str, Script)]) -> Arc<Self> {
        Arc::new(Self {
            scripts: scripts
                .iter()
                .map(|(id, script)| (id.to_string(), *script))
                .collect(),
            agents: Arc::new(AgentCounter::default()),
        })
    }
}

/// Video id of a watch URL (`...watch?v=<id>`)
pub fn video_id(item: &WorkItem) -> &str {
    item.as_str().rsplit('=').next().unwrap_or_default()
}

#[async_trait]
impl ItemProcessor for ScriptedProcessor {
    async fn process(
        &self,
        item: &WorkItem,
        output_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<Box<dyn AgentLease>, ProcessorError> {
        let lease = CountedLease::acquire(&self.agents);
        let id = video_id(item);

        match self.scripts.get(id).copied() {
            Some(Script::Download(delay)) => {
                let part = output_dir.join(format!("{id}.mp4.part"));
                tokio::fs::write(&part, b"half").await?;
                tokio::time::sleep(delay).await;
                tokio::fs::rename(&part, output_dir.join(format!("{id}.mp4"))).await?;
                Ok(Box::new(lease))
            }
            Some(Script::Hang) => {
                cancel.cancelled().await;
                Err(ProcessorError::Cancelled)
            }
            Some(Script::Error) | None => Err(ProcessorError::Automation {
                step: "paste link".into(),
                message: format!("no input field for {id}"),
            }),
        }
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}

/// Mount a single-page playlist response for `playlist_id`
pub async fn mount_playlist(server: &MockServer, playlist_id: &str, video_ids: &[&str]) {
    let items: Vec<_> = video_ids
        .iter()
        .map(|id| json!({"snippet": {"resourceId": {"kind": "youtube#video", "videoId": id}}}))
        .collect();

    Mock::given(method("GET"))
        .and(path("/playlistItems"))
        .and(query_param("playlistId", playlist_id))
        .and(query_param_is_missing("pageToken"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"items": items})))
        .mount(server)
        .await;
}

/// Configuration pointing the source at `server` and the pool at `output_dir`
pub fn test_config(server: &MockServer, output_dir: &Path) -> Config {
    let mut config = Config::default();
    config.source = SourceConfig {
        api_key: Some("test-key".into()),
        api_base_url: server.uri(),
        ..SourceConfig::default()
    };
    config.retry = RetryConfig {
        max_attempts: 1,
        initial_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(10),
        backoff_multiplier: 1.0,
        jitter: false,
    };
    config.detector = DetectorConfig {
        poll_interval: Duration::from_millis(10),
        download_timeout: Duration::from_secs(5),
        watch_events: false,
        ..DetectorConfig::default()
    };
    config.pool.output_dir = output_dir.to_path_buf();
    config.pool.teardown_grace = Duration::from_secs(1);
    config
}

/// Coordinator wired to the real source and detector and a scripted processor
pub fn coordinator(config: Config, processor: Arc<ScriptedProcessor>) -> RunCoordinator {
    let source = YouTubePlaylistSource::new(&config.source, config.retry.clone())
        .expect("source should build");
    let detector = MarkerDetector::new(config.detector.clone());
    RunCoordinator::new(config, Arc::new(source), processor, Arc::new(detector))
        .expect("config should validate")
}

/// Drain every event already sent on `rx`
pub fn drain(rx: &mut broadcast::Receiver<Event>) -> Vec<Event> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
