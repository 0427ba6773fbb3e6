use super::*;
use crate::config::DetectorConfig;
use crate::detector::MarkerDetector;
use crate::processor::AgentLease;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use tempfile::TempDir;

#[derive(Clone, Copy, Debug)]
enum Behavior {
    /// Write a final file after the delay
    Succeed(Duration),
    /// Leave a `.part` file behind that never finishes
    Partial,
    /// Block until cancelled
    Hang,
    /// Block forever, ignoring cancellation
    Stuck,
    /// Like `Stuck`, but tearing the item down panics
    StuckFaultyTeardown,
    /// Return an automation error
    Fail,
    /// Panic inside the task
    Panic,
}

/// Counts agents that are alive and the highest number alive at once
#[derive(Default)]
struct AgentCounter {
    live: AtomicUsize,
    peak: AtomicUsize,
    launched: AtomicUsize,
}

struct FakeAgent {
    agents: Arc<AgentCounter>,
}

impl FakeAgent {
    fn launch(agents: &Arc<AgentCounter>) -> Self {
        let live = agents.live.fetch_add(1, Ordering::SeqCst) + 1;
        agents.peak.fetch_max(live, Ordering::SeqCst);
        agents.launched.fetch_add(1, Ordering::SeqCst);
        Self {
            agents: Arc::clone(agents),
        }
    }
}

/// Guard whose teardown panics, escaping the item's panic isolation
struct FaultyTeardown;

impl Drop for FaultyTeardown {
    fn drop(&mut self) {
        panic!("agent teardown failed");
    }
}

impl Drop for FakeAgent {
    fn drop(&mut self) {
        self.agents.live.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl AgentLease for FakeAgent {
    async fn release(self: Box<Self>) {}
}

struct ScriptedProcessor {
    script: HashMap<String, Behavior>,
    agents: Arc<AgentCounter>,
}

impl ScriptedProcessor {
    fn new(script: &[(&str, Behavior)]) -> Arc<Self> {
        Arc::new(Self {
            script: script
                .iter()
                .map(|(item, behavior)| (item.to_string(), *behavior))
                .collect(),
            agents: Arc::new(AgentCounter::default()),
        })
    }
}

#[async_trait]
impl ItemProcessor for ScriptedProcessor {
    async fn process(
        &self,
        item: &WorkItem,
        output_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<Box<dyn AgentLease>, ProcessorError> {
        let agent = FakeAgent::launch(&self.agents);
        let behavior = self
            .script
            .get(item.as_str())
            .copied()
            .unwrap_or(Behavior::Succeed(Duration::from_millis(10)));

        match behavior {
            Behavior::Succeed(delay) => {
                tokio::time::sleep(delay).await;
                tokio::fs::write(output_dir.join(format!("{item}.mp4")), b"video").await?;
            }
            Behavior::Partial => {
                tokio::fs::write(output_dir.join(format!("{item}.mp4.part")), b"vid").await?;
            }
            Behavior::Hang => {
                cancel.cancelled().await;
                return Err(ProcessorError::Cancelled);
            }
            Behavior::Stuck => std::future::pending::<()>().await,
            Behavior::StuckFaultyTeardown => {
                let _guard = FaultyTeardown;
                std::future::pending::<()>().await;
            }
            Behavior::Fail => {
                return Err(ProcessorError::Automation {
                    step: "start conversion".into(),
                    message: "button missing".into(),
                });
            }
            Behavior::Panic => panic!("processor bug for {item}"),
        }

        Ok(Box::new(agent))
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}

const POLL_INTERVAL: Duration = Duration::from_millis(10);

fn detector() -> Arc<MarkerDetector> {
    Arc::new(MarkerDetector::new(DetectorConfig {
        poll_interval: POLL_INTERVAL,
        download_timeout: Duration::from_millis(150),
        watch_events: false,
        ..DetectorConfig::default()
    }))
}

fn pool_with(
    dir: &Path,
    workers: usize,
    item_timeout: Duration,
    processor: Arc<ScriptedProcessor>,
) -> (WorkerPool, broadcast::Receiver<Event>) {
    let (event_tx, event_rx) = broadcast::channel(1024);
    let config = PoolConfig {
        workers,
        item_timeout,
        teardown_grace: Duration::from_millis(100),
        output_dir: dir.to_path_buf(),
        file_collision: FileCollisionAction::Rename,
    };
    (
        WorkerPool::new(config, processor, detector(), event_tx),
        event_rx,
    )
}

fn items(names: &[&str]) -> Vec<WorkItem> {
    names.iter().map(|n| WorkItem::from(*n)).collect()
}

fn count(reports: &[ItemReport]) -> crate::types::OutcomeCounts {
    crate::types::OutcomeCounts::from_outcomes(reports.iter().map(|r| &r.outcome))
}

fn assert_exactly_once(reports: &[ItemReport], total: usize) {
    assert_eq!(reports.len(), total, "one report per item");
    let indices: HashSet<usize> = reports.iter().map(|r| r.index).collect();
    assert_eq!(indices, (0..total).collect::<HashSet<_>>(), "no duplicates, no omissions");
}

#[tokio::test]
async fn empty_item_list_returns_immediately() {
    let temp = TempDir::new().unwrap();
    let processor = ScriptedProcessor::new(&[]);
    let (pool, _events) = pool_with(temp.path(), 5, Duration::from_secs(1), processor.clone());

    let reports = pool.run(Vec::new(), &CancellationToken::new()).await;

    assert!(reports.is_empty());
    assert_eq!(processor.agents.launched.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn every_item_gets_exactly_one_outcome_for_any_pool_size() {
    let names = [
        "ok-1", "fail-1", "hang-1", "panic-1", "partial-1", "ok-2", "fail-2", "ok-3", "hang-2",
        "ok-4", "ok-5",
    ];
    let script = [
        ("fail-1", Behavior::Fail),
        ("fail-2", Behavior::Fail),
        ("hang-1", Behavior::Hang),
        ("hang-2", Behavior::Hang),
        ("panic-1", Behavior::Panic),
        ("partial-1", Behavior::Partial),
    ];

    for workers in [1, 5, 100] {
        let temp = TempDir::new().unwrap();
        let processor = ScriptedProcessor::new(&script);
        let (pool, _events) =
            pool_with(temp.path(), workers, Duration::from_millis(250), processor.clone());

        let reports = pool.run(items(&names), &CancellationToken::new()).await;

        assert_exactly_once(&reports, names.len());
        let counts = count(&reports);
        assert_eq!(counts.succeeded, 5, "workers={workers}");
        assert_eq!(counts.timed_out, 3, "hangs and the unfinished download, workers={workers}");
        assert_eq!(counts.failed, 3, "errors and the panic, workers={workers}");
        assert!(processor.agents.peak.load(Ordering::SeqCst) <= workers);
        assert_eq!(processor.agents.live.load(Ordering::SeqCst), 0, "all agents released");
    }
}

#[tokio::test]
async fn concurrency_never_exceeds_worker_count() {
    let names: Vec<String> = (0..20).map(|i| format!("item-{i}")).collect();
    let script: Vec<(&str, Behavior)> = names
        .iter()
        .map(|n| (n.as_str(), Behavior::Succeed(Duration::from_millis(30))))
        .collect();
    let name_refs: Vec<&str> = names.iter().map(String::as_str).collect();

    for workers in [1, 5, 100] {
        let temp = TempDir::new().unwrap();
        let processor = ScriptedProcessor::new(&script);
        let (pool, _events) =
            pool_with(temp.path(), workers, Duration::from_secs(5), processor.clone());

        let reports = pool.run(items(&name_refs), &CancellationToken::new()).await;

        assert_exactly_once(&reports, 20);
        let peak = processor.agents.peak.load(Ordering::SeqCst);
        assert!(peak <= workers, "peak {peak} exceeds {workers} workers");
        if workers > 1 {
            assert!(peak > 1, "items should overlap with {workers} workers");
        }
        assert!(
            reports
                .iter()
                .all(|r| r.slot.is_some_and(|s| s.0 < workers.min(20))),
            "slots stay below the slot count"
        );
    }
}

#[tokio::test]
async fn seven_item_scenario() {
    let temp = TempDir::new().unwrap();
    let unit = Duration::from_millis(30);
    let timeout = unit * 10;
    let processor = ScriptedProcessor::new(&[
        ("1", Behavior::Succeed(unit * 2)),
        ("2", Behavior::Hang),
        ("3", Behavior::Succeed(unit * 2)),
        ("4", Behavior::Hang),
        ("5", Behavior::Succeed(unit * 2)),
        ("6", Behavior::Fail),
        ("7", Behavior::Fail),
    ]);
    let (pool, _events) = pool_with(temp.path(), 2, timeout, processor.clone());
    let start = std::time::Instant::now();

    let reports = pool
        .run(items(&["1", "2", "3", "4", "5", "6", "7"]), &CancellationToken::new())
        .await;
    let elapsed = start.elapsed();

    assert_exactly_once(&reports, 7);
    assert_eq!(
        count(&reports),
        crate::types::OutcomeCounts {
            succeeded: 3,
            timed_out: 2,
            failed: 2,
            total: 7,
        }
    );
    assert!(processor.agents.peak.load(Ordering::SeqCst) <= 2);
    // ceil(7 / 2) x timeout, plus slack for teardown and scheduling
    assert!(
        elapsed <= timeout * 4 + Duration::from_millis(800),
        "run took {elapsed:?}"
    );
}

#[tokio::test]
async fn stuck_item_is_terminated_and_its_agent_released() {
    let temp = TempDir::new().unwrap();
    let timeout = Duration::from_millis(200);
    let processor = ScriptedProcessor::new(&[("stuck", Behavior::Stuck)]);
    let (pool, _events) = pool_with(temp.path(), 2, timeout, processor.clone());

    let reports = pool
        .run(items(&["stuck", "fine"]), &CancellationToken::new())
        .await;

    let stuck = reports.iter().find(|r| r.index == 0).unwrap();
    assert_eq!(stuck.outcome, ItemOutcome::TimedOut);
    assert!(stuck.elapsed >= timeout, "terminated early: {:?}", stuck.elapsed);
    assert!(
        stuck.elapsed <= timeout + POLL_INTERVAL,
        "terminated late: {:?}",
        stuck.elapsed
    );
    let fine = reports.iter().find(|r| r.index == 1).unwrap();
    assert_eq!(fine.outcome, ItemOutcome::Completed, "sibling unaffected");
    assert_eq!(processor.agents.live.load(Ordering::SeqCst), 0, "resource count back to baseline");
}

#[tokio::test]
async fn hanging_item_is_asked_to_stop_before_its_deadline() {
    let temp = TempDir::new().unwrap();
    let timeout = Duration::from_millis(200);
    let processor = ScriptedProcessor::new(&[("hang", Behavior::Hang)]);
    let (pool, _events) = pool_with(temp.path(), 1, timeout, processor.clone());

    let reports = pool.run(items(&["hang"]), &CancellationToken::new()).await;

    assert_eq!(reports[0].outcome, ItemOutcome::TimedOut);
    assert!(
        reports[0].elapsed < timeout,
        "outcome should land before the deadline: {:?}",
        reports[0].elapsed
    );
    assert_eq!(processor.agents.live.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn task_dying_in_teardown_frees_its_slot() {
    let temp = TempDir::new().unwrap();
    let processor = ScriptedProcessor::new(&[("faulty", Behavior::StuckFaultyTeardown)]);
    let (pool, _events) = pool_with(temp.path(), 1, Duration::from_millis(200), processor.clone());

    let reports = pool
        .run(items(&["faulty", "after"]), &CancellationToken::new())
        .await;

    assert_exactly_once(&reports, 2);
    let faulty = reports.iter().find(|r| r.index == 0).unwrap();
    match &faulty.outcome {
        ItemOutcome::Failed { reason } => assert!(reason.contains("ended abnormally"), "{reason}"),
        other => panic!("expected Failed, got {other:?}"),
    }
    assert_eq!(faulty.slot, Some(SlotId(0)));
    let after = reports.iter().find(|r| r.index == 1).unwrap();
    assert_eq!(after.outcome, ItemOutcome::Completed, "slot reused, not reported as cancelled");
    assert_eq!(processor.agents.live.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn panic_is_contained_as_failure() {
    let temp = TempDir::new().unwrap();
    let processor = ScriptedProcessor::new(&[("boom", Behavior::Panic)]);
    let (pool, _events) = pool_with(temp.path(), 1, Duration::from_secs(2), processor.clone());

    let reports = pool
        .run(items(&["boom", "after"]), &CancellationToken::new())
        .await;

    let boom = reports.iter().find(|r| r.index == 0).unwrap();
    match &boom.outcome {
        ItemOutcome::Failed { reason } => assert!(reason.contains("processor bug"), "{reason}"),
        other => panic!("expected Failed, got {other:?}"),
    }
    let after = reports.iter().find(|r| r.index == 1).unwrap();
    assert!(after.outcome.is_completed(), "pool keeps dispatching after a panic");
    assert_eq!(processor.agents.live.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn unfinished_download_is_timed_out() {
    let temp = TempDir::new().unwrap();
    let processor = ScriptedProcessor::new(&[("slow", Behavior::Partial)]);
    let (pool, _events) = pool_with(temp.path(), 1, Duration::from_secs(5), processor.clone());

    let reports = pool.run(items(&["slow"]), &CancellationToken::new()).await;

    assert_eq!(reports[0].outcome, ItemOutcome::TimedOut);
    assert!(
        reports[0].elapsed < Duration::from_secs(2),
        "detector timeout, not the item timeout, ended the item"
    );
    assert!(!temp.path().join("slow.mp4.part").exists(), "partial file not merged");
}

#[tokio::test]
async fn processor_errors_keep_their_reason() {
    let temp = TempDir::new().unwrap();
    let processor = ScriptedProcessor::new(&[("bad", Behavior::Fail)]);
    let (pool, _events) = pool_with(temp.path(), 1, Duration::from_secs(1), processor);

    let reports = pool.run(items(&["bad"]), &CancellationToken::new()).await;

    assert_eq!(
        reports[0].outcome,
        ItemOutcome::failed("automation error during 'start conversion': button missing")
    );
}

#[tokio::test]
async fn completed_artifacts_land_in_output_dir() {
    let temp = TempDir::new().unwrap();
    let processor = ScriptedProcessor::new(&[]);
    let (pool, _events) = pool_with(temp.path(), 2, Duration::from_secs(2), processor);

    let reports = pool
        .run(items(&["clip", "clip"]), &CancellationToken::new())
        .await;

    assert_exactly_once(&reports, 2);
    let mut artifacts: Vec<PathBuf> = reports.iter().flat_map(|r| r.artifacts.clone()).collect();
    artifacts.sort();
    assert_eq!(
        artifacts,
        vec![temp.path().join("clip (1).mp4"), temp.path().join("clip.mp4")],
        "duplicates are processed independently"
    );
    for artifact in &artifacts {
        assert!(artifact.is_file());
    }
    assert!(!slot_dir(temp.path(), 0).exists(), "slot directories cleaned up");
    assert!(!slot_dir(temp.path(), 1).exists());
}

#[tokio::test]
async fn cancellation_stops_dispatch_and_reports_every_item() {
    let temp = TempDir::new().unwrap();
    let processor = ScriptedProcessor::new(&[
        ("a", Behavior::Hang),
        ("b", Behavior::Hang),
        ("c", Behavior::Hang),
        ("d", Behavior::Hang),
    ]);
    let (pool, _events) = pool_with(temp.path(), 1, Duration::from_secs(30), processor.clone());
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let reports = pool.run(items(&["a", "b", "c", "d"]), &cancel).await;

    assert_exactly_once(&reports, 4);
    assert_eq!(count(&reports).failed, 4);
    let undispatched: Vec<&ItemReport> = reports.iter().filter(|r| r.slot.is_none()).collect();
    assert_eq!(undispatched.len(), 3);
    assert!(
        undispatched
            .iter()
            .all(|r| r.outcome == ItemOutcome::failed(RUN_CANCELLED))
    );
    assert_eq!(processor.agents.launched.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn events_cover_dispatch_and_outcome_of_every_item() {
    let temp = TempDir::new().unwrap();
    let processor = ScriptedProcessor::new(&[("x", Behavior::Fail)]);
    let (pool, mut events) = pool_with(temp.path(), 2, Duration::from_secs(2), processor);

    pool.run(items(&["x", "y", "z"]), &CancellationToken::new())
        .await;

    let mut dispatched = Vec::new();
    let mut awaiting = 0;
    let mut finished = 0;
    while let Ok(event) = events.try_recv() {
        match event {
            Event::ItemDispatched { index, .. } => dispatched.push(index),
            Event::ItemAwaitingArtifact { .. } => awaiting += 1,
            Event::ItemFinished { .. } => finished += 1,
            _ => {}
        }
    }
    assert_eq!(dispatched, vec![0, 1, 2], "dispatch follows source order");
    assert_eq!(awaiting, 2, "the failing item never reaches the detector");
    assert_eq!(finished, 3);
}
