//! End-to-end pipeline scenarios with scripted collaborators.

use async_trait::async_trait;
use overseer::config::OverseerConfig;
use overseer::notify::{DispatchEvent, DispatchEventKind, Notifier};
use overseer::pipeline::{DispatchResolution, Orchestrator};
use overseer::prompts::PromptCompiler;
use overseer::runner::{RunExecutor, RunOutcome, RunRequest};
use overseer::state::{Dispatch, DispatchStatus, RunPhase, SessionMapping, StateStore};
use overseer::tracker::{IssueContext, IssueTracker};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

struct ScriptedExecutor {
    script: Mutex<VecDeque<RunOutcome>>,
    requests: Mutex<Vec<RunRequest>>,
}

impl ScriptedExecutor {
    fn new(outcomes: Vec<RunOutcome>) -> Self {
        Self {
            script: Mutex::new(outcomes.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    fn requests(&self) -> Vec<RunRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl RunExecutor for ScriptedExecutor {
    async fn execute(&self, request: RunRequest) -> anyhow::Result<RunOutcome> {
        self.requests.lock().unwrap().push(request);
        Ok(self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .expect("executor invoked more times than scripted"))
    }
}

struct FakeTracker {
    comments: Mutex<Vec<(String, String)>>,
}

impl FakeTracker {
    fn new() -> Self {
        Self {
            comments: Mutex::new(Vec::new()),
        }
    }

    fn comments(&self) -> Vec<(String, String)> {
        self.comments.lock().unwrap().clone()
    }
}

#[async_trait]
impl IssueTracker for FakeTracker {
    async fn fetch_issue(&self, id: &str) -> anyhow::Result<IssueContext> {
        Ok(IssueContext {
            id: id.to_string(),
            identifier: "ENG-1".into(),
            title: "Fix login timeout".into(),
            body: "Sessions expire too early.".into(),
            acceptance_criteria: vec!["sessions last 24h".into()],
        })
    }

    async fn post_comment(&self, id: &str, body: &str) -> anyhow::Result<()> {
        self.comments
            .lock()
            .unwrap()
            .push((id.to_string(), body.to_string()));
        Ok(())
    }
}

struct RecordingNotifier {
    events: Mutex<Vec<DispatchEvent>>,
}

impl RecordingNotifier {
    fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
        }
    }

    fn kinds(&self) -> Vec<DispatchEventKind> {
        self.events.lock().unwrap().iter().map(|e| e.kind).collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, event: DispatchEvent) {
        self.events.lock().unwrap().push(event);
    }
}

struct Harness {
    store: Arc<StateStore>,
    orchestrator: Orchestrator,
    executor: Arc<ScriptedExecutor>,
    tracker: Arc<FakeTracker>,
    notifier: Arc<RecordingNotifier>,
    _dir: TempDir,
}

fn harness(outcomes: Vec<RunOutcome>, max_rework_attempts: u32) -> Harness {
    // RUST_LOG=debug makes failing scenarios traceable.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();

    let dir = TempDir::new().unwrap();
    let store = Arc::new(StateStore::new(dir.path().join("state.json")));
    let executor = Arc::new(ScriptedExecutor::new(outcomes));
    let tracker = Arc::new(FakeTracker::new());
    let notifier = Arc::new(RecordingNotifier::new());
    let config = OverseerConfig {
        max_rework_attempts,
        state_path: dir.path().join("state.json"),
        ..OverseerConfig::default()
    };
    let orchestrator = Orchestrator::new(
        store.clone(),
        config,
        PromptCompiler::with_install_dir(PathBuf::from("/nonexistent/templates")),
        executor.clone(),
        tracker.clone(),
        notifier.clone(),
    );
    Harness {
        store,
        orchestrator,
        executor,
        tracker,
        notifier,
        _dir: dir,
    }
}

async fn register(h: &Harness) {
    h.store
        .register_dispatch(Dispatch::new(
            "1",
            "ENG-1",
            "Fix login timeout",
            "/ws/repo",
            "fix/login",
        ))
        .await
        .unwrap();
}

fn passing_verdict() -> RunOutcome {
    RunOutcome::success(
        r#"All good. {"pass": true, "criteria": ["sessions last 24h"], "gaps": [], "testResults": "12 passed"}"#,
    )
}

fn failing_verdict(gaps: &[&str]) -> RunOutcome {
    let gaps = gaps
        .iter()
        .map(|g| format!("\"{}\"", g))
        .collect::<Vec<_>>()
        .join(", ");
    RunOutcome::success(format!(
        r#"{{"pass": false, "criteria": [], "gaps": [{}], "testResults": "2 failed"}}"#,
        gaps
    ))
}

#[tokio::test]
async fn happy_path_dispatched_to_done() {
    let h = harness(
        vec![RunOutcome::success("implemented it"), passing_verdict()],
        2,
    );
    register(&h).await;

    let resolution = h.orchestrator.run("1").await.unwrap();
    let record = match resolution {
        DispatchResolution::Completed(record) => record,
        other => panic!("expected completion, got {other:?}"),
    };
    assert_eq!(record.total_attempts, 1);
    assert_eq!(record.status, DispatchStatus::Done);

    let snap = h.store.read().unwrap();
    assert!(snap.dispatches.active.is_empty());
    assert!(snap.dispatches.completed.contains_key("1"));
    assert!(snap.session_map.is_empty(), "mappings cleared on completion");

    assert_eq!(
        h.notifier.kinds(),
        vec![
            DispatchEventKind::Working,
            DispatchEventKind::Auditing,
            DispatchEventKind::AuditPass,
        ]
    );

    // Worker prompt carried fresh issue context; audit prompt carried the
    // worker's report.
    let requests = h.executor.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].role, RunPhase::Worker);
    assert!(requests[0].prompt.contains("Sessions expire too early."));
    assert_eq!(requests[1].role, RunPhase::Audit);
    assert!(requests[1].prompt.contains("implemented it"));

    let comments = h.tracker.comments();
    assert_eq!(comments.len(), 1);
    assert!(comments[0].1.contains("Audit passed"));
}

#[tokio::test]
async fn one_rework_then_done() {
    let h = harness(
        vec![
            RunOutcome::success("first try"),
            failing_verdict(&["missing tests"]),
            RunOutcome::success("second try with tests"),
            passing_verdict(),
        ],
        2,
    );
    register(&h).await;

    let resolution = h.orchestrator.run("1").await.unwrap();
    match resolution {
        DispatchResolution::Completed(record) => assert_eq!(record.total_attempts, 2),
        other => panic!("expected completion, got {other:?}"),
    }

    let requests = h.executor.requests();
    assert_eq!(requests.len(), 4);
    // The attempt-1 worker prompt carries the failing audit's gaps.
    assert!(requests[2].prompt.contains("PREVIOUS AUDIT FAILED"));
    assert!(requests[2].prompt.contains("missing tests"));

    let kinds = h.notifier.kinds();
    assert_eq!(
        kinds,
        vec![
            DispatchEventKind::Working,
            DispatchEventKind::Auditing,
            DispatchEventKind::AuditFail,
            DispatchEventKind::Working,
            DispatchEventKind::Auditing,
            DispatchEventKind::AuditPass,
        ]
    );
}

#[tokio::test]
async fn escalates_after_rework_budget_exhausted() {
    // max_rework_attempts = 2: fail@0 -> rework, fail@1 -> rework,
    // fail@2 -> escalate. Exactly three worker runs.
    let h = harness(
        vec![
            RunOutcome::success("w0"),
            failing_verdict(&["gap a"]),
            RunOutcome::success("w1"),
            failing_verdict(&["gap b"]),
            RunOutcome::success("w2"),
            failing_verdict(&["gap c"]),
        ],
        2,
    );
    register(&h).await;

    let resolution = h.orchestrator.run("1").await.unwrap();
    let stuck = match resolution {
        DispatchResolution::Escalated(d) => d,
        other => panic!("expected escalation, got {other:?}"),
    };
    assert_eq!(stuck.status, DispatchStatus::Stuck);
    assert_eq!(stuck.attempt, 2);
    assert_eq!(
        stuck.stuck_reason.as_deref(),
        Some("audit failed after 3 attempts")
    );

    let worker_runs = h
        .executor
        .requests()
        .iter()
        .filter(|r| r.role == RunPhase::Worker)
        .count();
    assert_eq!(worker_runs, 3);

    // Stuck dispatches stay in the active set awaiting an operator.
    let snap = h.store.read().unwrap();
    assert!(snap.dispatches.active.contains_key("1"));
    assert!(snap.dispatches.completed.is_empty());

    assert_eq!(
        h.notifier.kinds().last(),
        Some(&DispatchEventKind::Escalation)
    );
}

#[tokio::test]
async fn watchdog_kill_escalates_without_audit() {
    let h = harness(vec![RunOutcome::watchdog_killed()], 2);
    register(&h).await;

    let resolution = h.orchestrator.run("1").await.unwrap();
    let stuck = match resolution {
        DispatchResolution::Escalated(d) => d,
        other => panic!("expected escalation, got {other:?}"),
    };
    assert_eq!(stuck.status, DispatchStatus::Stuck);
    assert!(stuck.stuck_reason.unwrap().contains("watchdog"));

    // Never reached auditing; rework budget untouched.
    assert_eq!(stuck.attempt, 0);
    let kinds = h.notifier.kinds();
    assert!(!kinds.contains(&DispatchEventKind::Auditing));
    assert_eq!(kinds.last(), Some(&DispatchEventKind::WatchdogKill));
    assert_eq!(h.executor.requests().len(), 1);
}

#[tokio::test]
async fn unparseable_verdict_is_a_failing_verdict() {
    // With no rework budget, a verdict-less audit escalates immediately
    // instead of erroring.
    let h = harness(
        vec![
            RunOutcome::success("done"),
            RunOutcome::success("I think it looks fine, no JSON though"),
        ],
        0,
    );
    register(&h).await;

    let resolution = h.orchestrator.run("1").await.unwrap();
    let stuck = match resolution {
        DispatchResolution::Escalated(d) => d,
        other => panic!("expected escalation, got {other:?}"),
    };
    assert_eq!(
        stuck.stuck_reason.as_deref(),
        Some("audit failed after 1 attempts")
    );
}

#[tokio::test]
async fn failed_audit_run_with_parseable_verdict_still_counts() {
    // The run's own success flag is secondary to extracting a verdict.
    let mut verdict_outcome = passing_verdict();
    verdict_outcome.success = false;

    let h = harness(vec![RunOutcome::success("done"), verdict_outcome], 2);
    register(&h).await;

    match h.orchestrator.run("1").await.unwrap() {
        DispatchResolution::Completed(record) => assert_eq!(record.total_attempts, 1),
        other => panic!("expected completion, got {other:?}"),
    }
}

#[tokio::test]
async fn failed_worker_run_still_gets_audited() {
    let h = harness(
        vec![
            RunOutcome::failure("could not finish"),
            failing_verdict(&["incomplete implementation"]),
            RunOutcome::success("finished this time"),
            passing_verdict(),
        ],
        2,
    );
    register(&h).await;

    match h.orchestrator.run("1").await.unwrap() {
        DispatchResolution::Completed(record) => assert_eq!(record.total_attempts, 2),
        other => panic!("expected completion, got {other:?}"),
    }
    // The failed worker's output went to the auditor verbatim.
    assert!(h.executor.requests()[1].prompt.contains("could not finish"));
}

#[tokio::test]
async fn duplicate_worker_completion_has_one_effect() {
    let h = harness(vec![passing_verdict()], 2);
    let mut d = Dispatch::new("1", "ENG-1", "Fix login timeout", "/ws/repo", "fix/login");
    d.status = DispatchStatus::Working;
    h.store.register_dispatch(d).await.unwrap();
    h.store
        .register_session(
            "worker-ENG-1-0",
            SessionMapping {
                dispatch_id: "1".into(),
                phase: RunPhase::Worker,
                attempt: 0,
            },
        )
        .await
        .unwrap();

    let first = h
        .orchestrator
        .handle_worker_completion("worker-ENG-1-0", RunOutcome::success("implemented"))
        .await
        .unwrap();
    assert!(matches!(first, DispatchResolution::Completed(_)));

    // Same run reported again via the safety-net path: no second audit, no
    // state change.
    let second = h
        .orchestrator
        .handle_worker_completion("worker-ENG-1-0", RunOutcome::success("implemented"))
        .await
        .unwrap();
    assert!(matches!(second, DispatchResolution::Dropped));
    assert_eq!(h.executor.requests().len(), 1);
    assert_eq!(h.store.read().unwrap().dispatches.completed.len(), 1);
}

#[tokio::test]
async fn stale_attempt_completion_is_dropped() {
    let h = harness(vec![], 2);
    let mut d = Dispatch::new("1", "ENG-1", "Fix login timeout", "/ws/repo", "fix/login");
    d.status = DispatchStatus::Working;
    d.attempt = 2;
    h.store.register_dispatch(d).await.unwrap();
    // Leftover mapping from attempt 1, superseded by rework.
    h.store
        .register_session(
            "worker-ENG-1-1",
            SessionMapping {
                dispatch_id: "1".into(),
                phase: RunPhase::Worker,
                attempt: 1,
            },
        )
        .await
        .unwrap();

    let resolution = h
        .orchestrator
        .handle_worker_completion("worker-ENG-1-1", RunOutcome::success("late delivery"))
        .await
        .unwrap();
    assert!(matches!(resolution, DispatchResolution::Dropped));
    assert!(h.executor.requests().is_empty());

    let current = h.store.get_dispatch("1").unwrap().unwrap();
    assert_eq!(current.status, DispatchStatus::Working);
    assert_eq!(current.attempt, 2);
}

#[tokio::test]
async fn unknown_run_key_completion_is_dropped() {
    let h = harness(vec![], 2);
    let resolution = h
        .orchestrator
        .handle_audit_completion("audit-ENG-9-0", RunOutcome::success("{}"))
        .await
        .unwrap();
    assert!(matches!(resolution, DispatchResolution::Dropped));
}

#[tokio::test]
async fn stale_lock_from_crashed_holder_is_recovered() {
    use overseer::state::LockSettings;
    use std::time::Duration;

    let dir = TempDir::new().unwrap();
    let state_path = dir.path().join("state.json");
    let store = StateStore::with_lock_settings(
        state_path.clone(),
        LockSettings {
            retry_interval: Duration::from_millis(5),
            acquire_timeout: Duration::from_millis(200),
            stale_after: Duration::ZERO,
        },
    );

    // A previous run wrote a snapshot, then crashed mid-hold leaving the
    // sentinel behind.
    store
        .register_dispatch(Dispatch::new("1", "ENG-1", "t", "/ws", "main"))
        .await
        .unwrap();
    let sentinel = dir.path().join("state.json.lock");
    std::fs::write(&sentinel, "12345").unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    // The next mutation evicts the stale sentinel and succeeds.
    store
        .register_dispatch(Dispatch::new("2", "ENG-2", "t", "/ws", "main"))
        .await
        .unwrap();
    assert!(!sentinel.exists());

    // The last successfully renamed snapshot is intact.
    let snap = store.read().unwrap();
    assert_eq!(snap.dispatches.active.len(), 2);
}
