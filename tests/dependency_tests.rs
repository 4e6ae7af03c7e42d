//! Dependency gating: a parent job launches only after its dependencies
//! complete, and a failed dependency blocks it permanently (fail-fast).

mod fixtures;

use std::sync::Arc;
use std::time::Duration;

use fixtures::{fleet_config, mocks, wait_for};
use foreman::config::ForemanConfig;
use foreman::gate::GateHandler;
use foreman::queue::{GATE_CONCURRENCY, QueueEvents, QueueTuning, Worker};
use foreman::record::{JobRecord, JobStatus, RecordPatch};
use foreman::spawn::{LaunchHandler, SessionLauncher};
use foreman::store::MemoryStore;
use foreman::tracker::JobTracker;
use tokio::sync::watch;

struct Harness {
    tracker: Arc<JobTracker>,
    shutdown: watch::Sender<bool>,
    handles: Vec<foreman::queue::WorkerHandle>,
}

/// Manual wiring with fast polling so gate behavior is observable in
/// test time.
fn harness(config: ForemanConfig) -> Harness {
    let (host, _sender) = mocks();
    let config = Arc::new(config);
    let tuning = QueueTuning {
        poll_interval_ms: 10,
        launch_backoff_base_ms: 10,
        ..Default::default()
    };
    let tracker = Arc::new(JobTracker::new(
        Arc::new(MemoryStore::new()),
        tuning,
        QueueEvents::default(),
    ));
    let launcher = Arc::new(SessionLauncher::new(host, Arc::clone(&config)));
    let (shutdown, shutdown_rx) = watch::channel(false);

    let mut handles = Vec::new();
    for agent_id in config.agents.keys() {
        let handler = Arc::new(LaunchHandler::new(Arc::clone(&tracker), Arc::clone(&launcher)));
        handles.push(Worker::new(tracker.agent_queue(agent_id), handler, 1).spawn(shutdown_rx.clone()));
    }
    let gate_handler = Arc::new(
        GateHandler::new(Arc::clone(&tracker))
            .with_polling(Duration::from_millis(10), Duration::from_millis(500)),
    );
    handles.push(
        Worker::new(tracker.flow().gate_queue().clone(), gate_handler, GATE_CONCURRENCY)
            .spawn(shutdown_rx),
    );

    Harness {
        tracker,
        shutdown,
        handles,
    }
}

impl Harness {
    async fn stop(self) {
        let _ = self.shutdown.send(true);
        for handle in self.handles {
            handle.join_timeout(Duration::from_secs(2)).await;
        }
    }
}

fn job(job_id: &str, task: &str, depends_on: Vec<String>) -> JobRecord {
    let mut record = JobRecord::new(job_id, "jarvis", task, "main");
    record.dispatcher_depth = Some(0);
    record.depends_on = depends_on;
    record
}

#[tokio::test]
async fn test_parent_launches_after_dependency_completes() {
    let h = harness(fleet_config());

    h.tracker.create_job(job("j1", "step 1", vec![])).await.unwrap();
    h.tracker
        .create_job(job("j2", "step 2", vec!["j1".to_string()]))
        .await
        .unwrap();

    // j1 launches; j2 stays parked behind its gate.
    wait_for("j1 to launch", || {
        let tracker = Arc::clone(&h.tracker);
        async move {
            tracker
                .find_by_job_id("j1")
                .await
                .unwrap()
                .is_some_and(|r| r.status == JobStatus::Active)
        }
    })
    .await;
    assert!(h.tracker.waiting_for_dependencies("j2").await.unwrap());

    // Complete j1; the gate opens and j2 launches.
    h.tracker
        .update_job_status("j1", JobStatus::Completed, &RecordPatch::default())
        .await
        .unwrap();
    wait_for("j2 to launch", || {
        let tracker = Arc::clone(&h.tracker);
        async move {
            tracker
                .find_by_job_id("j2")
                .await
                .unwrap()
                .is_some_and(|r| r.status == JobStatus::Active)
        }
    })
    .await;
    assert!(!h.tracker.waiting_for_dependencies("j2").await.unwrap());

    h.stop().await;
}

#[tokio::test]
async fn test_failed_dependency_blocks_parent_permanently() {
    let h = harness(fleet_config());

    h.tracker.create_job(job("j1", "step 1", vec![])).await.unwrap();
    // Force j1 into terminal failure before creating the dependent.
    wait_for("j1 to launch", || {
        let tracker = Arc::clone(&h.tracker);
        async move {
            tracker
                .find_by_job_id("j1")
                .await
                .unwrap()
                .is_some_and(|r| r.status == JobStatus::Active)
        }
    })
    .await;
    h.tracker
        .update_job_status("j1", JobStatus::Failed, &RecordPatch::default())
        .await
        .unwrap();
    h.tracker
        .update_job_status("j1", JobStatus::FailedPermanent, &RecordPatch::default())
        .await
        .unwrap();

    h.tracker
        .create_job(job("j2", "step 2", vec!["j1".to_string()]))
        .await
        .unwrap();

    // The gate fails fast and unrecoverably.
    wait_for("gate to dead-letter", || {
        let tracker = Arc::clone(&h.tracker);
        async move { tracker.flow().gate_queue().counts().await.unwrap().failed == 1 }
    })
    .await;

    // The parent never activates and still reports as gated.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let record = h.tracker.find_by_job_id("j2").await.unwrap().unwrap();
    assert_eq!(record.status, JobStatus::Queued);
    assert!(h.tracker.waiting_for_dependencies("j2").await.unwrap());

    h.stop().await;
}

#[tokio::test]
async fn test_dependency_on_unknown_job_is_rejected_at_create() {
    let h = harness(fleet_config());
    let err = h
        .tracker
        .create_job(job("j2", "step 2", vec!["ghost".to_string()]))
        .await
        .unwrap_err();
    assert!(matches!(err, foreman::ForemanError::JobNotFound(_)));
    h.stop().await;
}
