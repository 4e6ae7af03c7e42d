//! End-to-end dispatch lifecycle over the in-memory store: the queued
//! job is launched by the worker, observed by the hooks, and lands in a
//! terminal state.

mod fixtures;

use std::sync::Arc;
use std::time::Duration;

use fixtures::{fleet_config, mocks, wait_for};
use foreman::hooks::{AgentEndEvent, LifecycleHooks};
use foreman::store::{MemoryStore, Store};
use foreman::tools::{CallerIdentity, DispatchInput, DispatchStatus, FailureStatus, Tools};
use foreman::{JobStatus, OrchestratorService};

fn dispatch_input(target: &str, task: &str) -> DispatchInput {
    DispatchInput {
        target: target.to_string(),
        task: task.to_string(),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_happy_path_dispatch_through_completion() {
    let (host, sender) = mocks();
    let store = Arc::new(MemoryStore::new());
    let service = OrchestratorService::start_with_store(
        fleet_config(),
        host.clone(),
        sender.clone(),
        Some(store.clone() as Arc<dyn Store>),
    )
    .await
    .unwrap();
    let tools = Tools::new(service.handle());
    let hooks = LifecycleHooks::new(service.handle());
    let tracker = service.handle().resolve().unwrap().tracker.clone().unwrap();

    let reply = tools
        .dispatch(&CallerIdentity::new("main"), dispatch_input("jarvis", "echo hello"))
        .await;
    let reply = reply.ok().expect("dispatch should queue");
    assert_eq!(reply.status, DispatchStatus::Queued);
    let job_id = reply.job_id.clone();

    // Worker picks the job up and launches the child session.
    wait_for("job to become active", || {
        let tracker = tracker.clone();
        let job_id = job_id.clone();
        async move {
            tracker
                .find_by_job_id(&job_id)
                .await
                .unwrap()
                .is_some_and(|r| r.status == JobStatus::Active)
        }
    })
    .await;

    let record = tracker.find_by_job_id(&job_id).await.unwrap().unwrap();
    let session_key = record.session_key.clone().unwrap();
    assert!(session_key.starts_with("agent:jarvis:subagent:"));
    assert!(record.started_at.is_some());
    host.assert_started(1);

    // Child execution finishes; the hook closes the record.
    hooks
        .agent_end(AgentEndEvent {
            session_key,
            success: true,
            error: None,
        })
        .await;

    let record = tracker.find_by_job_id(&job_id).await.unwrap().unwrap();
    assert_eq!(record.status, JobStatus::Completed);
    assert!(record.completed_at.is_some());

    service.stop().await;
}

#[tokio::test]
async fn test_result_capture_on_completion() {
    let (host, sender) = mocks();
    let store = Arc::new(MemoryStore::new());
    let service = OrchestratorService::start_with_store(
        fleet_config(),
        host.clone(),
        sender,
        Some(store as Arc<dyn Store>),
    )
    .await
    .unwrap();
    let tools = Tools::new(service.handle());
    let hooks = LifecycleHooks::new(service.handle());
    let tracker = service.handle().resolve().unwrap().tracker.clone().unwrap();

    let mut input = dispatch_input("jarvis", "summarize the build");
    input.store_result = true;
    let reply = tools.dispatch(&CallerIdentity::new("main"), input).await;
    let job_id = reply.ok().unwrap().job_id.clone();

    wait_for("launch", || {
        let tracker = tracker.clone();
        let job_id = job_id.clone();
        async move {
            tracker
                .find_by_job_id(&job_id)
                .await
                .unwrap()
                .is_some_and(|r| r.status == JobStatus::Active)
        }
    })
    .await;

    host.set_history(vec![
        ("user", "summarize the build"),
        ("assistant", "Build is green; two warnings."),
    ]);
    let session_key = tracker
        .find_by_job_id(&job_id)
        .await
        .unwrap()
        .unwrap()
        .session_key
        .unwrap();
    hooks
        .agent_end(AgentEndEvent {
            session_key,
            success: true,
            error: None,
        })
        .await;

    let record = tracker.find_by_job_id(&job_id).await.unwrap().unwrap();
    assert_eq!(
        record.result.as_deref(),
        Some("Build is green; two warnings.")
    );

    service.stop().await;
}

#[tokio::test]
async fn test_rate_limit_window_rolls_over() {
    let (host, sender) = mocks();
    let store = Arc::new(MemoryStore::new());
    let service = OrchestratorService::start_with_store(
        fleet_config(),
        host,
        sender,
        Some(store.clone() as Arc<dyn Store>),
    )
    .await
    .unwrap();
    let tools = Tools::new(service.handle());
    let caller = CallerIdentity::new("iris");

    for i in 0..10 {
        let reply = tools
            .dispatch(&caller, dispatch_input("jarvis", &format!("job {}", i)))
            .await;
        assert!(!reply.is_failure(), "dispatch {} should pass", i);
    }

    let eleventh = tools.dispatch(&caller, dispatch_input("jarvis", "one too many")).await;
    let failure = eleventh.failure().expect("11th dispatch must be limited");
    assert_eq!(failure.status, FailureStatus::RateLimited);
    assert_eq!(
        failure.error,
        "Rate limit exceeded: 11/10 dispatches this minute"
    );

    // The counter key carries a 60 s TTL; once the window rolls, the
    // next dispatch goes through.
    store.advance(Duration::from_secs(61));
    let after_window = tools.dispatch(&caller, dispatch_input("jarvis", "fresh window")).await;
    assert!(!after_window.is_failure());

    service.stop().await;
}

#[tokio::test]
async fn test_dispatch_without_store_falls_back_to_direct_spawn() {
    let (host, sender) = mocks();
    let service =
        OrchestratorService::start_with_store(fleet_config(), host.clone(), sender, None)
            .await
            .unwrap();
    let tools = Tools::new(service.handle());

    let reply = tools
        .dispatch(&CallerIdentity::new("main"), dispatch_input("jarvis", "task"))
        .await;
    let reply = reply.ok().unwrap();
    assert_eq!(reply.status, DispatchStatus::Dispatched);
    assert!(reply.job_id.starts_with("fallback-"));
    assert_eq!(reply.fallback, Some(true));

    // The session host was called directly.
    host.assert_started(1);

    service.stop().await;
}
