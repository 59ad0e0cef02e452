//! Cancellation and persistence tests.
//!
//! These tests verify that cancelling stops further dispatch while in-flight
//! results are still recorded, and that finished orchestrations survive a
//! restart through the JSON store.

use std::sync::Arc;

use fanout::core::{ConflictStatus, OrchestrationStatus, TaskStatus};
use fanout::orchestration::{DevRequest, JsonStore};

use crate::fixtures::{
    chain_plan, drain, event_types, service, service_with_store, task_by_key, wait_for_task,
    web_plan, Gate, Script, ScriptedRunner,
};

/// Test: Cancel mid-run
/// Given a -> b -> c with a completed and b running
/// When the orchestration is cancelled
/// Then it is failed and cancelled, b reports its outcome, c never starts
#[tokio::test]
async fn test_cancel_mid_run() {
    let gate = Gate::new();
    let runner = Arc::new(ScriptedRunner::new().script("b", Script::files(&[]).gated(&gate)));
    let service = service(runner.clone(), 3);
    let (handle, events) = service
        .start_with_plan(DevRequest::new("req-cancel", ""), chain_plan(), None)
        .await
        .unwrap();

    wait_for_task(&handle, "b", TaskStatus::Running).await;
    let snapshot = service.cancel_orchestration("req-cancel").await.unwrap();
    assert_eq!(snapshot.status, OrchestrationStatus::Failed);
    assert!(snapshot.cancelled);

    let events = drain(events).await;
    let done = handle.wait().await;
    assert!(done.cancelled);
    assert_eq!(done.status, OrchestrationStatus::Failed);

    let tasks = handle.tasks().await;
    assert_eq!(task_by_key(&tasks, "a").status, TaskStatus::Completed);
    let b = task_by_key(&tasks, "b");
    assert_eq!(b.status, TaskStatus::Failed);
    assert_eq!(b.error_message.as_deref(), Some("cancelled"));
    assert_eq!(task_by_key(&tasks, "c").status, TaskStatus::Pending);
    assert_eq!(runner.started(), vec!["a", "b"]);

    let statuses: Vec<&str> = events
        .iter()
        .filter(|e| e.event_type() == "orchestration_status")
        .map(|e| e.kind.message())
        .collect();
    assert_eq!(statuses.len(), 3);
    assert_eq!(statuses[1], "Orchestration cancelled");
    assert!(statuses[2].starts_with("Orchestration cancelled:"));
}

/// Test: In-flight result after cancel
/// Given a running task that ignores cancellation
/// When the orchestration is cancelled and the task then completes
/// Then its completion is recorded but no dependent is dispatched
#[tokio::test]
async fn test_in_flight_result_recorded_after_cancel() {
    let gate = Gate::new();
    let runner = Arc::new(
        ScriptedRunner::new().script("b", Script::files(&[("b.md", "b")]).gated(&gate).ignoring_cancel()),
    );
    let service = service(runner.clone(), 3);
    let (handle, events) = service
        .start_with_plan(DevRequest::new("req-drain", ""), chain_plan(), None)
        .await
        .unwrap();

    wait_for_task(&handle, "b", TaskStatus::Running).await;
    handle.cancel().await;
    gate.open();
    let events = drain(events).await;
    let done = handle.wait().await;

    assert!(done.cancelled);
    assert_eq!(done.status, OrchestrationStatus::Failed);
    assert_eq!(done.completed_tasks, 2);
    let tasks = handle.tasks().await;
    assert_eq!(task_by_key(&tasks, "b").status, TaskStatus::Completed);
    assert_eq!(task_by_key(&tasks, "c").status, TaskStatus::Pending);
    assert_eq!(runner.started(), vec!["a", "b"]);
    assert_eq!(event_types(&events).last(), Some(&"orchestration_status"));
}

/// Test: Cancel is idempotent
/// Given a finished orchestration
/// When it is cancelled
/// Then the snapshot comes back unchanged
#[tokio::test]
async fn test_cancel_after_completion_is_noop() {
    let runner = Arc::new(ScriptedRunner::new());
    let service = service(runner, 3);
    let (handle, _) = service
        .start_with_plan(DevRequest::new("req-late", ""), chain_plan(), None)
        .await
        .unwrap();
    let done = handle.wait().await;

    let snapshot = service.cancel_orchestration("req-late").await.unwrap();
    assert_eq!(snapshot.status, OrchestrationStatus::Completed);
    assert!(!snapshot.cancelled);
    assert_eq!(snapshot.completed_at, done.completed_at);
}

/// Test: Late subscriber
/// Given a finished orchestration
/// When a new subscriber attaches
/// Then its stream ends immediately
#[tokio::test]
async fn test_subscribe_after_finish_ends_immediately() {
    let runner = Arc::new(ScriptedRunner::new());
    let service = service(runner, 3);
    let (handle, _) = service
        .start_with_plan(DevRequest::new("req-sub", ""), chain_plan(), None)
        .await
        .unwrap();
    handle.wait().await;

    let rx = service.subscribe("req-sub").await.unwrap();
    assert!(drain(rx).await.is_empty());
}

/// Test: Persist and restore
/// Given a finished orchestration with a conflict, saved to the store
/// When a new service restores from the same store
/// Then status, tasks and conflicts are back, and resolving persists
#[tokio::test]
async fn test_persist_and_restore() {
    let dir = tempfile::tempdir().unwrap();
    let store = JsonStore::new(dir.path());
    let runner = Arc::new(
        ScriptedRunner::new()
            .script("frontend", Script::files(&[("README.md", "front\n")]))
            .script("backend", Script::files(&[("README.md", "back\n")]).delay_ms(10)),
    );

    let first = service_with_store(runner.clone(), store.clone());
    let (handle, _) = first
        .start_with_plan(DevRequest::new("req-persist", ""), web_plan(), None)
        .await
        .unwrap();
    let done = handle.wait().await;
    assert_eq!(handle.conflicts().await.len(), 1);

    let second = service_with_store(runner, store.clone());
    assert_eq!(second.restore().await.unwrap(), 1);

    let restored = second.get_status("req-persist").await.unwrap();
    assert_eq!(restored.id, done.id);
    assert_eq!(restored.status, OrchestrationStatus::Completed);
    assert_eq!(second.get_tasks("req-persist").await.unwrap().len(), 3);

    let conflicts = second.get_conflicts(&done.id.to_string()).await.unwrap();
    assert_eq!(conflicts.len(), 1);
    second
        .resolve_conflict("req-persist", &conflicts[0].id.to_string(), true)
        .await
        .unwrap();

    let on_disk = store.load(&done.id).await.unwrap().unwrap();
    assert_eq!(on_disk.conflicts[0].status, ConflictStatus::Resolved);
}
