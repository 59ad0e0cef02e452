//! Conflict detection and resolution tests.
//!
//! These tests verify that overlapping task outputs raise conflicts as
//! tasks complete, and that resolving them is recorded without touching
//! task outputs.

use std::sync::Arc;

use fanout::core::{
    ConflictStatus, ConflictType, OrchestrationStatus, ResolutionStrategy, Severity, TaskStatus,
};
use fanout::orchestration::DevRequest;
use fanout::Error;

use crate::fixtures::{
    drain, independent_plan, service, task_by_key, wait_for_task, web_plan, Gate, Script,
    ScriptedRunner,
};

const FRONTEND_TYPES: &str = "import { Todo } from './todo';\n\nexport type Id = string;\n";
const BACKEND_TYPES: &str = "import { Order } from './order';\n\nexport type Id = string;\n";

fn shared_types_runner() -> ScriptedRunner {
    ScriptedRunner::new()
        .script("frontend", Script::files(&[("src/types.ts", FRONTEND_TYPES)]))
        .script("backend", Script::files(&[("src/types.ts", BACKEND_TYPES)]).delay_ms(10))
}

/// Test: Shared types file
/// Given frontend and backend both write src/types.ts with different imports
/// When both complete
/// Then exactly one import conflict names both tasks in creation order
#[tokio::test]
async fn test_shared_types_file_raises_import_conflict() {
    let runner = Arc::new(shared_types_runner());
    let service = service(runner, 3);

    let (handle, events) = service
        .start_with_plan(DevRequest::new("req-types", ""), web_plan(), None)
        .await
        .unwrap();
    let events = drain(events).await;
    handle.wait().await;

    let tasks = handle.tasks().await;
    let frontend = task_by_key(&tasks, "frontend");
    let backend = task_by_key(&tasks, "backend");

    let conflicts = handle.conflicts().await;
    assert_eq!(conflicts.len(), 1);
    let conflict = &conflicts[0];
    assert_eq!(conflict.conflict_type, ConflictType::Import);
    assert_eq!(conflict.file_path, "src/types.ts");
    assert_eq!(conflict.conflicting_tasks, vec![frontend.id, backend.id]);
    assert_eq!(conflict.status, ConflictStatus::Unresolved);
    assert_eq!(conflict.severity, Severity::Medium);

    let detected: Vec<_> = events
        .iter()
        .filter(|e| e.event_type() == "conflict_detected")
        .collect();
    assert_eq!(detected.len(), 1);

    // Conflicts do not fail the orchestration.
    assert_eq!(handle.snapshot().await.status, OrchestrationStatus::Completed);

    let results = handle.results().await;
    let types = results.files.iter().find(|f| f.path == "src/types.ts").unwrap();
    assert!(types.conflicted);
    assert_eq!(types.contributors, vec![frontend.id, backend.id]);
}

/// Test: Auto-resolution merges imports and leaves outputs alone
/// Given an import conflict on src/types.ts
/// When it is resolved automatically
/// Then the merged content carries both imports and task outputs are unchanged
#[tokio::test]
async fn test_auto_resolve_merges_imports() {
    let runner = Arc::new(shared_types_runner());
    let service = service(runner, 3);
    let (handle, _) = service
        .start_with_plan(DevRequest::new("req-merge", ""), web_plan(), None)
        .await
        .unwrap();
    handle.wait().await;

    let conflict_id = handle.conflicts().await[0].id.to_string();
    let before = handle.tasks().await;

    let resolved = service
        .resolve_conflict("req-merge", &conflict_id, true)
        .await
        .unwrap();
    assert_eq!(resolved.status, ConflictStatus::Resolved);
    let resolution = resolved.resolution.unwrap();
    assert_eq!(resolution.strategy, ResolutionStrategy::MergeNonOverlapping);
    let merged = resolution.merged_content.unwrap();
    assert!(merged.contains("import { Todo } from './todo';"));
    assert!(merged.contains("import { Order } from './order';"));

    let after = handle.tasks().await;
    for (a, b) in before.iter().zip(&after) {
        assert_eq!(a.output, b.output);
        assert_eq!(a.status, b.status);
    }
    assert_eq!(handle.summary().await.unresolved_conflicts, 0);
}

/// Test: Auto-resolution keeps multi-line declarations whole
/// Given two versions of src/types.ts declaring interfaces with the same field
/// When the import conflict is resolved automatically
/// Then both declarations survive intact with balanced braces
#[tokio::test]
async fn test_auto_resolve_keeps_multiline_declarations() {
    const USER: &str = "import { A } from './a';\n\nexport interface User {\n  id: string;\n}\n";
    const ORDER: &str = "import { B } from './b';\n\nexport interface Order {\n  id: string;\n}\n";
    let runner = Arc::new(
        ScriptedRunner::new()
            .script("frontend", Script::files(&[("src/types.ts", USER)]))
            .script("backend", Script::files(&[("src/types.ts", ORDER)]).delay_ms(10)),
    );
    let service = service(runner, 3);
    let (handle, _) = service
        .start_with_plan(DevRequest::new("req-multi", ""), web_plan(), None)
        .await
        .unwrap();
    handle.wait().await;

    let conflict_id = handle.conflicts().await[0].id;
    let resolved = handle.resolve_conflict(conflict_id, true).await.unwrap();
    let merged = resolved.resolution.unwrap().merged_content.unwrap();
    assert!(merged.contains("export interface User {\n  id: string;\n}"));
    assert!(merged.contains("export interface Order {\n  id: string;\n}"));
    assert_eq!(merged.matches('{').count(), merged.matches('}').count());
}

/// Test: Resolving twice
/// Given a resolved conflict
/// When it is resolved again
/// Then the second call is rejected and the first resolution stands
#[tokio::test]
async fn test_resolve_twice_is_rejected() {
    let runner = Arc::new(shared_types_runner());
    let service = service(runner, 3);
    let (handle, _) = service
        .start_with_plan(DevRequest::new("req-twice", ""), web_plan(), None)
        .await
        .unwrap();
    handle.wait().await;
    let conflict_id = handle.conflicts().await[0].id;

    let first = handle.resolve_conflict(conflict_id, true).await.unwrap();
    let second = handle.resolve_conflict(conflict_id, true).await;
    assert!(matches!(second, Err(Error::AlreadyResolved(_))));
    let manual = handle
        .accept_manual_resolution(conflict_id, "other".into())
        .await;
    assert!(matches!(manual, Err(Error::AlreadyResolved(_))));

    let stored = &handle.conflicts().await[0];
    assert_eq!(stored.resolution, first.resolution);
}

/// Test: Manual hand-off then accept
/// Given an unresolved conflict
/// When manual resolution is requested, then content is accepted
/// Then the conflict stays unresolved until the accept, then records it
#[tokio::test]
async fn test_manual_resolution_flow() {
    let runner = Arc::new(shared_types_runner());
    let service = service(runner, 3);
    let (handle, _) = service
        .start_with_plan(DevRequest::new("req-manual", ""), web_plan(), None)
        .await
        .unwrap();
    handle.wait().await;
    let conflict_id = handle.conflicts().await[0].id.to_string();

    let requested = service
        .resolve_conflict("req-manual", &conflict_id, false)
        .await
        .unwrap();
    assert_eq!(requested.status, ConflictStatus::Unresolved);
    assert!(requested.awaiting_manual());

    let accepted = service
        .accept_manual_resolution("req-manual", &conflict_id, "export type Id = number;\n".into())
        .await
        .unwrap();
    assert_eq!(accepted.status, ConflictStatus::Resolved);
    let resolution = accepted.resolution.unwrap();
    assert_eq!(resolution.strategy, ResolutionStrategy::Manual);
    assert_eq!(
        resolution.merged_content.as_deref(),
        Some("export type Id = number;\n")
    );
}

/// Test: API contract conflicts
/// Given two tasks declaring POST /orders with different signatures
/// When both complete
/// Then a high-severity api_contract conflict is raised on api:POST /orders
#[tokio::test]
async fn test_api_contract_conflict() {
    let runner = Arc::new(
        ScriptedRunner::new()
            .script("t0", Script::api("post /orders", "(Order) -> OrderId"))
            .script("t1", Script::api("POST /orders/", "(OrderDraft) -> Order")),
    );
    let service = service(runner, 3);
    let (handle, _) = service
        .start_with_plan(DevRequest::new("req-api", ""), independent_plan(2), None)
        .await
        .unwrap();
    handle.wait().await;

    let conflicts = handle.conflicts().await;
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].conflict_type, ConflictType::ApiContract);
    assert_eq!(conflicts[0].severity, Severity::High);
    assert_eq!(conflicts[0].file_path, "api:POST /orders");
}

/// Test: Matching API contracts
/// Given two tasks declaring the same signature
/// When both complete
/// Then no conflict is raised
#[tokio::test]
async fn test_matching_api_contracts_do_not_conflict() {
    let runner = Arc::new(
        ScriptedRunner::new()
            .script("t0", Script::api("GET /users", "() -> [User]"))
            .script("t1", Script::api("GET /users", "() -> [User]")),
    );
    let service = service(runner, 3);
    let (handle, _) = service
        .start_with_plan(DevRequest::new("req-same-api", ""), independent_plan(2), None)
        .await
        .unwrap();
    handle.wait().await;
    assert!(handle.conflicts().await.is_empty());
}

/// Test: Resolution while the orchestration is running
/// Given a conflict between frontend and backend while tests is still gated
/// When the conflict is resolved
/// Then conflict_resolved is published before the final status
#[tokio::test]
async fn test_resolve_while_running() {
    let gate = Gate::new();
    let runner = Arc::new(
        shared_types_runner().script("tests", Script::files(&[]).gated(&gate)),
    );
    let service = service(runner, 3);
    let (handle, events) = service
        .start_with_plan(DevRequest::new("req-live", ""), web_plan(), None)
        .await
        .unwrap();

    wait_for_task(&handle, "tests", TaskStatus::Running).await;
    let conflict_id = handle.conflicts().await[0].id;
    let resolved = handle.resolve_conflict(conflict_id, true).await.unwrap();
    assert!(resolved.is_resolved());
    assert!(handle.is_active().await);

    gate.open();
    let events = drain(events).await;
    let types: Vec<_> = events.iter().map(|e| e.event_type()).collect();
    let resolved_at = types.iter().position(|t| *t == "conflict_resolved").unwrap();
    let detected_at = types.iter().position(|t| *t == "conflict_detected").unwrap();
    assert!(detected_at < resolved_at);
    assert!(resolved_at < types.len() - 1);
    assert_eq!(types.last(), Some(&"orchestration_status"));
}

/// Test: Unknown conflict ids
/// Given a finished orchestration
/// When an unknown or malformed conflict id is resolved
/// Then conflict_not_found is reported
#[tokio::test]
async fn test_unknown_conflict_id() {
    let runner = Arc::new(ScriptedRunner::new());
    let service = service(runner, 3);
    let (handle, _) = service
        .start_with_plan(DevRequest::new("req-none", ""), web_plan(), None)
        .await
        .unwrap();
    handle.wait().await;

    let malformed = service.resolve_conflict("req-none", "not-a-uuid", true).await;
    assert!(matches!(malformed, Err(Error::ConflictNotFound(_))));
    let missing = service
        .resolve_conflict("req-none", &uuid::Uuid::new_v4().to_string(), true)
        .await;
    assert!(matches!(missing, Err(Error::ConflictNotFound(_))));
}
