//! REST and SSE interface tests.
//!
//! These tests call the router directly with `tower::ServiceExt::oneshot`,
//! so no socket is bound.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;

use fanout::core::TaskStatus;
use fanout::http::router;
use fanout::orchestration::OrchestrationService;

use crate::fixtures::{service, wait_for_task, Gate, Script, ScriptedRunner};

async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Vec<u8>) {
    let mut request = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(value) => {
            request = request.header(header::CONTENT_TYPE, "application/json");
            Body::from(value.to_string())
        }
        None => Body::empty(),
    };
    let response = app.clone().oneshot(request.body(body).unwrap()).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, bytes.to_vec())
}

async fn send_json(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let (status, bytes) = send(app, method, uri, body).await;
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

fn plan_body(request_id: &str) -> Value {
    json!({
        "requestId": request_id,
        "description": "todo app",
        "maxConcurrency": 2,
        "plan": {
            "tasks": [
                {"type": "frontend", "name": "Build frontend"},
                {"type": "backend", "name": "Build backend"},
                {"type": "tests", "name": "Write tests", "dependencies": ["frontend", "backend"]}
            ]
        }
    })
}

fn shared_file_runner() -> ScriptedRunner {
    ScriptedRunner::new()
        .script("frontend", Script::files(&[("src/types.ts", "export type A = 1;\n")]))
        .script("backend", Script::files(&[("src/types.ts", "export type B = 2;\n")]).delay_ms(10))
}

async fn finish(service: &OrchestrationService, id: &str) {
    service.wait(id, Some(crate::fixtures::TEST_TIMEOUT)).await.unwrap();
}

/// Test: Start and poll
/// Given a POST with an explicit plan
/// When the orchestration finishes
/// Then status, tasks, results and summary are served as camelCase JSON
#[tokio::test]
async fn test_start_and_read_back() {
    let service = service(Arc::new(ScriptedRunner::new()), 3);
    let app = router(service.clone());

    let (status, body) = send_json(&app, "POST", "/orchestrations", Some(plan_body("req-http"))).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["requestId"], "req-http");
    assert_eq!(body["totalTasks"], 3);
    assert_eq!(body["maxConcurrency"], 2);
    let id = body["id"].as_str().unwrap().to_string();

    finish(&service, &id).await;

    let (status, body) = send_json(&app, "GET", &format!("/orchestrations/{}", id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "completed");
    assert_eq!(body["completedTasks"], 3);

    let (_, tasks) = send_json(&app, "GET", "/orchestrations/req-http/tasks", None).await;
    let tasks = tasks.as_array().unwrap();
    assert_eq!(tasks.len(), 3);
    assert_eq!(tasks[0]["taskType"], "frontend");
    assert_eq!(tasks[2]["dependsOn"].as_array().unwrap().len(), 2);

    let task_id = tasks[1]["id"].as_str().unwrap();
    let (status, task) =
        send_json(&app, "GET", &format!("/orchestrations/req-http/tasks/{}", task_id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(task["key"], "backend");

    let (status, results) = send_json(&app, "GET", "/orchestrations/req-http/results", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(results["files"].as_array().unwrap().len(), 3);

    let (status, summary) = send_json(&app, "GET", "/orchestrations/req-http/summary", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(summary["peakConcurrency"], 2);

    let (_, list) = send_json(&app, "GET", "/orchestrations", None).await;
    assert_eq!(list.as_array().unwrap().len(), 1);
}

/// Test: Error mapping
/// Given bad inputs
/// When they are sent
/// Then each maps to its status and error code
#[tokio::test]
async fn test_error_responses() {
    let gate = Gate::new();
    let runner = ScriptedRunner::new().script("frontend", Script::files(&[]).gated(&gate));
    let service = service(Arc::new(runner), 3);
    let app = router(service.clone());

    let (status, _) = send_json(&app, "POST", "/orchestrations", Some(plan_body("req-busy"))).await;
    assert_eq!(status, StatusCode::CREATED);
    let (status, body) = send_json(&app, "POST", "/orchestrations", Some(plan_body("req-busy"))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "already_running");

    let cyclic = json!({
        "requestId": "req-cycle",
        "plan": {"tasks": [
            {"key": "a", "type": "backend", "name": "A", "dependencies": ["b"]},
            {"key": "b", "type": "frontend", "name": "B", "dependencies": ["a"]}
        ]}
    });
    let (status, body) = send_json(&app, "POST", "/orchestrations", Some(cyclic)).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["code"], "graph_construction");

    let zero = json!({"requestId": "req-zero", "maxConcurrency": 0});
    let (status, body) = send_json(&app, "POST", "/orchestrations", Some(zero)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "invalid_argument");

    let (status, body) = send_json(&app, "GET", "/orchestrations/missing", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "orchestration_not_found");

    let (status, body) = send_json(&app, "GET", "/orchestrations/req-busy/tasks/nope", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "task_not_found");

    gate.open();
    finish(&service, "req-busy").await;
}

/// Test: Conflict endpoints
/// Given a finished orchestration with one conflict
/// When it is resolved twice over HTTP
/// Then the first call succeeds and the second is a 409
#[tokio::test]
async fn test_conflict_endpoints() {
    let service = service(Arc::new(shared_file_runner()), 3);
    let app = router(service.clone());

    send_json(&app, "POST", "/orchestrations", Some(plan_body("req-conf"))).await;
    finish(&service, "req-conf").await;

    let (status, conflicts) = send_json(&app, "GET", "/orchestrations/req-conf/conflicts", None).await;
    assert_eq!(status, StatusCode::OK);
    let conflicts = conflicts.as_array().unwrap();
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0]["type"], "import");
    assert_eq!(conflicts[0]["status"], "unresolved");
    let conflict_id = conflicts[0]["id"].as_str().unwrap().to_string();

    let uri = format!("/orchestrations/req-conf/conflicts/{}/resolve", conflict_id);
    let (status, body) = send_json(&app, "POST", &uri, Some(json!({"auto": false}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "unresolved");
    assert!(body["manualRequestedAt"].is_string());

    let accept = format!("/orchestrations/req-conf/conflicts/{}/accept", conflict_id);
    let (status, body) =
        send_json(&app, "POST", &accept, Some(json!({"content": "export type A = 1;\n"}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "resolved");
    assert_eq!(body["resolution"]["strategy"], "manual");

    let (status, body) = send_json(&app, "POST", &uri, Some(json!({"auto": true}))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "already_resolved");
}

/// Test: Cancel endpoint
/// Given a running orchestration
/// When it is cancelled over HTTP
/// Then the response is the failed, cancelled snapshot
#[tokio::test]
async fn test_cancel_endpoint() {
    let gate = Gate::new();
    let runner = ScriptedRunner::new().script("frontend", Script::files(&[]).gated(&gate));
    let service = service(Arc::new(runner), 3);
    let app = router(service.clone());

    send_json(&app, "POST", "/orchestrations", Some(plan_body("req-stop"))).await;
    let (status, body) = send_json(&app, "POST", "/orchestrations/req-stop/cancel", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "failed");
    assert_eq!(body["cancelled"], true);

    finish(&service, "req-stop").await;
}

/// Test: Live event stream
/// Given a subscriber attached while a task is gated
/// When the task is released
/// Then the SSE body carries the remaining events and ends with the final status
#[tokio::test]
async fn test_event_stream() {
    let gate = Gate::new();
    let runner = ScriptedRunner::new().script("tests", Script::files(&[]).gated(&gate));
    let service = service(Arc::new(runner), 3);
    let app = router(service.clone());

    let (_, body) = send_json(&app, "POST", "/orchestrations", Some(plan_body("req-sse"))).await;
    let id = body["id"].as_str().unwrap().to_string();
    let handle = service.handle(&id).await.unwrap();
    wait_for_task(&handle, "tests", TaskStatus::Running).await;

    let request = Request::builder()
        .uri("/orchestrations/req-sse/events")
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CONTENT_TYPE],
        "text/event-stream"
    );

    gate.open();
    let bytes = tokio::time::timeout(
        crate::fixtures::TEST_TIMEOUT,
        axum::body::to_bytes(response.into_body(), usize::MAX),
    )
    .await
    .unwrap()
    .unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();

    assert!(text.contains("event: task_update"));
    assert!(text.contains("\"status\":\"completed\""));
    let last_event = text
        .lines()
        .filter(|l| l.starts_with("event: "))
        .last()
        .unwrap();
    assert_eq!(last_event, "event: orchestration_status");
}

/// Test: Stream of a finished orchestration
/// Given a finished orchestration
/// When its event stream is requested
/// Then the response ends without events
#[tokio::test]
async fn test_event_stream_after_finish_is_empty() {
    let service = service(Arc::new(ScriptedRunner::new()), 3);
    let app = router(service.clone());
    send_json(&app, "POST", "/orchestrations", Some(plan_body("req-done"))).await;
    finish(&service, "req-done").await;

    let (status, bytes) = send(&app, "GET", "/orchestrations/req-done/events", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(!String::from_utf8(bytes).unwrap().contains("event:"));
}

#[tokio::test]
async fn test_health() {
    let app = router(service(Arc::new(ScriptedRunner::new()), 3));
    let (status, body) = send_json(&app, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}
