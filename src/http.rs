//! REST and SSE surface over [`OrchestrationService`].
//!
//! Every `{id}` segment accepts an orchestration id or the request id that
//! started it. Errors come back as `{code, message}` with a status derived
//! from [`Error::code`].

use std::convert::Infallible;
use std::net::SocketAddr;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;
use tracing::info;

use crate::error::Error;
use crate::orchestration::builder::{DevRequest, TaskPlan};
use crate::orchestration::service::OrchestrationService;

type ApiResult<T> = std::result::Result<T, (StatusCode, Json<ErrorBody>)>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRequest {
    #[serde(flatten)]
    pub request: DevRequest,
    /// Explicit plan. Without one the service planner decomposes the request.
    #[serde(default)]
    pub plan: Option<TaskPlan>,
    #[serde(default)]
    pub max_concurrency: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct ResolveRequest {
    #[serde(default = "default_auto")]
    pub auto: bool,
}

fn default_auto() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct AcceptRequest {
    pub content: String,
}

pub fn router(service: OrchestrationService) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/orchestrations", get(list_orchestrations).post(start_orchestration))
        .route("/orchestrations/{id}", get(get_status))
        .route("/orchestrations/{id}/tasks", get(get_tasks))
        .route("/orchestrations/{id}/tasks/{task_id}", get(get_task))
        .route("/orchestrations/{id}/conflicts", get(get_conflicts))
        .route(
            "/orchestrations/{id}/conflicts/{conflict_id}/resolve",
            post(resolve_conflict),
        )
        .route(
            "/orchestrations/{id}/conflicts/{conflict_id}/accept",
            post(accept_manual_resolution),
        )
        .route("/orchestrations/{id}/cancel", post(cancel_orchestration))
        .route("/orchestrations/{id}/events", get(stream_events))
        .route("/orchestrations/{id}/results", get(get_results))
        .route("/orchestrations/{id}/summary", get(get_summary))
        .with_state(service)
}

/// Bind `addr` and serve until ctrl-c.
pub async fn serve(service: OrchestrationService, addr: SocketAddr) -> crate::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "listening");
    axum::serve(listener, router(service))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down");
        })
        .await?;
    Ok(())
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

async fn list_orchestrations(State(service): State<OrchestrationService>) -> impl IntoResponse {
    Json(service.list().await)
}

async fn start_orchestration(
    State(service): State<OrchestrationService>,
    Json(body): Json<StartRequest>,
) -> ApiResult<impl IntoResponse> {
    let (handle, _) = match body.plan {
        Some(plan) => {
            service
                .start_with_plan(body.request, plan, body.max_concurrency)
                .await
        }
        None => {
            service
                .start_orchestration(body.request, body.max_concurrency)
                .await
        }
    }
    .map_err(map_error)?;
    Ok((StatusCode::CREATED, Json(handle.snapshot().await)))
}

async fn get_status(
    State(service): State<OrchestrationService>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let orchestration = service.get_status(&id).await.map_err(map_error)?;
    Ok(Json(orchestration))
}

async fn get_tasks(
    State(service): State<OrchestrationService>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let tasks = service.get_tasks(&id).await.map_err(map_error)?;
    Ok(Json(tasks))
}

async fn get_task(
    State(service): State<OrchestrationService>,
    Path((id, task_id)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    let task = service.get_task(&id, &task_id).await.map_err(map_error)?;
    Ok(Json(task))
}

async fn get_conflicts(
    State(service): State<OrchestrationService>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let conflicts = service.get_conflicts(&id).await.map_err(map_error)?;
    Ok(Json(conflicts))
}

async fn resolve_conflict(
    State(service): State<OrchestrationService>,
    Path((id, conflict_id)): Path<(String, String)>,
    Json(body): Json<ResolveRequest>,
) -> ApiResult<impl IntoResponse> {
    let conflict = service
        .resolve_conflict(&id, &conflict_id, body.auto)
        .await
        .map_err(map_error)?;
    Ok(Json(conflict))
}

async fn accept_manual_resolution(
    State(service): State<OrchestrationService>,
    Path((id, conflict_id)): Path<(String, String)>,
    Json(body): Json<AcceptRequest>,
) -> ApiResult<impl IntoResponse> {
    let conflict = service
        .accept_manual_resolution(&id, &conflict_id, body.content)
        .await
        .map_err(map_error)?;
    Ok(Json(conflict))
}

async fn cancel_orchestration(
    State(service): State<OrchestrationService>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let orchestration = service.cancel_orchestration(&id).await.map_err(map_error)?;
    Ok(Json(orchestration))
}

async fn get_results(
    State(service): State<OrchestrationService>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let results = service.get_results(&id).await.map_err(map_error)?;
    Ok(Json(results))
}

async fn get_summary(
    State(service): State<OrchestrationService>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let summary = service.get_summary(&id).await.map_err(map_error)?;
    Ok(Json(summary))
}

/// Live events until the orchestration finishes. Attaching to a finished
/// orchestration yields an empty stream.
async fn stream_events(
    State(service): State<OrchestrationService>,
    Path(id): Path<String>,
) -> ApiResult<Sse<impl tokio_stream::Stream<Item = Result<SseEvent, Infallible>>>> {
    let rx = service.subscribe(&id).await.map_err(map_error)?;

    let stream = UnboundedReceiverStream::new(rx).map(|event| {
        let payload = serde_json::to_string(&event).unwrap_or_else(|_| "{}".to_string());
        Ok::<SseEvent, Infallible>(
            SseEvent::default()
                .event(event.event_type())
                .id(event.sequence.to_string())
                .data(payload),
        )
    });

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(10))
            .text("keepalive"),
    ))
}

fn status_for(err: &Error) -> StatusCode {
    match err {
        Error::GraphConstruction(_) => StatusCode::UNPROCESSABLE_ENTITY,
        Error::AlreadyRunning { .. } | Error::AlreadyResolved(_) => StatusCode::CONFLICT,
        Error::OrchestrationNotFound(_) | Error::TaskNotFound(_) | Error::ConflictNotFound(_) => {
            StatusCode::NOT_FOUND
        }
        Error::Validation(_) => StatusCode::BAD_REQUEST,
        Error::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn map_error(err: Error) -> (StatusCode, Json<ErrorBody>) {
    (
        status_for(&err),
        Json(ErrorBody {
            code: err.code().to_string(),
            message: err.to_string(),
        }),
    )
}
