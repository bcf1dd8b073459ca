//! HTTP surface of the orchestration core: event ingest, manual re-run,
//! and status/history queries. Consumed by the forge integration layer.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

use crate::dispatch::Dispatcher;
use crate::error::ForgeciError;
use crate::event::{ConfigSnapshot, Event, EventId, EventKind, ProjectRef};
use crate::status::{aggregate, StatusReport};
use crate::store::{JobDescriptor, JobId, JobStore};
use crate::supervisor::Supervisor;

#[derive(Clone)]
pub struct ApiState {
    pub store: Arc<dyn JobStore>,
    pub dispatcher: Arc<Dispatcher>,
    pub supervisor: Arc<Supervisor>,
}

/// Normalized event payload as delivered by the forge integration layer.
/// Configuration arrives already resolved (or marked unresolved) — the
/// core never talks to the config service itself.
#[derive(Debug, Deserialize)]
pub struct IngestEventRequest {
    pub project: ProjectRef,
    pub kind: EventKind,
    pub commit_sha: String,
    pub git_ref: String,
    pub actor: String,
    pub config: ConfigSnapshot,
}

#[derive(Debug, Serialize)]
pub struct DispatchResponse {
    pub event_id: EventId,
    pub job_ids: Vec<JobId>,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/healthz", get(healthz))
        .route("/api/events", post(ingest_event))
        .route("/api/events/:id/rerun", post(rerun_event))
        .route("/api/events/:id/status", get(event_status))
        .route("/api/events/:id/jobs", get(event_jobs))
        .layer(cors)
        .with_state(state)
}

pub async fn serve(addr: SocketAddr, state: ApiState, token: CancellationToken) {
    let app = router(state);

    tracing::info!(addr = %addr, "Starting API server");
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "Failed to bind API server");
            return;
        }
    };

    let shutdown = async move { token.cancelled().await };
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
    {
        tracing::error!(error = %e, "API server failed");
    }
}

async fn healthz() -> &'static str {
    "ok"
}

async fn ingest_event(
    State(state): State<ApiState>,
    Json(payload): Json<IngestEventRequest>,
) -> Response {
    let event = Event::new(
        payload.project,
        payload.kind,
        payload.commit_sha,
        payload.git_ref,
        payload.actor,
        payload.config,
    );
    let event_id = event.id;

    if let Err(e) = state.store.insert_event(event.clone()) {
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
    }

    match state.dispatcher.dispatch(&event) {
        Ok(jobs) => dispatch_response(event_id, jobs),
        Err(e) => dispatch_error(e),
    }
}

async fn rerun_event(State(state): State<ApiState>, Path(id): Path<Uuid>) -> Response {
    let event_id = EventId(id);
    match state.supervisor.rerun(event_id).await {
        Ok(jobs) => dispatch_response(event_id, jobs),
        Err(e) => dispatch_error(e),
    }
}

async fn event_status(State(state): State<ApiState>, Path(id): Path<Uuid>) -> Response {
    let event_id = EventId(id);
    if state.store.get_event(event_id).is_none() {
        return error_response(StatusCode::NOT_FOUND, format!("event not found: {event_id}"));
    }
    let latest = state.store.latest_attempts(event_id);
    let report: StatusReport = aggregate(event_id, &latest);
    (StatusCode::OK, Json(report)).into_response()
}

async fn event_jobs(State(state): State<ApiState>, Path(id): Path<Uuid>) -> Response {
    let event_id = EventId(id);
    if state.store.get_event(event_id).is_none() {
        return error_response(StatusCode::NOT_FOUND, format!("event not found: {event_id}"));
    }
    let jobs: Vec<JobDescriptor> = state.store.jobs_for_event(event_id);
    (StatusCode::OK, Json(jobs)).into_response()
}

fn dispatch_response(event_id: EventId, jobs: Vec<JobDescriptor>) -> Response {
    let response = DispatchResponse {
        event_id,
        job_ids: jobs.into_iter().map(|job| job.id).collect(),
    };
    (StatusCode::ACCEPTED, Json(response)).into_response()
}

fn dispatch_error(err: ForgeciError) -> Response {
    let status = match &err {
        ForgeciError::Configuration { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        ForgeciError::QueueFull => StatusCode::SERVICE_UNAVAILABLE,
        ForgeciError::EventNotFound(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(status, err.to_string())
}

fn error_response(status: StatusCode, message: String) -> Response {
    (status, Json(ErrorResponse { error: message })).into_response()
}
