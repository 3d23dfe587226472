//! Read-mostly monitoring API.
//!
//! Every read goes through the fallback store and works identically whether
//! the durable backend is up or the broker is running from memory. The one
//! write path, `POST /api/send`, hands the request to the broker loop and
//! waits for the dispatch outcome.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use drover_store::fallback::FallbackStore;
use drover_store::models::{ClientRecord, LogEntry, StoreStatus, Task, TaskStatus};

use crate::broker::{BrokerHandle, SubmitError};

/// Default page size for task and log listings.
const DEFAULT_LIMIT: i64 = 100;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

pub struct AppError {
    status: StatusCode,
    message: String,
}

impl AppError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: msg.into(),
        }
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: msg.into(),
        }
    }

    pub fn internal(err: anyhow::Error) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: format!("{err:#}"),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let body = serde_json::json!({ "error": self.message });
        (self.status, Json(body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct SendRequest {
    pub client_id: String,
    #[serde(default = "default_mode")]
    pub mode: String,
    pub payload: String,
}

fn default_mode() -> String {
    "shell".to_owned()
}

#[derive(Debug, Serialize)]
pub struct SendResponse {
    pub task_id: Uuid,
    pub status: TaskStatus,
}

#[derive(Debug, Deserialize)]
pub struct ListParams {
    pub limit: Option<i64>,
}

impl ListParams {
    /// Requested page size, with a negative value reading as zero rows
    /// rather than reaching the store as an invalid LIMIT.
    fn effective_limit(&self) -> i64 {
        self.limit.unwrap_or(DEFAULT_LIMIT).max(0)
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct ApiState {
    pub store: FallbackStore,
    pub broker: BrokerHandle,
}

pub fn build_router(state: ApiState) -> Router {
    Router::new()
        .route("/api/clients", get(list_clients))
        .route("/api/tasks", get(list_tasks))
        .route("/api/send", post(send_task))
        .route("/api/client/{id}/logs", get(get_client_logs))
        .route("/api/status", get(get_status))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

pub async fn run_api(state: ApiState, bind: &str, cancel: CancellationToken) -> Result<()> {
    let app = build_router(state);
    let addr: SocketAddr = bind
        .parse()
        .with_context(|| format!("invalid http bind address {bind:?}"))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind http api to {addr}"))?;
    tracing::info!("monitoring api listening on http://{addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    tracing::info!("monitoring api shut down");
    Ok(())
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn list_clients(
    State(state): State<ApiState>,
) -> Result<Json<Vec<ClientRecord>>, AppError> {
    let clients = state.store.list_clients().await.map_err(AppError::internal)?;
    Ok(Json(clients))
}

async fn list_tasks(
    State(state): State<ApiState>,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<Task>>, AppError> {
    let tasks = state
        .store
        .list_tasks(params.effective_limit())
        .await
        .map_err(AppError::internal)?;
    Ok(Json(tasks))
}

async fn send_task(
    State(state): State<ApiState>,
    Json(req): Json<SendRequest>,
) -> Result<Json<SendResponse>, AppError> {
    if req.client_id.is_empty() {
        return Err(AppError::bad_request("client_id must not be empty"));
    }
    if req.payload.is_empty() {
        return Err(AppError::bad_request("payload must not be empty"));
    }

    let task = state
        .broker
        .submit(req.client_id, req.mode, req.payload)
        .await
        .map_err(|err| match err {
            SubmitError::UnknownClient(_) => AppError::not_found(err.to_string()),
            SubmitError::Unavailable => AppError::internal(err.into()),
        })?;

    Ok(Json(SendResponse {
        task_id: task.id,
        status: task.status,
    }))
}

async fn get_client_logs(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<LogEntry>>, AppError> {
    let logs = state
        .store
        .get_client_logs(&id, params.effective_limit())
        .await
        .map_err(AppError::internal)?;
    Ok(Json(logs))
}

async fn get_status(State(state): State<ApiState>) -> Json<StoreStatus> {
    Json(state.store.get_status().await)
}
