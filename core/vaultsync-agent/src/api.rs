//! Local HTTP control surface.
//!
//! Listens on loopback only. Sync triggers funnel through the syncer's
//! mutex, so control-API work never overlaps the poll loop.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Path, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use tracing::{info, warn};

use vaultsync_backup::FileBackup;

use crate::error::{AgentError, AgentResult};
use crate::syncer::{Syncer, Updated, FAILURE_THRESHOLD_MULTIPLIER};

/// Shared state behind every control endpoint.
pub struct ApiState {
    pub syncer: Arc<Syncer>,
    /// Absent when backups are not configured; `/backup` then serves 503.
    pub backup: Option<FileBackup>,
}

#[derive(Serialize)]
pub struct StatusResponse {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated: Option<Updated>,
}

fn success(updated: Option<Updated>) -> (StatusCode, Json<StatusResponse>) {
    (
        StatusCode::OK,
        Json(StatusResponse {
            ok: true,
            message: None,
            updated,
        }),
    )
}

fn failure(status: StatusCode, message: String) -> (StatusCode, Json<StatusResponse>) {
    (
        status,
        Json(StatusResponse {
            ok: false,
            message: Some(message),
            updated: None,
        }),
    )
}

pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/sync", post(sync_all))
        .route("/sync/:client", post(sync_one))
        .route("/backup", post(run_backup))
        .route("/status", get(status))
        .route("/metrics", get(metrics))
        .layer(middleware::from_fn(log_requests))
        .with_state(state)
}

/// Binds the control API on loopback and serves until shutdown.
pub async fn serve(state: Arc<ApiState>, port: u16) -> AgentResult<()> {
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", port)).await?;
    info!(port, "control API listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

async fn log_requests(request: Request, next: Next) -> Response {
    let started = Instant::now();
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let response = next.run(request).await;
    info!(
        %method,
        url = %path,
        status = response.status().as_u16(),
        duration = ?started.elapsed(),
        "request"
    );
    response
}

async fn sync_all(State(state): State<Arc<ApiState>>) -> (StatusCode, Json<StatusResponse>) {
    info!("syncing all from API");
    let (updated, errors) = state.syncer.run_once().await;
    if !errors.is_empty() {
        let joined = errors
            .iter()
            .map(|err| err.to_string())
            .collect::<Vec<_>>()
            .join("; ");
        warn!(errors = %joined, "error syncing");
        return failure(StatusCode::INTERNAL_SERVER_ERROR, format!("errors: {joined}"));
    }
    success(Some(updated))
}

async fn sync_one(
    State(state): State<Arc<ApiState>>,
    Path(client): Path<String>,
) -> (StatusCode, Json<StatusResponse>) {
    // Strip newlines from the user-controlled name before logging so a
    // crafted request can't forge log lines.
    let sanitized: String = client.chars().filter(|c| *c != '\n' && *c != '\r').collect();
    info!(client = %sanitized, "syncing one from API");

    match state.syncer.sync_one(&client).await {
        Ok(updated) => {
            info!(
                client = %sanitized,
                added = updated.added,
                changed = updated.changed,
                deleted = updated.deleted,
                "API requested sync complete"
            );
            success(Some(updated))
        }
        Err(AgentError::UnknownClient(_)) => failure(
            StatusCode::NOT_FOUND,
            format!("unknown client: {sanitized}"),
        ),
        Err(err) => failure(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("error syncing {sanitized}: {err}"),
        ),
    }
}

async fn run_backup(State(state): State<Arc<ApiState>>) -> (StatusCode, Json<StatusResponse>) {
    let Some(backup) = &state.backup else {
        return failure(
            StatusCode::SERVICE_UNAVAILABLE,
            "backups not configured".to_string(),
        );
    };
    match backup.backup() {
        Ok(()) => success(None),
        Err(err) => failure(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

async fn status(State(state): State<Arc<ApiState>>) -> (StatusCode, Json<StatusResponse>) {
    let Some(since_success) = state.syncer.time_since_last_success() else {
        return failure(
            StatusCode::SERVICE_UNAVAILABLE,
            "initial sync has not yet completed".to_string(),
        );
    };

    let threshold = state.syncer.poll_interval() * FAILURE_THRESHOLD_MULTIPLIER;
    if since_success > threshold {
        let recent = state
            .syncer
            .most_recent_error()
            .unwrap_or_else(|| "unknown".to_string());
        return failure(
            StatusCode::SERVICE_UNAVAILABLE,
            format!(
                "haven't synced in over {} seconds (most recent err: {recent})",
                since_success.as_secs()
            ),
        );
    }

    success(None)
}

async fn metrics(State(state): State<Arc<ApiState>>) -> String {
    state.syncer.metrics().encode()
}
