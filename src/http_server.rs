/// HTTP Server Module
///
/// Provides HTTP endpoints for health checks, observing run progress and
/// triggering a posting run.

use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::Json,
    routing::{get, post},
    Router,
};
use chrono::Utc;
use std::sync::Arc;
use tower_http::cors::CorsLayer;

use crate::job::JobCoordinator;
use crate::lock::GlobalLock;
use crate::scheduler;
use crate::storage::Storage;

#[derive(Clone)]
pub struct AppState {
    pub storage: Arc<dyn Storage>,
    pub lock: Arc<dyn GlobalLock>,
    pub coordinator: Arc<JobCoordinator>,
    pub run_api_secret: Option<String>,
}

/// Create and configure the HTTP server router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/run-status", get(run_status_endpoint))
        .route("/force-run", post(force_run_endpoint))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> Result<Json<serde_json::Value>, StatusCode> {
    Ok(Json(serde_json::json!({
        "status": "ok",
        "service": "feedrelay_bot",
        "timestamp": Utc::now().to_rfc3339()
    })))
}

/// Latest run summary and scheduler state
async fn run_status_endpoint(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let locked = state
        .lock
        .is_locked()
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    let latest = state
        .storage
        .latest_run()
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    Ok(Json(serde_json::json!({
        "paused": locked,
        "latest_run": latest.map(|run| serde_json::json!({
            "run_id": run.run_id,
            "started_at": run.started_at.to_rfc3339(),
            "finished_at": run.finished_at.map(|t| t.to_rfc3339()),
            "duration_secs": run.duration_secs,
            "selected": run.selected,
            "completed": run.completed,
            "posted_count": run.result.posted_count,
            "posted_bytes": run.result.posted_bytes,
            "canceled": run.result.canceled,
            "max_seen_index": run.result.max_seen_index,
        }))
    })))
}

/// Trigger a posting run
async fn force_run_endpoint(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, StatusCode> {
    // Check authentication if run_api_secret is set
    if let Some(secret) = &state.run_api_secret {
        let auth_header = headers
            .get("authorization")
            .and_then(|h| h.to_str().ok())
            .unwrap_or("");

        let token = match auth_header.strip_prefix("Bearer ") {
            Some(token) => token,
            None => return Err(StatusCode::UNAUTHORIZED),
        };
        if token != secret.as_str() {
            return Err(StatusCode::UNAUTHORIZED);
        }
    }

    log::info!("Posting run triggered via HTTP endpoint");

    match scheduler::run_job(&state.coordinator).await {
        Ok(result) => Ok(Json(serde_json::json!({
            "status": "success",
            "posted_count": result.posted_count,
            "posted_bytes": result.posted_bytes,
            "canceled": result.canceled,
        }))),
        Err(e) => {
            log::error!("Forced run failed: {:#}", e);
            Ok(Json(serde_json::json!({
                "status": "error",
                "error": e.to_string()
            })))
        }
    }
}

/// Start the HTTP server
pub async fn start_server(state: AppState, port: u16) -> Result<()> {
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port))
        .await
        .context("Failed to bind HTTP server")?;

    log::info!("HTTP server listening on port {}", port);

    axum::serve(listener, app)
        .await
        .context("HTTP server error")?;

    Ok(())
}
