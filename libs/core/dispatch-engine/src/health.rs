//! Health, readiness, metrics, and extension-registry admin handlers (spec
//! §6.1), generalized from the teacher's Redis-PING readiness check to this
//! engine's own `is_accepting` flag and registry snapshot.

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::engine::JobDispatchEngine;
use crate::metrics;

/// Shared state for the health/admin routers.
#[derive(Clone)]
pub struct HealthState {
    pub engine: Arc<JobDispatchEngine>,
    pub app_name: String,
    pub app_version: String,
}

impl HealthState {
    pub fn new(engine: Arc<JobDispatchEngine>, app_name: impl Into<String>, app_version: impl Into<String>) -> Self {
        Self {
            engine,
            app_name: app_name.into(),
            app_version: app_version.into(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub name: String,
    pub version: String,
}

/// Liveness probe. Always reports healthy if the process is serving
/// requests at all; use `/ready` to ask whether it's accepting new work.
pub async fn health_handler(State(state): State<HealthState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        name: state.app_name,
        version: state.app_version,
    })
}

/// Readiness probe: not ready once the engine has stopped accepting new
/// enqueue requests (shutdown in progress).
pub async fn ready_handler(State(state): State<HealthState>) -> (StatusCode, Json<Value>) {
    if state.engine.is_accepting() {
        (StatusCode::OK, Json(json!({ "status": "ready" })))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "not_ready", "reason": "engine is shutting down" })),
        )
    }
}

/// Prometheus text-exposition endpoint.
pub async fn metrics_handler() -> impl IntoResponse {
    match metrics::get_metrics_handle() {
        Some(handle) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            handle.render(),
        )
            .into_response(),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            "metrics not initialized, call dispatch_engine::init_metrics() at startup".to_string(),
        )
            .into_response(),
    }
}

/// `GET /admin/extensions` — a snapshot of every known session, connected or
/// not, for operator visibility into the registry.
pub async fn extensions_handler(State(state): State<HealthState>) -> Json<Value> {
    Json(json!({ "extensions": state.engine.extensions() }))
}

/// `GET /admin/dlq/stats`, convenience mirror of the `/queue/dlq` surface
/// for operators who only have the admin router mounted.
pub async fn dlq_stats_handler(State(state): State<HealthState>) -> Json<Value> {
    Json(json!(state.engine.dlq_stats()))
}

/// `POST /admin/dlq/{id}/retry`
pub async fn dlq_retry_handler(
    State(state): State<HealthState>,
    axum::extract::Path(id): axum::extract::Path<uuid::Uuid>,
) -> Result<Json<Value>, crate::error::EngineError> {
    let job = state.engine.retry_from_dlq(id)?;
    Ok(Json(json!({ "job": job })))
}

/// `DELETE /admin/dlq`
pub async fn dlq_purge_handler(State(state): State<HealthState>) -> Json<Value> {
    let purged = state.engine.purge_dlq();
    Json(json!({ "purged": purged }))
}

/// Standard liveness/readiness/metrics router:
/// `/health`, `/healthz`, `/ready`, `/readyz`, `/metrics`.
pub fn health_router(state: HealthState) -> axum::Router {
    use axum::routing::get;

    axum::Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/readyz", get(ready_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

/// Operator-facing admin router: extension registry visibility plus a DLQ
/// mirror of the `/queue/dlq` surface.
pub fn admin_router(state: HealthState) -> axum::Router {
    use axum::routing::{delete, get, post};

    axum::Router::new()
        .route("/admin/extensions", get(extensions_handler))
        .route("/admin/dlq/stats", get(dlq_stats_handler))
        .route("/admin/dlq/{id}/retry", post(dlq_retry_handler))
        .route("/admin/dlq", delete(dlq_purge_handler))
        .with_state(state)
}
