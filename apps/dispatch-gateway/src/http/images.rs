//! The image-generation surface (spec §6.1): a caller-friendly veneer over
//! the generic queue surface. `prompt`/`model`/`parameters`/`userId` are
//! folded into the job's `url`/`ai_tool`/`metadata` fields the same way
//! `wire::OutboundFrame::generate_image` unpacks them back out on
//! dispatch.

use std::collections::HashMap;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use dispatch_engine::{EngineError, JobPayload, JobStatus, Priority};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/images/generate", post(generate))
        .route("/api/images/{request_id}/status", get(request_status))
        .route("/api/images/{request_id}", get(request_result))
}

#[derive(Debug, Deserialize)]
pub struct GenerateBody {
    pub prompt: String,
    pub model: Option<String>,
    #[serde(default)]
    pub parameters: HashMap<String, Value>,
    pub user_id: Option<String>,
    /// Caller's subscription tier; mapped to a dispatch priority the same
    /// way an edge billing layer would decide it, kept here only as the
    /// simplest faithful stand-in since tenant/billing data model is out
    /// of scope (spec §1).
    #[serde(default)]
    pub tier: Option<String>,
}

fn priority_for_tier(tier: Option<&str>) -> Priority {
    match tier {
        Some(t) if t.eq_ignore_ascii_case("enterprise") => Priority::High,
        Some(t) if t.eq_ignore_ascii_case("free") => Priority::Low,
        _ => Priority::Normal,
    }
}

#[derive(Debug, Serialize)]
pub struct AcceptedResponse {
    pub request_id: Uuid,
    pub status: &'static str,
    pub correlation_id: String,
    pub timestamp: chrono::DateTime<Utc>,
}

async fn generate(
    State(state): State<AppState>,
    Json(body): Json<GenerateBody>,
) -> Result<(StatusCode, Json<AcceptedResponse>), EngineError> {
    if body.prompt.trim().is_empty() {
        return Err(EngineError::Validation("prompt must not be empty".into()));
    }
    let mut metadata = body.parameters;
    if let Some(user_id) = &body.user_id {
        metadata.insert("userId".to_string(), Value::String(user_id.clone()));
    }
    let payload = JobPayload {
        url: body.prompt,
        headers: HashMap::new(),
        metadata,
        addon_id: None,
        callback_url: None,
        ai_tool: body.model,
    };
    let priority = priority_for_tier(body.tier.as_deref());
    let job = state.engine.enqueue(payload, priority)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(AcceptedResponse {
            request_id: job.id,
            status: "accepted",
            correlation_id: job.correlation_id,
            timestamp: Utc::now(),
        }),
    ))
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub status: JobStatus,
    /// Per-job progress isn't persisted on the job record (spec §4.6:
    /// progress frames touch only session activity), so this is always
    /// `None` until a future revision of the engine's job shape carries
    /// a running progress value.
    pub progress: Option<f64>,
    pub correlation_id: String,
}

async fn request_status(
    State(state): State<AppState>,
    Path(request_id): Path<Uuid>,
) -> Result<Json<StatusResponse>, EngineError> {
    let job = state
        .engine
        .find(request_id)
        .ok_or_else(|| EngineError::NotFound(request_id.to_string()))?;
    Ok(Json(StatusResponse {
        status: job.status,
        progress: None,
        correlation_id: job.correlation_id,
    }))
}

#[derive(Debug, Serialize)]
pub struct ResultResponse {
    pub request_id: Uuid,
    pub status: JobStatus,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub correlation_id: String,
}

async fn request_result(
    State(state): State<AppState>,
    Path(request_id): Path<Uuid>,
) -> Result<Json<ResultResponse>, EngineError> {
    let job = state
        .engine
        .find(request_id)
        .ok_or_else(|| EngineError::NotFound(request_id.to_string()))?;
    Ok(Json(ResultResponse {
        request_id: job.id,
        status: job.status,
        result: job.result,
        error: job.error,
        correlation_id: job.correlation_id,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enterprise_tier_maps_to_high_priority() {
        assert_eq!(priority_for_tier(Some("enterprise")), Priority::High);
        assert_eq!(priority_for_tier(Some("Enterprise")), Priority::High);
    }

    #[test]
    fn free_tier_maps_to_low_priority() {
        assert_eq!(priority_for_tier(Some("free")), Priority::Low);
    }

    #[test]
    fn unknown_or_missing_tier_maps_to_normal() {
        assert_eq!(priority_for_tier(None), Priority::Normal);
        assert_eq!(priority_for_tier(Some("pro")), Priority::Normal);
    }
}
