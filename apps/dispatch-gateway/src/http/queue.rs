//! The queue surface (spec §6.1): a thin adapter translating HTTP requests
//! into calls on `JobDispatchEngine`. Request parsing, auth, and edge rate
//! limiting are the hosting platform's job (spec §1's explicit
//! out-of-scope list); this module only validates the shape of the body
//! and maps engine results onto status codes.

use std::collections::HashMap;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::Utc;
use dispatch_engine::{EngineError, Job, JobPayload, Priority};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/queue/enqueue", post(enqueue))
        .route("/queue/status", get(status))
        .route("/queue/item/{id}", get(get_item).delete(cancel_item))
        .route("/queue/dlq", get(list_dlq).delete(purge_dlq))
        .route("/queue/dlq/{id}/retry", post(retry_dlq))
        .route("/queue/process/{id}/complete", post(process_complete))
        .route("/queue/process/{id}/fail", post(process_fail))
}

#[derive(Debug, Deserialize)]
pub struct EnqueueBody {
    pub url: String,
    #[serde(default)]
    pub priority: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    pub addon_id: Option<String>,
    pub callback_url: Option<String>,
    pub ai_tool: Option<String>,
}

fn parse_priority(raw: Option<&str>) -> Result<Priority, EngineError> {
    match raw {
        None => Ok(Priority::Normal),
        Some(s) if s.eq_ignore_ascii_case("high") => Ok(Priority::High),
        Some(s) if s.eq_ignore_ascii_case("normal") => Ok(Priority::Normal),
        Some(s) if s.eq_ignore_ascii_case("low") => Ok(Priority::Low),
        Some(other) => Err(EngineError::Validation(format!("unknown priority '{other}'"))),
    }
}

#[derive(Debug, Serialize)]
pub struct ItemResponse {
    pub item: Job,
    pub timestamp: chrono::DateTime<Utc>,
}

impl ItemResponse {
    fn new(item: Job) -> Self {
        Self { item, timestamp: Utc::now() }
    }
}

async fn enqueue(
    State(state): State<AppState>,
    Json(body): Json<EnqueueBody>,
) -> Result<(StatusCode, Json<ItemResponse>), EngineError> {
    if body.url.trim().is_empty() {
        return Err(EngineError::Validation("url must not be empty".into()));
    }
    let priority = parse_priority(body.priority.as_deref())?;
    let payload = JobPayload {
        url: body.url,
        headers: body.headers,
        metadata: body.metadata,
        addon_id: body.addon_id,
        callback_url: body.callback_url,
        ai_tool: body.ai_tool,
    };
    let job = state.engine.enqueue(payload, priority)?;
    Ok((StatusCode::CREATED, Json(ItemResponse::new(job))))
}

async fn status(State(state): State<AppState>) -> Json<dispatch_engine::EngineSnapshot> {
    Json(state.engine.status())
}

async fn get_item(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ItemResponse>, EngineError> {
    state
        .engine
        .find(id)
        .map(|job| Json(ItemResponse::new(job)))
        .ok_or_else(|| EngineError::NotFound(id.to_string()))
}

async fn cancel_item(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<StatusCode, EngineError> {
    state.engine.cancel(id)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct DlqQuery {
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
}

fn default_limit() -> usize {
    100
}

#[derive(Debug, Serialize)]
pub struct DlqListResponse {
    pub items: Vec<Job>,
    pub stats: dispatch_engine::DlqStats,
}

async fn list_dlq(State(state): State<AppState>, Query(query): Query<DlqQuery>) -> Json<DlqListResponse> {
    Json(DlqListResponse {
        items: state.engine.peek_dlq(query.limit, query.offset),
        stats: state.engine.dlq_stats(),
    })
}

async fn retry_dlq(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<Json<ItemResponse>, EngineError> {
    let job = state.engine.retry_from_dlq(id)?;
    Ok(Json(ItemResponse::new(job)))
}

#[derive(Debug, Serialize)]
pub struct PurgeResponse {
    pub purged: usize,
}

async fn purge_dlq(State(state): State<AppState>) -> Json<PurgeResponse> {
    Json(PurgeResponse { purged: state.engine.purge_dlq() })
}

/// Out-of-band completion for processors that receive work by other means
/// than the `/ws` wire (spec §6.1); semantically equivalent to an
/// `image_generated` inbound frame.
#[derive(Debug, Deserialize)]
pub struct CompleteBody {
    pub extension_id: String,
    pub result: Option<serde_json::Value>,
}

async fn process_complete(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<CompleteBody>,
) -> Result<Json<ItemResponse>, EngineError> {
    let job = state.engine.complete_job(&body.extension_id, id, body.result)?;
    Ok(Json(ItemResponse::new(job)))
}

#[derive(Debug, Deserialize)]
pub struct FailBody {
    pub extension_id: String,
    pub error: String,
}

async fn process_fail(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<FailBody>,
) -> Result<Json<ItemResponse>, EngineError> {
    let job = state.engine.fail_job(&body.extension_id, id, body.error)?;
    Ok(Json(ItemResponse::new(job)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_priority_defaults_to_normal() {
        assert_eq!(parse_priority(None).unwrap(), Priority::Normal);
    }

    #[test]
    fn parse_priority_is_case_insensitive() {
        assert_eq!(parse_priority(Some("HIGH")).unwrap(), Priority::High);
        assert_eq!(parse_priority(Some("low")).unwrap(), Priority::Low);
    }

    #[test]
    fn parse_priority_rejects_unknown_values() {
        assert!(parse_priority(Some("urgent")).is_err());
    }

    fn state() -> AppState {
        AppState::new(std::sync::Arc::new(dispatch_engine::JobDispatchEngine::new(
            dispatch_engine::EngineConfig::default(),
        )))
    }

    #[tokio::test]
    async fn enqueue_then_fetch_round_trips_through_the_handlers() {
        let state = state();
        let body = EnqueueBody {
            url: "https://ex/1.jpg".into(),
            priority: Some("high".into()),
            headers: HashMap::new(),
            metadata: HashMap::new(),
            addon_id: None,
            callback_url: None,
            ai_tool: None,
        };
        let (status, Json(created)) = enqueue(State(state.clone()), Json(body)).await.unwrap();
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created.item.priority, Priority::High);

        let Json(fetched) = get_item(State(state), Path(created.item.id)).await.unwrap();
        assert_eq!(fetched.item.id, created.item.id);
    }

    #[tokio::test]
    async fn enqueue_rejects_empty_url() {
        let state = state();
        let body = EnqueueBody {
            url: "   ".into(),
            priority: None,
            headers: HashMap::new(),
            metadata: HashMap::new(),
            addon_id: None,
            callback_url: None,
            ai_tool: None,
        };
        let err = enqueue(State(state), Json(body)).await.unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[tokio::test]
    async fn get_item_for_unknown_id_is_not_found() {
        let err = get_item(State(state()), Path(Uuid::new_v4())).await.unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }

    #[tokio::test]
    async fn cancel_pending_job_then_lookup_still_finds_it_cancelled() {
        let state = state();
        let job = state.engine.enqueue(
            JobPayload {
                url: "https://ex/2.jpg".into(),
                headers: HashMap::new(),
                metadata: HashMap::new(),
                addon_id: None,
                callback_url: None,
                ai_tool: None,
            },
            Priority::Normal,
        ).unwrap();

        let status = cancel_item(State(state.clone()), Path(job.id)).await.unwrap();
        assert_eq!(status, StatusCode::NO_CONTENT);

        let Json(fetched) = get_item(State(state), Path(job.id)).await.unwrap();
        assert_eq!(fetched.item.status, dispatch_engine::JobStatus::Cancelled);
    }
}
