//! The wire protocol between the engine and extension workers (spec §6.2).
//!
//! Framing is newline-delimited JSON over a persistent socket at `/ws`;
//! this module only defines the frame catalogue and (de)serialization, the
//! same way `fraiseql_rs`'s websocket handler keeps its tagged message enum
//! separate from the actual socket plumbing, which lives in the HTTP app.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::job::Job;

/// Frames sent by an extension worker to the engine.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundFrame {
    Authenticate {
        #[serde(rename = "extensionId")]
        extension_id: String,
        metadata: Option<Value>,
    },
    Heartbeat {
        status: Option<String>,
        metrics: Option<Value>,
    },
    ImageGenerated {
        #[serde(rename = "requestId")]
        request_id: String,
        #[serde(rename = "imageUrl")]
        image_url: String,
        metadata: Option<Value>,
        #[serde(rename = "correlationId")]
        correlation_id: Option<String>,
    },
    ImageGenerationFailed {
        #[serde(rename = "requestId")]
        request_id: String,
        error: String,
        reason: Option<String>,
        #[serde(rename = "correlationId")]
        correlation_id: Option<String>,
    },
    ImageGenerationProgress {
        #[serde(rename = "requestId")]
        request_id: String,
        progress: f64,
        status: Option<String>,
        #[serde(rename = "correlationId")]
        correlation_id: Option<String>,
    },
}

/// Frames sent by the engine to an extension worker.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundFrame {
    AuthenticationRequired {
        timestamp: DateTime<Utc>,
    },
    AuthenticationSuccess {
        #[serde(rename = "extensionId")]
        extension_id: String,
        timestamp: DateTime<Utc>,
    },
    GenerateImage {
        #[serde(rename = "requestId")]
        request_id: String,
        prompt: String,
        model: Option<String>,
        parameters: Option<Value>,
        #[serde(rename = "userId")]
        user_id: Option<String>,
        #[serde(rename = "correlationId")]
        correlation_id: String,
        timestamp: DateTime<Utc>,
    },
    HeartbeatResponse {
        timestamp: DateTime<Utc>,
    },
    Error {
        error: String,
        timestamp: DateTime<Utc>,
    },
    Ping,
}

impl OutboundFrame {
    pub fn to_json_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Builds the work-assignment frame for a job the dispatcher just bound
    /// to an extension. `payload.url` is the work the extension is handed as
    /// its `prompt`; `ai_tool`/`metadata` carry through as `model`/
    /// `parameters` since the wire catalogue predates the generalized
    /// "download job" payload shape and still speaks in image-generation
    /// terms.
    pub fn generate_image(job: &Job, now: DateTime<Utc>) -> Self {
        let user_id = job
            .payload
            .metadata
            .get("userId")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        let parameters = if job.payload.metadata.is_empty() {
            None
        } else {
            Some(Value::Object(
                job.payload
                    .metadata
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            ))
        };
        OutboundFrame::GenerateImage {
            request_id: job.id.to_string(),
            prompt: job.payload.url.clone(),
            model: job.payload.ai_tool.clone(),
            parameters,
            user_id,
            correlation_id: job.correlation_id.clone(),
            timestamp: now,
        }
    }
}

impl InboundFrame {
    pub fn from_json_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line)
    }
}
