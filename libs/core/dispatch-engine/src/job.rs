//! The job record moved around by the queue, router, and reaper.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Priority lane a job lives in. Ordered high > normal > low for dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Normal,
    Low,
}

impl Priority {
    /// Lanes in strict dispatch order.
    pub const ALL: [Priority; 3] = [Priority::High, Priority::Normal, Priority::Low];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Dead,
    Cancelled,
}

/// The work a job carries: a URL plus caller-supplied metadata, headers, and
/// an optional hint for which extension-side tool should handle it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobPayload {
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    pub addon_id: Option<String>,
    pub callback_url: Option<String>,
    pub ai_tool: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub priority: Priority,
    pub payload: JobPayload,
    pub attempts: u32,
    pub max_attempts: u32,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub result: Option<serde_json::Value>,
    pub processing_time_ms: Option<i64>,
    pub assigned_extension_id: Option<String>,
    /// Caller may pin a job to a specific extension; honored by the router
    /// as an exact match before scoring kicks in.
    pub target_extension_id: Option<String>,
    pub correlation_id: String,
    /// Capabilities the router requires a candidate extension to offer,
    /// consulted by the 40%-weighted capability term of its scoring
    /// formula (spec §4.5).
    pub required_capabilities: Vec<CapabilityRequirement>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityRequirement {
    pub name: String,
    pub required_version: String,
}

impl Job {
    pub fn new(payload: JobPayload, priority: Priority, max_attempts: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            priority,
            payload,
            attempts: 0,
            max_attempts,
            status: JobStatus::Pending,
            created_at: Utc::now(),
            last_attempt_at: None,
            completed_at: None,
            next_retry_at: None,
            error: None,
            result: None,
            processing_time_ms: None,
            assigned_extension_id: None,
            target_extension_id: None,
            correlation_id: Uuid::new_v4().to_string(),
            required_capabilities: Vec::new(),
        }
    }

    pub fn is_retry_ready(&self, now: DateTime<Utc>) -> bool {
        match self.next_retry_at {
            Some(at) => at <= now,
            None => true,
        }
    }

    pub fn can_retry(&self, dlq_threshold: u32) -> bool {
        self.attempts < dlq_threshold
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            JobStatus::Completed | JobStatus::Dead | JobStatus::Cancelled
        )
    }
}
