//! Shared test fixtures for the dispatch engine and its hosting apps.
//!
//! Mirrors `test-utils`'s role for the domain crates (a dedicated helper
//! crate rather than copy-pasting fixtures into every `#[cfg(test)]`
//! module), but its content is new: this engine has no external services
//! to spin up in containers, so the fixtures here are a deterministic clock
//! re-export, job/session builders, and a `WireHarness` for driving a
//! dispatcher-bound extension session without a real socket.

use std::collections::HashMap;
use std::sync::atomic::AtomicU32;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dispatch_engine::{Capability, ExtensionSession, JobPayload, Priority, SessionStatus};
use tokio::sync::mpsc;
use uuid::Uuid;

pub use dispatch_engine::{Clock, SystemClock, TestClock};

/// A minimal valid job payload, overridable via the builder methods.
pub struct JobPayloadBuilder {
    payload: JobPayload,
}

impl JobPayloadBuilder {
    pub fn new() -> Self {
        Self {
            payload: JobPayload {
                url: format!("https://example.com/{}.jpg", Uuid::new_v4()),
                headers: HashMap::new(),
                metadata: HashMap::new(),
                addon_id: None,
                callback_url: None,
                ai_tool: None,
            },
        }
    }

    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.payload.url = url.into();
        self
    }

    pub fn ai_tool(mut self, tool: impl Into<String>) -> Self {
        self.payload.ai_tool = Some(tool.into());
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.payload.metadata.insert(key.into(), value);
        self
    }

    pub fn build(self) -> JobPayload {
        self.payload
    }
}

impl Default for JobPayloadBuilder {
    fn default() -> Self {
        Self::new()
    }
}

pub fn payload() -> JobPayload {
    JobPayloadBuilder::new().build()
}

/// An `ExtensionSession` builder, plus the receiver end the test uses to
/// observe frames the engine sends it (the writer task's job in
/// production).
pub struct ExtensionSessionBuilder {
    id: String,
    capabilities: Vec<Capability>,
    status: SessionStatus,
    connected_at: DateTime<Utc>,
    avg_response_time_ms: f64,
    channel_capacity: usize,
}

impl ExtensionSessionBuilder {
    pub fn new(id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            capabilities: Vec::new(),
            status: SessionStatus::Connected,
            connected_at: now,
            avg_response_time_ms: 0.0,
            channel_capacity: 64,
        }
    }

    pub fn capability(mut self, name: impl Into<String>, version: impl Into<String>) -> Self {
        self.capabilities.push(Capability {
            name: name.into(),
            version: version.into(),
        });
        self
    }

    pub fn status(mut self, status: SessionStatus) -> Self {
        self.status = status;
        self
    }

    pub fn avg_response_time_ms(mut self, ms: f64) -> Self {
        self.avg_response_time_ms = ms;
        self
    }

    pub fn build(self) -> (ExtensionSession, mpsc::Receiver<dispatch_engine::OutboundFrame>) {
        let (tx, rx) = mpsc::channel(self.channel_capacity);
        let session = ExtensionSession {
            id: self.id,
            capabilities: self.capabilities,
            connected_at: self.connected_at,
            last_activity_at: self.connected_at,
            messages_sent: 0,
            messages_received: 0,
            in_flight_count: AtomicU32::new(0),
            status: self.status,
            send_channel: tx,
            avg_response_time_ms: self.avg_response_time_ms,
            success_count: 0,
            failure_count: 0,
            missed_heartbeats: 0,
        };
        (session, rx)
    }
}

/// Builds a ready-to-use engine with one connected extension already
/// registered, so router/dispatcher/failover tests don't repeat the same
/// seven lines of wiring.
pub struct WireHarness {
    pub engine: Arc<dispatch_engine::JobDispatchEngine>,
    pub clock: Arc<dyn Clock>,
}

impl WireHarness {
    pub fn new(config: dispatch_engine::EngineConfig) -> Self {
        let clock = TestClock::new(Utc::now());
        let engine = Arc::new(dispatch_engine::JobDispatchEngine::with_clock(config, clock.clone()));
        Self { engine, clock }
    }

    /// Registers and authenticates an extension in one step, returning the
    /// receiver the test polls to observe outbound frames.
    pub fn connect_extension(
        &self,
        id: &str,
        capabilities: Vec<Capability>,
    ) -> mpsc::Receiver<dispatch_engine::OutboundFrame> {
        let rx = self.engine.connect_extension(id.to_string());
        assert!(self.engine.authenticate_extension(id, id.to_string(), capabilities));
        rx
    }

    pub fn enqueue(&self, priority: Priority) -> dispatch_engine::Job {
        self.engine.enqueue(payload(), priority).expect("enqueue should succeed in tests")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_payload_builder_defaults_to_a_unique_url() {
        let a = JobPayloadBuilder::new().build();
        let b = JobPayloadBuilder::new().build();
        assert_ne!(a.url, b.url);
    }

    #[test]
    fn extension_session_builder_produces_connected_session_with_capability() {
        let now = Utc::now();
        let (session, _rx) = ExtensionSessionBuilder::new("ext-1", now)
            .capability("image-gen", "1.0")
            .build();
        assert_eq!(session.id, "ext-1");
        assert_eq!(session.capabilities.len(), 1);
        assert_eq!(session.status, SessionStatus::Connected);
    }

    #[test]
    fn wire_harness_connects_and_enqueues() {
        let harness = WireHarness::new(dispatch_engine::EngineConfig::default());
        let mut rx = harness.connect_extension("ext-1", vec![Capability { name: "image-gen".into(), version: "1.0".into() }]);
        let job = harness.enqueue(Priority::High);
        assert_eq!(job.priority, Priority::High);
        assert!(rx.try_recv().is_err());
    }
}
