//! Top-level wiring (spec §2, §5): owns every subsystem and exposes the one
//! surface the hosting HTTP/WS app talks to. Mirrors the teacher's
//! `StreamWorker` in spirit — a single struct a `main.rs` constructs once,
//! starts, and shuts down — generalized from one Redis consumer loop into
//! the dispatcher/reaper/failover/heartbeat quartet this engine needs.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::info;
use uuid::Uuid;

use crate::circuit_breaker::{CircuitBreakerConfig, CircuitBreakers};
use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::dispatcher::{Dispatcher, PendingRequests};
use crate::error::EngineError;
use crate::event::{EngineEvent, EventBus};
use crate::failover::FailoverController;
use crate::heartbeat::HeartbeatSupervisor;
use crate::job::{Job, JobPayload, Priority};
use crate::queue::{DlqStats, EngineSnapshot, QueueStore};
use crate::rate_limiter::RateLimiter;
use crate::reaper::ResultReaper;
use crate::registry::{Capability, ExtensionSession, ExtensionSnapshot, Registry, SessionStatus};
use crate::wire::OutboundFrame;

const DISPATCH_TICK: Duration = Duration::from_millis(50);

/// Wires the queue, registry, router, dispatcher, reaper, failover
/// controller, heartbeat supervisor, and event bus into one runnable unit.
pub struct JobDispatchEngine {
    pub queue: Arc<QueueStore>,
    pub registry: Arc<Registry>,
    pub events: Arc<EventBus>,
    circuit_breakers: Arc<CircuitBreakers>,
    dispatcher: Arc<Dispatcher>,
    failover: Arc<FailoverController>,
    heartbeat: Arc<HeartbeatSupervisor>,
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    accepting: Arc<AtomicBool>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl JobDispatchEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Construction with an injected clock, used by tests to drive retry and
    /// heartbeat timing deterministically without real sleeps.
    pub fn with_clock(config: EngineConfig, clock: Arc<dyn Clock>) -> Self {
        let events = Arc::new(EventBus::new());
        let queue = Arc::new(QueueStore::new(
            config.max_queue_size,
            config.dlq_threshold,
            config.retry_delays_ms.clone(),
            events.clone(),
            clock.clone(),
        ));
        let registry = Arc::new(Registry::new(clock.clone()));
        let circuit_breakers = Arc::new(CircuitBreakers::new(CircuitBreakerConfig::default()));
        let rate_limiter = Arc::new(RateLimiter::new(
            config.rate_limit_per_sec,
            config.rate_limit_per_sec,
            clock.clone(),
        ));
        let reaper = Arc::new(ResultReaper::new(queue.clone(), registry.clone(), circuit_breakers.clone()));
        let pending = Arc::new(PendingRequests::new());

        let failover = Arc::new(FailoverController::new(
            queue.clone(),
            registry.clone(),
            pending.clone(),
            reaper.clone(),
            config.processing_timeout,
        ));

        let dispatcher = Arc::new(Dispatcher::new(
            queue.clone(),
            registry.clone(),
            circuit_breakers.clone(),
            rate_limiter,
            reaper,
            failover.clone(),
            events.clone(),
            pending,
            DISPATCH_TICK,
            config.processing_timeout,
            config.max_concurrent,
        ));

        let heartbeat = Arc::new(HeartbeatSupervisor::new(
            registry.clone(),
            events.clone(),
            failover.clone(),
            config.heartbeat_interval,
            config.unhealthy_after,
            config.missed_heartbeat_limit,
        ));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Self {
            queue,
            registry,
            events,
            circuit_breakers,
            dispatcher,
            failover,
            heartbeat,
            config,
            clock,
            accepting: Arc::new(AtomicBool::new(true)),
            shutdown_tx,
            shutdown_rx,
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Spawns the dispatcher and heartbeat supervisor background tasks.
    /// Call once after construction.
    pub fn start(&self) {
        info!("job dispatch engine starting");
        metrics_init_once();

        let dispatcher = self.dispatcher.clone();
        let dispatcher_shutdown = self.shutdown_rx.clone();
        let dispatcher_handle = tokio::spawn(async move {
            dispatcher.run(dispatcher_shutdown).await;
        });

        let heartbeat = self.heartbeat.clone();
        let heartbeat_shutdown = self.shutdown_rx.clone();
        let heartbeat_handle = tokio::spawn(async move {
            heartbeat.run(heartbeat_shutdown).await;
        });

        let mut handles = self.handles.lock().unwrap();
        handles.push(dispatcher_handle);
        handles.push(heartbeat_handle);
    }

    /// Stops accepting new enqueue requests and signals the background
    /// tasks to finish their current tick and return.
    pub async fn shutdown(&self) {
        self.accepting.store(false, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(true);
        let handles: Vec<_> = self.handles.lock().unwrap().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
        info!("job dispatch engine stopped");
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    // --- Queue surface -----------------------------------------------

    pub fn enqueue(&self, payload: JobPayload, priority: Priority) -> Result<Job, EngineError> {
        if !self.is_accepting() {
            return Err(EngineError::Validation("engine is shutting down, not accepting new work".into()));
        }
        self.queue.enqueue(payload, priority)
    }

    pub fn find(&self, id: Uuid) -> Option<Job> {
        self.queue.find(id)
    }

    pub fn cancel(&self, id: Uuid) -> Result<(), EngineError> {
        if self.queue.cancel(id) {
            Ok(())
        } else if self.queue.find(id).is_some() {
            Err(EngineError::NotCancellable)
        } else {
            Err(EngineError::NotFound(id.to_string()))
        }
    }

    pub fn status(&self) -> EngineSnapshot {
        self.queue.get_status()
    }

    pub fn peek_dlq(&self, limit: usize, offset: usize) -> Vec<Job> {
        self.queue.peek_dlq(limit, offset)
    }

    pub fn dlq_stats(&self) -> DlqStats {
        self.queue.dlq_stats()
    }

    pub fn retry_from_dlq(&self, id: Uuid) -> Result<Job, EngineError> {
        self.queue.retry_from_dlq(id)
    }

    pub fn purge_dlq(&self) -> usize {
        self.queue.purge_dlq()
    }

    /// Out-of-band completion reported through an HTTP route rather than the
    /// WebSocket wire, for workers that can't hold a persistent connection.
    /// Late or duplicate calls for a `jobId` no longer in flight surface as
    /// `NotFound` here, matching the reaper's log-and-ignore behavior.
    pub fn complete_job(&self, extension_id: &str, id: Uuid, result: Option<Value>) -> Result<Job, EngineError> {
        self.dispatcher
            .handle_complete(extension_id, id, result)
            .ok_or_else(|| EngineError::NotFound(id.to_string()))
    }

    pub fn fail_job(&self, extension_id: &str, id: Uuid, error: String) -> Result<Job, EngineError> {
        self.dispatcher
            .handle_fail(extension_id, id, error)
            .ok_or_else(|| EngineError::NotFound(id.to_string()))
    }

    pub fn report_progress(&self, extension_id: &str, id: Uuid) {
        self.dispatcher.handle_progress(extension_id, id);
    }

    // --- Extension registry surface -----------------------------------

    pub fn extensions(&self) -> Vec<ExtensionSnapshot> {
        self.registry.snapshot()
    }

    pub fn extension(&self, id: &str) -> Option<ExtensionSnapshot> {
        self.registry.snapshot_one(id)
    }

    /// Registers a newly-connected (not yet authenticated) socket under a
    /// temporary id, returning the channel the WS writer task should drain.
    pub fn connect_extension(&self, temp_id: String) -> mpsc::Receiver<OutboundFrame> {
        let (tx, rx) = mpsc::channel(64);
        let now = self.clock.now();
        self.registry.register(ExtensionSession {
            id: temp_id,
            capabilities: Vec::new(),
            connected_at: now,
            last_activity_at: now,
            messages_sent: 0,
            messages_received: 0,
            in_flight_count: std::sync::atomic::AtomicU32::new(0),
            status: SessionStatus::Unauthenticated,
            send_channel: tx,
            avg_response_time_ms: 0.0,
            success_count: 0,
            failure_count: 0,
            missed_heartbeats: 0,
        });
        rx
    }

    /// Completes the authenticate handshake (spec §4.4): rekeys the session
    /// from its temporary connection id to the extension's self-declared
    /// id, records its advertised capabilities, and marks it `Connected`.
    pub fn authenticate_extension(&self, temp_id: &str, extension_id: String, capabilities: Vec<Capability>) -> bool {
        if !self.registry.rekey(temp_id, extension_id.clone()) {
            return false;
        }
        self.registry.set_capabilities(&extension_id, capabilities);
        self.events.publish(EngineEvent::ExtensionConnected { extension_id });
        true
    }

    pub fn heartbeat_extension(&self, extension_id: &str) {
        self.registry.mark_activity(extension_id);
        self.events.publish(EngineEvent::ExtensionHeartbeat {
            extension_id: extension_id.to_string(),
        });
    }

    /// Removes a session (the socket closed or authentication never
    /// completed) and fails over anything it was holding.
    pub fn disconnect_extension(&self, extension_id: &str) {
        if self.registry.remove(extension_id).is_none() {
            return;
        }
        self.circuit_breakers.remove(extension_id);
        self.events.publish(EngineEvent::ExtensionDisconnected {
            extension_id: extension_id.to_string(),
        });
        self.failover.handle_session_removed(extension_id);
    }

    pub fn now(&self) -> chrono::DateTime<Utc> {
        self.clock.now()
    }
}

fn metrics_init_once() {
    crate::metrics::init_metrics();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TestClock;

    fn payload() -> JobPayload {
        JobPayload {
            url: "https://ex/1.jpg".into(),
            headers: Default::default(),
            metadata: Default::default(),
            addon_id: None,
            callback_url: None,
            ai_tool: None,
        }
    }

    fn engine() -> JobDispatchEngine {
        let clock = TestClock::new(Utc::now());
        JobDispatchEngine::with_clock(EngineConfig::default(), clock)
    }

    #[test]
    fn enqueue_and_find_round_trip() {
        let engine = engine();
        let job = engine.enqueue(payload(), Priority::High).unwrap();
        let found = engine.find(job.id).unwrap();
        assert_eq!(found.id, job.id);
        assert_eq!(found.priority, Priority::High);
    }

    #[test]
    fn cancel_unknown_job_is_not_found() {
        let engine = engine();
        let err = engine.cancel(Uuid::new_v4()).unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }

    #[test]
    fn shutdown_stops_accepting_new_work() {
        let engine = engine();
        assert!(engine.is_accepting());
        engine.accepting.store(false, Ordering::SeqCst);
        let err = engine.enqueue(payload(), Priority::Normal).unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[test]
    fn connect_then_authenticate_promotes_session_to_connected() {
        let engine = engine();
        let _rx = engine.connect_extension("temp-1".into());
        assert_eq!(
            engine.extension("temp-1").unwrap().status,
            SessionStatus::Unauthenticated
        );

        let authed = engine.authenticate_extension(
            "temp-1",
            "ext-real".into(),
            vec![Capability { name: "image-gen".into(), version: "1.0".into() }],
        );
        assert!(authed);
        assert!(engine.extension("temp-1").is_none());
        let snapshot = engine.extension("ext-real").unwrap();
        assert_eq!(snapshot.status, SessionStatus::Connected);
        assert_eq!(snapshot.capabilities.len(), 1);
    }

    #[test]
    fn disconnect_unknown_extension_is_a_no_op() {
        let engine = engine();
        engine.disconnect_extension("never-connected");
    }
}
