//! Router / Dispatcher (spec §4.5): the one task that owns the queue
//! lanes, the pending-request map, and the rate limiter's token state.
//! Shaped directly on the teacher's `StreamWorker::run` loop — a ticker
//! wrapped in `tokio::select!` against shutdown, with exponential backoff
//! on consecutive tick errors — generalized from a single Redis consumer
//! to scanning the in-memory lanes and binding each eligible job to the
//! best-scoring live extension.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::circuit_breaker::CircuitBreakers;
use crate::event::{EngineEvent, EventBus};
use crate::failover::FailoverController;
use crate::job::Job;
use crate::metrics::{self, ErrorLabel};
use crate::queue::QueueStore;
use crate::rate_limiter::RateLimiter;
use crate::reaper::ResultReaper;
use crate::registry::Registry;
use crate::router;
use crate::wire::OutboundFrame;

/// Bookkeeping for a job currently bound to an extension: which extension
/// holds it and the handle for its per-job timeout, per spec §3's
/// `jobId → {extensionId, assignedAt, timeoutHandle, retryCount}`.
struct PendingEntry {
    extension_id: String,
    timeout: JoinHandle<()>,
}

/// Router bookkeeping, owned exclusively by the dispatcher task. A plain
/// `std::sync::Mutex` is sufficient: every critical section below is a
/// short, non-blocking map mutation (spec §5's "single consistent unit"
/// alternative to actor/channel serialization).
pub struct PendingRequests {
    entries: Mutex<HashMap<Uuid, PendingEntry>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn insert(&self, job_id: Uuid, extension_id: String, timeout: JoinHandle<()>) {
        self.entries.lock().unwrap().insert(job_id, PendingEntry { extension_id, timeout });
    }

    /// Removes and cancels the timeout for a job that just resolved
    /// (completed or failed) through a real worker response.
    fn take(&self, job_id: Uuid) -> Option<String> {
        let entry = self.entries.lock().unwrap().remove(&job_id)?;
        entry.timeout.abort();
        Some(entry.extension_id)
    }

    /// Every job this extension currently holds, per the pending map's
    /// reverse lookup used by failover.
    pub fn for_extension(&self, extension_id: &str) -> Vec<Uuid> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, e)| e.extension_id == extension_id)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Updates a job's pending entry to point at its new extension,
    /// aborting its old timeout task and installing the new one. Upserts
    /// rather than requiring a prior entry, so failover still works for a
    /// job that was bound outside the normal dispatch loop (e.g. in tests).
    pub fn rebind(&self, job_id: Uuid, extension_id: String, timeout: JoinHandle<()>) {
        let mut entries = self.entries.lock().unwrap();
        if let Some(old) = entries.insert(job_id, PendingEntry { extension_id, timeout }) {
            old.timeout.abort();
        }
    }

    pub fn remove_silently(&self, job_id: Uuid) {
        if let Some(entry) = self.entries.lock().unwrap().remove(&job_id) {
            entry.timeout.abort();
        }
    }
}

impl Default for PendingRequests {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Dispatcher {
    queue: Arc<QueueStore>,
    registry: Arc<Registry>,
    circuit_breakers: Arc<CircuitBreakers>,
    rate_limiter: Arc<RateLimiter>,
    reaper: Arc<ResultReaper>,
    failover: Arc<FailoverController>,
    events: Arc<EventBus>,
    pending: Arc<PendingRequests>,
    tick_interval: Duration,
    processing_timeout: Duration,
    max_in_flight: usize,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue: Arc<QueueStore>,
        registry: Arc<Registry>,
        circuit_breakers: Arc<CircuitBreakers>,
        rate_limiter: Arc<RateLimiter>,
        reaper: Arc<ResultReaper>,
        failover: Arc<FailoverController>,
        events: Arc<EventBus>,
        pending: Arc<PendingRequests>,
        tick_interval: Duration,
        processing_timeout: Duration,
        max_in_flight: usize,
    ) -> Self {
        Self {
            queue,
            registry,
            circuit_breakers,
            rate_limiter,
            reaper,
            failover,
            events,
            pending,
            tick_interval,
            processing_timeout,
            max_in_flight,
        }
    }

    pub fn pending(&self) -> Arc<PendingRequests> {
        self.pending.clone()
    }

    /// Main run loop: one tick per `tick_interval`, draining every
    /// dispatchable job each tick, until `shutdown` flips true. Mirrors the
    /// teacher's ticker-plus-select shape, generalized from a single Redis
    /// poll to scanning the lanes until none are dispatchable.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(tick_ms = self.tick_interval.as_millis(), "dispatcher starting");
        loop {
            if *shutdown.borrow() {
                info!("dispatcher received shutdown signal, stopping");
                return;
            }

            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("dispatcher received shutdown signal, stopping");
                        return;
                    }
                }
                _ = tokio::time::sleep(self.tick_interval) => {
                    self.drain_tick();
                }
            }
        }
    }

    /// Dispatch every job currently eligible for a live extension. Stops
    /// when the queue has nothing retry-ready, the rate limiter runs dry,
    /// `maxConcurrent` in-flight jobs are already outstanding, or routing
    /// fails — a routing failure means no connected extension can take
    /// *any* job right now, so re-popping the same head would just
    /// busy-spin against the token bucket until it ran dry; the next tick
    /// retries once the registry has had a chance to change.
    fn drain_tick(&self) {
        loop {
            if self.queue.in_flight_count() >= self.max_in_flight {
                debug!(max = self.max_in_flight, "at maxConcurrent in-flight jobs, ending this tick");
                return;
            }
            if !self.rate_limiter.try_consume() {
                debug!("rate limiter exhausted, ending this tick");
                return;
            }
            let Some(job) = self.queue.pop() else {
                return;
            };
            if !self.dispatch_one(job) {
                return;
            }
        }
    }

    /// Bind a single popped job to the best-scoring eligible extension, or
    /// re-head it as a routing failure if none qualifies (spec §4.5 step 3).
    /// Returns `false` when no extension was eligible, signalling the
    /// caller to stop this tick rather than re-pop the same job.
    fn dispatch_one(&self, job: Job) -> bool {
        let now = Utc::now();
        let connected: Vec<_> = self
            .registry
            .connected_sessions()
            .into_iter()
            .filter(|s| self.circuit_breakers.can_execute(&s.id))
            .collect();

        let Some(decision) = router::pick_extension(&job, &connected, now) else {
            warn!(job_id = %job.id, "no eligible extension, re-heading as queued-waiting");
            metrics::record_error(ErrorLabel::Routing);
            self.queue.requeue_for_routing_failure(job);
            return false;
        };

        let bound = self.queue.mark_dispatched(job, &decision.extension_id);
        self.registry.increment_in_flight(&decision.extension_id);

        let frame = OutboundFrame::generate_image(&bound, now);
        if !self.registry.try_send(&decision.extension_id, frame) {
            warn!(
                job_id = %bound.id,
                extension_id = %decision.extension_id,
                "send failed immediately after bind, treating extension as disconnected"
            );
            // A full/closed outbound channel counts as a disconnect (spec §5):
            // tear the session down and let failover sweep every job it was
            // holding (including this one) instead of only patching up the
            // job we happened to be dispatching.
            self.disconnect_dead_extension(&decision.extension_id);
            return true;
        }

        let timeout = self.spawn_timeout(bound.id);
        self.pending.insert(bound.id, decision.extension_id.clone(), timeout);
        self.events.publish(EngineEvent::MetricsUpdated);
        debug!(job_id = %bound.id, extension_id = %decision.extension_id, reason = decision.reason, "job dispatched");
        true
    }

    /// Removes a session whose outbound channel just rejected a send and
    /// fails over everything it was holding, mirroring
    /// `JobDispatchEngine::disconnect_extension`'s removal path.
    fn disconnect_dead_extension(&self, extension_id: &str) {
        if self.registry.remove(extension_id).is_none() {
            return;
        }
        self.circuit_breakers.remove(extension_id);
        self.events.publish(EngineEvent::ExtensionDisconnected {
            extension_id: extension_id.to_string(),
        });
        self.failover.handle_session_removed(extension_id);
    }

    fn spawn_timeout(&self, job_id: Uuid) -> JoinHandle<()> {
        let reaper = self.reaper.clone();
        let timeout = self.processing_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            reaper.on_timeout(job_id);
        })
    }

    /// Called by the WebSocket frame handler when a `progress` frame
    /// arrives for a job this dispatcher bound.
    pub fn handle_progress(&self, extension_id: &str, job_id: Uuid) {
        self.reaper.on_progress(extension_id, job_id);
    }

    /// Called when a `complete` frame arrives; cancels the job's timeout
    /// before handing off to the reaper.
    pub fn handle_complete(&self, extension_id: &str, job_id: Uuid, result: Option<Value>) -> Option<Job> {
        self.pending.take(job_id);
        self.reaper.on_complete(extension_id, job_id, result)
    }

    /// Called when a `fail` frame arrives; cancels the job's timeout
    /// before handing off to the reaper.
    pub fn handle_fail(&self, extension_id: &str, job_id: Uuid, error: String) -> Option<Job> {
        self.pending.take(job_id);
        self.reaper.on_fail(extension_id, job_id, error, true)
    }
}
