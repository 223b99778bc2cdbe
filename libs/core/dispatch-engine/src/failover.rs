//! Failover Controller (spec §4.7): when a worker drops off the registry,
//! every job it was holding must land somewhere — rebound to another live
//! extension or requeued to wait for one — never left orphaned in the
//! in-flight map with a dead `assigned_extension_id`.
//!
//! There's no teacher analogue for this (`stream-worker`'s consumer-group
//! model has Redis reclaim abandoned entries via `XAUTOCLAIM`); this module
//! reuses the router's scoring function the same way the dispatcher does,
//! just triggered by a registry removal instead of a queue pop.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};

use crate::dispatcher::PendingRequests;
use crate::metrics::{self, ErrorLabel};
use crate::queue::QueueStore;
use crate::reaper::ResultReaper;
use crate::registry::Registry;
use crate::router;
use crate::wire::OutboundFrame;

pub struct FailoverController {
    queue: Arc<QueueStore>,
    registry: Arc<Registry>,
    /// Set once the dispatcher exists (the two are constructed together by
    /// `engine.rs`); reassignment re-arms the job's per-job timeout under
    /// its new extension instead of leaving it pointed at the dead one.
    pending: Arc<PendingRequests>,
    reaper: Arc<ResultReaper>,
    processing_timeout: Duration,
}

impl FailoverController {
    pub fn new(
        queue: Arc<QueueStore>,
        registry: Arc<Registry>,
        pending: Arc<PendingRequests>,
        reaper: Arc<ResultReaper>,
        processing_timeout: Duration,
    ) -> Self {
        Self {
            queue,
            registry,
            pending,
            reaper,
            processing_timeout,
        }
    }

    fn spawn_timeout(&self, job_id: uuid::Uuid) -> tokio::task::JoinHandle<()> {
        let reaper = self.reaper.clone();
        let timeout = self.processing_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            reaper.on_timeout(job_id);
        })
    }

    /// Called once an extension has been removed from the registry. Every
    /// job still bound to it is rebound to another eligible worker, or
    /// requeued at the head of its lane if none is available — a routing
    /// failure, not the job's fault, so it doesn't count as an attempt.
    pub fn handle_session_removed(&self, extension_id: &str) {
        let orphaned = self.queue.in_flight_for_extension(extension_id);
        if orphaned.is_empty() {
            return;
        }
        info!(extension_id, count = orphaned.len(), "reassigning jobs from disconnected extension");

        let now = Utc::now();
        for job in orphaned {
            let connected = self.registry.connected_sessions();
            match router::pick_extension(&job, &connected, now) {
                Some(decision) => {
                    let Some(rebound) = self.queue.rebind_in_flight(job.id, &decision.extension_id) else {
                        continue;
                    };
                    self.registry.increment_in_flight(&decision.extension_id);
                    let frame = OutboundFrame::generate_image(&rebound, now);
                    if !self.registry.try_send(&decision.extension_id, frame) {
                        warn!(
                            job_id = %rebound.id,
                            extension_id = %decision.extension_id,
                            "failover rebind target unreachable, requeuing instead"
                        );
                        self.registry.decrement_in_flight(&decision.extension_id);
                        self.pending.remove_silently(rebound.id);
                        metrics::record_error(ErrorLabel::Routing);
                        self.queue.requeue_for_routing_failure(rebound);
                    } else {
                        let timeout = self.spawn_timeout(rebound.id);
                        self.pending.rebind(rebound.id, decision.extension_id.clone(), timeout);
                        info!(
                            job_id = %rebound.id,
                            from = extension_id,
                            to = %decision.extension_id,
                            "job reassigned after extension disconnect"
                        );
                    }
                }
                None => {
                    warn!(job_id = %job.id, "no eligible extension for failed-over job, requeuing");
                    self.pending.remove_silently(job.id);
                    metrics::record_error(ErrorLabel::Routing);
                    self.queue.requeue_for_routing_failure(job);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::{CircuitBreakerConfig, CircuitBreakers};
    use crate::clock::{Clock, TestClock};
    use crate::event::EventBus;
    use crate::job::{JobPayload, Priority};
    use crate::registry::{Capability, ExtensionSession, SessionStatus};
    use std::sync::atomic::AtomicU32;
    use tokio::sync::mpsc;

    fn failover_controller(queue: Arc<QueueStore>, registry: Arc<Registry>) -> FailoverController {
        let breakers = Arc::new(CircuitBreakers::new(CircuitBreakerConfig::default()));
        let reaper = Arc::new(ResultReaper::new(queue.clone(), registry.clone(), breakers));
        FailoverController::new(
            queue,
            registry,
            Arc::new(PendingRequests::new()),
            reaper,
            Duration::from_secs(30),
        )
    }

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

    fn session(id: &str, clock: &Arc<dyn Clock>) -> (ExtensionSession, mpsc::Receiver<OutboundFrame>) {
        let (tx, rx) = mpsc::channel(16);
        (
            ExtensionSession {
                id: id.to_string(),
                capabilities: vec![Capability { name: "image-gen".into(), version: "1.0".into() }],
                connected_at: clock.now(),
                last_activity_at: clock.now(),
                messages_sent: 0,
                messages_received: 0,
                in_flight_count: AtomicU32::new(0),
                status: SessionStatus::Connected,
                send_channel: tx,
                avg_response_time_ms: 0.0,
                success_count: 0,
                failure_count: 0,
                missed_heartbeats: 0,
            },
            rx,
        )
    }

    #[tokio::test]
    async fn orphaned_job_rebinds_to_another_connected_extension() {
        let clock: Arc<dyn Clock> = TestClock::new(Utc::now());
        let registry = Arc::new(Registry::new(clock.clone()));
        let queue = Arc::new(QueueStore::new(None, 3, vec![1000], Arc::new(EventBus::new()), clock.clone()));

        let (victim, _victim_rx) = session("ext-gone", &clock);
        let (survivor, mut survivor_rx) = session("ext-alive", &clock);
        registry.register(victim);
        registry.register(survivor);

        let job = queue.enqueue(payload(), Priority::Normal).unwrap();
        let popped = queue.pop().unwrap();
        assert_eq!(popped.id, job.id);
        queue.mark_dispatched(popped, "ext-gone");
        registry.remove("ext-gone");

        let failover = failover_controller(queue.clone(), registry.clone());
        failover.handle_session_removed("ext-gone");

        let rebound = queue.get_in_flight(job.id).unwrap();
        assert_eq!(rebound.assigned_extension_id.as_deref(), Some("ext-alive"));
        assert!(survivor_rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn orphaned_job_requeues_when_no_extension_available() {
        let clock: Arc<dyn Clock> = TestClock::new(Utc::now());
        let registry = Arc::new(Registry::new(clock.clone()));
        let queue = Arc::new(QueueStore::new(None, 3, vec![1000], Arc::new(EventBus::new()), clock.clone()));

        let (victim, _rx) = session("ext-gone", &clock);
        registry.register(victim);

        let job = queue.enqueue(payload(), Priority::Normal).unwrap();
        let popped = queue.pop().unwrap();
        queue.mark_dispatched(popped, "ext-gone");
        registry.remove("ext-gone");

        let failover = failover_controller(queue.clone(), registry.clone());
        failover.handle_session_removed("ext-gone");

        assert!(queue.get_in_flight(job.id).is_none());
        let requeued = queue.pop().unwrap();
        assert_eq!(requeued.id, job.id);
        assert!(requeued.assigned_extension_id.is_none());
    }

    #[tokio::test]
    async fn no_orphaned_jobs_is_a_no_op() {
        let clock: Arc<dyn Clock> = TestClock::new(Utc::now());
        let registry = Arc::new(Registry::new(clock.clone()));
        let queue = Arc::new(QueueStore::new(None, 3, vec![1000], Arc::new(EventBus::new()), clock));
        let failover = failover_controller(queue, registry);
        failover.handle_session_removed("ext-never-existed");
    }
}
