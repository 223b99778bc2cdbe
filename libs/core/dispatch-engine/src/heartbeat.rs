//! Liveness supervision over the extension registry: periodically pings
//! every connected session and escalates silence to unhealthy, then to
//! removal, following the same ticker-driven run loop shape as the
//! teacher's stream worker, pointed at the registry's heartbeat sweep
//! instead of a Redis consumer group.

use crate::event::{EngineEvent, EventBus};
use crate::failover::FailoverController;
use crate::registry::Registry;
use crate::wire::OutboundFrame;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

pub struct HeartbeatSupervisor {
    registry: Arc<Registry>,
    events: Arc<EventBus>,
    failover: Arc<FailoverController>,
    interval: Duration,
    unhealthy_after: chrono::Duration,
    missed_heartbeat_limit: u32,
}

impl HeartbeatSupervisor {
    pub fn new(
        registry: Arc<Registry>,
        events: Arc<EventBus>,
        failover: Arc<FailoverController>,
        interval: Duration,
        unhealthy_after: Duration,
        missed_heartbeat_limit: u32,
    ) -> Self {
        Self {
            registry,
            events,
            failover,
            interval,
            unhealthy_after: chrono::Duration::from_std(unhealthy_after).unwrap_or(chrono::Duration::seconds(60)),
            missed_heartbeat_limit,
        }
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = self.interval.as_secs(), "heartbeat supervisor starting");
        loop {
            if *shutdown.borrow() {
                info!("heartbeat supervisor received shutdown signal, stopping");
                return;
            }

            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("heartbeat supervisor received shutdown signal, stopping");
                        return;
                    }
                }
                _ = tokio::time::sleep(self.interval) => {
                    self.sweep();
                }
            }
        }
    }

    /// One liveness pass: ping every stale connected session, and drop
    /// sessions that have missed too many heartbeats in a row.
    fn sweep(&self) {
        let stale = self.registry.stale_sessions(self.unhealthy_after);
        for id in &stale {
            self.registry.mark_unhealthy(id);
            let missed = self.registry.increment_missed_heartbeat(id);
            if missed >= self.missed_heartbeat_limit {
                warn!(extension_id = %id, missed, "extension missed too many heartbeats, removing");
                self.remove_and_fail_over(id);
                continue;
            }
            if !self.registry.try_send(id, OutboundFrame::Ping) {
                warn!(extension_id = %id, "heartbeat ping failed to send, removing session");
                self.remove_and_fail_over(id);
            }
        }
    }

    fn remove_and_fail_over(&self, id: &str) {
        self.registry.remove(id);
        self.events.publish(EngineEvent::ExtensionDisconnected {
            extension_id: id.to_string(),
        });
        self.failover.handle_session_removed(id);
    }

    /// Evaluate a single session immediately, used by tests and by the
    /// failover path when a send fails outside the normal tick.
    pub fn evaluate_now(&self, id: &str) -> bool {
        let now = Utc::now();
        let Some(snapshot) = self.registry.snapshot_one(id) else {
            return false;
        };
        now - snapshot.last_activity_at <= self.unhealthy_after
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, TestClock};
    use crate::queue::QueueStore;
    use crate::registry::{Capability, ExtensionSession, SessionStatus};
    use std::sync::atomic::AtomicU32;
    use tokio::sync::mpsc;

    fn failover(registry: Arc<Registry>, clock: Arc<dyn Clock>) -> Arc<FailoverController> {
        let queue = Arc::new(QueueStore::new(None, 3, vec![1000], Arc::new(EventBus::new()), clock));
        let breakers = Arc::new(crate::circuit_breaker::CircuitBreakers::new(
            crate::circuit_breaker::CircuitBreakerConfig::default(),
        ));
        let reaper = Arc::new(crate::reaper::ResultReaper::new(queue.clone(), registry.clone(), breakers));
        Arc::new(FailoverController::new(
            queue,
            registry,
            Arc::new(crate::dispatcher::PendingRequests::new()),
            reaper,
            Duration::from_secs(30),
        ))
    }

    fn session(id: &str, clock: &Arc<dyn Clock>) -> ExtensionSession {
        let (tx, _rx) = mpsc::channel(16);
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
        }
    }

    #[test]
    fn sweep_marks_stale_sessions_unhealthy_and_pings() {
        let clock = TestClock::new(Utc::now());
        let dyn_clock: Arc<dyn Clock> = clock.clone();
        let registry = Arc::new(Registry::new(dyn_clock.clone()));
        registry.register(session("ext-1", &dyn_clock));

        let supervisor = HeartbeatSupervisor::new(
            registry.clone(),
            Arc::new(EventBus::new()),
            failover(registry.clone(), dyn_clock.clone()),
            Duration::from_secs(1),
            Duration::from_secs(30),
            3,
        );

        clock.advance(chrono::Duration::seconds(31));
        supervisor.sweep();

        assert_eq!(registry.snapshot_one("ext-1").unwrap().status, SessionStatus::Unhealthy);
    }

    #[test]
    fn sweep_removes_session_after_missed_limit() {
        let clock = TestClock::new(Utc::now());
        let dyn_clock: Arc<dyn Clock> = clock.clone();
        let registry = Arc::new(Registry::new(dyn_clock.clone()));
        registry.register(session("ext-1", &dyn_clock));

        let supervisor = HeartbeatSupervisor::new(
            registry.clone(),
            Arc::new(EventBus::new()),
            failover(registry.clone(), dyn_clock.clone()),
            Duration::from_secs(1),
            Duration::from_secs(30),
            1,
        );

        clock.advance(chrono::Duration::seconds(31));
        supervisor.sweep();

        assert!(registry.snapshot_one("ext-1").is_none());
    }
}
