//! Result Reaper (spec §4.6): consumes the three inbound outcomes a worker
//! can report for a job it was handed — progress, completion, failure —
//! plus the synthetic timeout fired when neither arrives in time, and folds
//! each into queue state, session stats, and the circuit breaker.

use std::sync::Arc;

use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

use crate::circuit_breaker::CircuitBreakers;
use crate::job::{Job, Priority};
use crate::metrics;
use crate::queue::QueueStore;
use crate::registry::Registry;

fn priority_label(p: Priority) -> &'static str {
    match p {
        Priority::High => "high",
        Priority::Normal => "normal",
        Priority::Low => "low",
    }
}

pub struct ResultReaper {
    queue: Arc<QueueStore>,
    registry: Arc<Registry>,
    circuit_breakers: Arc<CircuitBreakers>,
}

impl ResultReaper {
    pub fn new(queue: Arc<QueueStore>, registry: Arc<Registry>, circuit_breakers: Arc<CircuitBreakers>) -> Self {
        Self {
            queue,
            registry,
            circuit_breakers,
        }
    }

    /// A progress update touches session activity only; the job's queue
    /// state doesn't change (spec §4.6).
    pub fn on_progress(&self, extension_id: &str, job_id: Uuid) {
        self.registry.mark_activity(extension_id);
        if self.queue.get_in_flight(job_id).is_none() {
            warn!(%job_id, extension_id, "progress reported for a job not in flight, ignoring");
        }
    }

    /// Successful completion. Returns `None` for a late or duplicate
    /// `complete` referencing a `job_id` no longer in flight — logged and
    /// ignored, per spec §4.6.
    pub fn on_complete(&self, extension_id: &str, job_id: Uuid, result: Option<Value>) -> Option<Job> {
        self.registry.mark_activity(extension_id);
        let Some(job) = self.queue.complete(job_id, result) else {
            warn!(%job_id, extension_id, "late or duplicate completion, ignoring");
            return None;
        };
        self.registry.decrement_in_flight(extension_id);
        self.registry
            .record_result(extension_id, true, job.processing_time_ms.map(|ms| ms as f64));
        self.circuit_breakers.record_success(extension_id);
        metrics::record_job_terminal(priority_label(job.priority), metrics::TerminalStatus::Completed);
        if let Some(ms) = job.processing_time_ms {
            metrics::record_job_duration(priority_label(job.priority), std::time::Duration::from_millis(ms.max(0) as u64));
        }
        Some(job)
    }

    /// A reported failure: retries with backoff up to the DLQ threshold,
    /// then DLQ (spec §4.6/§7). `counts_as_attempt` is false for routing
    /// failures that reach this path indirectly; true for every worker-
    /// reported failure and the synthetic timeout.
    pub fn on_fail(&self, extension_id: &str, job_id: Uuid, error: String, counts_as_attempt: bool) -> Option<Job> {
        self.registry.mark_activity(extension_id);
        let Some(job) = self.queue.fail(job_id, error, counts_as_attempt) else {
            warn!(%job_id, extension_id, "late or duplicate failure, ignoring");
            return None;
        };
        self.registry.decrement_in_flight(extension_id);
        self.registry.record_result(extension_id, false, None);
        self.circuit_breakers.record_failure(extension_id);
        if job.status == crate::job::JobStatus::Dead {
            metrics::record_job_terminal(priority_label(job.priority), metrics::TerminalStatus::Dead);
            metrics::record_error(metrics::ErrorLabel::Permanent);
        } else {
            metrics::record_retry(job.attempts);
            metrics::record_error(metrics::ErrorLabel::Transient);
        }
        Some(job)
    }

    /// Synthesizes a `fail` with reason `timeout` for a job whose per-job
    /// timeout elapsed with no worker response. Looks up the job's
    /// *current* assignment rather than trusting the extension captured
    /// when the timeout was scheduled, since failover may have rebound the
    /// job to a different extension in the meantime. A no-op if the real
    /// result already landed, or the job is no longer in flight at all
    /// (`queue.fail` finds nothing and returns `None`), matching spec
    /// §4.6's "timeout after a real result is a no-op" rule.
    pub fn on_timeout(&self, job_id: Uuid) -> Option<Job> {
        let extension_id = self.queue.get_in_flight(job_id)?.assigned_extension_id?;
        self.on_fail(&extension_id, job_id, "timeout".to_string(), true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitBreakerConfig;
    use crate::clock::{Clock, TestClock};
    use crate::event::EventBus;
    use crate::job::{JobPayload, JobStatus};
    use crate::registry::{Capability, ExtensionSession, SessionStatus};
    use chrono::Utc;
    use std::sync::atomic::AtomicU32;
    use tokio::sync::mpsc;

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

    fn harness() -> (Arc<QueueStore>, Arc<Registry>, ResultReaper, Arc<dyn Clock>) {
        let clock: Arc<dyn Clock> = TestClock::new(Utc::now());
        let registry = Arc::new(Registry::new(clock.clone()));
        let queue = Arc::new(QueueStore::new(None, 3, vec![1000, 5000, 15000], Arc::new(EventBus::new()), clock.clone()));
        let breakers = Arc::new(CircuitBreakers::new(CircuitBreakerConfig::default()));
        let reaper = ResultReaper::new(queue.clone(), registry.clone(), breakers);

        let (tx, _rx) = mpsc::channel(16);
        registry.register(ExtensionSession {
            id: "ext-1".into(),
            capabilities: vec![Capability { name: "image-gen".into(), version: "1.0".into() }],
            connected_at: clock.now(),
            last_activity_at: clock.now(),
            messages_sent: 0,
            messages_received: 0,
            in_flight_count: AtomicU32::new(1),
            status: SessionStatus::Connected,
            send_channel: tx,
            avg_response_time_ms: 0.0,
            success_count: 0,
            failure_count: 0,
            missed_heartbeats: 0,
        });

        (queue, registry, reaper, clock)
    }

    #[test]
    fn complete_marks_job_done_and_updates_session_stats() {
        let (queue, registry, reaper, _clock) = harness();
        let job = queue.enqueue(payload(), Priority::Normal).unwrap();
        let popped = queue.pop().unwrap();
        queue.mark_dispatched(popped, "ext-1");

        let completed = reaper.on_complete("ext-1", job.id, Some(serde_json::json!({"url": "done"}))).unwrap();
        assert_eq!(completed.status, JobStatus::Completed);
        assert_eq!(registry.snapshot_one("ext-1").unwrap().success_count, 1);
        assert!(queue.get_in_flight(job.id).is_none());
    }

    #[test]
    fn late_complete_for_unknown_job_is_ignored() {
        let (_queue, _registry, reaper, _clock) = harness();
        assert!(reaper.on_complete("ext-1", Uuid::new_v4(), None).is_none());
    }

    #[test]
    fn fail_under_threshold_retries_not_dlq() {
        let (queue, _registry, reaper, _clock) = harness();
        let job = queue.enqueue(payload(), Priority::Normal).unwrap();
        let popped = queue.pop().unwrap();
        queue.mark_dispatched(popped, "ext-1");

        let failed = reaper.on_fail("ext-1", job.id, "boom".into(), true).unwrap();
        assert_eq!(failed.status, JobStatus::Pending);
        assert_eq!(failed.attempts, 1);
    }

    #[test]
    fn fail_at_threshold_moves_to_dlq() {
        let (queue, _registry, reaper, _clock) = harness();
        let job = queue.enqueue(payload(), Priority::Normal).unwrap();
        let mut current = job.clone();
        for _ in 0..3 {
            let popped = queue.pop().unwrap();
            queue.mark_dispatched(popped, "ext-1");
            current = reaper.on_fail("ext-1", current.id, "boom".into(), true).unwrap();
        }
        assert_eq!(current.status, JobStatus::Dead);
        assert_eq!(current.attempts, 3);
    }

    #[test]
    fn timeout_after_real_completion_is_a_no_op() {
        let (queue, _registry, reaper, _clock) = harness();
        let job = queue.enqueue(payload(), Priority::Normal).unwrap();
        let popped = queue.pop().unwrap();
        queue.mark_dispatched(popped, "ext-1");
        reaper.on_complete("ext-1", job.id, None).unwrap();

        assert!(reaper.on_timeout(job.id).is_none());
    }

    #[test]
    fn progress_touches_session_activity_without_changing_job_state() {
        let (queue, registry, reaper, _clock) = harness();
        let job = queue.enqueue(payload(), Priority::Normal).unwrap();
        let popped = queue.pop().unwrap();
        queue.mark_dispatched(popped, "ext-1");

        let before = registry.snapshot_one("ext-1").unwrap().last_activity_at;
        reaper.on_progress("ext-1", job.id);
        let after = registry.snapshot_one("ext-1").unwrap().last_activity_at;
        assert!(after >= before);
        assert_eq!(queue.get_in_flight(job.id).unwrap().status, JobStatus::Processing);
    }
}
