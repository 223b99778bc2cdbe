//! Prometheus-compatible metrics for the dispatch engine.
//!
//! ## Available metrics
//!
//! - `dispatch_jobs_total` - counter of jobs by terminal status
//! - `dispatch_job_duration_seconds` - histogram of job processing time
//! - `dispatch_queue_depth` - gauge of per-priority queue depth
//! - `dispatch_errors_total` - counter of errors by category
//! - `dispatch_retries_total` - counter of retry attempts
//! - `dispatch_dlq_size` - gauge of dead letter queue size
//! - `dispatch_connected_extensions` - gauge of live extension sessions
//! - `dispatch_in_flight_jobs` - gauge of jobs currently bound to a worker

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Duration;

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

pub mod names {
    pub const JOBS_TOTAL: &str = "dispatch_jobs_total";
    pub const JOB_DURATION: &str = "dispatch_job_duration_seconds";
    pub const QUEUE_DEPTH: &str = "dispatch_queue_depth";
    pub const ERRORS: &str = "dispatch_errors_total";
    pub const RETRIES: &str = "dispatch_retries_total";
    pub const DLQ_SIZE: &str = "dispatch_dlq_size";
    pub const CONNECTED_EXTENSIONS: &str = "dispatch_connected_extensions";
    pub const IN_FLIGHT_JOBS: &str = "dispatch_in_flight_jobs";
}

#[derive(Debug, Clone, Copy)]
pub enum TerminalStatus {
    Completed,
    Dead,
    Cancelled,
}

impl TerminalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Dead => "dead",
            Self::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum ErrorLabel {
    Transient,
    Permanent,
    Routing,
    RateLimited,
    Protocol,
    Internal,
}

impl ErrorLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Permanent => "permanent",
            Self::Routing => "routing",
            Self::RateLimited => "rate_limited",
            Self::Protocol => "protocol",
            Self::Internal => "internal",
        }
    }
}

/// Install the global Prometheus recorder. Idempotent; call once at startup.
pub fn init_metrics() -> PrometheusHandle {
    PROMETHEUS_HANDLE
        .get_or_init(|| {
            PrometheusBuilder::new()
                .install_recorder()
                .expect("failed to install prometheus recorder")
        })
        .clone()
}

pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

pub fn record_job_terminal(priority: &str, status: TerminalStatus) {
    counter!(
        names::JOBS_TOTAL,
        "priority" => priority.to_string(),
        "status" => status.as_str().to_string()
    )
    .increment(1);
}

pub fn record_job_duration(priority: &str, duration: Duration) {
    histogram!(
        names::JOB_DURATION,
        "priority" => priority.to_string()
    )
    .record(duration.as_secs_f64());
}

pub fn set_queue_depth(lane: &str, depth: f64) {
    gauge!(names::QUEUE_DEPTH, "lane" => lane.to_string()).set(depth);
}

pub fn record_error(category: ErrorLabel) {
    counter!(names::ERRORS, "category" => category.as_str().to_string()).increment(1);
}

pub fn record_retry(attempt: u32) {
    counter!(names::RETRIES, "attempt" => attempt.to_string()).increment(1);
}

pub fn set_dlq_size(size: f64) {
    gauge!(names::DLQ_SIZE).set(size);
}

pub fn set_connected_extensions(count: f64) {
    gauge!(names::CONNECTED_EXTENSIONS).set(count);
}

pub fn set_in_flight_jobs(count: f64) {
    gauge!(names::IN_FLIGHT_JOBS).set(count);
}

/// Times an in-flight job and records its duration on drop, unless already
/// stopped explicitly.
pub struct JobTimer {
    priority: String,
    start: std::time::Instant,
}

impl JobTimer {
    pub fn new(priority: impl Into<String>) -> Self {
        Self {
            priority: priority.into(),
            start: std::time::Instant::now(),
        }
    }

    pub fn stop(self) {
        record_job_duration(&self.priority, self.start.elapsed());
        // Skip the destructor so `Drop` below doesn't record a second time.
        std::mem::forget(self);
    }
}

impl Drop for JobTimer {
    fn drop(&mut self) {
        record_job_duration(&self.priority, self.start.elapsed());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_status_labels() {
        assert_eq!(TerminalStatus::Completed.as_str(), "completed");
        assert_eq!(TerminalStatus::Dead.as_str(), "dead");
        assert_eq!(TerminalStatus::Cancelled.as_str(), "cancelled");
    }

    #[test]
    fn error_labels() {
        assert_eq!(ErrorLabel::Routing.as_str(), "routing");
        assert_eq!(ErrorLabel::RateLimited.as_str(), "rate_limited");
    }

    #[test]
    fn job_timer_records_on_drop() {
        let timer = JobTimer::new("normal");
        std::thread::sleep(std::time::Duration::from_millis(5));
        drop(timer);
    }
}
