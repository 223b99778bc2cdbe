//! The Queue Store (spec §4.1): three ordered lanes, an in-flight map, and
//! a DLQ, all mutated through one lock as a single consistent unit so the
//! dispatcher task is the sole owner of queue state (spec §5).

use crate::clock::Clock;
use crate::error::EngineError;
use crate::event::{EngineEvent, EventBus};
use crate::job::{Job, JobPayload, JobStatus, Priority};
use crate::metrics;
use crate::retry;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
pub struct EngineSnapshot {
    pub high_depth: usize,
    pub normal_depth: usize,
    pub low_depth: usize,
    pub in_flight: usize,
    pub dlq_size: usize,
    pub total_enqueued: u64,
    pub total_processed: u64,
    pub total_failed: u64,
    pub total_in_dlq: u64,
    pub current_rate: f64,
    pub avg_processing_time_ms: f64,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DlqStats {
    pub len: usize,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
}

struct Lanes {
    high: VecDeque<Job>,
    normal: VecDeque<Job>,
    low: VecDeque<Job>,
}

impl Lanes {
    fn new() -> Self {
        Self {
            high: VecDeque::new(),
            normal: VecDeque::new(),
            low: VecDeque::new(),
        }
    }

    fn lane_mut(&mut self, p: Priority) -> &mut VecDeque<Job> {
        match p {
            Priority::High => &mut self.high,
            Priority::Normal => &mut self.normal,
            Priority::Low => &mut self.low,
        }
    }

    fn depth(&self, p: Priority) -> usize {
        match p {
            Priority::High => self.high.len(),
            Priority::Normal => self.normal.len(),
            Priority::Low => self.low.len(),
        }
    }

    fn total(&self) -> usize {
        self.high.len() + self.normal.len() + self.low.len()
    }
}

struct Inner {
    lanes: Lanes,
    in_flight: HashMap<Uuid, Job>,
    dlq: Vec<Job>,
    cancelled: HashMap<Uuid, Job>,
    total_enqueued: u64,
    total_processed: u64,
    total_failed: u64,
    processing_time_sum_ms: i64,
    processing_time_count: u64,
    dispatch_timestamps: VecDeque<DateTime<Utc>>,
}

pub struct QueueStore {
    inner: Mutex<Inner>,
    max_queue_size: Option<usize>,
    dlq_threshold: u32,
    retry_delays: Vec<u64>,
    at_capacity: AtomicBool,
    events: Arc<EventBus>,
    clock: Arc<dyn Clock>,
}

impl QueueStore {
    pub fn new(
        max_queue_size: Option<usize>,
        dlq_threshold: u32,
        retry_delays: Vec<u64>,
        events: Arc<EventBus>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            inner: Mutex::new(Inner {
                lanes: Lanes::new(),
                in_flight: HashMap::new(),
                dlq: Vec::new(),
                cancelled: HashMap::new(),
                total_enqueued: 0,
                total_processed: 0,
                total_failed: 0,
                processing_time_sum_ms: 0,
                processing_time_count: 0,
                dispatch_timestamps: VecDeque::new(),
            }),
            max_queue_size,
            dlq_threshold,
            retry_delays,
            at_capacity: AtomicBool::new(false),
            events,
            clock,
        }
    }

    pub fn enqueue(&self, payload: JobPayload, priority: Priority) -> Result<Job, EngineError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(cap) = self.max_queue_size {
            if inner.lanes.total() + inner.in_flight.len() >= cap {
                return Err(EngineError::QueueFull);
            }
        }

        let mut job = Job::new(payload, priority, self.dlq_threshold);
        job.created_at = self.clock.now();
        job.target_extension_id = job.payload.addon_id.clone();
        inner.lanes.lane_mut(priority).push_back(job.clone());
        inner.total_enqueued += 1;
        publish_gauges(&inner);
        self.events.publish(EngineEvent::ItemAdded { job: job.clone() });

        if let Some(cap) = self.max_queue_size {
            let now_full = inner.lanes.total() + inner.in_flight.len() >= cap;
            if now_full && !self.at_capacity.swap(true, Ordering::SeqCst) {
                self.events.publish(EngineEvent::CapacityReached);
            } else if !now_full {
                self.at_capacity.store(false, Ordering::SeqCst);
            }
        }

        Ok(job)
    }

    /// Select the next eligible job: scan high → normal → low; within a
    /// lane, prefer the first retry-ready item (FIFO), else the lane head
    /// if it carries no `next_retry_at`. Never blocks.
    pub fn pop(&self) -> Option<Job> {
        let mut inner = self.inner.lock().unwrap();
        let now = self.clock.now();
        for priority in Priority::ALL {
            let lane = inner.lanes.lane_mut(priority);
            if let Some(pos) = lane.iter().position(|j| j.is_retry_ready(now)) {
                let job = lane.remove(pos).unwrap();
                inner.dispatch_timestamps.push_back(now);
                trim_dispatch_window(&mut inner.dispatch_timestamps, now);
                publish_gauges(&inner);
                return Some(job);
            }
        }
        None
    }

    /// Put a job back at the head of its lane, e.g. because the router had
    /// no eligible worker for it (spec §4.1 edge case).
    pub fn requeue_at_head(&self, mut job: Job) {
        let mut inner = self.inner.lock().unwrap();
        job.status = JobStatus::Pending;
        job.assigned_extension_id = None;
        inner.lanes.lane_mut(job.priority).push_front(job);
        publish_gauges(&inner);
    }

    pub fn mark_dispatched(&self, mut job: Job, extension_id: &str) -> Job {
        let mut inner = self.inner.lock().unwrap();
        job.status = JobStatus::Processing;
        job.assigned_extension_id = Some(extension_id.to_string());
        job.last_attempt_at = Some(self.clock.now());
        inner.in_flight.insert(job.id, job.clone());
        publish_gauges(&inner);
        drop(inner);
        self.events.publish(EngineEvent::ItemProcessing { job: job.clone() });
        job
    }

    pub fn get_in_flight(&self, id: Uuid) -> Option<Job> {
        self.inner.lock().unwrap().in_flight.get(&id).cloned()
    }

    /// Number of jobs currently bound to an extension, consulted by the
    /// dispatcher against `maxConcurrent` (spec §6.3) before binding another.
    pub fn in_flight_count(&self) -> usize {
        self.inner.lock().unwrap().in_flight.len()
    }

    /// All jobs currently bound to an extension, used by failover to find
    /// what a disconnected worker was holding.
    pub fn in_flight_for_extension(&self, extension_id: &str) -> Vec<Job> {
        self.inner
            .lock()
            .unwrap()
            .in_flight
            .values()
            .filter(|j| j.assigned_extension_id.as_deref() == Some(extension_id))
            .cloned()
            .collect()
    }

    /// Rebinds an in-flight job to a new extension in place, without
    /// removing it from the in-flight map, so failover can hand it to
    /// another live worker without disturbing the rest of the bookkeeping
    /// a full `mark_dispatched` round trip would touch.
    pub fn rebind_in_flight(&self, id: Uuid, extension_id: &str) -> Option<Job> {
        let mut inner = self.inner.lock().unwrap();
        let job = inner.in_flight.get_mut(&id)?;
        job.assigned_extension_id = Some(extension_id.to_string());
        job.last_attempt_at = Some(self.clock.now());
        let job = job.clone();
        drop(inner);
        self.events.publish(EngineEvent::ItemProcessing { job: job.clone() });
        Some(job)
    }

    pub fn complete(&self, id: Uuid, result: Option<serde_json::Value>) -> Option<Job> {
        let mut inner = self.inner.lock().unwrap();
        let mut job = inner.in_flight.remove(&id)?;
        let now = self.clock.now();
        job.status = JobStatus::Completed;
        job.completed_at = Some(now);
        job.result = result;
        if let Some(started) = job.last_attempt_at {
            let elapsed = (now - started).num_milliseconds();
            job.processing_time_ms = Some(elapsed);
            inner.processing_time_sum_ms += elapsed;
            inner.processing_time_count += 1;
        }
        inner.total_processed += 1;
        publish_gauges(&inner);
        drop(inner);
        self.events.publish(EngineEvent::ItemCompleted { job: job.clone() });
        Some(job)
    }

    /// Handle a worker failure: retry with backoff up to `dlq_threshold`,
    /// then DLQ. Returns the updated job (whichever state it landed in).
    pub fn fail(&self, id: Uuid, error: String, counts_as_attempt: bool) -> Option<Job> {
        let mut job = self.inner.lock().unwrap().in_flight.remove(&id)?;
        if counts_as_attempt {
            job.attempts += 1;
        }
        job.error = Some(error);

        if job.can_retry(self.dlq_threshold) {
            let delay = retry::delay_for_attempt(&self.retry_delays, job.attempts.max(1));
            self.reenqueue_for_retry(job.clone(), delay.as_millis() as u64);
            Some(job)
        } else {
            Some(self.move_to_dlq(job))
        }
    }

    /// Requeue a job immediately (no backoff) because no worker was
    /// available — a routing failure, not the job's fault (spec §7).
    pub fn requeue_for_routing_failure(&self, mut job: Job) {
        job.status = JobStatus::Pending;
        job.assigned_extension_id = None;
        job.next_retry_at = None;
        let mut inner = self.inner.lock().unwrap();
        inner.in_flight.remove(&job.id);
        inner.lanes.lane_mut(job.priority).push_front(job);
        publish_gauges(&inner);
    }

    pub fn reenqueue_for_retry(&self, mut job: Job, delay_ms: u64) {
        job.status = JobStatus::Pending;
        job.assigned_extension_id = None;
        job.next_retry_at = Some(self.clock.now() + chrono::Duration::milliseconds(delay_ms as i64));
        let mut inner = self.inner.lock().unwrap();
        inner.lanes.lane_mut(job.priority).push_back(job.clone());
        publish_gauges(&inner);
        drop(inner);
        self.events.publish(EngineEvent::ItemRetry { job });
    }

    pub fn move_to_dlq(&self, mut job: Job) -> Job {
        job.status = JobStatus::Dead;
        let mut inner = self.inner.lock().unwrap();
        inner.dlq.push(job.clone());
        inner.total_failed += 1;
        publish_gauges(&inner);
        drop(inner);
        self.events.publish(EngineEvent::ItemDlq { job: job.clone() });
        job
    }

    /// Cancel succeeds only for pending items still sitting in a lane. The
    /// cancelled job is retained (not dropped) so `find` keeps answering for
    /// it afterward, matching `Job::is_terminal`'s treatment of `Cancelled`
    /// as a status callers can still look up.
    pub fn cancel(&self, id: Uuid) -> bool {
        let mut inner = self.inner.lock().unwrap();
        for priority in Priority::ALL {
            let lane = inner.lanes.lane_mut(priority);
            if let Some(pos) = lane.iter().position(|j| j.id == id) {
                let mut job = lane.remove(pos).unwrap();
                job.status = JobStatus::Cancelled;
                inner.cancelled.insert(id, job.clone());
                publish_gauges(&inner);
                drop(inner);
                self.events.publish(EngineEvent::ItemCancelled { job });
                return true;
            }
        }
        false
    }

    pub fn find(&self, id: Uuid) -> Option<Job> {
        let inner = self.inner.lock().unwrap();
        for priority in Priority::ALL {
            if let Some(job) = inner.lanes_ref(priority).iter().find(|j| j.id == id) {
                return Some(job.clone());
            }
        }
        inner
            .in_flight
            .get(&id)
            .cloned()
            .or_else(|| inner.dlq.iter().find(|j| j.id == id).cloned())
            .or_else(|| inner.cancelled.get(&id).cloned())
    }

    pub fn peek_dlq(&self, limit: usize, offset: usize) -> Vec<Job> {
        let inner = self.inner.lock().unwrap();
        inner.dlq.iter().skip(offset).take(limit).cloned().collect()
    }

    pub fn dlq_stats(&self) -> DlqStats {
        let inner = self.inner.lock().unwrap();
        DlqStats {
            len: inner.dlq.len(),
            oldest: inner.dlq.iter().map(|j| j.created_at).min(),
            newest: inner.dlq.iter().map(|j| j.created_at).max(),
        }
    }

    /// Per spec §9 Open Question 2: reappears in its original lane with
    /// `attempts=0` and `error=None` — lossy for auditing, by design.
    pub fn retry_from_dlq(&self, id: Uuid) -> Result<Job, EngineError> {
        let mut inner = self.inner.lock().unwrap();
        let pos = inner
            .dlq
            .iter()
            .position(|j| j.id == id)
            .ok_or_else(|| EngineError::NotFound(id.to_string()))?;
        let mut job = inner.dlq.remove(pos);
        job.status = JobStatus::Pending;
        job.attempts = 0;
        job.error = None;
        job.next_retry_at = None;
        job.assigned_extension_id = None;
        inner.lanes.lane_mut(job.priority).push_back(job.clone());
        publish_gauges(&inner);
        drop(inner);
        self.events.publish(EngineEvent::ItemDlqRetry { job: job.clone() });
        Ok(job)
    }

    /// DLQ entries cannot be cancelled, only purged (spec §9 Open Question 3).
    pub fn purge_dlq(&self) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let count = inner.dlq.len();
        inner.dlq.clear();
        publish_gauges(&inner);
        count
    }

    pub fn get_status(&self) -> EngineSnapshot {
        let inner = self.inner.lock().unwrap();
        let now = self.clock.now();
        let mut timestamps = inner.dispatch_timestamps.clone();
        trim_dispatch_window(&mut timestamps, now);
        let avg_processing_time_ms = if inner.processing_time_count > 0 {
            inner.processing_time_sum_ms as f64 / inner.processing_time_count as f64
        } else {
            0.0
        };
        EngineSnapshot {
            high_depth: inner.lanes.depth(Priority::High),
            normal_depth: inner.lanes.depth(Priority::Normal),
            low_depth: inner.lanes.depth(Priority::Low),
            in_flight: inner.in_flight.len(),
            dlq_size: inner.dlq.len(),
            total_enqueued: inner.total_enqueued,
            total_processed: inner.total_processed,
            total_failed: inner.total_failed,
            total_in_dlq: inner.dlq.len() as u64,
            current_rate: timestamps.len() as f64,
            avg_processing_time_ms,
            generated_at: now,
        }
    }
}

impl Inner {
    fn lanes_ref(&self, p: Priority) -> &VecDeque<Job> {
        match p {
            Priority::High => &self.lanes.high,
            Priority::Normal => &self.lanes.normal,
            Priority::Low => &self.lanes.low,
        }
    }
}

fn publish_gauges(inner: &Inner) {
    metrics::set_queue_depth("high", inner.lanes.depth(Priority::High) as f64);
    metrics::set_queue_depth("normal", inner.lanes.depth(Priority::Normal) as f64);
    metrics::set_queue_depth("low", inner.lanes.depth(Priority::Low) as f64);
    metrics::set_in_flight_jobs(inner.in_flight.len() as f64);
    metrics::set_dlq_size(inner.dlq.len() as f64);
}

fn trim_dispatch_window(timestamps: &mut VecDeque<DateTime<Utc>>, now: DateTime<Utc>) {
    while let Some(front) = timestamps.front() {
        if (now - *front).num_seconds() >= 1 {
            timestamps.pop_front();
        } else {
            break;
        }
    }
}
