//! Job Dispatch Engine - in-memory job queue and router for browser-extension
//! workers connected over a persistent socket.
//!
//! A reusable library providing:
//! - Three-lane priority queue (high/normal/low) with retry backoff and a DLQ
//! - Extension session registry with a connect/authenticate/heartbeat
//!   lifecycle
//! - Capability- and load-aware routing with a weighted scoring formula
//! - Per-extension circuit breakers and a token-bucket admission limiter
//! - Failover: jobs bound to a disconnected extension are rebound or requeued
//! - An internal event bus and Prometheus metrics for observability
//! - Health/readiness/DLQ-admin HTTP handlers for the hosting app to mount
//!
//! # Architecture
//!
//! ```text
//! HTTP/WS app
//!   ↓ (enqueue, admin, /ws frames)
//! JobDispatchEngine
//!   ├─ QueueStore        (lanes, in-flight, DLQ)
//!   ├─ Registry          (extension sessions)
//!   ├─ Dispatcher        (pop → route → bind → send)
//!   ├─ ResultReaper       (progress/complete/fail/timeout)
//!   ├─ FailoverController (rebind/requeue on disconnect)
//!   └─ HeartbeatSupervisor (liveness sweep)
//! ```

mod circuit_breaker;
mod clock;
mod config;
mod dispatcher;
mod engine;
mod error;
mod event;
mod failover;
mod health;
mod heartbeat;
mod job;
mod metrics;
mod queue;
mod rate_limiter;
mod reaper;
mod registry;
mod retry;
mod router;
mod wire;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakers, CircuitState};
pub use clock::{Clock, SystemClock, TestClock};
pub use config::{ConfigError, EngineConfig};
pub use dispatcher::{Dispatcher, PendingRequests};
pub use engine::JobDispatchEngine;
pub use error::{EngineError, ErrorBody, ErrorCategory};
pub use event::{EngineEvent, EventBus};
pub use failover::FailoverController;
pub use health::{
    admin_router, dlq_purge_handler, dlq_retry_handler, dlq_stats_handler, extensions_handler,
    health_handler, health_router, metrics_handler, ready_handler, HealthState,
};
pub use heartbeat::HeartbeatSupervisor;
pub use job::{CapabilityRequirement, Job, JobPayload, JobStatus, Priority};
pub use metrics::{init_metrics, JobTimer};
pub use queue::{DlqStats, EngineSnapshot, QueueStore};
pub use rate_limiter::RateLimiter;
pub use reaper::ResultReaper;
pub use registry::{Capability, ExtensionSession, ExtensionSnapshot, Registry, SessionStatus};
pub use router::DispatchDecision;
pub use wire::{InboundFrame, OutboundFrame};

/// Result type alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;
