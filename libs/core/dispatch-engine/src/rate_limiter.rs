//! Token-bucket rate limiter gating dispatch rate (spec §4.3).
//!
//! Generalized from the teacher's `resilience::RateLimiter`, which refills
//! by resetting to `max_tokens` once a fixed window elapses. Spec §4.3
//! requires continuous, proportional refill computed lazily from wall-clock
//! delta, so this version tracks fractional tokens and a last-refill
//! instant instead of a hard window boundary.

use crate::clock::Clock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

pub struct RateLimiter {
    capacity: f64,
    refill_per_sec: f64,
    tokens: Mutex<f64>,
    last_refill_ms: AtomicU64,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    pub fn new(capacity: f64, refill_per_sec: f64, clock: Arc<dyn Clock>) -> Self {
        let now_ms = clock.now().timestamp_millis() as u64;
        Self {
            capacity,
            refill_per_sec,
            tokens: Mutex::new(capacity),
            last_refill_ms: AtomicU64::new(now_ms),
            clock,
        }
    }

    /// Try to consume one token. Returns `false` if none are available;
    /// callers should back off briefly (~100ms per spec §4.3) and retry.
    pub fn try_consume(&self) -> bool {
        self.refill();
        let mut tokens = self.tokens.lock().unwrap();
        if *tokens >= 1.0 {
            *tokens -= 1.0;
            true
        } else {
            false
        }
    }

    pub fn available(&self) -> f64 {
        self.refill();
        *self.tokens.lock().unwrap()
    }

    fn refill(&self) {
        let now_ms = self.clock.now().timestamp_millis() as u64;
        let last_ms = self.last_refill_ms.swap(now_ms, Ordering::SeqCst);
        let elapsed_secs = now_ms.saturating_sub(last_ms) as f64 / 1000.0;
        if elapsed_secs <= 0.0 {
            // Another caller already refilled for this instant; restore
            // the timestamp we clobbered so we don't lose elapsed time.
            self.last_refill_ms.store(last_ms.max(now_ms), Ordering::SeqCst);
            return;
        }
        let mut tokens = self.tokens.lock().unwrap();
        *tokens = (*tokens + elapsed_secs * self.refill_per_sec).min(self.capacity);
    }
}
