//! Per-extension circuit breaker, kept close to the teacher's
//! `resilience::CircuitBreaker`. The router consults this before scoring a
//! session so a worker whose recent jobs keep failing stops receiving new
//! work until it recovers, without the registry needing to know why.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub timeout_secs: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            timeout_secs: 30,
        }
    }
}

pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: RwLock<CircuitState>,
    failure_count: AtomicU32,
    success_count: AtomicU32,
    last_failure_time: RwLock<Option<Instant>>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: RwLock::new(CircuitState::Closed),
            failure_count: AtomicU32::new(0),
            success_count: AtomicU32::new(0),
            last_failure_time: RwLock::new(None),
        }
    }

    pub fn state(&self) -> CircuitState {
        *self.state.read().unwrap()
    }

    pub fn can_execute(&self) -> bool {
        match self.state() {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                if self.should_attempt_reset() {
                    self.transition_to_half_open();
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        match self.state() {
            CircuitState::Closed => {
                self.failure_count.store(0, Ordering::SeqCst);
            }
            CircuitState::HalfOpen => {
                let successes = self.success_count.fetch_add(1, Ordering::SeqCst) + 1;
                if successes >= self.config.success_threshold {
                    self.transition_to_closed();
                }
            }
            CircuitState::Open => self.transition_to_closed(),
        }
    }

    pub fn record_failure(&self) {
        *self.last_failure_time.write().unwrap() = Some(Instant::now());
        match self.state() {
            CircuitState::Closed => {
                let failures = self.failure_count.fetch_add(1, Ordering::SeqCst) + 1;
                if failures >= self.config.failure_threshold {
                    self.transition_to_open();
                }
            }
            CircuitState::HalfOpen => self.transition_to_open(),
            CircuitState::Open => {}
        }
    }

    fn should_attempt_reset(&self) -> bool {
        match *self.last_failure_time.read().unwrap() {
            Some(time) => time.elapsed() >= Duration::from_secs(self.config.timeout_secs),
            None => true,
        }
    }

    fn transition_to_open(&self) {
        *self.state.write().unwrap() = CircuitState::Open;
        self.success_count.store(0, Ordering::SeqCst);
        tracing::warn!("circuit breaker opened");
    }

    fn transition_to_half_open(&self) {
        *self.state.write().unwrap() = CircuitState::HalfOpen;
        self.failure_count.store(0, Ordering::SeqCst);
        self.success_count.store(0, Ordering::SeqCst);
    }

    fn transition_to_closed(&self) {
        *self.state.write().unwrap() = CircuitState::Closed;
        self.failure_count.store(0, Ordering::SeqCst);
        self.success_count.store(0, Ordering::SeqCst);
    }
}

/// Per-extension circuit breaker registry. The router and dispatcher share
/// one of these so that "is this extension allowed to receive work right
/// now" is a single source of truth regardless of which component asks.
pub struct CircuitBreakers {
    config: CircuitBreakerConfig,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakers {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: RwLock::new(HashMap::new()),
        }
    }

    fn get_or_create(&self, extension_id: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.read().unwrap().get(extension_id) {
            return breaker.clone();
        }
        let mut breakers = self.breakers.write().unwrap();
        breakers
            .entry(extension_id.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(self.config.clone())))
            .clone()
    }

    pub fn can_execute(&self, extension_id: &str) -> bool {
        self.get_or_create(extension_id).can_execute()
    }

    pub fn record_success(&self, extension_id: &str) {
        self.get_or_create(extension_id).record_success();
    }

    pub fn record_failure(&self, extension_id: &str) {
        self.get_or_create(extension_id).record_failure();
    }

    pub fn state_of(&self, extension_id: &str) -> CircuitState {
        self.get_or_create(extension_id).state()
    }

    /// Drops the breaker for an extension that has left the registry so the
    /// map doesn't grow unbounded across reconnect churn.
    pub fn remove(&self, extension_id: &str) {
        self.breakers.write().unwrap().remove(extension_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_after_consecutive_failures() {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 3,
            ..Default::default()
        });
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.can_execute());
    }

    #[test]
    fn half_open_closes_after_success_threshold() {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 1,
            success_threshold: 2,
            timeout_secs: 0,
        });
        breaker.record_failure();
        assert!(breaker.can_execute());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn registry_tracks_independent_breakers_per_extension() {
        let registry = CircuitBreakers::new(CircuitBreakerConfig {
            failure_threshold: 1,
            ..Default::default()
        });
        registry.record_failure("ext-a");
        assert!(!registry.can_execute("ext-a"));
        assert!(registry.can_execute("ext-b"));
    }

    #[test]
    fn registry_remove_resets_state_for_extension() {
        let registry = CircuitBreakers::new(CircuitBreakerConfig {
            failure_threshold: 1,
            ..Default::default()
        });
        registry.record_failure("ext-a");
        assert!(!registry.can_execute("ext-a"));
        registry.remove("ext-a");
        assert!(registry.can_execute("ext-a"));
    }
}
