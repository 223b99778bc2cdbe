//! Extension Registry (spec §4.4): the set of live worker sessions, their
//! capabilities, load, and liveness, plus the session lifecycle state
//! machine. Session objects are owned by their I/O task pair; the registry
//! only holds snapshots and the channel used to reach them (spec §5).

use crate::clock::Clock;
use crate::metrics;
use crate::wire::OutboundFrame;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Unauthenticated,
    Connected,
    Unhealthy,
    Disconnected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Capability {
    pub name: String,
    pub version: String,
}

/// A live extension connection. The send channel is the only way the
/// registry reaches the session's writer task; a full channel marks the
/// session for removal rather than blocking the caller (spec §5).
pub struct ExtensionSession {
    pub id: String,
    pub capabilities: Vec<Capability>,
    pub connected_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub in_flight_count: AtomicU32,
    pub status: SessionStatus,
    pub send_channel: mpsc::Sender<OutboundFrame>,
    pub avg_response_time_ms: f64,
    pub success_count: u64,
    pub failure_count: u64,
    pub missed_heartbeats: u32,
}

impl ExtensionSession {
    pub fn current_load(&self) -> u32 {
        self.in_flight_count.load(Ordering::SeqCst)
    }
}

fn connected_count(sessions: &HashMap<String, ExtensionSession>) -> f64 {
    sessions.values().filter(|s| s.status == SessionStatus::Connected).count() as f64
}

/// A point-in-time, cloneable view for snapshots/admin endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct ExtensionSnapshot {
    pub id: String,
    pub capabilities: Vec<Capability>,
    pub connected_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub in_flight_count: u32,
    pub status: SessionStatus,
    pub avg_response_time_ms: f64,
    pub success_count: u64,
    pub failure_count: u64,
}

impl From<&ExtensionSession> for ExtensionSnapshot {
    fn from(s: &ExtensionSession) -> Self {
        Self {
            id: s.id.clone(),
            capabilities: s.capabilities.clone(),
            connected_at: s.connected_at,
            last_activity_at: s.last_activity_at,
            in_flight_count: s.current_load(),
            status: s.status.clone(),
            avg_response_time_ms: s.avg_response_time_ms,
            success_count: s.success_count,
            failure_count: s.failure_count,
        }
    }
}

pub struct Registry {
    sessions: RwLock<HashMap<String, ExtensionSession>>,
    clock: Arc<dyn Clock>,
}

impl Registry {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            clock,
        }
    }

    pub fn register(&self, session: ExtensionSession) {
        let mut sessions = self.sessions.write().unwrap();
        sessions.insert(session.id.clone(), session);
        metrics::set_connected_extensions(connected_count(&sessions));
    }

    pub fn mark_activity(&self, id: &str) {
        let mut sessions = self.sessions.write().unwrap();
        if let Some(session) = sessions.get_mut(id) {
            session.last_activity_at = self.clock.now();
            session.messages_received += 1;
            session.missed_heartbeats = 0;
            if session.status == SessionStatus::Unhealthy {
                session.status = SessionStatus::Connected;
                metrics::set_connected_extensions(connected_count(&sessions));
            }
        }
    }

    /// Records the capabilities an extension advertised in its authenticate
    /// frame, consulted by the router's capability-match scoring term.
    pub fn set_capabilities(&self, id: &str, capabilities: Vec<Capability>) {
        if let Some(session) = self.sessions.write().unwrap().get_mut(id) {
            session.capabilities = capabilities;
        }
    }

    /// Atomically rekey a session from its temporary connection id to its
    /// self-declared `extensionId` once the authenticate frame arrives.
    pub fn rekey(&self, temp_id: &str, real_id: String) -> bool {
        let mut sessions = self.sessions.write().unwrap();
        let Some(mut session) = sessions.remove(temp_id) else {
            return false;
        };
        session.id = real_id.clone();
        session.status = SessionStatus::Connected;
        sessions.insert(real_id, session);
        metrics::set_connected_extensions(connected_count(&sessions));
        true
    }

    /// Best-effort send; a full outbound channel counts as a delivery
    /// failure and the caller should treat the session as disconnected.
    pub fn try_send(&self, id: &str, frame: OutboundFrame) -> bool {
        let mut sessions = self.sessions.write().unwrap();
        let Some(session) = sessions.get_mut(id) else {
            return false;
        };
        match session.send_channel.try_send(frame) {
            Ok(()) => {
                session.messages_sent += 1;
                true
            }
            Err(_) => false,
        }
    }

    pub fn remove(&self, id: &str) -> Option<ExtensionSession> {
        let mut sessions = self.sessions.write().unwrap();
        let removed = sessions.remove(id);
        if removed.is_some() {
            metrics::set_connected_extensions(connected_count(&sessions));
        }
        removed
    }

    pub fn mark_unhealthy(&self, id: &str) {
        let mut sessions = self.sessions.write().unwrap();
        if let Some(session) = sessions.get_mut(id) {
            session.status = SessionStatus::Unhealthy;
            metrics::set_connected_extensions(connected_count(&sessions));
        }
    }

    pub fn increment_missed_heartbeat(&self, id: &str) -> u32 {
        let mut sessions = self.sessions.write().unwrap();
        match sessions.get_mut(id) {
            Some(session) => {
                session.missed_heartbeats += 1;
                session.missed_heartbeats
            }
            None => 0,
        }
    }

    pub fn increment_in_flight(&self, id: &str) {
        if let Some(session) = self.sessions.read().unwrap().get(id) {
            session.in_flight_count.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub fn decrement_in_flight(&self, id: &str) {
        if let Some(session) = self.sessions.read().unwrap().get(id) {
            session
                .in_flight_count
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| Some(v.saturating_sub(1)))
                .ok();
        }
    }

    pub fn record_result(&self, id: &str, success: bool, response_time_ms: Option<f64>) {
        let mut sessions = self.sessions.write().unwrap();
        if let Some(session) = sessions.get_mut(id) {
            if success {
                session.success_count += 1;
            } else {
                session.failure_count += 1;
            }
            if let Some(rt) = response_time_ms {
                let n = (session.success_count + session.failure_count) as f64;
                session.avg_response_time_ms += (rt - session.avg_response_time_ms) / n.max(1.0);
            }
        }
    }

    pub fn connected_sessions(&self) -> Vec<ExtensionSnapshot> {
        self.sessions
            .read()
            .unwrap()
            .values()
            .filter(|s| s.status == SessionStatus::Connected)
            .map(ExtensionSnapshot::from)
            .collect()
    }

    pub fn snapshot(&self) -> Vec<ExtensionSnapshot> {
        self.sessions.read().unwrap().values().map(ExtensionSnapshot::from).collect()
    }

    pub fn snapshot_one(&self, id: &str) -> Option<ExtensionSnapshot> {
        self.sessions.read().unwrap().get(id).map(ExtensionSnapshot::from)
    }

    pub fn stale_sessions(&self, unhealthy_after: chrono::Duration) -> Vec<String> {
        let now = self.clock.now();
        self.sessions
            .read()
            .unwrap()
            .values()
            .filter(|s| s.status == SessionStatus::Connected && now - s.last_activity_at > unhealthy_after)
            .map(|s| s.id.clone())
            .collect()
    }

    pub fn in_flight_job_count(&self, id: &str) -> u32 {
        self.sessions
            .read()
            .unwrap()
            .get(id)
            .map(|s| s.current_load())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TestClock;

    fn session(id: &str, clock: &Arc<dyn Clock>) -> ExtensionSession {
        let (tx, _rx) = mpsc::channel(16);
        ExtensionSession {
            id: id.to_string(),
            capabilities: vec![],
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
    fn rekey_moves_session_to_real_id() {
        let clock: Arc<dyn Clock> = TestClock::new(Utc::now());
        let registry = Registry::new(clock.clone());
        registry.register(session("temp-1", &clock));
        assert!(registry.rekey("temp-1", "ext-real".to_string()));
        assert!(registry.snapshot_one("temp-1").is_none());
        assert!(registry.snapshot_one("ext-real").is_some());
    }

    #[test]
    fn unhealthy_recovers_to_connected_on_activity() {
        let clock: Arc<dyn Clock> = TestClock::new(Utc::now());
        let registry = Registry::new(clock.clone());
        registry.register(session("ext-1", &clock));
        registry.mark_unhealthy("ext-1");
        assert_eq!(
            registry.snapshot_one("ext-1").unwrap().status,
            SessionStatus::Unhealthy
        );
        registry.mark_activity("ext-1");
        assert_eq!(
            registry.snapshot_one("ext-1").unwrap().status,
            SessionStatus::Connected
        );
    }

    #[test]
    fn set_capabilities_replaces_advertised_list() {
        let clock: Arc<dyn Clock> = TestClock::new(Utc::now());
        let registry = Registry::new(clock.clone());
        registry.register(session("ext-1", &clock));
        registry.set_capabilities(
            "ext-1",
            vec![Capability { name: "image-gen".into(), version: "2.0".into() }],
        );
        let snapshot = registry.snapshot_one("ext-1").unwrap();
        assert_eq!(snapshot.capabilities.len(), 1);
        assert_eq!(snapshot.capabilities[0].version, "2.0");
    }

    #[test]
    fn stale_sessions_detected_after_unhealthy_threshold() {
        let clock = TestClock::new(Utc::now());
        let dyn_clock: Arc<dyn Clock> = clock.clone();
        let registry = Registry::new(dyn_clock.clone());
        registry.register(session("ext-1", &dyn_clock));
        assert!(registry.stale_sessions(chrono::Duration::seconds(60)).is_empty());
        clock.advance(chrono::Duration::seconds(61));
        assert_eq!(registry.stale_sessions(chrono::Duration::seconds(60)), vec!["ext-1"]);
    }
}
