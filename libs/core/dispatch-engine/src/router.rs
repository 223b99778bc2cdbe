//! Router / Dispatcher scoring (spec §4.5): picks the best live extension
//! for a job. No direct teacher analogue — `stream-worker` always has a
//! single consumer per process — so this module is new code written in
//! the plain-data, no-hidden-global style the rest of the crate follows.

use crate::job::{CapabilityRequirement, Job};
use crate::registry::ExtensionSnapshot;
use chrono::{DateTime, Utc};

#[derive(Debug, Clone)]
pub struct DispatchDecision {
    pub extension_id: String,
    pub reason: &'static str,
    pub confidence: f64,
}

/// Pick the best eligible extension for `job` among `connected`. Returns
/// `None` if no session qualifies, which the dispatcher treats as a
/// routing failure (spec §7): the job is re-headed, not counted as a
/// failed attempt.
pub fn pick_extension(job: &Job, connected: &[ExtensionSnapshot], now: DateTime<Utc>) -> Option<DispatchDecision> {
    if let Some(target) = &job.target_extension_id {
        if connected.iter().any(|s| &s.id == target) {
            return Some(DispatchDecision {
                extension_id: target.clone(),
                reason: "exact_match",
                confidence: 1.0,
            });
        }
    }

    connected
        .iter()
        .map(|s| (s, score(job, s, now)))
        .max_by(|(a, score_a), (b, score_b)| {
            score_a
                .partial_cmp(score_b)
                .unwrap()
                .then_with(|| b.in_flight_count.cmp(&a.in_flight_count))
                .then_with(|| b.connected_at.cmp(&a.connected_at))
        })
        .map(|(session, best_score)| {
            let _ = best_score;
            DispatchDecision {
                extension_id: session.id.clone(),
                reason: "best_capability",
                confidence: 0.8,
            }
        })
}

fn score(job: &Job, session: &ExtensionSnapshot, now: DateTime<Utc>) -> f64 {
    let capability = capability_score(&job.required_capabilities, session) * 0.40;
    let inverse_load = (100.0 - session.in_flight_count as f64).max(0.0) * 0.30;
    let performance = performance_score(session) * 0.20;
    let availability = uptime_ratio(session, now) * 100.0 * 0.10;
    capability + inverse_load + performance + availability
}

fn capability_score(required: &[CapabilityRequirement], session: &ExtensionSnapshot) -> f64 {
    if required.is_empty() {
        return 100.0;
    }
    let total: f64 = required
        .iter()
        .map(|req| {
            match session.capabilities.iter().find(|c| c.name == req.name) {
                Some(offered) => match compare_versions(&req.required_version, &offered.version) {
                    VersionMatch::Exact => 100.0,
                    VersionMatch::Compatible => 80.0,
                    VersionMatch::Incompatible => 20.0,
                },
                None => 20.0,
            }
        })
        .sum();
    total / required.len() as f64
}

enum VersionMatch {
    Exact,
    Compatible,
    Incompatible,
}

fn compare_versions(required: &str, offered: &str) -> VersionMatch {
    if required == offered {
        return VersionMatch::Exact;
    }
    let parse = |v: &str| -> Option<(u32, u32)> {
        let mut parts = v.split('.');
        let major = parts.next()?.parse().ok()?;
        let minor = parts.next().unwrap_or("0").parse().ok()?;
        Some((major, minor))
    };
    match (parse(required), parse(offered)) {
        (Some((req_major, req_minor)), Some((off_major, off_minor))) => {
            if off_major == req_major && off_minor >= req_minor {
                VersionMatch::Compatible
            } else {
                VersionMatch::Incompatible
            }
        }
        _ => VersionMatch::Incompatible,
    }
}

fn performance_score(session: &ExtensionSnapshot) -> f64 {
    if session.success_count + session.failure_count == 0 {
        return 50.0;
    }
    if session.avg_response_time_ms <= 0.0 {
        return 100.0;
    }
    (10_000.0 / session.avg_response_time_ms).min(100.0)
}

fn uptime_ratio(session: &ExtensionSnapshot, now: DateTime<Utc>) -> f64 {
    let total = (now - session.connected_at).num_milliseconds().max(1) as f64;
    let down = session.failure_count as f64 * 1000.0;
    ((total - down) / total).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{Capability, SessionStatus};

    fn session(id: &str, in_flight: u32, connected_at: DateTime<Utc>) -> ExtensionSnapshot {
        ExtensionSnapshot {
            id: id.to_string(),
            capabilities: vec![Capability {
                name: "image-gen".into(),
                version: "2.0".into(),
            }],
            connected_at,
            last_activity_at: connected_at,
            in_flight_count: in_flight,
            status: SessionStatus::Connected,
            avg_response_time_ms: 100.0,
            success_count: 10,
            failure_count: 0,
        }
    }

    fn job() -> Job {
        use crate::job::{JobPayload, Priority};
        Job::new(
            JobPayload {
                url: "https://ex/1.jpg".into(),
                headers: Default::default(),
                metadata: Default::default(),
                addon_id: None,
                callback_url: None,
                ai_tool: None,
            },
            Priority::Normal,
            3,
        )
    }

    #[test]
    fn exact_target_wins_regardless_of_score() {
        let mut j = job();
        j.target_extension_id = Some("ext-2".to_string());
        let now = Utc::now();
        let sessions = vec![session("ext-1", 0, now), session("ext-2", 50, now)];
        let decision = pick_extension(&j, &sessions, now).unwrap();
        assert_eq!(decision.extension_id, "ext-2");
        assert_eq!(decision.reason, "exact_match");
        assert_eq!(decision.confidence, 1.0);
    }

    #[test]
    fn lower_load_wins_when_otherwise_tied() {
        let j = job();
        let now = Utc::now();
        let sessions = vec![session("busy", 10, now), session("idle", 0, now)];
        let decision = pick_extension(&j, &sessions, now).unwrap();
        assert_eq!(decision.extension_id, "idle");
    }

    #[test]
    fn tie_breaks_by_earlier_connected_at() {
        let j = job();
        let now = Utc::now();
        let earlier = now - chrono::Duration::minutes(10);
        let sessions = vec![session("newer", 0, now), session("older", 0, earlier)];
        let decision = pick_extension(&j, &sessions, now).unwrap();
        assert_eq!(decision.extension_id, "older");
    }

    #[test]
    fn no_connected_sessions_yields_none() {
        let j = job();
        let now = Utc::now();
        assert!(pick_extension(&j, &[], now).is_none());
    }
}
