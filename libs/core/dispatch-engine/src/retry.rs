//! Backoff schedule lookup for the retry scheduler (spec §4.1, §4.2).
//!
//! Not a separate task: `pop()` on the queue store consults `next_retry_at`
//! set here, and the dispatcher's periodic tick is what makes time-gated
//! retries eligible again.

use std::time::Duration;

/// Fallback delay used once `attempt` exceeds the configured schedule.
pub const FALLBACK_DELAY_MS: u64 = 30_000;

/// Look up the delay for a 1-indexed retry attempt.
///
/// Resolves the Open Question in spec.md §9 with a strict length check:
/// the fallback only applies once `attempt` exceeds the schedule's length,
/// never on a zero-valued entry within it (the source's `array[i] || 30000`
/// would also fall back on an explicit `0`; this implementation does not).
pub fn delay_for_attempt(schedule: &[u64], attempt: u32) -> Duration {
    let ms = if attempt == 0 {
        schedule.first().copied().unwrap_or(FALLBACK_DELAY_MS)
    } else {
        schedule
            .get(attempt as usize - 1)
            .copied()
            .unwrap_or(FALLBACK_DELAY_MS)
    };
    Duration::from_millis(apply_jitter(ms))
}

/// ±25% jitter to avoid a thundering herd of simultaneous retries.
fn apply_jitter(delay_ms: u64) -> u64 {
    use rand::Rng;
    let jitter_range = delay_ms / 4;
    if jitter_range == 0 {
        return delay_ms;
    }
    let offset = rand::rng().random_range(0..=jitter_range * 2) as i64 - jitter_range as i64;
    if offset < 0 {
        delay_ms.saturating_sub((-offset) as u64)
    } else {
        delay_ms.saturating_add(offset as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCHEDULE: [u64; 3] = [1000, 5000, 15000];

    #[test]
    fn first_attempt_uses_first_delay() {
        let delay = delay_for_attempt(&SCHEDULE, 1);
        assert!(delay.as_millis() >= 750 && delay.as_millis() <= 1250);
    }

    #[test]
    fn third_attempt_uses_third_delay() {
        let delay = delay_for_attempt(&SCHEDULE, 3);
        assert!(delay.as_millis() >= 11_250 && delay.as_millis() <= 18_750);
    }

    #[test]
    fn attempt_beyond_schedule_uses_fallback() {
        let delay = delay_for_attempt(&SCHEDULE, 4);
        assert!(delay.as_millis() >= 22_500 && delay.as_millis() <= 37_500);
    }

    #[test]
    fn zero_valued_schedule_entry_is_not_treated_as_missing() {
        let schedule = [0u64, 5000];
        let delay = delay_for_attempt(&schedule, 1);
        assert_eq!(delay.as_millis(), 0);
    }
}
