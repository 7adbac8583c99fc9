// Retry policy: bounded attempts with exponential backoff and jitter
//
// The attempt counter lives in the ActionRecord, so the bound holds across
// runs and process restarts. Backoff is expressed as `next_attempt_at`; the
// coordinator skips the obligation until then.

use crate::config::RetryConfig;
use crate::models::{ActionRecord, RecordOutcome};
use chrono::{DateTime, Utc};
use rand::Rng;
use std::time::Duration;

/// Exponential backoff with jitter.
/// Sequence for base 60s: 1m, 3m, 9m, 27m, ... capped at `max_delay`.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    base_delay_secs: u64,
    max_delay_secs: u64,
    /// 0.0 to 1.0
    jitter_factor: f64,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            base_delay_secs: 60,
            max_delay_secs: 6 * 3600,
            jitter_factor: 0.1,
        }
    }
}

impl ExponentialBackoff {
    pub fn with_config(base_delay_secs: u64, max_delay_secs: u64, jitter_factor: f64) -> Self {
        Self {
            base_delay_secs,
            max_delay_secs,
            jitter_factor: jitter_factor.clamp(0.0, 1.0),
        }
    }

    /// base * 3^attempt, capped at max_delay
    fn base_delay(&self, attempt: u32) -> u64 {
        self.base_delay_secs
            .saturating_mul(3_u64.saturating_pow(attempt))
            .min(self.max_delay_secs)
    }

    /// Delay before retry number `attempt` (0-based), jitter included
    pub fn delay(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay(attempt).saturating_mul(1000);
        let jitter_range_ms = (base_ms as f64 * self.jitter_factor) as u64;
        let jitter_ms = if jitter_range_ms > 0 {
            rand::thread_rng().gen_range(0..=jitter_range_ms)
        } else {
            0
        };
        Duration::from_millis(base_ms.saturating_add(jitter_ms))
    }
}

/// Turns delivery outcomes into the ActionRecord to commit
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    backoff: ExponentialBackoff,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: ExponentialBackoff) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(
            config.max_attempts,
            ExponentialBackoff::with_config(config.base_delay_seconds, config.max_delay_seconds, 0.1),
        )
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Attempt number of the next try given the previous record
    pub fn next_attempt(previous: Option<&ActionRecord>) -> i32 {
        previous.map_or(0, |r| r.attempt_count).saturating_add(1)
    }

    /// Whether a transient record is still inside its backoff window
    pub fn is_backing_off(record: &ActionRecord, now: DateTime<Utc>) -> bool {
        record.outcome == RecordOutcome::TransientFailure
            && record.next_attempt_at.map_or(false, |at| at > now)
    }

    pub fn on_success(&self, fingerprint: &str, attempt: i32, now: DateTime<Utc>) -> ActionRecord {
        ActionRecord::success(fingerprint, now, attempt)
    }

    /// Transient failure: back off, or escalate once the attempt budget is spent
    pub fn on_transient(
        &self,
        fingerprint: &str,
        attempt: i32,
        reason: &str,
        now: DateTime<Utc>,
    ) -> ActionRecord {
        if attempt >= self.max_attempts as i32 {
            return ActionRecord {
                fingerprint: fingerprint.to_string(),
                acted_at: now,
                outcome: RecordOutcome::PermanentFailure,
                attempt_count: attempt,
                last_error: Some(format!("gave up after {} attempts: {}", attempt, reason)),
                next_attempt_at: None,
            };
        }

        let delay = self.backoff.delay(attempt.saturating_sub(1).max(0) as u32);
        let next_attempt_at = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|d| now.checked_add_signed(d));

        ActionRecord {
            fingerprint: fingerprint.to_string(),
            acted_at: now,
            outcome: RecordOutcome::TransientFailure,
            attempt_count: attempt,
            last_error: Some(reason.to_string()),
            next_attempt_at,
        }
    }

    pub fn on_permanent(
        &self,
        fingerprint: &str,
        attempt: i32,
        reason: &str,
        now: DateTime<Utc>,
    ) -> ActionRecord {
        ActionRecord {
            fingerprint: fingerprint.to_string(),
            acted_at: now,
            outcome: RecordOutcome::PermanentFailure,
            attempt_count: attempt,
            last_error: Some(reason.to_string()),
            next_attempt_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts, ExponentialBackoff::with_config(60, 3600, 0.0))
    }

    #[test]
    fn test_exponential_backoff_sequence() {
        let backoff = ExponentialBackoff::with_config(5, 1800, 0.0);
        assert_eq!(backoff.base_delay(0), 5);
        assert_eq!(backoff.base_delay(1), 15);
        assert_eq!(backoff.base_delay(2), 45);
        assert_eq!(backoff.base_delay(5), 1215);
        // 3645 capped
        assert_eq!(backoff.base_delay(6), 1800);
        assert_eq!(backoff.base_delay(60), 1800);
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let backoff = ExponentialBackoff::with_config(5, 1800, 0.1);
        for _ in 0..20 {
            let ms = backoff.delay(0).as_millis();
            assert!((5000..=5500).contains(&ms), "delay {}ms out of range", ms);
        }
    }

    #[test]
    fn test_jitter_factor_clamping() {
        assert_eq!(ExponentialBackoff::with_config(5, 10, -0.5).jitter_factor, 0.0);
        assert_eq!(ExponentialBackoff::with_config(5, 10, 1.5).jitter_factor, 1.0);
    }

    #[test]
    fn test_transient_backs_off_until_budget_is_spent() {
        let policy = policy(3);
        let now = Utc::now();

        let first = policy.on_transient("fp", 1, "HTTP 503", now);
        assert_eq!(first.outcome, RecordOutcome::TransientFailure);
        assert_eq!(first.next_attempt_at, Some(now + chrono::Duration::seconds(60)));
        assert!(RetryPolicy::is_backing_off(&first, now));
        assert!(!RetryPolicy::is_backing_off(&first, now + chrono::Duration::seconds(61)));

        let second = policy.on_transient("fp", 2, "HTTP 503", now);
        assert_eq!(second.next_attempt_at, Some(now + chrono::Duration::seconds(180)));

        let third = policy.on_transient("fp", 3, "HTTP 503", now);
        assert_eq!(third.outcome, RecordOutcome::PermanentFailure);
        assert_eq!(third.attempt_count, 3);
        assert!(third.last_error.unwrap().contains("gave up after 3 attempts"));
    }

    #[test]
    fn test_next_attempt_counts_from_previous_record() {
        assert_eq!(RetryPolicy::next_attempt(None), 1);
        let record = policy(5).on_transient("fp", 2, "timeout", Utc::now());
        assert_eq!(RetryPolicy::next_attempt(Some(&record)), 3);
    }

    #[test]
    fn test_zero_max_attempts_is_treated_as_one() {
        let policy = policy(0);
        assert_eq!(policy.max_attempts(), 1);
        let record = policy.on_transient("fp", 1, "boom", Utc::now());
        assert_eq!(record.outcome, RecordOutcome::PermanentFailure);
    }
}
