//! Consecutive-failure accounting for one auto loop.
//!
//! The loop keeps launching while failures are sporadic; a run of
//! consecutive failures, or a single capacity failure (quota, rate limit),
//! means continuing would burn attempts for nothing.

use tracing::debug;

use crate::config::DEFAULT_FAILURE_THRESHOLD;
use crate::error::FailureKind;

/// Pause decision tracker. One per live auto loop.
#[derive(Debug, Clone)]
pub struct FailureTracker {
    consecutive_failures: u32,
    threshold: u32,
}

impl FailureTracker {
    pub fn new(threshold: u32) -> Self {
        Self {
            consecutive_failures: 0,
            threshold: threshold.max(1),
        }
    }

    /// Record one failed execution. Returns `true` when the loop should
    /// pause: immediately for capacity failures, otherwise once the
    /// consecutive count reaches the threshold.
    pub fn record_failure(&mut self, kind: FailureKind) -> bool {
        if kind.is_abort() {
            // A deliberate stop is not a failure.
            return false;
        }

        self.consecutive_failures += 1;

        if kind.is_capacity() {
            debug!(%kind, "capacity failure, pausing without waiting for threshold");
            return true;
        }

        self.consecutive_failures >= self.threshold
    }

    /// A successful execution clears the streak.
    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
}

impl Default for FailureTracker {
    fn default() -> Self {
        Self::new(DEFAULT_FAILURE_THRESHOLD)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pause_on_third_consecutive_failure() {
        let mut tracker = FailureTracker::new(3);
        assert!(!tracker.record_failure(FailureKind::AgentError));
        assert!(!tracker.record_failure(FailureKind::Unknown));
        assert!(tracker.record_failure(FailureKind::AgentError));
        assert_eq!(tracker.consecutive_failures(), 3);
    }

    #[test]
    fn test_success_resets_streak() {
        let mut tracker = FailureTracker::new(3);
        assert!(!tracker.record_failure(FailureKind::AgentError));
        assert!(!tracker.record_failure(FailureKind::AgentError));
        tracker.record_success();
        assert!(!tracker.record_failure(FailureKind::AgentError));
        assert!(!tracker.record_failure(FailureKind::AgentError));
        assert!(tracker.record_failure(FailureKind::AgentError));
    }

    #[test]
    fn test_capacity_failures_pause_immediately() {
        let mut tracker = FailureTracker::new(3);
        assert!(tracker.record_failure(FailureKind::QuotaExhausted));

        let mut tracker = FailureTracker::new(3);
        assert!(tracker.record_failure(FailureKind::RateLimit));
    }

    #[test]
    fn test_abort_does_not_count() {
        let mut tracker = FailureTracker::new(2);
        assert!(!tracker.record_failure(FailureKind::Abort));
        assert_eq!(tracker.consecutive_failures(), 0);
        assert!(!tracker.record_failure(FailureKind::AgentError));
        assert!(tracker.record_failure(FailureKind::AgentError));
    }

    #[test]
    fn test_threshold_floor() {
        let mut tracker = FailureTracker::new(0);
        assert!(tracker.record_failure(FailureKind::AgentError));
    }
}
