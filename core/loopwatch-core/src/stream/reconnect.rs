use std::cmp;
use std::time::Duration;

const DEFAULT_RETRY_INTERVAL_MS: u64 = 3000;
const DEFAULT_MAX_RETRIES: u32 = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackoffStrategy {
    Fixed,
    Exponential { max_interval: Duration },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub interval: Duration,
    pub max_retries: u32,
    pub strategy: BackoffStrategy,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(DEFAULT_RETRY_INTERVAL_MS),
            max_retries: DEFAULT_MAX_RETRIES,
            strategy: BackoffStrategy::Fixed,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match self.strategy {
            BackoffStrategy::Fixed => self.interval,
            BackoffStrategy::Exponential { max_interval } => {
                let factor = 1u32
                    .checked_shl(attempt.saturating_sub(1))
                    .unwrap_or(u32::MAX);
                cmp::min(self.interval.saturating_mul(factor), max_interval)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter { attempt: u32, delay: Duration },
    GiveUp { message: String },
}

/// Counts consecutive transport failures for one `connect()` call.
///
/// Pure bookkeeping; the connection task owns exactly one tracker, so at
/// most one retry is ever pending.
#[derive(Debug, Clone)]
pub struct ReconnectTracker {
    policy: ReconnectPolicy,
    attempts: u32,
}

impl ReconnectTracker {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            attempts: 0,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn on_connected(&mut self) {
        self.attempts = 0;
    }

    pub fn on_error(&mut self) -> RetryDecision {
        self.attempts = self.attempts.saturating_add(1);
        if self.attempts <= self.policy.max_retries {
            return RetryDecision::RetryAfter {
                attempt: self.attempts,
                delay: self.policy.delay_for(self.attempts),
            };
        }

        RetryDecision::GiveUp {
            message: format!(
                "Live stream unavailable after {} reconnect attempts",
                self.policy.max_retries
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed(max_retries: u32) -> ReconnectPolicy {
        ReconnectPolicy {
            interval: Duration::from_millis(100),
            max_retries,
            strategy: BackoffStrategy::Fixed,
        }
    }

    #[test]
    fn gives_up_after_bound_is_exceeded() {
        let mut tracker = ReconnectTracker::new(fixed(5));
        for expected in 1..=5 {
            assert_eq!(
                tracker.on_error(),
                RetryDecision::RetryAfter {
                    attempt: expected,
                    delay: Duration::from_millis(100)
                }
            );
        }

        let sixth = tracker.on_error();
        assert!(
            matches!(sixth, RetryDecision::GiveUp { ref message } if message.contains('5')),
            "sixth failure should be terminal, got {sixth:?}"
        );
        assert!(matches!(tracker.on_error(), RetryDecision::GiveUp { .. }));
    }

    #[test]
    fn successful_connection_resets_counter() {
        let mut tracker = ReconnectTracker::new(fixed(2));
        tracker.on_error();
        tracker.on_error();
        tracker.on_connected();
        assert_eq!(tracker.attempts(), 0);
        assert!(matches!(
            tracker.on_error(),
            RetryDecision::RetryAfter { attempt: 1, .. }
        ));
    }

    #[test]
    fn zero_retries_gives_up_immediately() {
        let mut tracker = ReconnectTracker::new(fixed(0));
        assert!(matches!(tracker.on_error(), RetryDecision::GiveUp { .. }));
    }

    #[test]
    fn exponential_delay_doubles_and_caps() {
        let policy = ReconnectPolicy {
            interval: Duration::from_millis(500),
            max_retries: 10,
            strategy: BackoffStrategy::Exponential {
                max_interval: Duration::from_secs(3),
            },
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for(2), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(3), Duration::from_millis(2000));
        assert_eq!(policy.delay_for(4), Duration::from_secs(3));
        assert_eq!(policy.delay_for(40), Duration::from_secs(3));
    }
}
