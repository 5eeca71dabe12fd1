//! Exponential backoff with a bounded retry budget.
//!
//! [`Backoff`] is the bookkeeping half of the reconnection controller. The
//! engine owns one, asks it for the next delay on every abnormal close, and
//! resets it on every successful open. The timer itself lives in the engine so
//! that there is never more than one pending reconnect.

use std::time::Duration;

/// Default delay before the first retry.
const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);

/// Default multiplier applied per consecutive failure.
const DEFAULT_BACKOFF_FACTOR: f64 = 1.5;

/// Default upper bound on any single delay.
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);

/// Default attempt ceiling.
const DEFAULT_MAX_ATTEMPTS: u32 = 10;

/// Reconnection tuning.
///
/// The delay after the `n`th consecutive abnormal close is
/// `base_delay × backoff_factor^(n−1)`, capped at `max_delay`. A retry is only
/// scheduled while `n` is below `max_attempts`.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use watchroom_client::reconnect::ReconnectPolicy;
///
/// let policy = ReconnectPolicy::default();
/// assert_eq!(policy.delay_for(1), Duration::from_secs(1));
/// assert_eq!(policy.delay_for(2), Duration::from_millis(1500));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub backoff_factor: f64,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: DEFAULT_BASE_DELAY,
            backoff_factor: DEFAULT_BACKOFF_FACTOR,
            max_delay: DEFAULT_MAX_DELAY,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before retrying after the `attempt`th consecutive failure (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.base_delay.as_secs_f64() * self.backoff_factor.powi(exponent);
        let max = self.max_delay.as_secs_f64();
        if !secs.is_finite() || secs >= max {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs.max(0.0))
    }
}

/// Outcome of recording an abnormal close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retry {
    /// Try again after `delay`; `attempt` is the number of consecutive failures.
    After { attempt: u32, delay: Duration },
    /// The attempt ceiling was reached; stop trying.
    Exhausted { attempts: u32 },
}

/// Consecutive-failure counter for one connection lifecycle.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: ReconnectPolicy,
    attempts: u32,
}

impl Backoff {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            attempts: 0,
        }
    }

    /// Number of consecutive failures since the last successful open.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Record an abnormal close and decide whether to retry.
    pub fn record_failure(&mut self) -> Retry {
        self.attempts = self.attempts.saturating_add(1);
        if self.attempts < self.policy.max_attempts {
            Retry::After {
                attempt: self.attempts,
                delay: self.policy.delay_for(self.attempts),
            }
        } else {
            Retry::Exhausted {
                attempts: self.attempts,
            }
        }
    }

    /// A connection opened; the budget starts over.
    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn delays_grow_by_half_each_step() {
        let policy = ReconnectPolicy::default();
        let expected = [1.0, 1.5, 2.25, 3.375, 5.0625];
        for (i, secs) in expected.iter().enumerate() {
            let delay = policy.delay_for(i as u32 + 1);
            assert!(
                (delay.as_secs_f64() - secs).abs() < 1e-9,
                "attempt {}: {delay:?}",
                i + 1
            );
        }
    }

    #[test]
    fn delays_are_capped() {
        let policy = ReconnectPolicy::default();
        assert!(policy.delay_for(9) < Duration::from_secs(30));
        assert_eq!(policy.delay_for(10), Duration::from_secs(30));
        assert_eq!(policy.delay_for(11), Duration::from_secs(30));
        assert_eq!(policy.delay_for(500), Duration::from_secs(30));
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn retries_stop_at_the_ceiling() {
        let mut backoff = Backoff::new(ReconnectPolicy::default());
        for attempt in 1..10 {
            match backoff.record_failure() {
                Retry::After { attempt: a, .. } => assert_eq!(a, attempt),
                Retry::Exhausted { .. } => panic!("exhausted early at {attempt}"),
            }
        }
        assert_eq!(
            backoff.record_failure(),
            Retry::Exhausted { attempts: 10 }
        );
    }

    #[test]
    fn reset_restores_the_budget() {
        let mut backoff = Backoff::new(ReconnectPolicy::default());
        backoff.record_failure();
        backoff.record_failure();
        assert_eq!(backoff.attempts(), 2);

        backoff.reset();
        assert_eq!(backoff.attempts(), 0);
        assert_eq!(
            backoff.record_failure(),
            Retry::After {
                attempt: 1,
                delay: Duration::from_secs(1)
            }
        );
    }
}
