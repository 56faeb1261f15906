//! Reusable retry backoff policy
//!
//! Every retrying component (reconciler flush, feed-ranker reconnect) shares
//! this one policy object instead of growing its own ad hoc delay math.
//! A policy is the immutable rule (minimum, maximum, growth); `Backoff` is the
//! mutable per-retry-loop state produced by [`BackoffPolicy::start`].

use std::time::Duration;

/// Growth rule applied between consecutive delays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Growth {
    /// Each delay is the sum of the previous two (seeded at the minimum)
    Fibonacci,
    /// Each delay is the previous delay multiplied by `factor`
    Exponential { factor: u32 },
}

/// Immutable backoff rule: minimum delay, maximum cap, growth function
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub min: Duration,
    pub max: Duration,
    pub growth: Growth,
}

impl BackoffPolicy {
    /// Fibonacci growth: min, min, 2*min, 3*min, 5*min, ... capped at max
    pub fn fibonacci(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max,
            growth: Growth::Fibonacci,
        }
    }

    /// Exponential growth: min, min*factor, min*factor^2, ... capped at max
    pub fn exponential(min: Duration, max: Duration, factor: u32) -> Self {
        Self {
            min,
            max,
            growth: Growth::Exponential { factor },
        }
    }

    /// Begin a retry sequence at the minimum delay
    pub fn start(&self) -> Backoff {
        Backoff {
            policy: *self,
            prev: Duration::ZERO,
            current: self.min,
            attempts: 0,
        }
    }
}

/// Mutable retry state for one retry loop
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    prev: Duration,
    current: Duration,
    attempts: u32,
}

impl Backoff {
    /// Return the delay to sleep before the next attempt and advance the
    /// sequence. The first call always returns the policy minimum.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        let grown = match self.policy.growth {
            Growth::Fibonacci => self.prev.saturating_add(self.current),
            Growth::Exponential { factor } => self.current.saturating_mul(factor),
        };
        self.prev = self.current;
        self.current = grown.min(self.policy.max);
        self.attempts += 1;
        delay
    }

    /// Reset to the minimum delay. Called on any successful attempt.
    pub fn reset(&mut self) {
        self.prev = Duration::ZERO;
        self.current = self.policy.min;
        self.attempts = 0;
    }

    /// Number of delays handed out since the last reset
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn fibonacci_sequence_caps_at_max() {
        let mut backoff = BackoffPolicy::fibonacci(ms(200), ms(5000)).start();

        let delays: Vec<u64> = (0..10).map(|_| backoff.next_delay().as_millis() as u64).collect();
        assert_eq!(
            delays,
            vec![200, 200, 400, 600, 1000, 1600, 2600, 4200, 5000, 5000]
        );
        assert_eq!(backoff.attempts(), 10);
    }

    #[test]
    fn exponential_sequence_caps_at_max() {
        let mut backoff = BackoffPolicy::exponential(ms(100), ms(1000), 2).start();

        let delays: Vec<u64> = (0..6).map(|_| backoff.next_delay().as_millis() as u64).collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1000, 1000]);
    }

    #[test]
    fn reset_returns_to_minimum() {
        let mut backoff = BackoffPolicy::fibonacci(ms(200), ms(5000)).start();
        for _ in 0..5 {
            backoff.next_delay();
        }
        assert!(backoff.next_delay() > ms(200));

        backoff.reset();
        assert_eq!(backoff.attempts(), 0);
        assert_eq!(backoff.next_delay(), ms(200));
        assert_eq!(backoff.next_delay(), ms(200));
        assert_eq!(backoff.next_delay(), ms(400));
    }
}
