//! Reconnect policy for the long-lived internal streams.

use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};

/// First reconnect delay, doubled on every further attempt.
pub const RECONNECT_INITIAL_DELAY: Duration = Duration::from_millis(50);

/// Decides whether a Kafka reset error is worth reconnecting for.
pub trait ErrorClassifier: Send + Sync {
    fn is_transient(&self, error: i32) -> bool;
}

#[derive(Debug, Clone)]
pub struct KafkaErrorClassifier {
    transient: Vec<i32>,
}

impl KafkaErrorClassifier {
    #[inline]
    pub fn new(transient: Vec<i32>) -> Self {
        Self { transient }
    }
}

impl ErrorClassifier for KafkaErrorClassifier {
    #[inline]
    fn is_transient(&self, error: i32) -> bool {
        self.transient.contains(&error)
    }
}

/// `min(50ms * 2^attempt, cap)`, restarted by `reset` after a successful reconnect.
pub struct ReconnectBackoff {
    cap: Duration,
    inner: ExponentialBackoff,
}

impl std::fmt::Debug for ReconnectBackoff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconnectBackoff").field("cap", &self.cap).finish()
    }
}

impl ReconnectBackoff {
    pub fn new(cap: Duration) -> Self {
        let inner = ExponentialBackoffBuilder::new()
            .with_initial_interval(RECONNECT_INITIAL_DELAY.min(cap))
            .with_randomization_factor(0.0)
            .with_multiplier(2.0)
            .with_max_interval(cap)
            .with_max_elapsed_time(None)
            .build();
        Self { cap, inner }
    }

    #[inline]
    pub fn next_delay(&mut self) -> Duration {
        self.inner.next_backoff().unwrap_or(self.cap).min(self.cap)
    }

    #[inline]
    pub fn reset(&mut self) {
        self.inner.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classifier() {
        let c = KafkaErrorClassifier::new(vec![6]);
        assert!(c.is_transient(6));
        assert!(!c.is_transient(3));
    }

    #[test]
    fn test_backoff_capped() {
        let mut b = ReconnectBackoff::new(Duration::from_millis(300));
        let delays: Vec<_> = (0..5).map(|_| b.next_delay().as_millis()).collect();
        assert_eq!(delays, vec![50, 100, 200, 300, 300]);
        b.reset();
        assert_eq!(b.next_delay().as_millis(), 50);
    }
}
