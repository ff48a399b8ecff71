//! # Exponential Backoff
//!
//! Capped exponential backoff for failed reconcile passes.
//! Sequence with the defaults: 1s, 2s, 4s, 8s, ... 256s, 300s (max).

use std::time::Duration;

/// First retry delay.
pub const MIN_BACKOFF: Duration = Duration::from_secs(1);

/// Upper bound for any retry delay.
pub const MAX_BACKOFF: Duration = Duration::from_secs(300);

/// Exponential backoff calculator
///
/// Each call to [`next_backoff`](Self::next_backoff) returns the current delay
/// and doubles it for the next call, capped at `max`.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    min: Duration,
    current: Duration,
    max: Duration,
}

impl ExponentialBackoff {
    /// Create a new backoff starting at `min` and capped at `max`
    #[must_use]
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            current: min,
            max,
        }
    }

    /// Get the next backoff duration and advance the sequence
    pub fn next_backoff(&mut self) -> Duration {
        let result = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        result
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(MIN_BACKOFF, MAX_BACKOFF)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_backoff_sequence() {
        let mut backoff = ExponentialBackoff::default();

        let secs: Vec<u64> = (0..10).map(|_| backoff.next_backoff().as_secs()).collect();
        assert_eq!(secs, vec![1, 2, 4, 8, 16, 32, 64, 128, 256, 300]);
        // Stays at max
        assert_eq!(backoff.next_backoff().as_secs(), 300);
    }
}
