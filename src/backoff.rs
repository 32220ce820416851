use std::time::Duration;

const DEFAULT_BASE: Duration = Duration::from_secs(60);
const DEFAULT_MAX: Duration = Duration::from_secs(6 * 60 * 60);

/// Capped exponential delay applied before a failed job becomes claimable again.
///
/// The delay after the `n`-th failed attempt is `base * 2^(n - 1)`, clamped to
/// `max`. It is deterministic and strictly increasing until it reaches `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(DEFAULT_BASE, DEFAULT_MAX)
    }
}

impl Backoff {
    /// Create a backoff starting at `base` and never exceeding `max`.
    pub const fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// Delay before the next attempt, given the number of attempts made so far.
    pub fn delay(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(31);
        self.base
            .checked_mul(1 << exponent)
            .map_or(self.max, |delay| delay.min(self.max))
    }

    /// [`Self::delay`] for the signed counters stored on a job.
    pub(crate) fn delay_for(&self, attempts: i32) -> Duration {
        self.delay(u32::try_from(attempts).unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_from_base() {
        let backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(3600));
        let delays: Vec<_> = (1..=5).map(|n| backoff.delay(n).as_secs()).collect();
        assert_eq!(delays, [1, 2, 4, 8, 16]);
    }

    #[test]
    fn strictly_increasing_until_capped() {
        let backoff = Backoff::default();
        let mut previous = Duration::ZERO;
        for attempts in 1..=9 {
            let delay = backoff.delay(attempts);
            assert!(delay > previous, "attempt {attempts}: {delay:?} <= {previous:?}");
            previous = delay;
        }
        assert_eq!(backoff.delay(10), DEFAULT_MAX);
    }

    #[test]
    fn capped_and_overflow_safe() {
        let backoff = Backoff::new(Duration::from_millis(500), Duration::from_secs(10));
        assert_eq!(backoff.delay(6), Duration::from_secs(10));
        assert_eq!(backoff.delay(u32::MAX), Duration::from_secs(10));

        let huge = Backoff::new(Duration::MAX, Duration::MAX);
        assert_eq!(huge.delay(40), Duration::MAX);
    }

    #[test]
    fn zero_attempts_uses_base() {
        let backoff = Backoff::new(Duration::from_secs(3), Duration::from_secs(60));
        assert_eq!(backoff.delay(0), Duration::from_secs(3));
        assert_eq!(backoff.delay_for(-1), Duration::from_secs(3));
    }

    #[test]
    fn deterministic() {
        let backoff = Backoff::default();
        assert_eq!(backoff.delay(4), backoff.delay(4));
    }
}
