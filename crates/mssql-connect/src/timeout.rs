//! Login time budget and retry backoff.

use std::time::Duration;

use tokio::time::Instant;

/// Budget used to size failover slices when the login budget is unlimited.
pub const DEFAULT_SLICE_BASE: Duration = Duration::from_secs(15);

/// Share of the budget, in percent, making up one failover time slice.
const SLICE_PERCENT: u32 = 8;

/// The single time budget of a login across all attempts.
#[derive(Debug, Clone, Copy)]
pub struct TimeoutBudget {
    start: Instant,
    total: Option<Duration>,
}

impl TimeoutBudget {
    /// Start a budget of `total`, or an unlimited one for `None`.
    #[must_use]
    pub fn new(total: Option<Duration>) -> Self {
        Self {
            start: Instant::now(),
            total,
        }
    }

    /// When the budget runs out.
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.total.map(|total| self.start + total)
    }

    /// Time left, or `None` when unlimited.
    #[must_use]
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline()
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Whether the budget has run out.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.remaining().is_some_and(|left| left.is_zero())
    }

    /// Whether the budget is unlimited.
    #[must_use]
    pub fn is_unlimited(&self) -> bool {
        self.total.is_none()
    }

    /// Restart the clock with the original total.
    pub fn reset(&mut self) {
        self.start = Instant::now();
    }

    /// Whether a sleep of `sleep` leaves time for another attempt.
    #[must_use]
    pub fn can_sleep(&self, sleep: Duration) -> bool {
        self.remaining().is_none_or(|left| left > sleep)
    }

    /// Clamp an attempt timeout to what is left.
    #[must_use]
    pub fn clamp(&self, timeout: Duration) -> Duration {
        match self.remaining() {
            Some(left) => timeout.min(left),
            None => timeout,
        }
    }

    /// One failover time slice: 8% of the budget, or of 15 s when unlimited.
    #[must_use]
    pub fn slice(&self) -> Duration {
        self.total.unwrap_or(DEFAULT_SLICE_BASE) * SLICE_PERCENT / 100
    }

    /// Timeout for 1-based attempt `attempt` when alternating between a
    /// primary and a failover partner.
    ///
    /// Both hosts of a pair get the same slice; each pair gets one more
    /// slice than the last.
    #[must_use]
    pub fn failover_attempt_timeout(&self, slice: Duration, attempt: u32) -> Duration {
        self.clamp(slice * attempt.div_ceil(2))
    }

    /// Timeout for 1-based attempt `attempt` against a multi-subnet listener.
    #[must_use]
    pub fn multi_subnet_attempt_timeout(&self, slice: Duration, attempt: u32) -> Duration {
        self.clamp(slice * attempt)
    }
}

/// Exponential backoff schedule: doubles up to a ceiling, then stays there.
///
/// ```
/// use std::time::Duration;
/// use mssql_connect::timeout::Backoff;
///
/// let ms: Vec<u64> = Backoff::new(Duration::from_millis(100), Duration::from_secs(1))
///     .take(6)
///     .map(|d| d.as_millis() as u64)
///     .collect();
/// assert_eq!(ms, [100, 200, 400, 800, 1000, 1000]);
/// ```
#[derive(Debug, Clone)]
pub struct Backoff {
    current: Duration,
    max: Duration,
}

impl Backoff {
    /// Start a schedule at `initial`, capped at `max`.
    #[must_use]
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            current: initial.min(max),
            max,
        }
    }

    /// The sleep the next call to `next` will yield.
    #[must_use]
    pub fn peek(&self) -> Duration {
        self.current
    }
}

impl Iterator for Backoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        let sleep = self.current;
        self.current = if self.current < self.max / 2 {
            self.current * 2
        } else {
            self.max
        };
        Some(sleep)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn ms(d: Duration) -> u64 {
        d.as_millis() as u64
    }

    #[test]
    fn test_backoff_sequence() {
        let schedule: Vec<u64> =
            Backoff::new(Duration::from_millis(100), Duration::from_millis(1000))
                .take(8)
                .map(ms)
                .collect();
        assert_eq!(schedule, [100, 200, 400, 800, 1000, 1000, 1000, 1000]);
    }

    #[test]
    fn test_backoff_initial_above_max() {
        let mut backoff = Backoff::new(Duration::from_secs(5), Duration::from_secs(1));
        assert_eq!(backoff.peek(), Duration::from_secs(1));
        assert_eq!(backoff.next(), Some(Duration::from_secs(1)));
        assert_eq!(backoff.next(), Some(Duration::from_secs(1)));
    }

    #[test]
    fn test_slice_is_eight_percent() {
        let budget = TimeoutBudget::new(Some(Duration::from_secs(30)));
        assert_eq!(budget.slice(), Duration::from_millis(2400));

        let unlimited = TimeoutBudget::new(None);
        assert_eq!(unlimited.slice(), Duration::from_millis(1200));
        assert!(unlimited.remaining().is_none());
        assert!(!unlimited.is_expired());
        assert!(unlimited.can_sleep(Duration::from_secs(3600)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failover_slices_grow_per_pair() {
        let budget = TimeoutBudget::new(Some(Duration::from_secs(15)));
        let slice = budget.slice();
        let timeouts: Vec<u64> = (1..=6)
            .map(|n| ms(budget.failover_attempt_timeout(slice, n)))
            .collect();
        assert_eq!(timeouts, [1200, 1200, 2400, 2400, 3600, 3600]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_timeouts_clamp_to_remaining() {
        let budget = TimeoutBudget::new(Some(Duration::from_secs(15)));
        let slice = budget.slice();
        tokio::time::advance(Duration::from_secs(14)).await;

        assert_eq!(budget.remaining(), Some(Duration::from_secs(1)));
        assert_eq!(
            budget.multi_subnet_attempt_timeout(slice, 3),
            Duration::from_secs(1)
        );
        assert_eq!(
            budget.failover_attempt_timeout(slice, 1),
            Duration::from_secs(1)
        );
        assert!(budget.can_sleep(Duration::from_millis(100)));
        assert!(!budget.can_sleep(Duration::from_secs(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_and_reset() {
        let mut budget = TimeoutBudget::new(Some(Duration::from_secs(2)));
        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(budget.is_expired());
        assert_eq!(budget.remaining(), Some(Duration::ZERO));

        budget.reset();
        assert!(!budget.is_expired());
        assert_eq!(budget.remaining(), Some(Duration::from_secs(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_multi_subnet_slices() {
        let budget = TimeoutBudget::new(Some(Duration::from_secs(15)));
        let slice = budget.slice();
        assert_eq!(ms(budget.multi_subnet_attempt_timeout(slice, 1)), 1200);
        assert_eq!(ms(budget.multi_subnet_attempt_timeout(slice, 2)), 2400);
    }

    proptest! {
        #[test]
        fn backoff_never_shrinks_or_exceeds_max(
            initial_ms in 1u64..5_000,
            max_ms in 1u64..10_000,
            steps in 1usize..32,
        ) {
            let max = Duration::from_millis(max_ms);
            let delays: Vec<Duration> =
                Backoff::new(Duration::from_millis(initial_ms), max).take(steps).collect();

            prop_assert!(delays.iter().all(|d| *d <= max));
            prop_assert!(delays.windows(2).all(|w| w[0] <= w[1]));
        }

        #[test]
        fn failover_pairs_share_a_timeout(
            pair in 1u32..20,
            slice_ms in 1u64..10_000,
        ) {
            let budget = TimeoutBudget::new(None);
            let slice = Duration::from_millis(slice_ms);
            let first = budget.failover_attempt_timeout(slice, 2 * pair - 1);
            let second = budget.failover_attempt_timeout(slice, 2 * pair);

            prop_assert_eq!(first, second);
            prop_assert_eq!(first, slice * pair);
            prop_assert_eq!(budget.multi_subnet_attempt_timeout(slice, pair), slice * pair);
        }
    }
}
