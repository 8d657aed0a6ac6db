use std::time::{Duration, Instant};

use backoff::backoff::Backoff as _;
use backoff::{ExponentialBackoff, SystemClock};

/// Retry delay for a failing discovery source, doubling up to `max`.
pub struct Backoff {
    policy: ExponentialBackoff,
    max: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        let initial = initial.max(Duration::from_millis(1));
        let max = max.max(initial);
        Self {
            policy: ExponentialBackoff {
                initial_interval: initial,
                current_interval: initial,
                randomization_factor: 0.0,
                multiplier: 2.0,
                start_time: Instant::now(),
                max_interval: max,
                max_elapsed_time: None,
                clock: SystemClock::default(),
            },
            max,
        }
    }

    /// Delay before the next attempt after a failure.
    pub fn mark_failure(&mut self) -> Duration {
        // Without an elapsed-time cap the policy always yields a delay.
        self.policy.next_backoff().unwrap_or(self.max)
    }

    pub fn mark_success(&mut self) {
        self.policy.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn millis(b: &mut Backoff) -> u128 {
        b.mark_failure().as_millis()
    }

    #[test]
    fn doubles_until_max_and_resets() {
        let mut b = Backoff::new(Duration::from_millis(500), Duration::from_secs(3));
        let delays: Vec<u128> = (0..5).map(|_| millis(&mut b)).collect();
        assert_eq!(delays, vec![500, 1000, 2000, 3000, 3000]);

        b.mark_success();
        assert_eq!(millis(&mut b), 500);
    }

    #[test]
    fn max_below_initial_is_raised() {
        let mut b = Backoff::new(Duration::from_secs(2), Duration::from_secs(1));
        assert_eq!(millis(&mut b), 2000);
        assert_eq!(millis(&mut b), 2000);
    }
}
