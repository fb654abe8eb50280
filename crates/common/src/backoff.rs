//! Exponential backoff with jitter, shared by every subsystem that retries
//! a fallible operation against a collaborator (persistence writes, block
//! fetches, lease notifications, ...).

use std::time::Duration;

use rand::Rng;

#[derive(Clone, Debug)]
pub struct Backoff {
    initial_backoff: Duration,
    max_backoff: Duration,
    num_failures: u32,
}

impl Backoff {
    pub fn new(initial_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            initial_backoff,
            max_backoff,
            num_failures: 0,
        }
    }

    pub fn reset(&mut self) {
        self.num_failures = 0;
    }

    pub fn max_backoff(&self) -> Duration {
        self.max_backoff
    }

    pub fn failures(&self) -> u32 {
        self.num_failures
    }

    /// Record a failure and return how long to wait before retrying. Doubles
    /// the backoff on every call up to `max_backoff`, then jitters by +/-50%
    /// so that many callers retrying in lockstep don't all wake up at once.
    pub fn fail(&mut self, rng: &mut impl Rng) -> Duration {
        let backoff_power = self.num_failures.min(32);
        self.num_failures = self.num_failures.saturating_add(1);
        let backoff = self
            .initial_backoff
            .saturating_mul(1u32.checked_shl(backoff_power).unwrap_or(u32::MAX))
            .min(self.max_backoff);
        let jitter_factor = rng.gen_range(0.5..1.5);
        backoff.mul_f64(jitter_factor)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use rand::thread_rng;

    use super::Backoff;

    #[test]
    fn backoff_is_capped_at_max() {
        let mut backoff = Backoff::new(Duration::from_millis(10), Duration::from_millis(100));
        let mut rng = thread_rng();
        for _ in 0..20 {
            let delay = backoff.fail(&mut rng);
            assert!(delay <= Duration::from_millis(150));
        }
    }

    #[test]
    fn reset_clears_failure_count() {
        let mut backoff = Backoff::new(Duration::from_millis(10), Duration::from_millis(100));
        let mut rng = thread_rng();
        backoff.fail(&mut rng);
        backoff.fail(&mut rng);
        assert_eq!(backoff.failures(), 2);
        backoff.reset();
        assert_eq!(backoff.failures(), 0);
    }
}
