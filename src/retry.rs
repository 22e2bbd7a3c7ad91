use std::time::Duration;

use crate::clock::Clock;
use crate::constants::{DEFAULT_RETRY_ATTEMPTS, DEFAULT_RETRY_BASE_DELAY};
use crate::error::ProviderError;

/// Per-candidate retry budget. Only transient failures are retried, with a
/// linear backoff of `base_delay * attempt`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_RETRY_ATTEMPTS,
            base_delay: DEFAULT_RETRY_BASE_DELAY,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    /// Wait after the given (1-based) attempt failed.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay * attempt
    }

    /// Runs `op` until it succeeds, fails non-transiently or the budget is
    /// spent. Returns the last outcome and the number of attempts made.
    pub fn run<T>(
        &self,
        clock: &dyn Clock,
        mut op: impl FnMut(u32) -> Result<T, ProviderError>,
        mut on_retry: impl FnMut(u32, Duration, &ProviderError),
    ) -> (Result<T, ProviderError>, u32) {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op(attempt) {
                Ok(value) => return (Ok(value), attempt),
                Err(err) if err.is_transient() && attempt < max_attempts => {
                    let delay = self.delay_for(attempt);
                    on_retry(attempt, delay, &err);
                    clock.sleep(delay);
                    attempt += 1;
                }
                Err(err) => return (Err(err), attempt),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    #[test]
    fn transient_failures_use_linear_backoff() {
        let clock = ManualClock::default();
        let policy = RetryPolicy::default();
        let mut retries = Vec::new();
        let (result, tries) = policy.run(
            &clock,
            |_| Err::<(), _>(ProviderError::transient("503")),
            |attempt, delay, _| retries.push((attempt, delay)),
        );
        assert!(result.is_err());
        assert_eq!(tries, 3);
        assert_eq!(
            clock.sleeps(),
            vec![Duration::from_secs(2), Duration::from_secs(4)]
        );
        assert_eq!(retries.len(), 2);
    }

    #[test]
    fn fatal_failures_are_not_retried() {
        let clock = ManualClock::default();
        let mut calls = 0;
        let (result, tries) = RetryPolicy::default().run(
            &clock,
            |_| {
                calls += 1;
                Err::<(), _>(ProviderError::fatal("401"))
            },
            |_, _, _| {},
        );
        assert_eq!(result, Err(ProviderError::fatal("401")));
        assert_eq!((tries, calls), (1, 1));
        assert!(clock.sleeps().is_empty());
    }

    #[test]
    fn recovers_after_a_transient_failure() {
        let clock = ManualClock::default();
        let policy = RetryPolicy::new(3, Duration::from_millis(10));
        let (result, tries) = policy.run(
            &clock,
            |attempt| {
                if attempt == 1 {
                    Err(ProviderError::transient("timeout"))
                } else {
                    Ok(attempt)
                }
            },
            |_, _, _| {},
        );
        assert_eq!(result, Ok(2));
        assert_eq!(tries, 2);
        assert_eq!(clock.total_slept(), Duration::from_millis(10));
    }
}
