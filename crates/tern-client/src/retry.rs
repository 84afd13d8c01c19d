use std::time::Duration;

use crate::error::Error;

/// Retry parameters attached to a request: the starting per-attempt timeout,
/// how many retries are allowed, and how fast the timeout grows.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub initial_timeout: Duration,
    pub max_retries: u32,
    pub backoff_multiplier: f32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_timeout: Duration::from_millis(2_500),
            max_retries: 0,
            backoff_multiplier: 1.0,
        }
    }
}

impl RetryPolicy {
    pub fn new(initial_timeout: Duration, max_retries: u32, backoff_multiplier: f32) -> Self {
        Self {
            initial_timeout,
            max_retries,
            backoff_multiplier,
        }
    }
}

/// The live backoff state of one request.
#[derive(Debug)]
pub(crate) struct RetryState {
    current_timeout: Duration,
    retry_count: u32,
    policy: RetryPolicy,
}

impl RetryState {
    pub(crate) fn new(policy: RetryPolicy) -> Self {
        Self {
            current_timeout: policy.initial_timeout,
            retry_count: 0,
            policy,
        }
    }

    /// The timeout the next attempt must use.
    pub(crate) fn current_timeout(&self) -> Duration {
        self.current_timeout
    }

    pub(crate) fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// Record a retriable failure: grow the timeout, then check the attempt
    /// budget. The order is contractual — the timeout is grown *before* the
    /// limit check, so even the rejected final retry leaves it mutated.
    pub(crate) fn retry(&mut self, error: Error) -> Result<(), Error> {
        self.retry_count += 1;
        self.current_timeout += self.current_timeout.mul_f32(self.policy.backoff_multiplier);
        if self.retry_count > self.policy.max_retries {
            return Err(error);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn timeout_grows_geometrically() {
        let mut state = RetryState::new(RetryPolicy::new(Duration::from_millis(1_000), 3, 1.0));
        assert_eq!(state.current_timeout(), Duration::from_millis(1_000));

        state.retry(ErrorKind::Timeout.into()).unwrap();
        assert_eq!(state.current_timeout(), Duration::from_millis(2_000));

        state.retry(ErrorKind::Timeout.into()).unwrap();
        assert_eq!(state.current_timeout(), Duration::from_millis(4_000));
    }

    #[test]
    fn default_policy_rejects_the_first_retry() {
        let mut state = RetryState::new(RetryPolicy::default());
        assert!(state.retry(ErrorKind::Timeout.into()).is_err());
    }

    #[test]
    fn exhaustion_still_mutates_the_timeout() {
        let mut state = RetryState::new(RetryPolicy::new(Duration::from_millis(500), 1, 2.0));

        state.retry(ErrorKind::Timeout.into()).unwrap();
        assert_eq!(state.current_timeout(), Duration::from_millis(1_500));

        // The rejected retry has already grown the timeout.
        assert!(state.retry(ErrorKind::Timeout.into()).is_err());
        assert_eq!(state.current_timeout(), Duration::from_millis(4_500));
        assert_eq!(state.retry_count(), 2);
    }
}
