use super::RetryPolicy;
use std::time::Duration;

/// 固定间隔重试
#[derive(Debug, Clone, Copy)]
pub struct FixedRetryPolicy {
    retries: usize,
    interval: Duration,
}

impl FixedRetryPolicy {
    pub fn new(retries: usize, interval: Duration) -> Self {
        Self { retries, interval }
    }
}

impl RetryPolicy for FixedRetryPolicy {
    fn max_attempts(&self) -> usize {
        self.retries
    }

    fn backoff_duration(&self, _attempt: usize) -> Duration {
        self.interval
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;

    #[test]
    fn delay_is_constant() {
        let policy = FixedRetryPolicy::new(3, Duration::from_millis(250));
        assert_eq!(policy.backoff_duration(0), policy.backoff_duration(2));
        assert_eq!(policy.max_attempts(), 3);
        assert!(policy.should_retry(2, &TransportError::Timeout));
        assert!(!policy.should_retry(3, &TransportError::Timeout));
    }
}
