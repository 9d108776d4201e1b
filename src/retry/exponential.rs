use super::RetryPolicy;
use std::time::Duration;

/// 指数退避：`base * 2^attempt`，不超过 `cap`
#[derive(Debug, Clone, Copy)]
pub struct ExponentialBackoffPolicy {
    retries: usize,
    base: Duration,
    cap: Duration,
}

impl ExponentialBackoffPolicy {
    pub fn new(retries: usize, base: Duration, cap: Duration) -> Self {
        Self { retries, base, cap }
    }
}

impl RetryPolicy for ExponentialBackoffPolicy {
    fn max_attempts(&self) -> usize {
        self.retries
    }

    fn backoff_duration(&self, attempt: usize) -> Duration {
        // 指数部分封顶，避免移位溢出
        let factor = 1u32 << attempt.min(10);
        self.base.saturating_mul(factor).min(self.cap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;

    #[test]
    fn backoff_doubles_until_capped() {
        let policy = ExponentialBackoffPolicy::new(
            5,
            Duration::from_millis(100),
            Duration::from_millis(350),
        );
        assert_eq!(policy.backoff_duration(0), Duration::from_millis(100));
        assert_eq!(policy.backoff_duration(1), Duration::from_millis(200));
        assert_eq!(policy.backoff_duration(2), Duration::from_millis(350));
        assert_eq!(policy.backoff_duration(60), Duration::from_millis(350));
    }

    #[test]
    fn stops_after_max_attempts() {
        let policy =
            ExponentialBackoffPolicy::new(2, Duration::from_millis(1), Duration::from_secs(1));
        let err = TransportError::Transient("leader moved".into());
        assert!(policy.should_retry(0, &err));
        assert!(policy.should_retry(1, &err));
        assert!(!policy.should_retry(2, &err));
    }

    #[test]
    fn never_retries_structural_errors() {
        let policy =
            ExponentialBackoffPolicy::new(3, Duration::from_millis(1), Duration::from_secs(1));
        assert!(!policy.should_retry(0, &TransportError::Authentication("sasl".into())));
        assert!(!policy.should_retry(0, &TransportError::Rejected("too large".into())));
    }
}
