//! 重试策略模块
//!
//! 发送调度与元数据刷新共用的退避策略

pub mod exponential;
pub mod fixed;

pub use exponential::ExponentialBackoffPolicy;
pub use fixed::FixedRetryPolicy;

use crate::config::{ProducerConfig, RetryStrategy};
use crate::error::TransportError;
use std::time::Duration;

/// 重试策略 trait
///
/// `attempt` 为已经执行过的重试次数（首次发送失败时为 0）
pub trait RetryPolicy: Send + Sync {
    /// 最多重试次数（不含首次发送）
    fn max_attempts(&self) -> usize;

    /// 第 `attempt` 次重试前的等待时间
    fn backoff_duration(&self, attempt: usize) -> Duration;

    /// 只有可重试错误且次数未用完时才重试
    fn should_retry(&self, attempt: usize, error: &TransportError) -> bool {
        attempt < self.max_attempts() && error.is_retryable()
    }
}

/// 根据配置构建重试策略
pub fn from_config(config: &ProducerConfig) -> Box<dyn RetryPolicy> {
    match config.retry_strategy {
        RetryStrategy::Exponential => Box::new(ExponentialBackoffPolicy::new(
            config.send_retry_limit,
            config.retry_backoff,
            config.retry_backoff_max,
        )),
        RetryStrategy::Fixed => Box::new(FixedRetryPolicy::new(
            config.send_retry_limit,
            config.retry_backoff,
        )),
    }
}
