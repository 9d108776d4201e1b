//! 传输层错误
//!
//! 由 `BrokerTransport` 实现返回，客户端据此决定重试、失败或进入 Failed 状态

use thiserror::Error;

/// 传输层错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// broker 不可达（DNS 失败、所有 broker 宕机）
    #[error("broker 不可达: {0}")]
    Unreachable(String),

    /// 请求超时
    #[error("请求超时")]
    Timeout,

    /// 临时错误（leader 切换、网络抖动等）
    #[error("临时错误: {0}")]
    Transient(String),

    /// 认证或授权失败
    #[error("认证失败: {0}")]
    Authentication(String),

    /// broker 不认识该 topic
    #[error("未知 topic: {0}")]
    UnknownTopic(String),

    /// broker 明确拒绝了请求
    #[error("请求被拒绝: {0}")]
    Rejected(String),

    /// 不可恢复的连接丢失
    #[error("连接丢失: {0}")]
    ConnectionLost(String),
}

impl TransportError {
    /// 判断是否为可重试的错误
    pub fn is_retryable(&self) -> bool {
        matches!(self, TransportError::Timeout | TransportError::Transient(_))
    }

    /// 判断是否会使整个客户端失效
    pub fn is_fatal(&self) -> bool {
        matches!(self, TransportError::ConnectionLost(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_timeouts_and_transient_errors_are_retryable() {
        assert!(TransportError::Timeout.is_retryable());
        assert!(TransportError::Transient("leader moved".into()).is_retryable());
        assert!(!TransportError::Authentication("bad sasl".into()).is_retryable());
        assert!(!TransportError::UnknownTopic("t".into()).is_retryable());
        assert!(!TransportError::ConnectionLost("eof".into()).is_retryable());
    }

    #[test]
    fn connection_lost_is_fatal() {
        assert!(TransportError::ConnectionLost("eof".into()).is_fatal());
        assert!(!TransportError::Timeout.is_fatal());
    }
}
