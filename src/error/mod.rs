//! Flare Producer 错误处理模块
//!
//! 按调用入口划分错误类型：连接、元数据、发送、关闭各自拥有独立的错误枚举，
//! 调用方可以据此区分"记录确定未发送"与"发送结果未知"。

pub mod conversions;
pub mod transport;

pub use transport::TransportError;

use thiserror::Error;

/// 建立连接失败
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectError {
    /// 没有任何一个 broker 地址可以解析或连通
    #[error("broker 不可达: {0}")]
    Unreachable(String),

    /// 传输层或安全握手失败（TLS、认证、初始元数据请求）
    #[error("握手失败: {0}")]
    HandshakeFailed(String),

    /// 配置不合法
    #[error("配置错误: {0}")]
    InvalidConfig(String),
}

/// 元数据查询失败
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MetadataError {
    /// broker 未返回该 topic
    #[error("未知 topic: {0}")]
    UnknownTopic(String),

    /// 刷新超过截止时间，或客户端已进入 Failed 状态
    #[error("元数据刷新超时")]
    Timeout,

    /// 客户端正在关闭或已关闭
    #[error("客户端已关闭")]
    Closed,
}

/// 记录发送失败
///
/// `Closed`、`QueueFull`、`Rejected` 表示记录确定没有写入 broker；
/// `Abandoned` 与 `TimedOut` 表示记录已被接受但结果未知。
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    /// 客户端处于 Closing / Closed / Failed 状态
    #[error("客户端已关闭，拒绝发送")]
    Closed,

    /// 发送队列已满（背压）
    #[error("发送队列已满")]
    QueueFull,

    /// broker 拒绝或重试耗尽
    #[error("发送被拒绝: {0}")]
    Rejected(String),

    /// 结果未知：客户端在确认前关闭
    #[error("发送结果未知，客户端在确认前关闭")]
    Abandoned,

    /// 结果未知：请求超时且重试耗尽，broker 可能已经写入
    #[error("发送超时，结果未知")]
    TimedOut,
}

impl SendError {
    /// 记录是否确定没有写入 broker
    pub fn is_definite(&self) -> bool {
        !matches!(self, SendError::Abandoned | SendError::TimedOut)
    }
}

/// 关闭失败
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CloseError {
    /// 超时前未能完成的记录数，这些记录的结果未知
    #[error("关闭超时，{0} 条记录未完成")]
    Incomplete(usize),
}

/// 配置加载失败
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// 配置值不合法
    #[error("配置不合法: {0}")]
    Invalid(String),

    /// 配置解析失败
    #[error("配置解析失败: {0}")]
    Parse(String),

    /// 配置文件读取失败
    #[error("配置文件读取失败: {0}")]
    Io(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abandoned_is_not_definite() {
        assert!(!SendError::Abandoned.is_definite());
        assert!(!SendError::TimedOut.is_definite());
        assert!(SendError::Closed.is_definite());
        assert!(SendError::QueueFull.is_definite());
        assert!(SendError::Rejected("boom".into()).is_definite());
    }

    #[test]
    fn incomplete_names_dropped_count() {
        let err = CloseError::Incomplete(3);
        assert!(err.to_string().contains('3'));
    }
}
