//! 传输层抽象
//!
//! 客户端只定义"拥有连接的包装"，线协议由 `BrokerTransport` 的实现提供：
//! - `kafka`：基于 librdkafka 的实现（需要 `kafka` feature）
//! - `memory`：进程内集群，用于测试和演示
//!
//! 传输实例只被客户端的后台 owner 任务持有，调用方永远拿不到裸句柄。

#[cfg(feature = "kafka")]
pub mod kafka;
pub mod memory;

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::time::Duration;

use crate::config::{BrokerAddress, ProducerConfig};
use crate::error::TransportError;
use crate::metadata::ClusterMetadata;

#[cfg(feature = "kafka")]
pub use kafka::KafkaTransport;
pub use memory::{CommittedRecord, MemoryCluster, MemoryTransport};

/// 建立会话所需的参数
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// 已通过解析校验的 bootstrap 地址
    pub addresses: Vec<BrokerAddress>,
    pub use_secure_transport: bool,
    pub client_id: String,
    pub request_timeout: Duration,
    pub metadata_timeout: Duration,
    /// 透传配置
    pub properties: HashMap<String, String>,
}

impl SessionConfig {
    pub fn new(config: &ProducerConfig, addresses: Vec<BrokerAddress>) -> Self {
        Self {
            addresses,
            use_secure_transport: config.use_secure_transport,
            client_id: config.client_id.clone(),
            request_timeout: config.request_timeout,
            metadata_timeout: config.metadata_timeout,
            properties: config.properties.clone(),
        }
    }

    pub fn bootstrap_servers(&self) -> String {
        self.addresses
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// 元数据请求范围
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetadataScope {
    /// 空 topic 集合，只获取 broker 列表
    Bootstrap,
    /// 指定 topic
    Topics(Vec<String>),
    /// 全部 topic
    All,
}

/// 线上传输的单条记录
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundRecord {
    pub key: Bytes,
    pub payload: Bytes,
}

/// 发往单个分区的一批记录
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProduceRequest {
    pub topic: String,
    pub partition: i32,
    pub records: Vec<OutboundRecord>,
}

/// produce 确认：按请求顺序给出每条记录的结果
///
/// 写入成功的记录带回 broker 分配的 offset；未写入的记录带回原因，
/// 由客户端只重发这些记录。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProduceAck {
    pub records: Vec<Result<i64, TransportError>>,
}

impl ProduceAck {
    /// 整批写入，offset 从 `base_offset` 起连续
    pub fn contiguous(base_offset: i64, count: usize) -> Self {
        Self {
            records: (0..count as i64).map(|i| Ok(base_offset + i)).collect(),
        }
    }

    /// 写入成功的记录数
    pub fn delivered(&self) -> usize {
        self.records.iter().filter(|r| r.is_ok()).count()
    }

    /// 第一条未写入记录的原因
    pub fn first_error(&self) -> Option<&TransportError> {
        self.records.iter().find_map(|r| r.as_ref().err())
    }
}

/// Broker 传输 trait
///
/// 注意：由于需要动态分发（dyn），使用 async-trait
#[async_trait]
pub trait BrokerTransport: Send + Sync {
    /// 建立会话（传输层握手、TLS、认证）
    async fn connect(&self, session: &SessionConfig) -> Result<(), TransportError>;

    /// 一次元数据往返
    ///
    /// 请求的 topic 不存在时不出现在结果中，由调用方判定为未知 topic
    async fn fetch_metadata(&self, scope: &MetadataScope) -> Result<ClusterMetadata, TransportError>;

    /// 发送一个批次
    ///
    /// 请求整体失败（没有任何记录写入）时返回 `Err`；部分写入时返回 `Ok`，
    /// 在 `ProduceAck` 中逐条标出失败的记录。
    async fn produce(&self, request: ProduceRequest) -> Result<ProduceAck, TransportError>;

    /// 释放会话
    async fn close(&self) -> Result<(), TransportError>;
}
