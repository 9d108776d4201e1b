//! Flare Producer
//!
//! 托管的消息代理生产者客户端：一个对象持有到 broker 集群的连接，
//! 惰性解析集群元数据，提供 topic 发现、记录发送与显式关闭。
//!
//! ```no_run
//! use flare_producer::{MemoryCluster, ProducerClient, ProducerConfig};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let cluster = MemoryCluster::with_topics(&[("orders", 3)]);
//! let config = ProducerConfig::from_bootstrap("127.0.0.1:9092", false)?;
//! let client = ProducerClient::connect_with_transport(config, Arc::new(cluster.transport())).await?;
//!
//! let partitions = client.topics_for("orders").await?;
//! let handle = client.send("orders", "user-1", "created")?;
//! let delivered = handle.await?;
//! assert!(delivered.partition < partitions.len() as i32);
//!
//! client.close(Duration::from_secs(5)).await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod metadata;
pub mod partitioner;
pub mod retry;
mod scheduler;
pub mod stats;
pub mod telemetry;
pub mod transport;

pub use client::{ClientState, ProducerClient, RecordHandle, RecordMetadata};
pub use config::{BrokerAddress, ProducerConfig, ProducerFileConfig, RetryStrategy};
pub use error::{CloseError, ConfigError, ConnectError, MetadataError, SendError, TransportError};
pub use metadata::{BrokerInfo, ClusterMetadata, MetadataSnapshot, PartitionInfo, TopicMetadata};
pub use retry::{ExponentialBackoffPolicy, FixedRetryPolicy, RetryPolicy};
pub use stats::ProducerStatsSnapshot;
pub use telemetry::{LoggingConfig, init_tracing};
pub use transport::{
    BrokerTransport, MemoryCluster, MemoryTransport, MetadataScope, ProduceAck, ProduceRequest,
    SessionConfig,
};

#[cfg(feature = "kafka")]
pub use transport::KafkaTransport;
