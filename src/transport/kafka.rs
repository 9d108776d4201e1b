//! librdkafka 传输
//!
//! 会话即一个 `FutureProducer`。librdkafka 自己维护到各 broker 的连接，
//! 阻塞的元数据调用放到 `spawn_blocking` 上执行。

use async_trait::async_trait;
use parking_lot::RwLock;
use rdkafka::config::ClientConfig;
use rdkafka::error::KafkaError;
use rdkafka::metadata::Metadata;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::types::RDKafkaErrorCode;
use rdkafka::util::Timeout;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::{BrokerTransport, MetadataScope, ProduceAck, ProduceRequest, SessionConfig};
use crate::error::TransportError;
use crate::metadata::{BrokerInfo, ClusterMetadata, PartitionInfo, TopicMetadata};

fn security_protocol(session: &SessionConfig) -> &'static str {
    if session.use_secure_transport {
        "ssl"
    } else {
        "plaintext"
    }
}

/// 生产者配置
///
/// 启用幂等性：librdkafka 内部重试时不会打乱分区内的顺序，也不会重复写入。
/// 透传配置最后写入，可以覆盖这里的默认值。
pub fn client_config(session: &SessionConfig) -> ClientConfig {
    let mut config = ClientConfig::new();
    config
        .set("bootstrap.servers", session.bootstrap_servers())
        .set("client.id", &session.client_id)
        .set("message.timeout.ms", session.request_timeout.as_millis().to_string())
        .set("socket.timeout.ms", session.metadata_timeout.as_millis().to_string())
        .set("enable.idempotence", "true")
        .set("acks", "all")
        .set("linger.ms", "5")
        .set("security.protocol", security_protocol(session));

    for (key, value) in &session.properties {
        config.set(key, value);
    }
    config
}

/// 构建 librdkafka 生产者
pub fn build_producer(session: &SessionConfig) -> Result<FutureProducer, KafkaError> {
    let config = client_config(session);
    let producer: FutureProducer = config.create()?;

    info!(
        bootstrap = %session.bootstrap_servers(),
        client_id = %session.client_id,
        security_protocol = security_protocol(session),
        idempotence = config.get("enable.idempotence").unwrap_or("false"),
        "Kafka producer created successfully"
    );

    Ok(producer)
}

/// 基于 `FutureProducer` 的传输实现
#[derive(Default)]
pub struct KafkaTransport {
    producer: RwLock<Option<Arc<FutureProducer>>>,
    metadata_timeout: RwLock<Duration>,
}

impl KafkaTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn producer(&self) -> Result<Arc<FutureProducer>, TransportError> {
        self.producer
            .read()
            .clone()
            .ok_or_else(|| TransportError::ConnectionLost("kafka producer not connected".to_string()))
    }

    async fn fetch(&self, topic: Option<String>) -> Result<Metadata, TransportError> {
        let producer = self.producer()?;
        let timeout = *self.metadata_timeout.read();
        let label = topic.clone().unwrap_or_default();

        tokio::task::spawn_blocking(move || {
            producer
                .client()
                .fetch_metadata(topic.as_deref(), Timeout::After(timeout))
        })
        .await
        .map_err(|e| TransportError::Transient(format!("metadata task failed: {}", e)))?
        .map_err(|e| map_kafka_error(&e, &label))
    }
}

#[async_trait]
impl BrokerTransport for KafkaTransport {
    async fn connect(&self, session: &SessionConfig) -> Result<(), TransportError> {
        let producer = build_producer(session).map_err(|e| map_kafka_error(&e, ""))?;
        *self.metadata_timeout.write() = session.metadata_timeout;
        *self.producer.write() = Some(Arc::new(producer));
        Ok(())
    }

    async fn fetch_metadata(&self, scope: &MetadataScope) -> Result<ClusterMetadata, TransportError> {
        match scope {
            // librdkafka 无法请求空 topic 集合：这里拉取全部 topic，只保留 broker 列表
            MetadataScope::Bootstrap => {
                let metadata = self.fetch(None).await?;
                Ok(ClusterMetadata {
                    brokers: convert_brokers(&metadata),
                    topics: Vec::new(),
                })
            }
            MetadataScope::All => {
                let metadata = self.fetch(None).await?;
                Ok(ClusterMetadata {
                    brokers: convert_brokers(&metadata),
                    topics: convert_topics(&metadata),
                })
            }
            MetadataScope::Topics(names) => {
                let mut result = ClusterMetadata::default();
                for name in names {
                    let metadata = self.fetch(Some(name.clone())).await?;
                    result.brokers = convert_brokers(&metadata);
                    result.topics.extend(convert_topics(&metadata));
                }
                Ok(result)
            }
        }
    }

    async fn produce(&self, request: ProduceRequest) -> Result<ProduceAck, TransportError> {
        let producer = self.producer()?;

        // 入队失败（例如本地队列已满）后的记录不再提交，保持分区内顺序
        let mut deliveries = Vec::with_capacity(request.records.len());
        let mut refused = None;
        for record in &request.records {
            let mut future_record = FutureRecord::<[u8], [u8]>::to(&request.topic)
                .partition(request.partition)
                .payload(record.payload.as_ref());
            if !record.key.is_empty() {
                future_record = future_record.key(record.key.as_ref());
            }

            match producer.send_result(future_record) {
                Ok(delivery) => deliveries.push(delivery),
                Err((e, _)) => {
                    refused = Some(map_kafka_error(&e, &request.topic));
                    break;
                }
            }
        }

        if deliveries.is_empty()
            && let Some(error) = refused
        {
            return Err(error);
        }

        let mut records = Vec::with_capacity(request.records.len());
        for delivery in deliveries {
            records.push(match delivery.await {
                Ok(Ok(delivered)) => Ok(delivered.offset),
                Ok(Err((e, _))) => Err(map_kafka_error(&e, &request.topic)),
                Err(_) => Err(TransportError::ConnectionLost(
                    "kafka producer dropped pending delivery".to_string(),
                )),
            });
        }
        if let Some(error) = refused {
            records.resize(request.records.len(), Err(error));
        }

        let ack = ProduceAck { records };
        debug!(
            topic = %request.topic,
            partition = request.partition,
            records = request.records.len(),
            delivered = ack.delivered(),
            "Kafka batch acknowledged"
        );

        Ok(ack)
    }

    async fn close(&self) -> Result<(), TransportError> {
        let Some(producer) = self.producer.write().take() else {
            return Ok(());
        };
        let timeout = *self.metadata_timeout.read();

        tokio::task::spawn_blocking(move || producer.flush(Timeout::After(timeout)))
            .await
            .map_err(|e| TransportError::Transient(format!("flush task failed: {}", e)))?
            .map_err(|e| map_kafka_error(&e, ""))
    }
}

fn convert_brokers(metadata: &Metadata) -> Vec<BrokerInfo> {
    metadata
        .brokers()
        .iter()
        .map(|b| BrokerInfo::new(b.id(), b.host(), u16::try_from(b.port()).unwrap_or_default()))
        .collect()
}

/// 出错的 topic（例如不存在）不进入结果
fn convert_topics(metadata: &Metadata) -> Vec<TopicMetadata> {
    metadata
        .topics()
        .iter()
        .filter(|t| t.error().is_none())
        .map(|t| {
            let partitions = t
                .partitions()
                .iter()
                .map(|p| {
                    let leader = (p.leader() >= 0).then_some(p.leader());
                    PartitionInfo::new(p.id(), leader, p.replicas().to_vec())
                })
                .collect();
            TopicMetadata::new(t.name(), partitions)
        })
        .collect()
}

/// librdkafka 错误码到传输错误
pub fn map_kafka_error(error: &KafkaError, topic: &str) -> TransportError {
    let message = error.to_string();
    match error.rdkafka_error_code() {
        Some(RDKafkaErrorCode::AllBrokersDown | RDKafkaErrorCode::Resolve) => {
            TransportError::Unreachable(message)
        }
        Some(
            RDKafkaErrorCode::OperationTimedOut
            | RDKafkaErrorCode::RequestTimedOut
            | RDKafkaErrorCode::MessageTimedOut,
        ) => TransportError::Timeout,
        Some(
            RDKafkaErrorCode::Authentication
            | RDKafkaErrorCode::SaslAuthenticationFailed
            | RDKafkaErrorCode::SSL
            | RDKafkaErrorCode::TopicAuthorizationFailed,
        ) => TransportError::Authentication(message),
        Some(RDKafkaErrorCode::UnknownTopicOrPartition | RDKafkaErrorCode::UnknownTopic) => {
            TransportError::UnknownTopic(topic.to_string())
        }
        Some(RDKafkaErrorCode::MessageSizeTooLarge | RDKafkaErrorCode::InvalidMessage) => {
            TransportError::Rejected(message)
        }
        Some(RDKafkaErrorCode::Fatal) => TransportError::ConnectionLost(message),
        _ => TransportError::Transient(message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_map_to_transport_errors() {
        let timeout = KafkaError::MessageProduction(RDKafkaErrorCode::MessageTimedOut);
        assert_eq!(map_kafka_error(&timeout, "orders"), TransportError::Timeout);

        let unknown = KafkaError::MessageProduction(RDKafkaErrorCode::UnknownTopicOrPartition);
        assert_eq!(
            map_kafka_error(&unknown, "orders"),
            TransportError::UnknownTopic("orders".to_string())
        );

        let down = KafkaError::MetadataFetch(RDKafkaErrorCode::AllBrokersDown);
        assert!(matches!(map_kafka_error(&down, ""), TransportError::Unreachable(_)));

        let full = KafkaError::MessageProduction(RDKafkaErrorCode::QueueFull);
        assert!(map_kafka_error(&full, "orders").is_retryable());
    }

    fn session(secure: bool) -> SessionConfig {
        let config = crate::config::ProducerConfig::from_bootstrap("b1:9092,b2:9092", secure)
            .unwrap()
            .with_client_id("kafka-test")
            .with_property("compression.type", "lz4");
        SessionConfig::new(&config, config.addresses.clone())
    }

    #[test]
    fn client_config_keeps_partition_order() {
        let config = client_config(&session(false));
        assert_eq!(config.get("enable.idempotence"), Some("true"));
        assert_eq!(config.get("acks"), Some("all"));
        assert_eq!(config.get("bootstrap.servers"), Some("b1:9092,b2:9092"));
        assert_eq!(config.get("client.id"), Some("kafka-test"));
        assert_eq!(config.get("security.protocol"), Some("plaintext"));
        assert_eq!(config.get("compression.type"), Some("lz4"));
    }

    #[test]
    fn secure_sessions_use_ssl() {
        let config = client_config(&session(true));
        assert_eq!(config.get("security.protocol"), Some("ssl"));
    }

    #[tokio::test]
    async fn produce_before_connect_is_connection_lost() {
        let transport = KafkaTransport::new();
        let request = ProduceRequest {
            topic: "orders".to_string(),
            partition: 0,
            records: Vec::new(),
        };
        assert!(matches!(
            transport.produce(request).await,
            Err(TransportError::ConnectionLost(_))
        ));
    }
}
