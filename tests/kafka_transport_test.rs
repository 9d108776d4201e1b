//! Kafka 传输集成测试
//!
//! 这些测试需要运行中的 Kafka broker，并且需要启用 `kafka` feature。
//! 默认情况下测试会被忽略，使用以下命令运行：
//! `cargo test --features kafka --test kafka_transport_test -- --ignored`
//!
//! 启动 Kafka：
//! ```bash
//! docker run -d --name kafka-test -p 9092:9092 apache/kafka:3.7.0
//! ```
//!
//! 测试使用的 topic 需要预先创建（客户端不负责创建 topic）。

#![cfg(feature = "kafka")]

use flare_producer::{MetadataError, ProducerClient, ProducerConfig};
use std::time::Duration;

/// broker 地址，可以通过环境变量 KAFKA_BOOTSTRAP 覆盖
fn bootstrap() -> String {
    std::env::var("KAFKA_BOOTSTRAP").unwrap_or_else(|_| "127.0.0.1:9092".to_string())
}

/// 测试 topic，可以通过环境变量 KAFKA_TEST_TOPIC 覆盖
fn test_topic() -> String {
    std::env::var("KAFKA_TEST_TOPIC").unwrap_or_else(|_| "flare-producer-test".to_string())
}

fn config() -> ProducerConfig {
    ProducerConfig::from_bootstrap(&bootstrap(), false)
        .expect("invalid KAFKA_BOOTSTRAP")
        .with_connect_timeout(Duration::from_secs(10))
}

#[tokio::test]
#[ignore]
async fn connects_and_lists_topics() {
    let client = ProducerClient::connect(config()).await.expect("connect failed");
    let topics = client.topics().await.expect("list topics failed");
    println!("topics: {:?}", topics);
    client.close(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
#[ignore]
async fn produces_and_flushes() {
    let topic = test_topic();
    let client = ProducerClient::connect(config()).await.expect("connect failed");

    let partitions = client.topics_for(&topic).await.expect("topic metadata");
    assert!(!partitions.is_empty());

    let handles: Vec<_> = (0..10)
        .map(|i| client.send(&topic, "flare-key", format!("message-{i}")).unwrap())
        .collect();

    client.close(Duration::from_secs(10)).await.unwrap();

    let mut last = None;
    for handle in handles {
        let delivered = handle.await.expect("delivery failed");
        if let Some(previous) = last {
            assert!(delivered.offset > previous);
        }
        last = Some(delivered.offset);
    }
}

#[tokio::test]
#[ignore]
async fn unknown_topic_is_reported() {
    let client = ProducerClient::connect(config())
        .await
        .expect("connect failed");
    let result = client.topics_for("flare-producer-missing-topic").await;
    assert!(matches!(result, Err(MetadataError::UnknownTopic(_))));
    client.close(Duration::from_secs(5)).await.unwrap();
}
