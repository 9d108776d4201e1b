//! 集群元数据与缓存
//!
//! `MetadataCache` 只由后台 owner 任务修改，每次合并刷新结果后发布一个新的
//! 不可变 `MetadataSnapshot`；调用方线程只读取快照，不持有任何锁。
//!
//! 新鲜度按 topic 记录：针对单个 topic 的刷新只会更新该 topic 的时间戳，
//! 不会丢弃其他 topic 的缓存。

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// Broker 节点信息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerInfo {
    pub id: i32,
    pub host: String,
    pub port: u16,
}

impl BrokerInfo {
    pub fn new(id: i32, host: impl Into<String>, port: u16) -> Self {
        Self {
            id,
            host: host.into(),
            port,
        }
    }
}

/// 分区信息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionInfo {
    /// 分区 ID
    pub id: i32,
    /// leader broker ID（选举中时为空）
    pub leader: Option<i32>,
    /// 副本所在 broker
    pub replicas: Vec<i32>,
}

impl PartitionInfo {
    pub fn new(id: i32, leader: Option<i32>, replicas: Vec<i32>) -> Self {
        Self {
            id,
            leader,
            replicas,
        }
    }
}

/// 单个 topic 的分区布局
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicMetadata {
    pub name: String,
    /// 按分区 ID 排序
    pub partitions: Vec<PartitionInfo>,
}

impl TopicMetadata {
    pub fn new(name: impl Into<String>, mut partitions: Vec<PartitionInfo>) -> Self {
        partitions.sort_by_key(|p| p.id);
        Self {
            name: name.into(),
            partitions,
        }
    }
}

/// 一次元数据请求的结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterMetadata {
    pub brokers: Vec<BrokerInfo>,
    pub topics: Vec<TopicMetadata>,
}

impl ClusterMetadata {
    pub fn topic(&self, name: &str) -> Option<&TopicMetadata> {
        self.topics.iter().find(|t| t.name == name)
    }
}

/// 缓存中的 topic 条目
#[derive(Debug, Clone)]
pub struct CachedTopic {
    partitions: Vec<PartitionInfo>,
    fetched_at: Instant,
}

impl CachedTopic {
    pub fn partitions(&self) -> &[PartitionInfo] {
        &self.partitions
    }

    pub fn fetched_at(&self) -> Instant {
        self.fetched_at
    }

    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.fetched_at)
    }
}

/// 不可变的元数据快照
#[derive(Debug, Clone)]
pub struct MetadataSnapshot {
    brokers: Vec<BrokerInfo>,
    topics: HashMap<String, CachedTopic>,
    max_age: Duration,
    refreshed_at: Option<Instant>,
}

impl MetadataSnapshot {
    fn empty(max_age: Duration) -> Self {
        Self {
            brokers: Vec::new(),
            topics: HashMap::new(),
            max_age,
            refreshed_at: None,
        }
    }

    pub fn brokers(&self) -> &[BrokerInfo] {
        &self.brokers
    }

    pub fn topic(&self, name: &str) -> Option<&CachedTopic> {
        self.topics.get(name)
    }

    pub fn topic_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.topics.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn max_age(&self) -> Duration {
        self.max_age
    }

    /// 最近一次合并刷新结果的时间
    pub fn refreshed_at(&self) -> Option<Instant> {
        self.refreshed_at
    }

    /// topic 是否已缓存且未超过最大年龄（age > max_age 视为过期）
    pub fn is_fresh(&self, name: &str, now: Instant) -> bool {
        self.topics
            .get(name)
            .is_some_and(|topic| topic.age(now) <= self.max_age)
    }

    /// 新鲜的分区列表；缺失或过期时返回 `None`
    pub fn fresh_partitions(&self, name: &str, now: Instant) -> Option<Vec<PartitionInfo>> {
        if self.is_fresh(name, now) {
            self.topics.get(name).map(|t| t.partitions.clone())
        } else {
            None
        }
    }
}

/// 元数据缓存（仅 owner 任务持有）
pub(crate) struct MetadataCache {
    current: Arc<MetadataSnapshot>,
    publisher: watch::Sender<Arc<MetadataSnapshot>>,
}

impl MetadataCache {
    pub(crate) fn new(max_age: Duration) -> (Self, watch::Receiver<Arc<MetadataSnapshot>>) {
        let current = Arc::new(MetadataSnapshot::empty(max_age));
        let (publisher, receiver) = watch::channel(current.clone());
        (Self { current, publisher }, receiver)
    }

    pub(crate) fn is_fresh(&self, topic: &str, now: Instant) -> bool {
        self.current.is_fresh(topic, now)
    }

    /// 已缓存的分区（可能已过期）
    pub(crate) fn partitions(&self, topic: &str) -> Option<&[PartitionInfo]> {
        self.current.topic(topic).map(CachedTopic::partitions)
    }

    /// 合并一次刷新结果并发布新快照
    ///
    /// 只覆盖响应中出现的 topic；响应携带 broker 列表时才替换 broker 列表
    pub(crate) fn merge(&mut self, update: ClusterMetadata, now: Instant) {
        let mut next = (*self.current).clone();

        if !update.brokers.is_empty() {
            next.brokers = update.brokers;
        }

        for topic in update.topics {
            next.topics.insert(
                topic.name,
                CachedTopic {
                    partitions: topic.partitions,
                    fetched_at: now,
                },
            );
        }

        next.refreshed_at = Some(now);
        self.publish(next);
    }

    /// 移除 broker 已不再认识的 topic
    pub(crate) fn forget(&mut self, topic: &str) {
        if self.current.topics.contains_key(topic) {
            let mut next = (*self.current).clone();
            next.topics.remove(topic);
            self.publish(next);
        }
    }

    fn publish(&mut self, next: MetadataSnapshot) {
        self.current = Arc::new(next);
        self.publisher.send_replace(self.current.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topic(name: &str, partitions: i32) -> TopicMetadata {
        TopicMetadata::new(
            name,
            (0..partitions)
                .map(|id| PartitionInfo::new(id, Some(1), vec![1]))
                .collect(),
        )
    }

    #[test]
    fn partitions_are_sorted_by_id() {
        let meta = TopicMetadata::new(
            "orders",
            vec![
                PartitionInfo::new(2, Some(1), vec![1]),
                PartitionInfo::new(0, Some(1), vec![1]),
                PartitionInfo::new(1, None, vec![1, 2]),
            ],
        );
        let ids: Vec<i32> = meta.partitions.iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![0, 1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn targeted_merge_keeps_other_topics() {
        let (mut cache, receiver) = MetadataCache::new(Duration::from_secs(15));
        let t0 = Instant::now();

        cache.merge(
            ClusterMetadata {
                brokers: vec![BrokerInfo::new(1, "b1", 9092)],
                topics: vec![topic("a", 1)],
            },
            t0,
        );
        cache.merge(
            ClusterMetadata {
                brokers: vec![],
                topics: vec![topic("b", 3)],
            },
            t0,
        );

        let snapshot = receiver.borrow().clone();
        assert_eq!(snapshot.topic_names(), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(snapshot.brokers().len(), 1);
        assert_eq!(snapshot.topic("b").unwrap().partitions().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn freshness_follows_max_age() {
        let (mut cache, _receiver) = MetadataCache::new(Duration::from_secs(15));
        let t0 = Instant::now();
        cache.merge(
            ClusterMetadata {
                brokers: vec![],
                topics: vec![topic("orders", 2)],
            },
            t0,
        );

        assert!(cache.is_fresh("orders", t0 + Duration::from_secs(15)));
        assert!(!cache.is_fresh("orders", t0 + Duration::from_secs(20)));
        assert!(!cache.is_fresh("unknown", t0));

        // 过期数据仍可用于分区选择
        assert_eq!(cache.partitions("orders").map(<[_]>::len), Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn forget_removes_topic_from_snapshot() {
        let (mut cache, receiver) = MetadataCache::new(Duration::from_secs(15));
        cache.merge(
            ClusterMetadata {
                brokers: vec![],
                topics: vec![topic("gone", 1)],
            },
            Instant::now(),
        );
        cache.forget("gone");
        assert!(receiver.borrow().topic("gone").is_none());
    }
}
