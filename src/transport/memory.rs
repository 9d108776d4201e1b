//! 进程内 broker 集群
//!
//! 记录每一次元数据往返和 produce 请求，支持阻塞 produce、注入失败，
//! 用于验证客户端的缓存、顺序与背压行为。

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::watch;

use super::{BrokerTransport, MetadataScope, ProduceAck, ProduceRequest, SessionConfig};
use crate::error::TransportError;
use crate::metadata::{BrokerInfo, ClusterMetadata, PartitionInfo, TopicMetadata};

/// 已写入分区日志的记录
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommittedRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: bytes::Bytes,
    pub payload: bytes::Bytes,
}

/// 可开关的闸门，关闭时请求在此等待
#[derive(Debug)]
struct Gate {
    open: watch::Sender<bool>,
}

impl Gate {
    fn new() -> Self {
        let (open, _) = watch::channel(true);
        Self { open }
    }

    fn set(&self, open: bool) {
        self.open.send_replace(open);
    }

    async fn pass(&self) {
        let mut rx = self.open.subscribe();
        let _ = rx.wait_for(|open| *open).await;
    }
}

#[derive(Debug, Default)]
struct ClusterState {
    brokers: Vec<BrokerInfo>,
    topics: BTreeMap<String, Vec<PartitionInfo>>,
    next_offsets: HashMap<(String, i32), i64>,
    committed: Vec<CommittedRecord>,
    produce_attempts: Vec<ProduceRequest>,
    metadata_requests: Vec<MetadataScope>,
    connect_failure: Option<TransportError>,
    metadata_failures: VecDeque<TransportError>,
    produce_failures: VecDeque<TransportError>,
    /// (写入的前缀长度, 其余记录的错误)
    partial_produces: VecDeque<(usize, TransportError)>,
    metadata_latency: Duration,
    produce_latency: Duration,
    sessions: Vec<SessionConfig>,
    close_calls: usize,
}

#[derive(Debug)]
struct ClusterInner {
    state: Mutex<ClusterState>,
    produce_gate: Gate,
    metadata_gate: Gate,
}

/// 进程内集群，可被多个传输实例共享
#[derive(Debug, Clone)]
pub struct MemoryCluster {
    inner: Arc<ClusterInner>,
}

impl Default for MemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCluster {
    /// 创建只有一个 broker（id 0）的空集群
    pub fn new() -> Self {
        let state = ClusterState {
            brokers: vec![BrokerInfo::new(0, "127.0.0.1", 9092)],
            ..ClusterState::default()
        };
        Self {
            inner: Arc::new(ClusterInner {
                state: Mutex::new(state),
                produce_gate: Gate::new(),
                metadata_gate: Gate::new(),
            }),
        }
    }

    /// 创建集群并预建 topic
    pub fn with_topics(topics: &[(&str, usize)]) -> Self {
        let cluster = Self::new();
        for (name, partitions) in topics {
            cluster.create_topic(name, *partitions);
        }
        cluster
    }

    /// 新建连接到该集群的传输实例
    pub fn transport(&self) -> MemoryTransport {
        MemoryTransport {
            cluster: self.clone(),
            connected: AtomicBool::new(false),
        }
    }

    pub fn create_topic(&self, name: &str, partitions: usize) {
        let brokers: Vec<i32> = {
            let state = self.inner.state.lock();
            state.brokers.iter().map(|b| b.id).collect()
        };
        let layout = (0..partitions as i32)
            .map(|id| {
                let leader = brokers.get(id as usize % brokers.len().max(1)).copied();
                PartitionInfo::new(id, leader, brokers.clone())
            })
            .collect();
        self.inner.state.lock().topics.insert(name.to_string(), layout);
    }

    pub fn delete_topic(&self, name: &str) {
        self.inner.state.lock().topics.remove(name);
    }

    pub fn add_broker(&self, broker: BrokerInfo) {
        self.inner.state.lock().brokers.push(broker);
    }

    /// 下一次 connect 返回该错误
    pub fn fail_connect(&self, error: TransportError) {
        self.inner.state.lock().connect_failure = Some(error);
    }

    /// 接下来的元数据请求依次返回这些错误
    pub fn fail_next_metadata(&self, error: TransportError) {
        self.inner.state.lock().metadata_failures.push_back(error);
    }

    /// 接下来的 produce 请求依次返回这些错误
    pub fn fail_next_produce(&self, error: TransportError) {
        self.inner.state.lock().produce_failures.push_back(error);
    }

    /// 下一次 produce 只写入前 `delivered` 条记录，其余记录返回该错误
    pub fn fail_next_produce_after(&self, delivered: usize, error: TransportError) {
        self.inner
            .state
            .lock()
            .partial_produces
            .push_back((delivered, error));
    }

    pub fn set_metadata_latency(&self, latency: Duration) {
        self.inner.state.lock().metadata_latency = latency;
    }

    pub fn set_produce_latency(&self, latency: Duration) {
        self.inner.state.lock().produce_latency = latency;
    }

    /// 阻塞所有 produce 请求，直到 `release_produce`
    pub fn hold_produce(&self) {
        self.inner.produce_gate.set(false);
    }

    pub fn release_produce(&self) {
        self.inner.produce_gate.set(true);
    }

    /// 阻塞所有元数据请求，直到 `release_metadata`
    pub fn hold_metadata(&self) {
        self.inner.metadata_gate.set(false);
    }

    pub fn release_metadata(&self) {
        self.inner.metadata_gate.set(true);
    }

    /// 元数据往返记录（包括 bootstrap）
    pub fn metadata_requests(&self) -> Vec<MetadataScope> {
        self.inner.state.lock().metadata_requests.clone()
    }

    pub fn metadata_round_trips(&self) -> usize {
        self.inner.state.lock().metadata_requests.len()
    }

    /// 所有 produce 请求（包括失败和重试）
    pub fn produce_attempts(&self) -> Vec<ProduceRequest> {
        self.inner.state.lock().produce_attempts.clone()
    }

    /// 按写入顺序返回某个 topic 已提交的记录
    pub fn committed(&self, topic: &str) -> Vec<CommittedRecord> {
        self.inner
            .state
            .lock()
            .committed
            .iter()
            .filter(|r| r.topic == topic)
            .cloned()
            .collect()
    }

    /// 建立过的会话参数
    pub fn sessions(&self) -> Vec<SessionConfig> {
        self.inner.state.lock().sessions.clone()
    }

    pub fn close_calls(&self) -> usize {
        self.inner.state.lock().close_calls
    }

    fn describe(&self, scope: &MetadataScope) -> ClusterMetadata {
        let state = self.inner.state.lock();
        let topic = |name: &String, partitions: &Vec<PartitionInfo>| {
            TopicMetadata::new(name.clone(), partitions.clone())
        };
        let topics = match scope {
            MetadataScope::Bootstrap => Vec::new(),
            MetadataScope::Topics(names) => names
                .iter()
                .filter_map(|name| state.topics.get(name).map(|p| topic(name, p)))
                .collect(),
            MetadataScope::All => state.topics.iter().map(|(n, p)| topic(n, p)).collect(),
        };
        ClusterMetadata {
            brokers: state.brokers.clone(),
            topics,
        }
    }

    fn append(&self, request: &ProduceRequest) -> Result<ProduceAck, TransportError> {
        let mut state = self.inner.state.lock();
        let partition_exists = state
            .topics
            .get(&request.topic)
            .ok_or_else(|| TransportError::UnknownTopic(request.topic.clone()))?
            .iter()
            .any(|p| p.id == request.partition);
        if !partition_exists {
            return Err(TransportError::Rejected(format!(
                "unknown partition {}/{}",
                request.topic, request.partition
            )));
        }

        let next = state
            .next_offsets
            .entry((request.topic.clone(), request.partition))
            .or_insert(0);
        let base_offset = *next;
        *next += request.records.len() as i64;

        for (i, record) in request.records.iter().enumerate() {
            state.committed.push(CommittedRecord {
                topic: request.topic.clone(),
                partition: request.partition,
                offset: base_offset + i as i64,
                key: record.key.clone(),
                payload: record.payload.clone(),
            });
        }

        Ok(ProduceAck::contiguous(base_offset, request.records.len()))
    }
}

/// 连接到 `MemoryCluster` 的传输实例
#[derive(Debug)]
pub struct MemoryTransport {
    cluster: MemoryCluster,
    connected: AtomicBool,
}

impl MemoryTransport {
    pub fn cluster(&self) -> &MemoryCluster {
        &self.cluster
    }

    fn ensure_connected(&self) -> Result<(), TransportError> {
        if self.connected.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(TransportError::ConnectionLost("session not established".to_string()))
        }
    }
}

#[async_trait]
impl BrokerTransport for MemoryTransport {
    async fn connect(&self, session: &SessionConfig) -> Result<(), TransportError> {
        let failure = {
            let mut state = self.cluster.inner.state.lock();
            state.sessions.push(session.clone());
            state.connect_failure.take()
        };
        if let Some(error) = failure {
            return Err(error);
        }
        self.connected.store(true, Ordering::Release);
        Ok(())
    }

    async fn fetch_metadata(&self, scope: &MetadataScope) -> Result<ClusterMetadata, TransportError> {
        self.ensure_connected()?;

        let latency = {
            let mut state = self.cluster.inner.state.lock();
            state.metadata_requests.push(scope.clone());
            state.metadata_latency
        };

        self.cluster.inner.metadata_gate.pass().await;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        if let Some(error) = self.cluster.inner.state.lock().metadata_failures.pop_front() {
            return Err(error);
        }

        Ok(self.cluster.describe(scope))
    }

    async fn produce(&self, request: ProduceRequest) -> Result<ProduceAck, TransportError> {
        self.ensure_connected()?;

        let latency = {
            let mut state = self.cluster.inner.state.lock();
            state.produce_attempts.push(request.clone());
            state.produce_latency
        };

        self.cluster.inner.produce_gate.pass().await;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let (failure, partial) = {
            let mut state = self.cluster.inner.state.lock();
            match state.produce_failures.pop_front() {
                Some(error) => (Some(error), None),
                None => (None, state.partial_produces.pop_front()),
            }
        };
        if let Some(error) = failure {
            return Err(error);
        }

        let Some((delivered, error)) = partial else {
            return self.cluster.append(&request);
        };
        let head = ProduceRequest {
            topic: request.topic.clone(),
            partition: request.partition,
            records: request.records[..delivered.min(request.records.len())].to_vec(),
        };
        let mut ack = self.cluster.append(&head)?;
        ack.records.resize(request.records.len(), Err(error));
        Ok(ack)
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.connected.store(false, Ordering::Release);
        self.cluster.inner.state.lock().close_calls += 1;
        Ok(())
    }
}
