//! 托管的生产者客户端
//!
//! `ProducerClient` 是调用方唯一接触的对象：
//! - `connect*`：校验配置、解析地址、建立会话并拉取 bootstrap 元数据
//! - `topics_for` / `topics`：读取元数据，过期时触发刷新
//! - `send`：同步入队，返回 `RecordHandle`
//! - `close` / `shutdown`：排空队列后释放连接
//!
//! 传输实例、元数据缓存与发送队列都由后台 owner 任务（`worker`）独占，
//! 客户端只通过命令通道和 `watch` 快照与之交互。

mod worker;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::net::IpAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{Semaphore, TryAcquireError, mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{BrokerAddress, ProducerConfig};
use crate::error::{CloseError, ConnectError, MetadataError, SendError, TransportError};
use crate::metadata::{MetadataCache, MetadataSnapshot, PartitionInfo};
use crate::scheduler::PendingRecord;
use crate::stats::{ProducerStats, ProducerStatsSnapshot};
use crate::transport::{BrokerTransport, SessionConfig};
use worker::{Command, Worker};

/// 客户端状态
///
/// Disconnected → Connecting → Ready → Closing → Closed；
/// 任意状态在连接不可恢复地丢失后进入 Failed。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientState {
    Disconnected,
    Connecting,
    Ready,
    Closing,
    Closed,
    Failed,
}

impl ClientState {
    /// 是否已经（或正在）结束
    pub fn is_terminal(&self) -> bool {
        matches!(self, ClientState::Closing | ClientState::Closed | ClientState::Failed)
    }
}

/// 已确认记录的位置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordMetadata {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

/// 单条记录的发送结果
///
/// 记录被确认、被拒绝或被放弃时完成；owner 任务在记录解决前退出时返回
/// `SendError::Abandoned`。
#[derive(Debug)]
pub struct RecordHandle {
    receiver: oneshot::Receiver<Result<RecordMetadata, SendError>>,
}

impl RecordHandle {
    /// 非阻塞地查看结果，尚未完成时返回 `None`
    pub fn try_result(&mut self) -> Option<Result<RecordMetadata, SendError>> {
        match self.receiver.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(SendError::Abandoned)),
        }
    }
}

impl Future for RecordHandle {
    type Output = Result<RecordMetadata, SendError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|result| result.unwrap_or(Err(SendError::Abandoned)))
    }
}

/// 客户端与 owner 任务共享的状态
#[derive(Debug)]
pub(crate) struct Shared {
    pub(crate) config: ProducerConfig,
    pub(crate) state: watch::Sender<ClientState>,
    pub(crate) metadata: watch::Receiver<Arc<MetadataSnapshot>>,
    pub(crate) permits: Arc<Semaphore>,
    pub(crate) stats: ProducerStats,
}

impl Shared {
    pub(crate) fn state(&self) -> ClientState {
        *self.state.borrow()
    }

    pub(crate) fn set_state(&self, next: ClientState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!(client_id = %self.config.client_id, ?previous, ?next, "Producer state changed");
        }
    }

    fn pending(&self) -> usize {
        self.config
            .send_queue_capacity
            .saturating_sub(self.permits.available_permits())
    }
}

/// 托管的生产者客户端
///
/// 丢弃客户端会停止 owner 任务：未完成的记录以 `SendError::Abandoned` 结束，
/// 连接随之释放。需要排空队列时应先调用 `close`。
#[derive(Debug)]
pub struct ProducerClient {
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<Command>,
}

impl ProducerClient {
    /// 使用 librdkafka 传输建立连接
    #[cfg(feature = "kafka")]
    pub async fn connect(config: ProducerConfig) -> Result<Self, ConnectError> {
        let transport = Arc::new(crate::transport::KafkaTransport::new());
        Self::connect_with_transport(config, transport).await
    }

    /// 使用指定传输建立连接
    ///
    /// 成功返回时会话已建立、bootstrap 元数据已缓存，客户端处于 `Ready` 状态。
    pub async fn connect_with_transport(
        config: ProducerConfig,
        transport: Arc<dyn BrokerTransport>,
    ) -> Result<Self, ConnectError> {
        config
            .validate()
            .map_err(|e| ConnectError::InvalidConfig(e.to_string()))?;

        let addresses = resolve_addresses(&config.addresses).await?;
        let session = SessionConfig::new(&config, addresses);

        let (state, _) = watch::channel(ClientState::Disconnected);
        let (cache, metadata) = MetadataCache::new(config.metadata_max_age);
        let shared = Arc::new(Shared {
            permits: Arc::new(Semaphore::new(config.send_queue_capacity)),
            config,
            state,
            metadata,
            stats: ProducerStats::default(),
        });

        let (commands, receiver) = mpsc::unbounded_channel();
        let (startup, started) = oneshot::channel();
        let worker = Worker::new(shared.clone(), transport, cache, receiver);
        tokio::spawn(worker.run(session, startup));

        match started.await {
            Ok(Ok(())) => {
                info!(
                    client_id = %shared.config.client_id,
                    bootstrap = %shared.config.bootstrap_servers(),
                    secure = shared.config.use_secure_transport,
                    "Producer client connected"
                );
                Ok(Self { shared, commands })
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(ConnectError::Unreachable(
                "producer task exited during connect".to_string(),
            )),
        }
    }

    /// 返回 topic 的分区列表
    ///
    /// 缓存新鲜时不产生网络往返；否则请求只针对该 topic 的刷新，并与同一 topic
    /// 上正在进行的刷新合并。
    pub async fn topics_for(&self, topic: &str) -> Result<Vec<PartitionInfo>, MetadataError> {
        self.check_metadata_available()?;

        if let Some(partitions) = self
            .shared
            .metadata
            .borrow()
            .fresh_partitions(topic, Instant::now())
        {
            return Ok(partitions);
        }

        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Refresh {
                topic: topic.to_string(),
                reply,
            })
            .map_err(|_| self.metadata_unavailable())?;

        self.await_metadata(response).await
    }

    /// 集群中全部 topic 名称（排序）
    pub async fn topics(&self) -> Result<Vec<String>, MetadataError> {
        self.check_metadata_available()?;

        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::ListTopics { reply })
            .map_err(|_| self.metadata_unavailable())?;

        self.await_metadata(response).await
    }

    /// 提交一条记录
    ///
    /// 只入队不做 I/O；返回的 handle 在记录被确认或失败时完成。
    pub fn send(
        &self,
        topic: &str,
        key: impl Into<Bytes>,
        payload: impl Into<Bytes>,
    ) -> Result<RecordHandle, SendError> {
        if self.shared.state() != ClientState::Ready {
            return Err(SendError::Closed);
        }

        let permit = match self.shared.permits.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(TryAcquireError::NoPermits) => {
                ProducerStats::incr(&self.shared.stats.queue_full_rejections);
                return Err(SendError::QueueFull);
            }
            Err(TryAcquireError::Closed) => return Err(SendError::Closed),
        };

        let (completion, receiver) = oneshot::channel();
        let record = PendingRecord::new(
            topic.to_string(),
            key.into(),
            payload.into(),
            completion,
            permit,
        );
        self.commands
            .send(Command::Send(record))
            .map_err(|_| SendError::Closed)?;

        ProducerStats::incr(&self.shared.stats.records_accepted);
        Ok(RecordHandle { receiver })
    }

    /// 关闭客户端
    ///
    /// 停止接受新记录，在 `timeout` 内排空队列后释放连接。超时仍未完成的记录
    /// 以 `SendError::Abandoned` 结束，并返回 `CloseError::Incomplete`。
    /// 对已关闭或已失败的客户端直接返回 `Ok(())`；并发的第二次调用等待第一次的结果。
    pub async fn close(&self, timeout: Duration) -> Result<(), CloseError> {
        let mut finished = false;
        self.shared.state.send_if_modified(|state| match state {
            ClientState::Closed | ClientState::Failed => {
                finished = true;
                false
            }
            ClientState::Closing => false,
            _ => {
                *state = ClientState::Closing;
                true
            }
        });
        if finished {
            return Ok(());
        }

        let (reply, response) = oneshot::channel();
        let deadline = Instant::now() + timeout;
        if self.commands.send(Command::Close { deadline, reply }).is_err() {
            return Ok(());
        }

        response.await.unwrap_or(Ok(()))
    }

    /// 使用配置中的 `close_timeout` 关闭客户端
    pub async fn shutdown(&self) -> Result<(), CloseError> {
        self.close(self.shared.config.close_timeout).await
    }

    pub fn state(&self) -> ClientState {
        self.shared.state()
    }

    /// 当前元数据快照（不触发刷新）
    pub fn metadata(&self) -> Arc<MetadataSnapshot> {
        self.shared.metadata.borrow().clone()
    }

    pub fn stats(&self) -> ProducerStatsSnapshot {
        self.shared.stats.snapshot(self.shared.pending())
    }

    pub fn config(&self) -> &ProducerConfig {
        &self.shared.config
    }

    fn check_metadata_available(&self) -> Result<(), MetadataError> {
        match self.shared.state() {
            ClientState::Closing | ClientState::Closed => Err(MetadataError::Closed),
            ClientState::Failed => Err(MetadataError::Timeout),
            _ => Ok(()),
        }
    }

    fn metadata_unavailable(&self) -> MetadataError {
        match self.shared.state() {
            ClientState::Failed => MetadataError::Timeout,
            _ => MetadataError::Closed,
        }
    }

    async fn await_metadata<T>(
        &self,
        response: oneshot::Receiver<Result<T, MetadataError>>,
    ) -> Result<T, MetadataError> {
        match tokio::time::timeout(self.shared.config.metadata_timeout, response).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(self.metadata_unavailable()),
            Err(_) => Err(MetadataError::Timeout),
        }
    }
}

/// 过滤出可解析的地址
///
/// IP 字面量直接使用，主机名通过 DNS 解析校验；解析后的地址仍以原始主机名交给
/// 传输层，TLS 校验需要主机名。
async fn resolve_addresses(addresses: &[BrokerAddress]) -> Result<Vec<BrokerAddress>, ConnectError> {
    let mut resolved = Vec::with_capacity(addresses.len());
    let mut last_error = None;

    for address in addresses {
        if address.host().parse::<IpAddr>().is_ok() {
            resolved.push(address.clone());
            continue;
        }

        match tokio::net::lookup_host((address.host(), address.port())).await {
            Ok(mut found) => {
                if found.next().is_some() {
                    resolved.push(address.clone());
                } else {
                    warn!(address = %address, "Broker address resolved to nothing");
                    last_error = Some(format!("{} resolved to no addresses", address));
                }
            }
            Err(e) => {
                let error = TransportError::from(e);
                warn!(address = %address, error = %error, "Failed to resolve broker address");
                last_error = Some(format!("{}: {}", address, error));
            }
        }
    }

    if resolved.is_empty() {
        Err(ConnectError::Unreachable(
            last_error.unwrap_or_else(|| "no broker address".to_string()),
        ))
    } else {
        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ip_literals_skip_dns() {
        let addresses = vec![
            BrokerAddress::new("127.0.0.1", 9092).unwrap(),
            BrokerAddress::new("::1", 9093).unwrap(),
        ];
        let resolved = resolve_addresses(&addresses).await.unwrap();
        assert_eq!(resolved, addresses);
    }

    #[tokio::test]
    async fn dropped_completion_resolves_as_abandoned() {
        let (completion, receiver) = oneshot::channel();
        let mut handle = RecordHandle { receiver };
        assert!(handle.try_result().is_none());
        drop(completion);
        assert_eq!(handle.try_result(), Some(Err(SendError::Abandoned)));
    }

    #[tokio::test]
    async fn handle_yields_delivery() {
        let (completion, receiver) = oneshot::channel();
        let handle = RecordHandle { receiver };
        let metadata = RecordMetadata {
            topic: "orders".into(),
            partition: 1,
            offset: 7,
        };
        completion.send(Ok(metadata.clone())).unwrap();
        assert_eq!(handle.await, Ok(metadata));
    }

    #[test]
    fn terminal_states() {
        assert!(ClientState::Failed.is_terminal());
        assert!(ClientState::Closing.is_terminal());
        assert!(!ClientState::Ready.is_terminal());
    }
}
