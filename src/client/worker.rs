//! owner 任务
//!
//! 独占传输实例、元数据缓存、发送调度器与分区选择器。所有网络调用以 future
//! 的形式放进同一个 `FuturesUnordered`，在本任务内并发推进。

use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, sleep, sleep_until, timeout};
use tracing::{debug, error, info, warn};

use super::{ClientState, Shared};
use crate::error::{CloseError, ConnectError, MetadataError, SendError, TransportError};
use crate::metadata::{ClusterMetadata, MetadataCache, PartitionInfo};
use crate::partitioner::Partitioner;
use crate::retry::{self, RetryPolicy};
use crate::scheduler::{PendingRecord, SendScheduler};
use crate::stats::ProducerStats;
use crate::transport::{BrokerTransport, MetadataScope, ProduceAck, ProduceRequest, SessionConfig};

type MetadataReply = oneshot::Sender<Result<Vec<PartitionInfo>, MetadataError>>;
type ListReply = oneshot::Sender<Result<Vec<String>, MetadataError>>;
type CloseReply = oneshot::Sender<Result<(), CloseError>>;

/// 客户端发往 owner 任务的命令
pub(crate) enum Command {
    Send(PendingRecord),
    Refresh { topic: String, reply: MetadataReply },
    ListTopics { reply: ListReply },
    Close { deadline: Instant, reply: CloseReply },
}

/// 网络 future 完成后产生的事件
enum Event {
    Refreshed {
        topic: String,
        result: Result<ClusterMetadata, TransportError>,
    },
    Listed {
        result: Result<ClusterMetadata, TransportError>,
    },
    Produced {
        topic: String,
        result: Result<ProduceAck, TransportError>,
    },
    RetryDue {
        topic: String,
    },
}

struct Closing {
    deadline: Instant,
    waiters: Vec<CloseReply>,
}

pub(crate) struct Worker {
    shared: Arc<Shared>,
    transport: Arc<dyn BrokerTransport>,
    cache: MetadataCache,
    scheduler: SendScheduler,
    partitioner: Partitioner,
    retry: Arc<dyn RetryPolicy>,
    commands: mpsc::UnboundedReceiver<Command>,
    commands_open: bool,
    tasks: FuturesUnordered<BoxFuture<'static, Event>>,
    /// 进行中的单 topic 刷新及其等待者
    refreshes: HashMap<String, Vec<MetadataReply>>,
    /// 进行中的全量刷新等待者
    listing: Option<Vec<ListReply>>,
    closing: Option<Closing>,
    fatal: Option<TransportError>,
}

impl Worker {
    pub(crate) fn new(
        shared: Arc<Shared>,
        transport: Arc<dyn BrokerTransport>,
        cache: MetadataCache,
        commands: mpsc::UnboundedReceiver<Command>,
    ) -> Self {
        let scheduler = SendScheduler::new(shared.config.max_batch_records);
        let retry = Arc::from(retry::from_config(&shared.config));
        Self {
            shared,
            transport,
            cache,
            scheduler,
            partitioner: Partitioner::default(),
            retry,
            commands,
            commands_open: true,
            tasks: FuturesUnordered::new(),
            refreshes: HashMap::new(),
            listing: None,
            closing: None,
            fatal: None,
        }
    }

    pub(crate) async fn run(
        mut self,
        session: SessionConfig,
        startup: oneshot::Sender<Result<(), ConnectError>>,
    ) {
        self.shared.set_state(ClientState::Connecting);

        let connect_timeout = self.shared.config.connect_timeout;
        let connected = match timeout(connect_timeout, self.bootstrap(&session)).await {
            Ok(result) => result,
            Err(_) => Err(ConnectError::Unreachable(format!(
                "connect timed out after {:?}",
                connect_timeout
            ))),
        };

        if let Err(e) = connected {
            warn!(bootstrap = %session.bootstrap_servers(), error = %e, "Failed to connect producer");
            let _ = self.transport.close().await;
            self.shared.set_state(ClientState::Disconnected);
            let _ = startup.send(Err(e));
            return;
        }

        self.shared.set_state(ClientState::Ready);
        if startup.send(Ok(())).is_err() {
            // 调用方放弃了 connect
            let _ = self.transport.close().await;
            self.shared.set_state(ClientState::Closed);
            return;
        }

        self.event_loop().await;
    }

    async fn bootstrap(&mut self, session: &SessionConfig) -> Result<(), ConnectError> {
        self.transport.connect(session).await?;

        ProducerStats::incr(&self.shared.stats.metadata_refreshes);
        let metadata = self.transport.fetch_metadata(&MetadataScope::Bootstrap).await?;
        debug!(brokers = metadata.brokers.len(), "Bootstrap metadata fetched");
        self.cache.merge(metadata, Instant::now());
        Ok(())
    }

    async fn event_loop(mut self) {
        loop {
            if let Some(reason) = self.fatal.take() {
                self.fail(reason).await;
                return;
            }

            let deadline = self.closing.as_ref().map(|c| c.deadline);

            if let Some(deadline) = deadline {
                if !self.commands_open && self.scheduler.is_idle() {
                    self.finish(Ok(())).await;
                    return;
                }
                if !self.commands_open && Instant::now() >= deadline {
                    let abandoned = self.abandon();
                    self.finish(Err(CloseError::Incomplete(abandoned))).await;
                    return;
                }
            }

            tokio::select! {
                biased;

                command = self.commands.recv(), if self.commands_open => match command {
                    Some(command) => self.handle_command(command),
                    None => {
                        self.commands_open = false;
                        if self.closing.is_none() {
                            self.dropped().await;
                            return;
                        }
                    }
                },

                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {}

                Some(event) = self.tasks.next(), if !self.tasks.is_empty() => self.handle_event(event),
            }

            if self.fatal.is_none() {
                self.pump();
            }
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Send(record) => self.handle_send(record),
            Command::Refresh { topic, reply } => {
                if self.closing.is_some() {
                    let _ = reply.send(Err(MetadataError::Closed));
                    return;
                }
                let now = Instant::now();
                if self.cache.is_fresh(&topic, now) {
                    // 排队期间已有刷新完成
                    let partitions = self.cache.partitions(&topic).map(<[_]>::to_vec);
                    let _ = reply.send(partitions.ok_or(MetadataError::UnknownTopic(topic)));
                    return;
                }
                self.request_refresh(topic, Some(reply));
            }
            Command::ListTopics { reply } => {
                if self.closing.is_some() {
                    let _ = reply.send(Err(MetadataError::Closed));
                    return;
                }
                self.request_listing(reply);
            }
            Command::Close { deadline, reply } => match &mut self.closing {
                Some(closing) => closing.waiters.push(reply),
                None => {
                    info!(
                        client_id = %self.shared.config.client_id,
                        pending = self.scheduler.pending(),
                        "Closing producer client"
                    );
                    self.shared.set_state(ClientState::Closing);
                    self.closing = Some(Closing {
                        deadline,
                        waiters: vec![reply],
                    });
                    // 已缓冲的命令仍会被处理
                    self.commands.close();
                }
            },
        }
    }

    fn handle_send(&mut self, record: PendingRecord) {
        if self.closing.is_some() {
            // 与 close 并发的 send 排在 Close 之后到达
            ProducerStats::incr(&self.shared.stats.records_failed);
            record.resolve(Err(SendError::Closed));
            return;
        }

        let topic = record.topic.clone();

        if self.scheduler.has_parked(&topic) {
            self.scheduler.park(record);
            return;
        }

        if self.cache.partitions(&topic).is_some() {
            let stale = !self.cache.is_fresh(&topic, Instant::now());
            self.place(record);
            if stale {
                debug!(topic = %topic, "Sending with stale metadata, refreshing in background");
                self.request_refresh(topic, None);
            }
        } else {
            self.scheduler.park(record);
            self.request_refresh(topic, None);
        }
    }

    /// 按当前缓存选择分区并入队
    fn place(&mut self, record: PendingRecord) {
        let partition = self
            .cache
            .partitions(&record.topic)
            .and_then(|partitions| self.partitioner.select(&record.topic, &record.key, partitions));

        match partition {
            Some(partition) => self.scheduler.enqueue(partition, record),
            None => {
                let reason = format!("topic {} has no partitions", record.topic);
                self.reject(vec![record], reason);
            }
        }
    }

    fn reject(&self, records: Vec<PendingRecord>, reason: String) {
        if records.is_empty() {
            return;
        }
        ProducerStats::add(&self.shared.stats.records_failed, records.len());
        for record in records {
            record.resolve(Err(SendError::Rejected(reason.clone())));
        }
    }

    fn request_refresh(&mut self, topic: String, waiter: Option<MetadataReply>) {
        match self.refreshes.entry(topic) {
            Entry::Occupied(mut entry) => {
                ProducerStats::incr(&self.shared.stats.coalesced_refreshes);
                entry.get_mut().extend(waiter);
            }
            Entry::Vacant(entry) => {
                let topic = entry.key().clone();
                entry.insert(waiter.into_iter().collect());
                debug!(topic = %topic, "Refreshing topic metadata");

                let fetch = self.fetch(MetadataScope::Topics(vec![topic.clone()]));
                self.tasks.push(
                    async move {
                        let result = fetch.await;
                        Event::Refreshed { topic, result }
                    }
                    .boxed(),
                );
            }
        }
    }

    fn request_listing(&mut self, reply: ListReply) {
        if let Some(waiters) = &mut self.listing {
            ProducerStats::incr(&self.shared.stats.coalesced_refreshes);
            waiters.push(reply);
            return;
        }
        self.listing = Some(vec![reply]);

        let fetch = self.fetch(MetadataScope::All);
        self.tasks.push(
            async move {
                let result = fetch.await;
                Event::Listed { result }
            }
            .boxed(),
        );
    }

    /// 一次元数据刷新：可重试错误按重试策略退避，总时长不超过 `metadata_timeout`
    fn fetch(&self, scope: MetadataScope) -> BoxFuture<'static, Result<ClusterMetadata, TransportError>> {
        let transport = self.transport.clone();
        let retry = self.retry.clone();
        let shared = self.shared.clone();
        let limit = self.shared.config.metadata_timeout;

        async move {
            let attempts = async {
                let mut attempt = 0;
                loop {
                    ProducerStats::incr(&shared.stats.metadata_refreshes);
                    match transport.fetch_metadata(&scope).await {
                        Err(e) if retry.should_retry(attempt, &e) => {
                            debug!(scope = ?scope, attempt, error = %e, "Retrying metadata fetch");
                            sleep(retry.backoff_duration(attempt)).await;
                            attempt += 1;
                        }
                        result => return result,
                    }
                }
            };
            timeout(limit, attempts)
                .await
                .unwrap_or(Err(TransportError::Timeout))
        }
        .boxed()
    }

    fn spawn_produce(&mut self, request: ProduceRequest) {
        let transport = self.transport.clone();
        let limit = self.shared.config.request_timeout;
        let topic = request.topic.clone();
        ProducerStats::incr(&self.shared.stats.batches_sent);

        self.tasks.push(
            async move {
                let result = timeout(limit, transport.produce(request))
                    .await
                    .unwrap_or(Err(TransportError::Timeout));
                Event::Produced { topic, result }
            }
            .boxed(),
        );
    }

    /// 为空闲 topic 发出下一批
    fn pump(&mut self) {
        for request in self.scheduler.next_batches() {
            self.spawn_produce(request);
        }
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Refreshed { topic, result } => self.on_refreshed(topic, result),
            Event::Listed { result } => self.on_listed(result),
            Event::Produced { topic, result } => self.on_produced(topic, result),
            Event::RetryDue { topic } => {
                if let Some(batch) = self.scheduler.in_flight_mut(&topic) {
                    let request = batch.request();
                    self.spawn_produce(request);
                }
            }
        }
    }

    fn on_refreshed(&mut self, topic: String, result: Result<ClusterMetadata, TransportError>) {
        let waiters = self.refreshes.remove(&topic).unwrap_or_default();

        let metadata = match result {
            Ok(metadata) => metadata,
            Err(e) if e.is_fatal() => {
                self.fatal = Some(e);
                // 等待者在 fail() 中以超时结束
                self.refreshes.insert(topic, waiters);
                return;
            }
            Err(e) => {
                warn!(topic = %topic, error = %e, "Metadata refresh failed");
                let reply = MetadataError::from(e.clone());
                for waiter in waiters {
                    let _ = waiter.send(Err(reply.clone()));
                }
                let parked = self.scheduler.take_parked(&topic);
                self.reject(parked, format!("metadata refresh failed: {}", e));
                return;
            }
        };

        let partitions = metadata.topic(&topic).map(|t| t.partitions.clone());
        self.cache.merge(metadata, Instant::now());

        match partitions {
            Some(partitions) => {
                debug!(topic = %topic, partitions = partitions.len(), "Topic metadata refreshed");
                for waiter in waiters {
                    let _ = waiter.send(Ok(partitions.clone()));
                }
                for record in self.scheduler.take_parked(&topic) {
                    self.place(record);
                }
            }
            None => {
                warn!(topic = %topic, "Broker does not know topic");
                self.cache.forget(&topic);
                for waiter in waiters {
                    let _ = waiter.send(Err(MetadataError::UnknownTopic(topic.clone())));
                }
                let parked = self.scheduler.take_parked(&topic);
                self.reject(parked, format!("unknown topic {}", topic));
            }
        }
    }

    fn on_listed(&mut self, result: Result<ClusterMetadata, TransportError>) {
        let waiters = self.listing.take().unwrap_or_default();

        match result {
            Ok(metadata) => {
                let mut names: Vec<String> = metadata.topics.iter().map(|t| t.name.clone()).collect();
                names.sort();
                self.cache.merge(metadata, Instant::now());
                for waiter in waiters {
                    let _ = waiter.send(Ok(names.clone()));
                }
            }
            Err(e) if e.is_fatal() => {
                self.fatal = Some(e);
                self.listing = Some(waiters);
            }
            Err(e) => {
                warn!(error = %e, "Failed to list topics");
                for waiter in waiters {
                    let _ = waiter.send(Err(MetadataError::Timeout));
                }
            }
        }
    }

    fn on_produced(&mut self, topic: String, result: Result<ProduceAck, TransportError>) {
        let error = match result {
            Ok(ack) => {
                let Some(batch) = self.scheduler.in_flight_mut(&topic) else {
                    return;
                };
                let oldest = batch.records.first().map(|r| r.enqueued_at.elapsed());
                let partition = batch.partition;
                let (delivered, failure) = batch.settle(ack.records);
                ProducerStats::add(&self.shared.stats.records_delivered, delivered);

                match failure {
                    None => {
                        debug!(
                            topic = %topic,
                            partition,
                            records = delivered,
                            latency = ?oldest,
                            "Batch delivered"
                        );
                        self.scheduler.complete(&topic);
                        return;
                    }
                    Some(e) => {
                        warn!(
                            topic = %topic,
                            partition,
                            delivered,
                            error = %e,
                            "Batch partially delivered"
                        );
                        e
                    }
                }
            }
            Err(e) => e,
        };

        if error.is_fatal() {
            self.fatal = Some(error);
            return;
        }

        let retry = self.retry.clone();
        let Some(batch) = self.scheduler.in_flight_mut(&topic) else {
            return;
        };

        if retry.should_retry(batch.attempt, &error) {
            let backoff = retry.backoff_duration(batch.attempt);
            batch.attempt += 1;
            warn!(
                topic = %topic,
                partition = batch.partition,
                attempt = batch.attempt,
                backoff = ?backoff,
                error = %error,
                "Produce failed, retrying"
            );
            ProducerStats::incr(&self.shared.stats.retries);
            self.tasks.push(
                async move {
                    sleep(backoff).await;
                    Event::RetryDue { topic }
                }
                .boxed(),
            );
            return;
        }

        if let Some(batch) = self.scheduler.complete(&topic) {
            error!(
                topic = %topic,
                partition = batch.partition,
                records = batch.len(),
                attempts = batch.attempt + 1,
                error = %error,
                "Produce failed, rejecting batch"
            );
            if matches!(error, TransportError::UnknownTopic(_)) {
                self.cache.forget(&topic);
            }
            let failure = SendError::from(error);
            let counter = if failure.is_definite() {
                &self.shared.stats.records_failed
            } else {
                &self.shared.stats.records_abandoned
            };
            ProducerStats::add(counter, batch.len());
            batch.fail(failure);
        }
    }

    /// 放弃所有未完成的记录，返回数量
    fn abandon(&mut self) -> usize {
        let queued = self.scheduler.drain_queued();
        let in_flight = self.scheduler.drain_in_flight();
        let count = queued.len() + in_flight.iter().map(|b| b.len()).sum::<usize>();

        for record in queued {
            record.resolve(Err(SendError::Abandoned));
        }
        for batch in in_flight {
            batch.fail(SendError::Abandoned);
        }
        self.tasks.clear();

        for (_, waiters) in self.refreshes.drain() {
            for waiter in waiters {
                let _ = waiter.send(Err(MetadataError::Closed));
            }
        }
        for waiter in self.listing.take().unwrap_or_default() {
            let _ = waiter.send(Err(MetadataError::Closed));
        }

        ProducerStats::add(&self.shared.stats.records_abandoned, count);
        count
    }

    async fn release_transport(&mut self, limit: Option<Instant>) {
        let closed = match limit {
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                timeout(remaining, self.transport.close())
                    .await
                    .unwrap_or(Err(TransportError::Timeout))
            }
            None => self.transport.close().await,
        };
        if let Err(e) = closed {
            warn!(error = %e, "Failed to release producer transport");
        }
    }

    /// 关闭完成（排空或超时）
    async fn finish(mut self, result: Result<(), CloseError>) {
        let Some(closing) = self.closing.take() else {
            return;
        };

        self.release_transport(Some(closing.deadline)).await;
        self.shared.set_state(ClientState::Closed);

        match &result {
            Ok(()) => info!(client_id = %self.shared.config.client_id, "Producer client closed"),
            Err(e) => warn!(client_id = %self.shared.config.client_id, error = %e, "Producer client closed with pending records"),
        }

        for waiter in closing.waiters {
            let _ = waiter.send(result.clone());
        }
    }

    /// 客户端未调用 close 就被丢弃
    async fn dropped(mut self) {
        let abandoned = self.abandon();
        if abandoned > 0 {
            warn!(abandoned, "Producer client dropped with pending records");
        }
        self.release_transport(None).await;
        self.shared.set_state(ClientState::Closed);
    }

    /// 连接不可恢复地丢失
    async fn fail(mut self, reason: TransportError) {
        error!(client_id = %self.shared.config.client_id, error = %reason, "Producer connection lost");
        self.shared.set_state(ClientState::Failed);

        let queued = self.scheduler.drain_queued();
        ProducerStats::add(&self.shared.stats.records_failed, queued.len());
        for record in queued {
            record.resolve(Err(SendError::Closed));
        }

        // 在途批次结果未知
        let in_flight = self.scheduler.drain_in_flight();
        let abandoned: usize = in_flight.iter().map(|b| b.len()).sum();
        ProducerStats::add(&self.shared.stats.records_abandoned, abandoned);
        for batch in in_flight {
            batch.fail(SendError::Abandoned);
        }
        self.tasks.clear();

        // 进行中的 close 同样要报告结果未知的记录
        let outcome = if abandoned > 0 {
            Err(CloseError::Incomplete(abandoned))
        } else {
            Ok(())
        };

        for (_, waiters) in self.refreshes.drain() {
            for waiter in waiters {
                let _ = waiter.send(Err(MetadataError::Timeout));
            }
        }
        for waiter in self.listing.take().unwrap_or_default() {
            let _ = waiter.send(Err(MetadataError::Timeout));
        }

        self.commands.close();
        while let Ok(command) = self.commands.try_recv() {
            match command {
                Command::Send(record) => {
                    ProducerStats::incr(&self.shared.stats.records_failed);
                    record.resolve(Err(SendError::Closed));
                }
                Command::Refresh { reply, .. } => {
                    let _ = reply.send(Err(MetadataError::Timeout));
                }
                Command::ListTopics { reply } => {
                    let _ = reply.send(Err(MetadataError::Timeout));
                }
                Command::Close { reply, .. } => {
                    let _ = reply.send(outcome.clone());
                }
            }
        }
        if let Some(closing) = self.closing.take() {
            for waiter in closing.waiters {
                let _ = waiter.send(outcome.clone());
            }
        }

        self.release_transport(None).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProducerConfig;
    use crate::transport::MemoryCluster;
    use bytes::Bytes;
    use std::time::Duration;
    use tokio::sync::{Semaphore, watch};

    #[tokio::test]
    async fn sends_queued_behind_close_are_refused() {
        let cluster = MemoryCluster::with_topics(&[("orders", 1)]);
        let config = ProducerConfig::from_bootstrap("127.0.0.1:9092", false).unwrap();
        let session = SessionConfig::new(&config, config.addresses.clone());
        let (cache, metadata) = MetadataCache::new(config.metadata_max_age);
        let (state, _) = watch::channel(ClientState::Disconnected);
        let permits = Arc::new(Semaphore::new(config.send_queue_capacity));
        let shared = Arc::new(Shared {
            config,
            state,
            metadata,
            permits: permits.clone(),
            stats: ProducerStats::default(),
        });

        // send 通过了 Ready 检查，但命令排在 Close 之后
        let (commands, receiver) = mpsc::unbounded_channel();
        let (reply, closed) = oneshot::channel();
        let deadline = Instant::now() + Duration::from_secs(5);
        commands.send(Command::Close { deadline, reply }).unwrap();

        let (completion, outcome) = oneshot::channel();
        let record = PendingRecord::new(
            "orders".to_string(),
            Bytes::new(),
            Bytes::from_static(b"late"),
            completion,
            permits.clone().try_acquire_owned().unwrap(),
        );
        commands.send(Command::Send(record)).unwrap();

        let (startup, started) = oneshot::channel();
        let worker = Worker::new(shared.clone(), Arc::new(cluster.transport()), cache, receiver);
        tokio::spawn(worker.run(session, startup));
        started.await.unwrap().unwrap();

        assert_eq!(closed.await.unwrap(), Ok(()));
        assert_eq!(outcome.await.unwrap(), Err(SendError::Closed));
        assert!(cluster.produce_attempts().is_empty());
        assert_eq!(shared.stats.snapshot(0).records_failed, 1);
        assert_eq!(permits.available_permits(), shared.config.send_queue_capacity);
        assert_eq!(shared.state(), ClientState::Closed);
    }
}
