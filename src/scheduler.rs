//! 发送调度
//!
//! 每个 `(topic, partition)` 一条 FIFO 队列，记录携带全局递增序号。
//! 每个 topic 同一时刻最多一个在途批次，批次只取"没有更早记录排在其他分区"
//! 的连续片段，因此同一 topic 的记录按调用顺序上线。
//!
//! 调度器不做任何 I/O，由 owner 任务驱动。

use bytes::Bytes;
use std::collections::{BTreeMap, HashMap, VecDeque};
use tokio::sync::{OwnedSemaphorePermit, oneshot};
use tokio::time::Instant;

use crate::client::RecordMetadata;
use crate::error::{SendError, TransportError};
use crate::transport::{OutboundRecord, ProduceRequest};

pub(crate) type Completion = oneshot::Sender<Result<RecordMetadata, SendError>>;

/// 已被接受、尚未解决的记录
///
/// 持有一个队列许可，记录被解决（或丢弃）时许可随之释放。
/// `seq` 在进入调度器时分配，0 表示尚未分配。
#[derive(Debug)]
pub(crate) struct PendingRecord {
    pub(crate) seq: u64,
    pub(crate) topic: String,
    pub(crate) key: Bytes,
    pub(crate) payload: Bytes,
    pub(crate) enqueued_at: Instant,
    completion: Completion,
    _permit: OwnedSemaphorePermit,
}

impl PendingRecord {
    pub(crate) fn new(
        topic: String,
        key: Bytes,
        payload: Bytes,
        completion: Completion,
        permit: OwnedSemaphorePermit,
    ) -> Self {
        Self {
            seq: 0,
            topic,
            key,
            payload,
            enqueued_at: Instant::now(),
            completion,
            _permit: permit,
        }
    }

    /// 解决记录；调用方已丢弃 handle 时忽略
    pub(crate) fn resolve(self, result: Result<RecordMetadata, SendError>) {
        let _ = self.completion.send(result);
    }
}

/// 发往单个分区的批次
#[derive(Debug)]
pub(crate) struct RecordBatch {
    pub(crate) topic: String,
    pub(crate) partition: i32,
    pub(crate) records: Vec<PendingRecord>,
    /// 已执行的重试次数
    pub(crate) attempt: usize,
}

impl RecordBatch {
    pub(crate) fn request(&self) -> ProduceRequest {
        ProduceRequest {
            topic: self.topic.clone(),
            partition: self.partition,
            records: self
                .records
                .iter()
                .map(|r| OutboundRecord {
                    key: r.key.clone(),
                    payload: r.payload.clone(),
                })
                .collect(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.records.len()
    }

    /// 按逐条结果确认记录
    ///
    /// 已写入的记录以各自的 offset 完成并移出批次，未写入的记录按原顺序留下等待重发。
    /// 返回已写入的数量和第一条未写入记录的原因。
    pub(crate) fn settle(
        &mut self,
        results: Vec<Result<i64, TransportError>>,
    ) -> (usize, Option<TransportError>) {
        let mut results = results.into_iter();
        let mut remaining = Vec::new();
        let mut delivered = 0;
        let mut error = None;

        for record in std::mem::take(&mut self.records) {
            match results.next() {
                Some(Ok(offset)) => {
                    delivered += 1;
                    record.resolve(Ok(RecordMetadata {
                        topic: self.topic.clone(),
                        partition: self.partition,
                        offset,
                    }));
                }
                Some(Err(e)) => {
                    error.get_or_insert(e);
                    remaining.push(record);
                }
                None => {
                    error.get_or_insert_with(|| {
                        TransportError::Transient("missing delivery report".to_string())
                    });
                    remaining.push(record);
                }
            }
        }

        self.records = remaining;
        (delivered, error)
    }

    pub(crate) fn fail(self, error: SendError) {
        for record in self.records {
            record.resolve(Err(error.clone()));
        }
    }
}

#[derive(Debug, Default)]
struct TopicQueue {
    /// 等待首次元数据的记录（尚未分配分区）
    parked: VecDeque<PendingRecord>,
    partitions: BTreeMap<i32, VecDeque<PendingRecord>>,
    in_flight: Option<RecordBatch>,
}

impl TopicQueue {
    fn queued(&self) -> usize {
        self.partitions.values().map(VecDeque::len).sum()
    }

    fn len(&self) -> usize {
        self.parked.len() + self.queued() + self.in_flight.as_ref().map_or(0, RecordBatch::len)
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 取出队首序号最小的连续片段
    fn next_run(&mut self, max_records: usize) -> Option<(i32, Vec<PendingRecord>)> {
        let mut fronts: Vec<(u64, i32)> = self
            .partitions
            .iter()
            .filter_map(|(id, queue)| queue.front().map(|r| (r.seq, *id)))
            .collect();
        fronts.sort_unstable();

        let (_, partition) = *fronts.first()?;
        let limit = fronts.get(1).map_or(u64::MAX, |(seq, _)| *seq);

        let queue = self.partitions.get_mut(&partition)?;
        let mut run = Vec::new();
        while run.len() < max_records && queue.front().is_some_and(|r| r.seq < limit) {
            if let Some(record) = queue.pop_front() {
                run.push(record);
            }
        }
        if queue.is_empty() {
            self.partitions.remove(&partition);
        }

        Some((partition, run))
    }
}

/// 发送调度器（仅 owner 任务持有）
#[derive(Debug)]
pub(crate) struct SendScheduler {
    topics: HashMap<String, TopicQueue>,
    max_batch_records: usize,
    next_seq: u64,
}

impl SendScheduler {
    pub(crate) fn new(max_batch_records: usize) -> Self {
        Self {
            topics: HashMap::new(),
            max_batch_records: max_batch_records.max(1),
            next_seq: 0,
        }
    }

    fn stamp(&mut self, record: &mut PendingRecord) {
        if record.seq == 0 {
            self.next_seq += 1;
            record.seq = self.next_seq;
        }
    }

    /// 放入指定分区的队列
    pub(crate) fn enqueue(&mut self, partition: i32, mut record: PendingRecord) {
        self.stamp(&mut record);
        self.topics
            .entry(record.topic.clone())
            .or_default()
            .partitions
            .entry(partition)
            .or_default()
            .push_back(record);
    }

    /// 暂存到首次元数据返回
    pub(crate) fn park(&mut self, mut record: PendingRecord) {
        self.stamp(&mut record);
        self.topics
            .entry(record.topic.clone())
            .or_default()
            .parked
            .push_back(record);
    }

    /// 该 topic 是否有记录在等待元数据；有则后续记录也必须排在其后
    pub(crate) fn has_parked(&self, topic: &str) -> bool {
        self.topics.get(topic).is_some_and(|q| !q.parked.is_empty())
    }

    /// 按接受顺序取出等待元数据的记录
    pub(crate) fn take_parked(&mut self, topic: &str) -> Vec<PendingRecord> {
        let Some(queue) = self.topics.get_mut(topic) else {
            return Vec::new();
        };
        let parked = queue.parked.drain(..).collect();
        self.prune(topic);
        parked
    }

    /// 为每个空闲 topic 切出下一个批次，返回需要发送的请求
    pub(crate) fn next_batches(&mut self) -> Vec<ProduceRequest> {
        let max = self.max_batch_records;
        let mut requests = Vec::new();

        for (topic, queue) in self.topics.iter_mut() {
            if queue.in_flight.is_some() {
                continue;
            }
            if let Some((partition, records)) = queue.next_run(max) {
                let batch = RecordBatch {
                    topic: topic.clone(),
                    partition,
                    records,
                    attempt: 0,
                };
                requests.push(batch.request());
                queue.in_flight = Some(batch);
            }
        }

        requests
    }

    /// 在途批次（用于重试）
    pub(crate) fn in_flight_mut(&mut self, topic: &str) -> Option<&mut RecordBatch> {
        self.topics.get_mut(topic)?.in_flight.as_mut()
    }

    /// 取出在途批次，topic 随即可以发送下一批
    pub(crate) fn complete(&mut self, topic: &str) -> Option<RecordBatch> {
        let batch = self.topics.get_mut(topic)?.in_flight.take();
        self.prune(topic);
        batch
    }

    /// 排队中（含等待元数据）的记录，不包括在途批次
    pub(crate) fn drain_queued(&mut self) -> Vec<PendingRecord> {
        let mut records: Vec<PendingRecord> = Vec::new();
        for queue in self.topics.values_mut() {
            records.extend(queue.parked.drain(..));
            for partition in std::mem::take(&mut queue.partitions).into_values() {
                records.extend(partition);
            }
        }
        self.topics.retain(|_, q| !q.is_empty());
        records.sort_by_key(|r| r.seq);
        records
    }

    /// 所有在途批次
    pub(crate) fn drain_in_flight(&mut self) -> Vec<RecordBatch> {
        let batches = self
            .topics
            .values_mut()
            .filter_map(|q| q.in_flight.take())
            .collect();
        self.topics.retain(|_, q| !q.is_empty());
        batches
    }

    /// 未解决记录数（排队、等待元数据、在途）
    pub(crate) fn pending(&self) -> usize {
        self.topics.values().map(TopicQueue::len).sum()
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.pending() == 0
    }

    fn prune(&mut self, topic: &str) {
        if self.topics.get(topic).is_some_and(TopicQueue::is_empty) {
            self.topics.remove(topic);
        }
    }
}
