//! 生产者统计
//!
//! 原子计数器，调用方通过 `ProducerClient::stats()` 获取快照。
//! 不负责向任何指标后端注册。

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub(crate) struct ProducerStats {
    pub(crate) records_accepted: AtomicU64,
    pub(crate) records_delivered: AtomicU64,
    pub(crate) records_failed: AtomicU64,
    pub(crate) records_abandoned: AtomicU64,
    pub(crate) queue_full_rejections: AtomicU64,
    pub(crate) batches_sent: AtomicU64,
    pub(crate) retries: AtomicU64,
    pub(crate) metadata_refreshes: AtomicU64,
    pub(crate) coalesced_refreshes: AtomicU64,
}

impl ProducerStats {
    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add(counter: &AtomicU64, n: usize) {
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self, pending: usize) -> ProducerStatsSnapshot {
        ProducerStatsSnapshot {
            records_accepted: self.records_accepted.load(Ordering::Relaxed),
            records_delivered: self.records_delivered.load(Ordering::Relaxed),
            records_failed: self.records_failed.load(Ordering::Relaxed),
            records_abandoned: self.records_abandoned.load(Ordering::Relaxed),
            queue_full_rejections: self.queue_full_rejections.load(Ordering::Relaxed),
            batches_sent: self.batches_sent.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            metadata_refreshes: self.metadata_refreshes.load(Ordering::Relaxed),
            coalesced_refreshes: self.coalesced_refreshes.load(Ordering::Relaxed),
            pending_records: pending as u64,
        }
    }
}

/// 统计快照
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProducerStatsSnapshot {
    /// `send` 接受的记录数
    pub records_accepted: u64,
    /// 已确认的记录数
    pub records_delivered: u64,
    /// 确定失败的记录数（Rejected / Closed）
    pub records_failed: u64,
    /// 结果未知的记录数
    pub records_abandoned: u64,
    /// 因队列已满被拒绝的 `send` 调用数
    pub queue_full_rejections: u64,
    /// 发出的 produce 请求数（含重试）
    pub batches_sent: u64,
    pub retries: u64,
    /// 元数据往返次数（含 bootstrap）
    pub metadata_refreshes: u64,
    /// 合并到已有刷新的请求数
    pub coalesced_refreshes: u64,
    /// 当前未解决的记录数
    pub pending_records: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reads_counters() {
        let stats = ProducerStats::default();
        ProducerStats::incr(&stats.records_accepted);
        ProducerStats::add(&stats.records_delivered, 3);
        let snapshot = stats.snapshot(2);
        assert_eq!(snapshot.records_accepted, 1);
        assert_eq!(snapshot.records_delivered, 3);
        assert_eq!(snapshot.pending_records, 2);
    }

    #[test]
    fn snapshot_serializes_to_json() {
        let json = serde_json::to_value(ProducerStatsSnapshot::default()).unwrap();
        assert_eq!(json["queue_full_rejections"], 0);
    }
}
