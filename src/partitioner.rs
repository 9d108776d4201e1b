//! 分区选择
//!
//! 有 key 的记录使用与 Kafka Java 客户端一致的 murmur2 哈希；
//! 空 key 的记录在 topic 内轮询。

use crate::metadata::PartitionInfo;
use std::collections::HashMap;

/// Kafka 兼容的 murmur2 哈希（seed 0x9747b28c）
pub fn murmur2(data: &[u8]) -> u32 {
    const SEED: u32 = 0x9747b28c;
    const M: u32 = 0x5bd1e995;
    const R: u32 = 24;

    let len = data.len();
    let mut h: u32 = SEED ^ (len as u32);

    let mut chunks = data.chunks_exact(4);
    for chunk in &mut chunks {
        let mut k = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        k = k.wrapping_mul(M);
        k ^= k >> R;
        k = k.wrapping_mul(M);
        h = h.wrapping_mul(M);
        h ^= k;
    }

    let tail = chunks.remainder();
    if tail.len() >= 3 {
        h ^= (tail[2] as u32) << 16;
    }
    if tail.len() >= 2 {
        h ^= (tail[1] as u32) << 8;
    }
    if !tail.is_empty() {
        h ^= tail[0] as u32;
        h = h.wrapping_mul(M);
    }

    h ^= h >> 13;
    h = h.wrapping_mul(M);
    h ^= h >> 15;
    h
}

/// `toPositive(murmur2(key)) % n`
pub fn murmur2_partition(key: &[u8], num_partitions: usize) -> usize {
    (murmur2(key) & 0x7fff_ffff) as usize % num_partitions
}

/// 分区选择器（仅 owner 任务使用）
#[derive(Debug, Default)]
pub(crate) struct Partitioner {
    round_robin: HashMap<String, usize>,
}

impl Partitioner {
    /// 为记录选择目标分区 ID；分区列表为空时返回 `None`
    pub(crate) fn select(
        &mut self,
        topic: &str,
        key: &[u8],
        partitions: &[PartitionInfo],
    ) -> Option<i32> {
        if partitions.is_empty() {
            return None;
        }

        let index = if key.is_empty() {
            let counter = self.round_robin.entry(topic.to_string()).or_insert(0);
            let index = *counter % partitions.len();
            *counter = counter.wrapping_add(1);
            index
        } else {
            murmur2_partition(key, partitions.len())
        };

        Some(partitions[index].id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn partitions(n: i32) -> Vec<PartitionInfo> {
        (0..n).map(|id| PartitionInfo::new(id, Some(0), vec![0])).collect()
    }

    #[test]
    fn matches_kafka_reference_hashes() {
        assert_eq!(murmur2(b"21") as i32, -973932308);
        assert_eq!(murmur2(b"foobar") as i32, -790332482);
        assert_eq!(murmur2(b"a-little-bit-long-string") as i32, -985981536);
        assert_eq!(murmur2(b"abc") as i32, 479470107);
    }

    #[test]
    fn keyed_records_are_sticky() {
        let mut partitioner = Partitioner::default();
        let parts = partitions(3);
        let first = partitioner.select("orders", b"k1", &parts);
        let second = partitioner.select("orders", b"k1", &parts);
        assert_eq!(first, second);
        assert_eq!(first, Some(2));
    }

    #[test]
    fn empty_keys_round_robin_per_topic() {
        let mut partitioner = Partitioner::default();
        let parts = partitions(2);
        let picks: Vec<_> = (0..4)
            .map(|_| partitioner.select("events", b"", &parts).unwrap())
            .collect();
        assert_eq!(picks, vec![0, 1, 0, 1]);

        // 另一个 topic 有独立的计数器
        assert_eq!(partitioner.select("audit", b"", &parts), Some(0));
    }

    #[test]
    fn no_partitions_yields_none() {
        let mut partitioner = Partitioner::default();
        assert_eq!(partitioner.select("orders", b"k", &[]), None);
    }
}
