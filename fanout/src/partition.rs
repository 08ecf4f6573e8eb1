//! Shard to channel assignment.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use fanout_config::shared::PartitionerConfig;

/// Maps a shard key to one of the queue channels.
///
/// Implementations must be deterministic: the same shard and channel count always yield the
/// same channel, otherwise transactions of one shard could be applied out of order.
pub trait Partitioner: fmt::Debug + Send + Sync {
    /// Returns the channel in `0..channels` for `shard_id`.
    fn partition(&self, shard_id: &str, channels: usize) -> usize;
}

/// Deterministic hash used to select a channel for a shard key.
pub fn hash_shard_key(key: impl AsRef<[u8]>) -> u64 {
    // 64-bit FNV-1a, stable across toolchains and processes.
    const OFFSET_BASIS: u64 = 0xcbf29ce484222325;
    const PRIME: u64 = 0x100000001b3;
    key.as_ref().iter().fold(OFFSET_BASIS, |hash, byte| {
        (hash ^ u64::from(*byte)).wrapping_mul(PRIME)
    })
}

/// Assigns shards by hashing the shard key modulo the channel count.
#[derive(Debug, Default, Clone, Copy)]
pub struct HashPartitioner;

impl Partitioner for HashPartitioner {
    fn partition(&self, shard_id: &str, channels: usize) -> usize {
        if channels <= 1 {
            return 0;
        }

        (hash_shard_key(shard_id) % channels as u64) as usize
    }
}

/// Pins listed shards to fixed channels and hashes the rest.
#[derive(Debug, Default, Clone)]
pub struct ShardMapPartitioner {
    shards: BTreeMap<String, usize>,
    fallback: HashPartitioner,
}

impl ShardMapPartitioner {
    pub fn new(shards: BTreeMap<String, usize>) -> Self {
        Self {
            shards,
            fallback: HashPartitioner,
        }
    }
}

impl Partitioner for ShardMapPartitioner {
    fn partition(&self, shard_id: &str, channels: usize) -> usize {
        match self.shards.get(shard_id) {
            Some(channel) if *channel < channels => *channel,
            _ => self.fallback.partition(shard_id, channels),
        }
    }
}

/// Builds the partitioner described by `config`.
pub fn build_partitioner(config: &PartitionerConfig) -> Arc<dyn Partitioner> {
    match config {
        PartitionerConfig::Hash => Arc::new(HashPartitioner),
        PartitionerConfig::ShardMap { shards } => Arc::new(ShardMapPartitioner::new(shards.clone())),
    }
}
