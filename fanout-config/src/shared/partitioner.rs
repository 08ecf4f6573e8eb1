use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::shared::ValidationError;

/// Strategy used to assign shard keys to channels.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PartitionerConfig {
    /// Hash the shard key modulo the channel count.
    #[default]
    Hash,
    /// Pin listed shards to fixed channels and hash every other shard.
    ShardMap {
        /// Explicit shard key to channel assignments.
        #[serde(default)]
        shards: BTreeMap<String, usize>,
    },
}

impl PartitionerConfig {
    /// Validates the partitioner against the configured channel count.
    pub fn validate(&self, channels: usize) -> Result<(), ValidationError> {
        if let PartitionerConfig::ShardMap { shards } = self
            && let Some((shard, channel)) = shards.iter().find(|(_, channel)| **channel >= channels)
        {
            return Err(ValidationError::InvalidFieldValue {
                field: format!("partitioner.shards.{shard}"),
                constraint: format!("channel {channel} must be lower than {channels}"),
            });
        }

        Ok(())
    }
}
