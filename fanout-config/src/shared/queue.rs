use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::shared::{PartitionerConfig, ValidationError};

/// Settings for the parallel queue that fans the transaction stream out to channels.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ParallelQueueConfig {
    /// Number of independent channels transactions are distributed across.
    #[serde(default = "default_channels")]
    pub channels: usize,
    /// Strategy used to map a shard key to a channel.
    #[serde(default)]
    pub partitioner: PartitionerConfig,
    /// Maximum distance, in seconds of source commit time, a lagging channel may trail the
    /// channels that still hold pending work before its releases are held back.
    #[serde(default = "default_max_offline_interval_secs")]
    pub max_offline_interval_secs: u64,
    /// Seconds after which a held-back channel is released anyway. `-1` disables the override.
    #[serde(default = "default_max_delay_interval_secs")]
    pub max_delay_interval_secs: i64,
    /// Maximum number of transaction fragments buffered per channel.
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,
    /// Emits a sync control event every `sync_interval` accepted events per channel.
    #[serde(default)]
    pub sync_interval: Option<u64>,
    /// Channel that receives transactions which cannot be safely parallelized.
    #[serde(default)]
    pub serialization_channel: usize,
}

impl ParallelQueueConfig {
    /// Default number of channels.
    pub const DEFAULT_CHANNELS: usize = 1;

    /// Default offline interval, in seconds.
    pub const DEFAULT_MAX_OFFLINE_INTERVAL_SECS: u64 = 5;

    /// Default delay override, disabled.
    pub const DEFAULT_MAX_DELAY_INTERVAL_SECS: i64 = -1;

    /// Default per-channel buffer capacity.
    pub const DEFAULT_MAX_QUEUE_SIZE: usize = 1000;

    /// Returns the offline interval as a [`Duration`].
    pub fn max_offline_interval(&self) -> Duration {
        Duration::from_secs(self.max_offline_interval_secs)
    }

    /// Returns the delay override, or `None` when it is disabled.
    pub fn max_delay_interval(&self) -> Option<Duration> {
        u64::try_from(self.max_delay_interval_secs)
            .ok()
            .map(Duration::from_secs)
    }

    /// Validates queue settings.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.channels == 0 {
            return Err(ValidationError::ChannelsZero);
        }

        if self.max_queue_size == 0 {
            return Err(ValidationError::MaxQueueSizeZero);
        }

        if self.serialization_channel >= self.channels {
            return Err(ValidationError::SerializationChannelOutOfRange {
                channel: self.serialization_channel,
                channels: self.channels,
            });
        }

        if self.max_delay_interval_secs < -1 {
            return Err(ValidationError::InvalidFieldValue {
                field: "max_delay_interval_secs".to_string(),
                constraint: "must be -1 (disabled) or a non-negative number of seconds"
                    .to_string(),
            });
        }

        if self.sync_interval == Some(0) {
            return Err(ValidationError::InvalidFieldValue {
                field: "sync_interval".to_string(),
                constraint: "must be greater than 0 when set".to_string(),
            });
        }

        self.partitioner.validate(self.channels)
    }
}

impl Default for ParallelQueueConfig {
    fn default() -> Self {
        Self {
            channels: default_channels(),
            partitioner: PartitionerConfig::default(),
            max_offline_interval_secs: default_max_offline_interval_secs(),
            max_delay_interval_secs: default_max_delay_interval_secs(),
            max_queue_size: default_max_queue_size(),
            sync_interval: None,
            serialization_channel: 0,
        }
    }
}

fn default_channels() -> usize {
    ParallelQueueConfig::DEFAULT_CHANNELS
}

fn default_max_offline_interval_secs() -> u64 {
    ParallelQueueConfig::DEFAULT_MAX_OFFLINE_INTERVAL_SECS
}

fn default_max_delay_interval_secs() -> i64 {
    ParallelQueueConfig::DEFAULT_MAX_DELAY_INTERVAL_SECS
}

fn default_max_queue_size() -> usize {
    ParallelQueueConfig::DEFAULT_MAX_QUEUE_SIZE
}
