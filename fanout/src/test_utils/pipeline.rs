use fanout_config::shared::{ParallelQueueConfig, PartitionerConfig, PipelineConfig};

use crate::applier::Applier;
use crate::log::LogReader;
use crate::pipeline::{Pipeline, PipelineId};
use crate::test_utils::event::shard;

/// Creates a queue configuration pinning shard `shard-i` to channel `i`.
///
/// The offline interval is wide enough for the interval guard to stay out of the way of tests
/// that do not exercise it.
pub fn test_queue_config(channels: usize) -> ParallelQueueConfig {
    let shards = (0..channels).map(|channel| (shard(channel), channel)).collect();

    ParallelQueueConfig {
        channels,
        partitioner: PartitionerConfig::ShardMap { shards },
        max_offline_interval_secs: 3600,
        max_delay_interval_secs: -1,
        max_queue_size: 100,
        sync_interval: None,
        serialization_channel: 0,
    }
}

/// Creates a pipeline configuration around [`test_queue_config`].
pub fn test_pipeline_config(pipeline_id: PipelineId, channels: usize) -> PipelineConfig {
    PipelineConfig {
        id: pipeline_id,
        queue: test_queue_config(channels),
        idle_wait_ms: 10,
        shutdown_timeout_ms: 5_000,
    }
}

/// Creates a pipeline over [`test_pipeline_config`].
pub fn create_pipeline<L, A>(
    pipeline_id: PipelineId,
    channels: usize,
    reader: L,
    applier: A,
) -> Pipeline<L, A>
where
    L: LogReader + Send + 'static,
    A: Applier + Clone + Send + Sync + 'static,
{
    let config = test_pipeline_config(pipeline_id, channels);
    Pipeline::new(config, reader, applier).expect("test pipeline config is valid")
}
