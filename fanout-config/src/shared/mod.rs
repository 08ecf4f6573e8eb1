//! Shared configuration types for fanout pipelines.

mod base;
mod log;
mod partitioner;
mod pipeline;
mod queue;
mod replicator;

pub use base::ValidationError;
pub use log::LogConfig;
pub use partitioner::PartitionerConfig;
pub use pipeline::PipelineConfig;
pub use queue::ParallelQueueConfig;
pub use replicator::ReplicatorConfig;
