//! Parallel transaction distribution for log-based replication.
//!
//! A replication log delivers transactions strictly ordered by sequence number. This crate fans
//! that stream out to several independent apply channels while keeping every shard's
//! transactions in order, serializing transactions that cannot be attributed to a single shard
//! and bounding how far channels drift apart in source commit time.
//!
//! The [`store::parallel::ParallelQueue`] is the core of the crate. The [`pipeline::Pipeline`]
//! wires it to a [`log::LogReader`] through a feeder worker and to an [`applier::Applier`]
//! through one worker per channel.

pub mod applier;
pub mod concurrency;
pub mod error;
pub mod failpoints;
pub mod log;
mod macros;
pub mod metrics;
pub mod partition;
pub mod pipeline;
pub mod store;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod types;
pub mod workers;
