use std::fmt;
use std::future::Future;

use serde::Serialize;

use crate::error::FanoutResult;

/// Classification of pipeline worker types.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum WorkerType {
    /// Worker that reads the log and feeds the queue.
    Feeder,
    /// Worker that consumes one channel and applies its transactions.
    Channel {
        /// Index of the consumed channel.
        channel: usize,
    },
}

impl fmt::Display for WorkerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerType::Feeder => write!(f, "feeder"),
            WorkerType::Channel { channel } => write!(f, "channel-{channel}"),
        }
    }
}

/// Trait for background workers of the pipeline.
///
/// The generic parameter `H` is the handle returned once the worker runs and `S` the state
/// exposed through it.
pub trait Worker<H, S>
where
    H: WorkerHandle<S>,
{
    /// Spawns the worker and returns a handle for monitoring its execution.
    fn start(self) -> H;
}

/// Handle for monitoring a running worker.
pub trait WorkerHandle<S> {
    /// Returns a snapshot of the worker's progress.
    fn state(&self) -> S;

    /// Waits for the worker to complete and returns its result.
    fn wait(self) -> impl Future<Output = FanoutResult<()>> + Send;
}
