use std::future::Future;
use std::time::Duration;

use crate::error::{FanoutError, FanoutResult};
use crate::store::parallel::{ParallelQueue, QueueStatus};
use crate::types::{Offer, Seqno, Take, TransactionEvent};

/// Trait for queues that distribute a transaction stream to channel consumers.
///
/// [`EventStore`] is the surface the pipeline workers depend on. A single producer offers
/// fragments in sequence number order and one consumer per channel takes them back out,
/// committing what it applied. Implementations decide how fragments are routed and when a
/// channel may release its next transaction.
pub trait EventStore {
    /// Returns the number of channels.
    fn channels(&self) -> usize;

    /// Accepts the next fragment, waiting as long as needed.
    fn accept(&self, event: TransactionEvent) -> impl Future<Output = FanoutResult<()>> + Send;

    /// Accepts the next fragment, handing it back if `timeout` elapses first.
    fn accept_timeout(
        &self,
        event: TransactionEvent,
        timeout: Duration,
    ) -> impl Future<Output = FanoutResult<Offer<TransactionEvent>>> + Send;

    /// Takes the next event of `channel`, returning [`Take::Empty`] after `timeout`.
    fn consume_timeout(
        &self,
        channel: usize,
        timeout: Duration,
    ) -> impl Future<Output = FanoutResult<Take>> + Send;

    /// Records that `channel` committed every transaction up to `seqno`.
    fn commit(&self, channel: usize, seqno: Seqno) -> FanoutResult<()>;

    /// Reports that the consumer of `channel` failed.
    fn report_failure(&self, channel: usize, error: FanoutError);

    /// Requests a graceful or immediate shutdown.
    fn shutdown(&self, immediate: bool);

    /// Position a restart must replay from.
    fn restart_seqno(&self) -> Option<Seqno>;

    /// Returns a diagnostic snapshot.
    fn status(&self) -> QueueStatus;
}

impl EventStore for ParallelQueue {
    fn channels(&self) -> usize {
        ParallelQueue::channels(self)
    }

    fn accept(&self, event: TransactionEvent) -> impl Future<Output = FanoutResult<()>> + Send {
        ParallelQueue::accept(self, event)
    }

    fn accept_timeout(
        &self,
        event: TransactionEvent,
        timeout: Duration,
    ) -> impl Future<Output = FanoutResult<Offer<TransactionEvent>>> + Send {
        ParallelQueue::accept_timeout(self, event, timeout)
    }

    fn consume_timeout(
        &self,
        channel: usize,
        timeout: Duration,
    ) -> impl Future<Output = FanoutResult<Take>> + Send {
        ParallelQueue::consume_timeout(self, channel, timeout)
    }

    fn commit(&self, channel: usize, seqno: Seqno) -> FanoutResult<()> {
        ParallelQueue::commit(self, channel, seqno)
    }

    fn report_failure(&self, channel: usize, error: FanoutError) {
        ParallelQueue::report_failure(self, channel, error)
    }

    fn shutdown(&self, immediate: bool) {
        ParallelQueue::shutdown(self, immediate)
    }

    fn restart_seqno(&self) -> Option<Seqno> {
        ParallelQueue::restart_seqno(self)
    }

    fn status(&self) -> QueueStatus {
        ParallelQueue::status(self)
    }
}
