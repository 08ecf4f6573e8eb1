use std::future::Future;

use crate::error::FanoutResult;
use crate::types::{ControlEvent, Seqno, TransactionEvent};

/// Trait for systems that apply the transactions handed out by a channel.
///
/// One channel worker drives an [`Applier`] per channel, always from the same task, but the
/// same applier value is shared by every channel worker. Fragments of a transaction arrive in
/// order and are followed by [`Applier::commit`] once the last fragment was applied. When a
/// shutdown discards the rest of a transaction whose first fragments were already applied,
/// [`Applier::rollback`] is called instead and the transaction is replayed after a restart.
pub trait Applier {
    /// Applies one fragment of a transaction on `channel`.
    fn apply(
        &self,
        channel: usize,
        event: &TransactionEvent,
    ) -> impl Future<Output = FanoutResult<()>> + Send;

    /// Makes the transaction `seqno` applied on `channel` durable.
    fn commit(&self, channel: usize, seqno: Seqno) -> impl Future<Output = FanoutResult<()>> + Send;

    /// Discards the partially applied transaction `seqno` on `channel`.
    fn rollback(
        &self,
        channel: usize,
        seqno: Seqno,
    ) -> impl Future<Output = FanoutResult<()>> + Send;

    /// Handles a control event emitted on `channel`.
    ///
    /// The default implementation ignores it.
    fn control(
        &self,
        _channel: usize,
        _event: &ControlEvent,
    ) -> impl Future<Output = FanoutResult<()>> + Send {
        async { Ok(()) }
    }
}
