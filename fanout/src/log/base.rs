use std::future::Future;

use crate::error::FanoutResult;
use crate::types::TransactionEvent;

/// Trait for readers of a replicated transaction log.
///
/// [`LogReader`] delivers transaction fragments in sequence number order, each transaction's
/// fragments contiguous and numbered from zero. Returning `Ok(None)` means no fragment is
/// available right now; the caller is expected to try again later rather than treat it as the
/// end of the log.
pub trait LogReader {
    /// Returns the next fragment of the log, or `None` if none is available yet.
    fn next_event(&mut self) -> impl Future<Output = FanoutResult<Option<TransactionEvent>>> + Send;
}
