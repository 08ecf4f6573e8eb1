use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use fanout::applier::Applier;
use fanout::error::FanoutResult;
use fanout::types::{ControlEvent, Seqno, TransactionEvent};
use tracing::{debug, info, warn};

/// Applier that writes every transaction it receives to the service log.
///
/// The replicator has no target system of its own, so committed transactions are only
/// reported. Counters are shared between clones.
#[derive(Debug, Clone, Default)]
pub struct LoggingApplier {
    committed: Arc<AtomicU64>,
    rolled_back: Arc<AtomicU64>,
}

impl LoggingApplier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of transactions committed across all channels.
    pub fn committed_count(&self) -> u64 {
        self.committed.load(Ordering::Relaxed)
    }

    /// Number of transactions rolled back across all channels.
    pub fn rolled_back_count(&self) -> u64 {
        self.rolled_back.load(Ordering::Relaxed)
    }
}

impl Applier for LoggingApplier {
    async fn apply(&self, channel: usize, event: &TransactionEvent) -> FanoutResult<()> {
        debug!(
            channel,
            seqno = event.seqno,
            fragno = event.fragno,
            last_frag = event.last_frag,
            shard_id = event.shard_id.as_deref(),
            payload_len = event.payload.len(),
            "applying fragment"
        );

        Ok(())
    }

    async fn commit(&self, channel: usize, seqno: Seqno) -> FanoutResult<()> {
        self.committed.fetch_add(1, Ordering::Relaxed);
        info!(channel, seqno, "transaction committed");

        Ok(())
    }

    async fn rollback(&self, channel: usize, seqno: Seqno) -> FanoutResult<()> {
        self.rolled_back.fetch_add(1, Ordering::Relaxed);
        warn!(channel, seqno, "transaction rolled back, it will be replayed on restart");

        Ok(())
    }

    async fn control(&self, channel: usize, event: &ControlEvent) -> FanoutResult<()> {
        debug!(channel, kind = ?event.kind, seqno = event.seqno, "control event");

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use fanout::test_utils::event::{shard, transaction};

    use super::*;

    #[tokio::test]
    async fn counters_are_shared_between_clones() {
        let applier = LoggingApplier::new();
        let clone = applier.clone();

        clone.apply(0, &transaction(1, &shard(0))).await.unwrap();
        clone.commit(0, 1).await.unwrap();
        applier.rollback(1, 2).await.unwrap();

        assert_eq!(applier.committed_count(), 1);
        assert_eq!(applier.rolled_back_count(), 1);
    }
}
