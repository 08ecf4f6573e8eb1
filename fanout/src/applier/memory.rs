use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;

use crate::applier::Applier;
use crate::bail;
use crate::error::{ErrorKind, FanoutResult};
use crate::types::{ControlEvent, Seqno, TransactionEvent};

/// Transaction committed by a [`MemoryApplier`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedTransaction {
    pub channel: usize,
    pub seqno: Seqno,
    pub shard_id: Option<String>,
    pub fragments: Vec<TransactionEvent>,
}

#[derive(Debug, Default)]
struct Inner {
    open: HashMap<usize, Vec<TransactionEvent>>,
    committed: Vec<AppliedTransaction>,
    controls: Vec<(usize, ControlEvent)>,
    rollbacks: Vec<(usize, Seqno)>,
}

/// In-memory applier for testing and development purposes.
///
/// [`MemoryApplier`] collects applied fragments per channel and moves them into the committed
/// list on commit, in commit order across channels. Rolled back transactions are dropped and
/// recorded separately.
#[derive(Debug, Clone, Default)]
pub struct MemoryApplier {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryApplier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the committed transactions in commit order.
    pub async fn committed(&self) -> Vec<AppliedTransaction> {
        self.inner.lock().await.committed.clone()
    }

    /// Returns the control events received, with their channel.
    pub async fn controls(&self) -> Vec<(usize, ControlEvent)> {
        self.inner.lock().await.controls.clone()
    }

    /// Returns the rolled back transactions, with their channel.
    pub async fn rollbacks(&self) -> Vec<(usize, Seqno)> {
        self.inner.lock().await.rollbacks.clone()
    }

    /// Returns the fragments applied on `channel` but not yet committed.
    pub async fn open_fragments(&self, channel: usize) -> Vec<TransactionEvent> {
        self.inner
            .lock()
            .await
            .open
            .get(&channel)
            .cloned()
            .unwrap_or_default()
    }
}

impl Applier for MemoryApplier {
    async fn apply(&self, channel: usize, event: &TransactionEvent) -> FanoutResult<()> {
        let mut inner = self.inner.lock().await;
        let open = inner.open.entry(channel).or_default();

        if let Some(last) = open.last()
            && last.seqno != event.seqno
        {
            bail!(
                ErrorKind::InvalidState,
                "Fragment applied while another transaction is open",
                format!(
                    "channel {channel} has seqno {} open, got seqno {}",
                    last.seqno, event.seqno
                )
            );
        }

        open.push(event.clone());

        Ok(())
    }

    async fn commit(&self, channel: usize, seqno: Seqno) -> FanoutResult<()> {
        let mut inner = self.inner.lock().await;
        let fragments = inner.open.remove(&channel).unwrap_or_default();

        if fragments.first().is_none_or(|first| first.seqno != seqno) {
            bail!(
                ErrorKind::InvalidState,
                "Commit does not match the open transaction",
                format!("channel {channel} commit of seqno {seqno}")
            );
        }

        debug!(channel, seqno, fragments = fragments.len(), "transaction committed");
        inner.committed.push(AppliedTransaction {
            channel,
            seqno,
            shard_id: fragments.first().and_then(|first| first.shard_id.clone()),
            fragments,
        });

        Ok(())
    }

    async fn rollback(&self, channel: usize, seqno: Seqno) -> FanoutResult<()> {
        let mut inner = self.inner.lock().await;
        inner.open.remove(&channel);
        inner.rollbacks.push((channel, seqno));

        Ok(())
    }

    async fn control(&self, channel: usize, event: &ControlEvent) -> FanoutResult<()> {
        self.inner
            .lock()
            .await
            .controls
            .push((channel, event.clone()));

        Ok(())
    }
}
