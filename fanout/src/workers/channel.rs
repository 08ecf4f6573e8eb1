use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use metrics::{counter, histogram};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info, warn};

use crate::applier::Applier;
use crate::concurrency::shutdown::ShutdownTx;
use crate::error::{ErrorKind, FanoutResult};
use crate::failpoints::{CHANNEL_WORKER_BEFORE_APPLY, fanout_fail_point};
use crate::fanout_error;
use crate::metrics::{
    CHANNEL_LABEL, FANOUT_APPLY_LAG_SECONDS, FANOUT_TRANSACTIONS_APPLIED_TOTAL, PIPELINE_ID_LABEL,
};
use crate::store::base::EventStore;
use crate::types::{QueueEvent, Seqno, Take, TransactionEvent};
use crate::workers::base::{Worker, WorkerHandle, WorkerType};

/// How long a channel worker waits for an event before polling again.
const CONSUME_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Progress of a channel worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ChannelWorkerState {
    pub applied_transactions: u64,
    pub last_committed_seqno: Option<Seqno>,
    pub control_events: u64,
    pub rolled_back: Option<Seqno>,
}

/// Handle for a channel worker.
#[derive(Debug)]
pub struct ChannelWorkerHandle {
    channel: usize,
    state: Arc<Mutex<ChannelWorkerState>>,
    handle: Option<JoinHandle<FanoutResult<()>>>,
}

impl ChannelWorkerHandle {
    pub fn channel(&self) -> usize {
        self.channel
    }
}

impl WorkerHandle<ChannelWorkerState> for ChannelWorkerHandle {
    fn state(&self) -> ChannelWorkerState {
        *lock(&self.state)
    }

    async fn wait(mut self) -> FanoutResult<()> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };

        handle.await.map_err(|err| {
            fanout_error!(
                ErrorKind::ChannelWorkerPanic,
                "Channel worker panicked",
                format!("channel {}: {err}", self.channel)
            )
        })??;

        Ok(())
    }
}

/// Worker consuming one channel of the queue and handing its events to an [`Applier`].
///
/// Each transaction is committed on the applier once its last fragment was applied, then
/// reported to the queue. A failure is reported to the queue, which abandons any pending
/// serialization drain, and the queue and the pipeline are shut down immediately.
#[derive(Debug)]
pub struct ChannelWorker<S, A> {
    pipeline_id: u64,
    channel: usize,
    store: S,
    applier: A,
    shutdown_tx: ShutdownTx,
}

impl<S, A> ChannelWorker<S, A> {
    pub fn new(
        pipeline_id: u64,
        channel: usize,
        store: S,
        applier: A,
        shutdown_tx: ShutdownTx,
    ) -> Self {
        Self {
            pipeline_id,
            channel,
            store,
            applier,
            shutdown_tx,
        }
    }
}

impl<S, A> Worker<ChannelWorkerHandle, ChannelWorkerState> for ChannelWorker<S, A>
where
    S: EventStore + Clone + Send + Sync + 'static,
    A: Applier + Clone + Send + Sync + 'static,
{
    fn start(self) -> ChannelWorkerHandle {
        let channel = self.channel;
        let worker_type = WorkerType::Channel { channel };
        info!(%worker_type, "starting channel worker");

        let span = tracing::info_span!(
            "channel_worker",
            pipeline_id = self.pipeline_id,
            channel = channel
        );
        let state = Arc::new(Mutex::new(ChannelWorkerState::default()));

        let store = self.store.clone();
        let shutdown_tx = self.shutdown_tx.clone();
        let worker_state = state.clone();
        let worker = async move {
            let result = self.run(worker_state).await;
            if let Err(err) = &result {
                error!(channel, error = %err, "channel worker failed, shutting down the queue");
                store.report_failure(channel, err.clone());
                store.shutdown(true);
                shutdown_tx.shutdown(true);
            }

            result
        }
        .instrument(span.or_current());

        ChannelWorkerHandle {
            channel,
            state,
            handle: Some(tokio::spawn(worker)),
        }
    }
}

impl<S, A> ChannelWorker<S, A>
where
    S: EventStore + Clone + Send + Sync + 'static,
    A: Applier + Clone + Send + Sync + 'static,
{
    async fn run(self, state: Arc<Mutex<ChannelWorkerState>>) -> FanoutResult<()> {
        let channel = self.channel;

        loop {
            let take = self
                .store
                .consume_timeout(channel, CONSUME_POLL_INTERVAL)
                .await?;

            match take {
                Take::Empty => {}
                Take::Closed { rollback } => {
                    if let Some(seqno) = rollback {
                        warn!(channel, seqno, "rolling back partially applied transaction");
                        self.applier.rollback(channel, seqno).await?;
                        lock(&state).rolled_back = Some(seqno);
                    }

                    info!(channel, "channel closed, channel worker finished");
                    return Ok(());
                }
                Take::Event(QueueEvent::Control(control)) => {
                    debug!(channel, kind = ?control.kind, seqno = control.seqno, "control event");
                    self.applier.control(channel, &control).await?;
                    lock(&state).control_events += 1;
                }
                Take::Event(QueueEvent::Transaction(transaction)) => {
                    self.apply(&transaction, &state).await?;
                }
            }
        }
    }

    async fn apply(
        &self,
        transaction: &TransactionEvent,
        state: &Mutex<ChannelWorkerState>,
    ) -> FanoutResult<()> {
        let channel = self.channel;
        fanout_fail_point(CHANNEL_WORKER_BEFORE_APPLY)?;

        self.applier.apply(channel, transaction).await?;
        if !transaction.last_frag {
            return Ok(());
        }

        self.applier.commit(channel, transaction.seqno).await?;
        self.store.commit(channel, transaction.seqno)?;

        counter!(
            FANOUT_TRANSACTIONS_APPLIED_TOTAL,
            PIPELINE_ID_LABEL => self.pipeline_id.to_string(),
            CHANNEL_LABEL => channel.to_string()
        )
        .increment(1);

        let lag = Utc::now()
            .signed_duration_since(transaction.commit_timestamp)
            .to_std()
            .unwrap_or_default();
        histogram!(
            FANOUT_APPLY_LAG_SECONDS,
            PIPELINE_ID_LABEL => self.pipeline_id.to_string(),
            CHANNEL_LABEL => channel.to_string()
        )
        .record(lag.as_secs_f64());

        let mut state = lock(state);
        state.applied_transactions += 1;
        state.last_committed_seqno = Some(transaction.seqno);

        Ok(())
    }
}

fn lock(state: &Mutex<ChannelWorkerState>) -> MutexGuard<'_, ChannelWorkerState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
