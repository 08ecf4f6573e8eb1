use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info};

use crate::concurrency::shutdown::{ShutdownRx, ShutdownState};
use crate::error::{ErrorKind, FanoutResult};
use crate::failpoints::{FEEDER_BEFORE_ACCEPT, fanout_fail_point};
use crate::fanout_error;
use crate::log::LogReader;
use crate::store::base::EventStore;
use crate::types::Seqno;
use crate::workers::base::{Worker, WorkerHandle};

/// Progress of the feeder worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FeederState {
    /// Fragments accepted by the queue.
    pub accepted_fragments: u64,
    /// Sequence number of the last accepted fragment.
    pub last_seqno: Option<Seqno>,
    /// Whether the last accepted fragment closed its transaction.
    pub at_boundary: bool,
}

/// Handle for the feeder worker.
#[derive(Debug)]
pub struct FeederWorkerHandle {
    state: Arc<Mutex<FeederState>>,
    handle: Option<JoinHandle<FanoutResult<()>>>,
}

impl WorkerHandle<FeederState> for FeederWorkerHandle {
    fn state(&self) -> FeederState {
        *lock(&self.state)
    }

    async fn wait(mut self) -> FanoutResult<()> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };

        handle.await.map_err(|err| {
            fanout_error!(
                ErrorKind::FeederWorkerPanic,
                "Feeder worker panicked",
                err
            )
        })??;

        Ok(())
    }
}

/// Worker reading the log and offering every fragment to the queue.
///
/// When the log has nothing to offer the worker waits `idle_wait` before asking again. On a
/// graceful shutdown it keeps feeding an open transaction until its last fragment and stops at
/// the boundary; an immediate shutdown stops it right away.
#[derive(Debug)]
pub struct FeederWorker<L, S> {
    pipeline_id: u64,
    reader: L,
    store: S,
    idle_wait: Duration,
    shutdown_rx: ShutdownRx,
}

impl<L, S> FeederWorker<L, S> {
    pub fn new(
        pipeline_id: u64,
        reader: L,
        store: S,
        idle_wait: Duration,
        shutdown_rx: ShutdownRx,
    ) -> Self {
        Self {
            pipeline_id,
            reader,
            store,
            idle_wait,
            shutdown_rx,
        }
    }
}

impl<L, S> Worker<FeederWorkerHandle, FeederState> for FeederWorker<L, S>
where
    L: LogReader + Send + 'static,
    S: EventStore + Clone + Send + Sync + 'static,
{
    fn start(self) -> FeederWorkerHandle {
        info!("starting feeder worker");

        let span = tracing::info_span!("feeder_worker", pipeline_id = self.pipeline_id);
        let state = Arc::new(Mutex::new(FeederState {
            at_boundary: true,
            ..FeederState::default()
        }));

        let store = self.store.clone();
        let worker_state = state.clone();
        let worker = async move {
            let result = self.feed(worker_state).await;
            if let Err(err) = &result {
                error!(error = %err, "feeder worker failed, shutting down the queue");
                store.shutdown(true);
            }

            result
        }
        .instrument(span.or_current());

        FeederWorkerHandle {
            state,
            handle: Some(tokio::spawn(worker)),
        }
    }
}

impl<L, S> FeederWorker<L, S>
where
    L: LogReader + Send + 'static,
    S: EventStore + Clone + Send + Sync + 'static,
{
    async fn feed(mut self, state: Arc<Mutex<FeederState>>) -> FanoutResult<()> {
        let mut at_boundary = true;

        loop {
            match self.shutdown_rx.state() {
                ShutdownState::Running => {}
                ShutdownState::Graceful if !at_boundary => {}
                _ => {
                    info!(at_boundary, "feeder worker stopping");
                    return Ok(());
                }
            }

            let Some(event) = self.reader.next_event().await? else {
                let level = if at_boundary {
                    ShutdownState::Graceful
                } else {
                    ShutdownState::Immediate
                };

                tokio::select! {
                    _ = tokio::time::sleep(self.idle_wait) => {}
                    _ = self.shutdown_rx.reached(level) => {}
                }
                continue;
            };

            fanout_fail_point(FEEDER_BEFORE_ACCEPT)?;

            let seqno = event.seqno;
            let last_frag = event.last_frag;
            match self.store.accept(event).await {
                Ok(()) => {
                    at_boundary = last_frag;

                    let mut state = lock(&state);
                    state.accepted_fragments += 1;
                    state.last_seqno = Some(seqno);
                    state.at_boundary = at_boundary;
                }
                Err(err)
                    if matches!(
                        err.kind(),
                        ErrorKind::QueueShutdown | ErrorKind::Interrupted
                    ) =>
                {
                    debug!(seqno, error = %err, "queue stopped accepting");
                    info!(at_boundary, "feeder worker stopping");
                    return Ok(());
                }
                Err(err) => return Err(err),
            }
        }
    }
}

fn lock(state: &Mutex<FeederState>) -> MutexGuard<'_, FeederState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
