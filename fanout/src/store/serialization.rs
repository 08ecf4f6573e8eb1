//! Serialization of transactions that cannot run in parallel.
//!
//! A transaction without a usable shard may touch data of any shard. Before such a transaction
//! is released every channel must have released and committed everything accepted before it,
//! and the first parallel-safe transaction after a run of unsafe ones must in turn wait until
//! the run has left the serialization channel. Consecutive unsafe transactions share one drain and count as
//! a single serialization.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use metrics::{counter, histogram};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::concurrency::deadline::deadline;
use crate::concurrency::shutdown::{ShutdownRx, ShutdownState};
use crate::error::{ErrorKind, FanoutError, FanoutResult};
use crate::failpoints::{SERIALIZATION_BEFORE_RELEASE, fanout_fail_point};
use crate::fanout_error;
use crate::metrics::{FANOUT_SERIALIZATION_DRAIN_DURATION_SECONDS, FANOUT_SERIALIZATIONS_TOTAL};
use crate::store::guard::IntervalGuard;
use crate::types::{Offer, Seqno};

/// A run of consecutive unsafe transactions routed to the serialization channel.
#[derive(Debug, Clone)]
pub struct SerializationEpoch {
    pub first_seqno: Seqno,
    pub last_seqno: Seqno,
    pub transactions: u64,
    started_at: Instant,
}

/// Condition a drain waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainTarget {
    /// Every transaction accepted so far was handed out and committed by its consumer.
    Committed,
    /// Every transaction accepted so far was handed out.
    Released,
}

/// Failure reported by a channel consumer.
#[derive(Debug, Clone)]
pub struct ConsumerFailure {
    pub channel: usize,
    pub error: FanoutError,
}

#[derive(Debug, Default)]
struct CoordinatorState {
    epoch: Option<SerializationEpoch>,
    failure: Option<ConsumerFailure>,
}

/// Decides when unsafe transactions may be released and counts serialization epochs.
#[derive(Debug)]
pub struct SerializationCoordinator {
    channel: usize,
    count: AtomicU64,
    state: Mutex<CoordinatorState>,
    failed: Notify,
}

impl SerializationCoordinator {
    pub fn new(channel: usize) -> Self {
        Self {
            channel,
            count: AtomicU64::new(0),
            state: Mutex::new(CoordinatorState::default()),
            failed: Notify::new(),
        }
    }

    /// Channel receiving unsafe transactions.
    pub fn channel(&self) -> usize {
        self.channel
    }

    /// Number of serialization epochs entered so far.
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Acquire)
    }

    /// Returns `true` while a run of unsafe transactions has not been followed by a safe one.
    pub fn in_progress(&self) -> bool {
        self.state().epoch.is_some()
    }

    /// Returns what a transaction with the given safety must wait for before it is routed.
    ///
    /// An unsafe transaction opening a new run waits until everything before it was committed.
    /// A safe transaction closing a run waits until the run was handed out.
    pub fn drain_target(&self, parallel_safe: bool) -> Option<DrainTarget> {
        if parallel_safe != self.in_progress() {
            return None;
        }

        Some(if parallel_safe {
            DrainTarget::Released
        } else {
            DrainTarget::Committed
        })
    }

    /// Waits until every channel reached `target`.
    ///
    /// Returns [`Offer::TimedOut`] if `until` passes first. Fails with
    /// [`ErrorKind::SerializationAborted`] when a consumer reported a failure and with
    /// [`ErrorKind::Interrupted`] when `shutdown` reaches `level`.
    pub async fn drain(
        &self,
        guard: &IntervalGuard,
        target: DrainTarget,
        until: Option<Instant>,
        shutdown: &mut ShutdownRx,
        level: ShutdownState,
    ) -> FanoutResult<Offer<()>> {
        let started_at = Instant::now();

        loop {
            let changed = guard.changed();
            let failed = self.failed.notified();
            tokio::pin!(changed);
            tokio::pin!(failed);
            changed.as_mut().enable();
            failed.as_mut().enable();

            self.check_failure()?;

            let reached = match target {
                DrainTarget::Committed => guard.is_committed(),
                DrainTarget::Released => guard.is_drained(),
            };
            if reached {
                fanout_fail_point(SERIALIZATION_BEFORE_RELEASE)?;

                histogram!(FANOUT_SERIALIZATION_DRAIN_DURATION_SECONDS)
                    .record(started_at.elapsed().as_secs_f64());
                return Ok(Offer::Accepted);
            }

            tokio::select! {
                _ = &mut changed => {}
                _ = &mut failed => {}
                _ = shutdown.reached(level) => {
                    return Err(fanout_error!(
                        ErrorKind::Interrupted,
                        "Serialization drain interrupted by shutdown"
                    ));
                }
                _ = deadline(until) => return Ok(Offer::TimedOut(())),
            }
        }
    }

    /// Records that the unsafe transaction `seqno` was routed to the serialization channel.
    pub fn record_unsafe(&self, seqno: Seqno) {
        let mut state = self.state();
        match state.epoch.as_mut() {
            Some(epoch) => {
                epoch.last_seqno = seqno;
                epoch.transactions += 1;
            }
            None => {
                let count = self.count.fetch_add(1, Ordering::AcqRel) + 1;
                counter!(FANOUT_SERIALIZATIONS_TOTAL).increment(1);
                info!(
                    seqno,
                    serialization_count = count,
                    channel = self.channel,
                    "serializing unsafe transactions"
                );

                state.epoch = Some(SerializationEpoch {
                    first_seqno: seqno,
                    last_seqno: seqno,
                    transactions: 1,
                    started_at: Instant::now(),
                });
            }
        }
    }

    /// Records that a parallel-safe transaction follows the current run, ending it.
    pub fn record_safe(&self) {
        let Some(epoch) = self.state().epoch.take() else {
            return;
        };

        info!(
            first_seqno = epoch.first_seqno,
            last_seqno = epoch.last_seqno,
            transactions = epoch.transactions,
            duration_ms = epoch.started_at.elapsed().as_millis() as u64,
            "resuming parallel apply"
        );
    }

    /// Returns the current run of unsafe transactions, if any.
    pub fn epoch(&self) -> Option<SerializationEpoch> {
        self.state().epoch.clone()
    }

    /// Records a consumer failure. Pending and future drains are aborted.
    pub fn report_failure(&self, channel: usize, error: FanoutError) {
        {
            let mut state = self.state();
            if state.failure.is_some() {
                return;
            }

            warn!(channel, error = %error, "channel consumer reported a failure");
            state.failure = Some(ConsumerFailure { channel, error });
        }

        self.failed.notify_waiters();
    }

    /// Returns the first failure reported by a consumer.
    pub fn failure(&self) -> Option<ConsumerFailure> {
        self.state().failure.clone()
    }

    fn check_failure(&self) -> FanoutResult<()> {
        let Some(failure) = self.failure() else {
            return Ok(());
        };

        Err(fanout_error!(
            ErrorKind::SerializationAborted,
            "Serialization drain aborted after a consumer failure",
            detail = format!("channel {} failed with {:?}", failure.channel, failure.error.kind()),
            source: failure.error
        ))
    }

    fn state(&self) -> MutexGuard<'_, CoordinatorState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
