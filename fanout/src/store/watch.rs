//! Position watches.
//!
//! A watch resolves once the queue reaches a sequence number. Two flavors exist:
//!
//! - A *processed* watch resolves when a consumer takes the control event placed right after
//!   the transaction at the target position, meaning the transaction left its channel.
//! - A *committed* watch resolves when every channel has committed past the target position
//!   or has no outstanding work left.
//!
//! Processed watches registered for a position that was not accepted yet wait in the registry
//! until it is.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::task::{Context, Poll, ready};

use pin_project_lite::pin_project;
use tokio::sync::oneshot;
use tracing::debug;

use crate::error::{ErrorKind, FanoutResult};
use crate::fanout_error;
use crate::store::guard::IntervalGuard;
use crate::types::{Seqno, WatchId};

pin_project! {
    /// Future resolving with the sequence number that satisfied a watch.
    ///
    /// Fails with [`ErrorKind::WatchCancelled`] if the queue shuts down first.
    #[derive(Debug)]
    pub struct Watch {
        id: WatchId,
        target: Seqno,
        #[pin]
        receiver: oneshot::Receiver<Seqno>,
    }
}

impl Watch {
    pub fn id(&self) -> WatchId {
        self.id
    }

    /// Position the watch waits for.
    pub fn target(&self) -> Seqno {
        self.target
    }
}

impl Future for Watch {
    type Output = FanoutResult<Seqno>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let result = ready!(this.receiver.poll(cx));

        Poll::Ready(result.map_err(|_| {
            fanout_error!(
                ErrorKind::WatchCancelled,
                "Watch cancelled before its position was reached",
                format!("{} waiting for seqno {}", this.id, this.target)
            )
        }))
    }
}

/// Outcome of registering a processed watch.
#[derive(Debug)]
pub enum ProcessedRegistration {
    /// The target was not accepted yet; the watch is posted once it is.
    Deferred(Watch),
    /// The target was already accepted; the caller must place a control event for the watch in
    /// the channel holding the target, or resolve it directly if the target was already taken.
    Accepted(Watch),
}

#[derive(Debug)]
struct CommittedWatch {
    id: WatchId,
    sender: oneshot::Sender<Seqno>,
}

#[derive(Debug, Default)]
struct RegistryState {
    closed: bool,
    accepted_hi: Option<Seqno>,
    /// Processed watches waiting for a position to be accepted, keyed by target.
    anchored: BTreeMap<Seqno, Vec<WatchId>>,
    processed: HashMap<WatchId, oneshot::Sender<Seqno>>,
    committed: BTreeMap<Seqno, Vec<CommittedWatch>>,
    committed_seqnos: Vec<Option<Seqno>>,
}

/// Registry of watches and anchored control requests shared by the producer and consumers.
#[derive(Debug)]
pub struct WatchRegistry {
    next_id: AtomicU64,
    state: Mutex<RegistryState>,
}

impl WatchRegistry {
    pub fn new(channels: usize) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            state: Mutex::new(RegistryState {
                committed_seqnos: vec![None; channels],
                ..RegistryState::default()
            }),
        }
    }

    /// Registers a processed watch for `target`.
    pub fn watch_processed(&self, target: Seqno) -> FanoutResult<ProcessedRegistration> {
        let (id, watch, sender) = self.new_watch(target);
        let mut state = self.state();
        ensure_open(&state)?;

        state.processed.insert(id, sender);
        if state.accepted_hi.is_some_and(|hi| hi >= target) {
            return Ok(ProcessedRegistration::Accepted(watch));
        }

        state.anchored.entry(target).or_default().push(id);

        Ok(ProcessedRegistration::Deferred(watch))
    }

    /// Registers a committed watch for `target`, resolving it right away if already satisfied.
    pub fn watch_committed(&self, target: Seqno, guard: &IntervalGuard) -> FanoutResult<Watch> {
        let (id, watch, sender) = self.new_watch(target);
        let mut state = self.state();
        ensure_open(&state)?;

        state
            .committed
            .entry(target)
            .or_default()
            .push(CommittedWatch { id, sender });
        resolve_committed(&mut state, guard);

        Ok(watch)
    }

    /// Records that the first fragment of `seqno` was accepted and returns the watches due at
    /// that position.
    pub fn on_accepted(&self, seqno: Seqno) -> Vec<WatchId> {
        let mut state = self.state();
        state.accepted_hi = Some(state.accepted_hi.map_or(seqno, |hi| hi.max(seqno)));

        let later = state.anchored.split_off(&seqno.saturating_add(1));
        let due = std::mem::replace(&mut state.anchored, later);

        due.into_values().flatten().collect()
    }

    /// Resolves the processed watch `id` at `seqno`.
    pub fn resolve_processed(&self, id: WatchId, seqno: Seqno) {
        let sender = self.state().processed.remove(&id);
        if let Some(sender) = sender {
            debug!(%id, seqno, "processed watch resolved");
            let _ = sender.send(seqno);
        }
    }

    /// Records a commit on `channel` and resolves the committed watches it satisfies.
    pub fn commit(&self, channel: usize, seqno: Seqno, guard: &IntervalGuard) {
        let mut state = self.state();
        if let Some(committed) = state.committed_seqnos.get_mut(channel) {
            *committed = Some(committed.map_or(seqno, |current| current.max(seqno)));
        }

        resolve_committed(&mut state, guard);
    }

    /// Highest committed sequence number of `channel`.
    pub fn committed_seqno(&self, channel: usize) -> Option<Seqno> {
        self.state().committed_seqnos.get(channel).copied().flatten()
    }

    /// Re-evaluates committed watches, used when a channel drains without committing.
    pub fn refresh(&self, guard: &IntervalGuard) {
        resolve_committed(&mut self.state(), guard);
    }

    /// Cancels watches whose position will never be accepted because intake stopped.
    pub fn cancel_deferred(&self) {
        let mut state = self.state();
        let anchored = std::mem::take(&mut state.anchored);
        for id in anchored.into_values().flatten() {
            state.processed.remove(&id);
        }
    }

    /// Cancels every outstanding watch and rejects new registrations.
    pub fn close(&self) {
        let mut state = self.state();
        state.closed = true;
        state.anchored.clear();
        let cancelled = state.processed.len()
            + state.committed.values().map(Vec::len).sum::<usize>();
        state.processed.clear();
        state.committed.clear();

        if cancelled > 0 {
            debug!(cancelled, "cancelled outstanding watches");
        }
    }

    fn new_watch(&self, target: Seqno) -> (WatchId, Watch, oneshot::Sender<Seqno>) {
        let id = WatchId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (sender, receiver) = oneshot::channel();

        (
            id,
            Watch {
                id,
                target,
                receiver,
            },
            sender,
        )
    }

    fn state(&self) -> MutexGuard<'_, RegistryState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn ensure_open(state: &RegistryState) -> FanoutResult<()> {
    if state.closed {
        return Err(fanout_error!(
            ErrorKind::QueueShutdown,
            "Cannot register a watch on a queue that is shut down"
        ));
    }

    Ok(())
}

/// Resolves committed watches in ascending target order, stopping at the first unsatisfied one.
fn resolve_committed(state: &mut RegistryState, guard: &IntervalGuard) {
    while let Some(entry) = state.committed.first_entry() {
        let target = *entry.key();
        if !committed_through(&state.committed_seqnos, target, guard) {
            break;
        }

        let position = state
            .committed_seqnos
            .iter()
            .flatten()
            .copied()
            .max()
            .unwrap_or(target)
            .max(target);

        for watch in entry.remove() {
            debug!(id = %watch.id, target, position, "committed watch resolved");
            let _ = watch.sender.send(position);
        }
    }
}

fn committed_through(committed: &[Option<Seqno>], target: Seqno, guard: &IntervalGuard) -> bool {
    if guard.hi_seqno().is_none_or(|hi| hi < target) {
        return false;
    }

    committed.iter().enumerate().all(|(channel, committed)| {
        let caught_up = match (guard.last_accepted_seqno(channel), committed) {
            (None, _) => true,
            (Some(accepted), Some(committed)) => *committed >= accepted,
            (Some(_), None) => false,
        };

        caught_up || committed.is_some_and(|committed| committed >= target)
    })
}
