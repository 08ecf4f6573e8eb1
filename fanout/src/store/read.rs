//! Bounded per-channel FIFO.
//!
//! A [`ReadQueue`] buffers the transaction fragments routed to one channel together with the
//! control events synthesized for it. Control events are only ever placed on a transaction
//! boundary: a control anchored to a transaction that is still open is parked and released
//! right after the transaction's last fragment.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use metrics::{counter, gauge};
use serde::Serialize;
use tokio::sync::Notify;
use tokio::sync::futures::Notified;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::bail;
use crate::concurrency::deadline::deadline;
use crate::error::{ErrorKind, FanoutResult};
use crate::fanout_error;
use crate::metrics::{
    CHANNEL_LABEL, CONTROL_KIND_LABEL, FANOUT_CHANNEL_DEPTH, FANOUT_CONTROL_EVENTS_TOTAL,
    FANOUT_FRAGMENTS_ACCEPTED_TOTAL, FANOUT_FRAGMENTS_DISCARDED_TOTAL,
};
use crate::types::{
    ControlEvent, ControlKind, EventHeader, Offer, QueueEvent, Seqno, Take, TransactionEvent,
};

/// Predicate evaluated against every posted fragment until it first matches.
pub type SyncPredicate = Arc<dyn Fn(&TransactionEvent) -> bool + Send + Sync>;

/// Lifecycle of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueState {
    /// Normal operation.
    Accepting,
    /// Shutdown requested: no new fragments, buffered content is still consumable.
    Draining,
    /// Nothing left to consume.
    Closed,
}

/// Where an out-of-band control event ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// Inserted into the buffer at a transaction boundary.
    Queued,
    /// Parked until the transaction it is anchored to is complete.
    Parked,
}

/// Outcome of a non-blocking take attempt.
#[derive(Debug)]
pub(crate) enum Polled {
    Event(QueueEvent),
    /// The head transaction was refused by the release gate.
    Blocked,
    Empty,
    Closed { rollback: Option<Seqno> },
}

/// Counters of a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReadQueueStats {
    pub state: QueueState,
    /// Items currently buffered, fragments and control events.
    pub depth: usize,
    /// Fragments accepted since creation.
    pub accept_count: u64,
    /// Fragments rejected or dropped because of a shutdown.
    pub discard_count: u64,
    /// Control events placed since creation.
    pub control_count: u64,
}

struct Inner {
    state: QueueState,
    buffer: VecDeque<QueueEvent>,
    /// Number of transaction fragments in `buffer`, the unit of capacity.
    fragments: usize,
    tail: Option<EventHeader>,
    last_taken: Option<EventHeader>,
    parked: BTreeMap<Seqno, Vec<ControlEvent>>,
    predicates: Vec<SyncPredicate>,
    since_sync: u64,
    accept_count: u64,
    discard_count: u64,
    control_count: u64,
    rollback: Option<Seqno>,
    /// Graceful shutdown requested while a transaction was open.
    drain_pending: bool,
}

/// Bounded FIFO of one channel.
///
/// One producer posts and one consumer takes. Capacity counts transaction fragments only;
/// control events never block the producer.
pub struct ReadQueue {
    channel: usize,
    capacity: usize,
    sync_interval: Option<u64>,
    inner: Mutex<Inner>,
    readable: Notify,
    writable: Notify,
}

impl ReadQueue {
    pub fn new(channel: usize, capacity: usize, sync_interval: Option<u64>) -> Self {
        Self {
            channel,
            capacity: capacity.max(1),
            sync_interval: sync_interval.filter(|interval| *interval > 0),
            inner: Mutex::new(Inner {
                state: QueueState::Accepting,
                buffer: VecDeque::new(),
                fragments: 0,
                tail: None,
                last_taken: None,
                parked: BTreeMap::new(),
                predicates: Vec::new(),
                since_sync: 0,
                accept_count: 0,
                discard_count: 0,
                control_count: 0,
                rollback: None,
                drain_pending: false,
            }),
            readable: Notify::new(),
            writable: Notify::new(),
        }
    }

    pub fn channel(&self) -> usize {
        self.channel
    }

    /// Appends a fragment, waiting for room until `until` if the channel is full.
    ///
    /// Returns the fragment back when the deadline expires first. Fails when the channel no
    /// longer accepts fragments or when the fragment breaks the channel's ordering.
    pub async fn post(
        &self,
        mut event: TransactionEvent,
        until: Option<Instant>,
    ) -> FanoutResult<Offer<TransactionEvent>> {
        event.channel = Some(self.channel);

        loop {
            let writable = self.writable.notified();
            tokio::pin!(writable);
            writable.as_mut().enable();

            {
                let mut inner = self.lock();
                if inner.state != QueueState::Accepting {
                    inner.discard_count += 1;
                    counter!(
                        FANOUT_FRAGMENTS_DISCARDED_TOTAL,
                        CHANNEL_LABEL => self.channel.to_string()
                    )
                    .increment(1);

                    bail!(
                        ErrorKind::QueueClosed,
                        "Cannot post to a channel that no longer accepts fragments",
                        format!(
                            "channel {} rejected seqno {} fragment {}",
                            self.channel, event.seqno, event.fragno
                        )
                    );
                }

                if inner.fragments < self.capacity {
                    self.push(&mut inner, event)?;
                    drop(inner);

                    self.readable.notify_waiters();
                    return Ok(Offer::Accepted);
                }
            }

            tokio::select! {
                _ = &mut writable => {}
                _ = deadline(until) => return Ok(Offer::TimedOut(event)),
            }
        }
    }

    /// Inserts a control event anchored to `control.seqno`.
    ///
    /// An anchor that was not posted yet, or whose transaction is still open, parks the control
    /// until the transaction completes. An anchor that is already behind the consumer is
    /// emitted at the current position instead, so callers always observe the control.
    pub fn post_out_of_band(&self, control: ControlEvent) -> FanoutResult<Placement> {
        let mut inner = self.lock();
        if inner.state == QueueState::Closed {
            bail!(
                ErrorKind::QueueClosed,
                "Cannot post a control event to a closed channel",
                format!("channel {} anchor {}", self.channel, control.seqno)
            );
        }

        let placement = self.place(&mut inner, control);
        drop(inner);

        if placement == Placement::Queued {
            self.readable.notify_waiters();
        }

        Ok(placement)
    }

    /// Places `control` only if this channel holds the transaction at `control.seqno`.
    ///
    /// Returns `None` when the transaction is not buffered here, either because it was routed
    /// to another channel or because it was already taken.
    pub fn post_if_holding(&self, control: ControlEvent) -> Option<Placement> {
        let mut inner = self.lock();
        if inner.state == QueueState::Closed {
            return None;
        }

        let anchor = control.seqno;
        let open_here = inner
            .tail
            .as_ref()
            .is_some_and(|tail| tail.seqno == anchor && tail.is_open());
        let buffered = inner.buffer.iter().any(|event| {
            matches!(event, QueueEvent::Transaction(transaction) if transaction.seqno == anchor)
        });
        if !open_here && !buffered {
            return None;
        }

        let placement = self.place(&mut inner, control);
        drop(inner);

        if placement == Placement::Queued {
            self.readable.notify_waiters();
        }

        Some(placement)
    }

    /// Places `control` after the last fragment posted to this channel, whatever its anchor.
    ///
    /// Used when the anchor's transaction went to another channel and already left it. The
    /// control reports the later of its anchor and the channel's tail.
    pub fn post_at_tail(&self, mut control: ControlEvent) -> FanoutResult<Placement> {
        let mut inner = self.lock();
        if inner.state == QueueState::Closed {
            bail!(
                ErrorKind::QueueClosed,
                "Cannot post a control event to a closed channel",
                format!("channel {} anchor {}", self.channel, control.seqno)
            );
        }

        let tail = inner.tail.clone();
        if let Some(tail) = tail.as_ref().filter(|tail| tail.is_open()) {
            inner.parked.entry(tail.seqno).or_default().push(control);
            return Ok(Placement::Parked);
        }

        if let Some(tail) = &tail {
            control.seqno = control.seqno.max(tail.seqno);
        }
        control.header = tail;
        let index = inner.buffer.len();
        self.enqueue_control(&mut inner, index, control);
        drop(inner);

        self.readable.notify_waiters();

        Ok(Placement::Queued)
    }

    /// Registers a predicate matched against every subsequently posted fragment.
    ///
    /// On its first match a [`ControlKind::Predicate`] control is placed after the matching
    /// transaction and the predicate is dropped.
    pub fn add_watch_sync_predicate(&self, predicate: SyncPredicate) {
        let mut inner = self.lock();
        if inner.state == QueueState::Accepting {
            inner.predicates.push(predicate);
        }
    }

    /// Takes the head event, asking `gate` before releasing the first fragment of a
    /// transaction. The gate is skipped while draining.
    pub(crate) fn try_take<G>(&self, gate: G) -> Polled
    where
        G: FnOnce(&TransactionEvent) -> bool,
    {
        let mut inner = self.lock();

        let Some(head) = inner.buffer.front() else {
            return match inner.state {
                QueueState::Accepting => Polled::Empty,
                QueueState::Draining | QueueState::Closed => {
                    if inner.state == QueueState::Draining {
                        inner.state = QueueState::Closed;
                        inner.parked.clear();
                        debug!(channel = self.channel, "channel drained");
                    }

                    Polled::Closed {
                        rollback: inner.rollback,
                    }
                }
            };
        };

        if let QueueEvent::Transaction(transaction) = head
            && transaction.is_first_fragment()
            && inner.state == QueueState::Accepting
            && !gate(transaction)
        {
            return Polled::Blocked;
        }

        let Some(event) = inner.buffer.pop_front() else {
            return Polled::Empty;
        };

        let freed = if let QueueEvent::Transaction(transaction) = &event {
            inner.fragments -= 1;
            inner.last_taken = Some(transaction.header());
            true
        } else {
            false
        };
        self.record_depth(&inner);
        drop(inner);

        if freed {
            self.writable.notify_waiters();
        }

        Polled::Event(event)
    }

    /// Takes the head event in insertion order, waiting until `until` for one to arrive.
    ///
    /// Returns [`Take::Empty`] when the deadline expires first.
    pub async fn take(&self, until: Option<Instant>) -> Take {
        loop {
            let readable = self.readable.notified();
            tokio::pin!(readable);
            readable.as_mut().enable();

            match self.try_take(|_| true) {
                Polled::Event(event) => return Take::Event(event),
                Polled::Closed { rollback } => return Take::Closed { rollback },
                Polled::Blocked | Polled::Empty => {}
            }

            tokio::select! {
                _ = &mut readable => {}
                _ = deadline(until) => return Take::Empty,
            }
        }
    }

    /// Returns a clone of the head event without removing it.
    pub fn peek(&self) -> Option<QueueEvent> {
        self.lock().buffer.front().cloned()
    }

    /// Stops accepting fragments while keeping buffered content consumable.
    ///
    /// If a transaction is still open on this channel its remaining fragments are accepted and
    /// draining starts right after its last fragment.
    pub fn begin_drain(&self) {
        let mut inner = self.lock();
        if inner.state != QueueState::Accepting {
            return;
        }

        if inner.tail.as_ref().is_some_and(EventHeader::is_open) {
            inner.drain_pending = true;
            debug!(channel = self.channel, "channel drains after open transaction");
            return;
        }

        self.start_drain(&mut inner);
        drop(inner);

        self.wake_all();
    }

    /// Closes the channel and drops everything not yet taken.
    ///
    /// Returns the number of unreleased transactions that were dropped. If the consumer already
    /// took part of a transaction, its sequence number is reported as rollback position by the
    /// next take.
    pub fn close_immediately(&self) -> usize {
        let mut inner = self.lock();
        if inner.state == QueueState::Closed {
            return 0;
        }

        let dropped_fragments = inner.fragments;
        let dropped_transactions = inner
            .buffer
            .iter()
            .filter(|event| {
                matches!(event, QueueEvent::Transaction(transaction) if transaction.is_first_fragment())
            })
            .count();

        let partial = inner
            .last_taken
            .as_ref()
            .filter(|taken| taken.is_open())
            .map(|taken| taken.seqno);
        if partial.is_some() {
            inner.rollback = partial;
        }

        inner.buffer.clear();
        inner.parked.clear();
        inner.predicates.clear();
        inner.fragments = 0;
        inner.discard_count += dropped_fragments as u64;
        inner.state = QueueState::Closed;
        self.record_depth(&inner);
        let rollback = inner.rollback;
        drop(inner);

        if dropped_fragments > 0 {
            counter!(
                FANOUT_FRAGMENTS_DISCARDED_TOTAL,
                CHANNEL_LABEL => self.channel.to_string()
            )
            .increment(dropped_fragments as u64);
        }

        info!(
            channel = self.channel,
            dropped_fragments,
            rollback = ?rollback,
            "channel closed immediately"
        );
        self.wake_all();

        dropped_transactions + usize::from(partial.is_some())
    }

    pub fn state(&self) -> QueueState {
        self.lock().state
    }

    /// Number of buffered items, fragments and control events.
    pub fn depth(&self) -> usize {
        self.lock().buffer.len()
    }

    /// Header of the last fragment posted to this channel.
    pub fn tail(&self) -> Option<EventHeader> {
        self.lock().tail.clone()
    }

    pub fn stats(&self) -> ReadQueueStats {
        let inner = self.lock();
        ReadQueueStats {
            state: inner.state,
            depth: inner.buffer.len(),
            accept_count: inner.accept_count,
            discard_count: inner.discard_count,
            control_count: inner.control_count,
        }
    }

    /// Returns a future completing on the next change of the buffer or state.
    pub fn readable(&self) -> Notified<'_> {
        self.readable.notified()
    }

    fn push(&self, inner: &mut Inner, event: TransactionEvent) -> FanoutResult<()> {
        validate_order(OrderScope::Channel(self.channel), inner.tail.as_ref(), &event)?;

        let header = event.header();
        let mut matched = 0;
        inner.predicates.retain(|predicate| {
            if predicate(&event) {
                matched += 1;
                return false;
            }
            true
        });

        inner.buffer.push_back(QueueEvent::Transaction(event));
        inner.fragments += 1;
        inner.accept_count += 1;
        inner.since_sync += 1;
        inner.tail = Some(header.clone());
        counter!(
            FANOUT_FRAGMENTS_ACCEPTED_TOTAL,
            CHANNEL_LABEL => self.channel.to_string()
        )
        .increment(1);

        for _ in 0..matched {
            inner
                .parked
                .entry(header.seqno)
                .or_default()
                .push(ControlEvent::new(ControlKind::Predicate, header.seqno));
        }

        if header.last_frag {
            self.release_parked(inner, &header);

            if let Some(interval) = self.sync_interval
                && inner.since_sync >= interval
            {
                inner.since_sync = 0;
                let index = inner.buffer.len();
                self.enqueue_control(
                    inner,
                    index,
                    ControlEvent {
                        kind: ControlKind::Sync,
                        seqno: header.seqno,
                        header: Some(header.clone()),
                    },
                );
            }

            if inner.drain_pending {
                self.start_drain(inner);
            }
        }

        self.record_depth(inner);

        Ok(())
    }

    fn start_drain(&self, inner: &mut Inner) {
        inner.state = QueueState::Draining;
        inner.drain_pending = false;
        inner.predicates.clear();

        // Anchors beyond the tail will never be posted here.
        let parked = std::mem::take(&mut inner.parked);
        let tail = inner.tail.clone();
        for mut control in parked.into_values().flatten() {
            if let Some(tail) = &tail {
                control.seqno = control.seqno.max(tail.seqno);
            }
            control.header = tail.clone();
            let index = inner.buffer.len();
            self.enqueue_control(inner, index, control);
        }

        debug!(channel = self.channel, "channel draining");
    }

    fn place(&self, inner: &mut Inner, mut control: ControlEvent) -> Placement {
        let anchor = control.seqno;
        let pending_anchor = match &inner.tail {
            None => true,
            Some(tail) => anchor > tail.seqno || (anchor == tail.seqno && tail.is_open()),
        };
        if pending_anchor {
            inner.parked.entry(anchor).or_default().push(control);
            return Placement::Parked;
        }

        let first_later = inner.buffer.iter().position(|event| {
            matches!(event, QueueEvent::Transaction(transaction) if transaction.seqno > anchor)
        });

        let index = match first_later {
            None => inner.buffer.len(),
            Some(index) => match &inner.buffer[index] {
                // The consumer is inside this transaction, the boundary is after its last
                // fragment.
                QueueEvent::Transaction(transaction) if !transaction.is_first_fragment() => {
                    let seqno = transaction.seqno;
                    let closing = inner.buffer.iter().skip(index).position(|event| {
                        matches!(
                            event,
                            QueueEvent::Transaction(t) if t.seqno == seqno && t.last_frag
                        )
                    });

                    match closing {
                        Some(offset) => index + offset + 1,
                        None => {
                            inner.parked.entry(seqno).or_default().push(control);
                            return Placement::Parked;
                        }
                    }
                }
                _ => index,
            },
        };

        let preceding = inner
            .buffer
            .iter()
            .take(index)
            .rev()
            .find_map(|event| event.as_transaction().map(TransactionEvent::header))
            .or_else(|| inner.last_taken.clone());

        control.seqno = preceding
            .as_ref()
            .map_or(anchor, |header| header.seqno.max(anchor));
        control.header = preceding;
        self.enqueue_control(inner, index, control);

        Placement::Queued
    }

    fn release_parked(&self, inner: &mut Inner, header: &EventHeader) {
        let later = inner.parked.split_off(&header.seqno.saturating_add(1));
        let due = std::mem::replace(&mut inner.parked, later);

        for mut control in due.into_values().flatten() {
            control.seqno = control.seqno.max(header.seqno);
            control.header = Some(header.clone());
            let index = inner.buffer.len();
            self.enqueue_control(inner, index, control);
        }
    }

    fn enqueue_control(&self, inner: &mut Inner, index: usize, control: ControlEvent) {
        counter!(
            FANOUT_CONTROL_EVENTS_TOTAL,
            CHANNEL_LABEL => self.channel.to_string(),
            CONTROL_KIND_LABEL => control_kind_label(&control.kind),
        )
        .increment(1);

        inner.control_count += 1;
        inner.buffer.insert(index, QueueEvent::Control(control));
    }

    fn record_depth(&self, inner: &Inner) {
        gauge!(FANOUT_CHANNEL_DEPTH, CHANNEL_LABEL => self.channel.to_string())
            .set(inner.buffer.len() as f64);
    }

    fn wake_all(&self) {
        self.readable.notify_waiters();
        self.writable.notify_waiters();
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl fmt::Debug for ReadQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadQueue")
            .field("channel", &self.channel)
            .field("capacity", &self.capacity)
            .field("stats", &self.stats())
            .finish()
    }
}

/// Stream whose ordering is validated.
#[derive(Debug, Clone, Copy)]
pub(crate) enum OrderScope {
    Channel(usize),
    Intake,
}

impl fmt::Display for OrderScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderScope::Channel(channel) => write!(f, "channel {channel}"),
            OrderScope::Intake => write!(f, "intake"),
        }
    }
}

/// Checks that `event` continues the open transaction at `tail` or opens a later one.
pub(crate) fn validate_order(
    scope: OrderScope,
    tail: Option<&EventHeader>,
    event: &TransactionEvent,
) -> FanoutResult<()> {
    match tail {
        Some(tail) if tail.is_open() => {
            if event.seqno != tail.seqno || event.fragno != tail.fragno + 1 {
                return Err(fanout_error!(
                    ErrorKind::OrderingViolation,
                    "Fragment does not continue the open transaction",
                    format!(
                        "{scope} expected seqno {} fragment {}, got seqno {} fragment {}",
                        tail.seqno,
                        tail.fragno + 1,
                        event.seqno,
                        event.fragno
                    )
                ));
            }
        }
        _ => {
            if !event.is_first_fragment() {
                return Err(fanout_error!(
                    ErrorKind::OrderingViolation,
                    "Transaction does not start with its first fragment",
                    format!(
                        "{scope} got seqno {} fragment {}",
                        event.seqno, event.fragno
                    )
                ));
            }

            if let Some(tail) = tail
                && event.seqno <= tail.seqno
            {
                return Err(fanout_error!(
                    ErrorKind::OrderingViolation,
                    "Sequence number does not increase",
                    format!(
                        "{scope} got seqno {} after seqno {}",
                        event.seqno, tail.seqno
                    )
                ));
            }
        }
    }

    Ok(())
}

fn control_kind_label(kind: &ControlKind) -> &'static str {
    match kind {
        ControlKind::Sync => "sync",
        ControlKind::OutOfBand => "out_of_band",
        ControlKind::Predicate => "predicate",
        ControlKind::Watch(_) => "watch",
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use chrono::{DateTime, Utc};

    use super::*;

    fn ts() -> DateTime<Utc> {
        DateTime::from_timestamp_millis(1_700_000_000_000).unwrap()
    }

    fn fragment(seqno: Seqno, fragno: u32, last_frag: bool) -> TransactionEvent {
        TransactionEvent::fragment(
            seqno,
            fragno,
            last_frag,
            Some("shard".to_string()),
            ts(),
            Bytes::new(),
        )
    }

    fn take(queue: &ReadQueue) -> Option<QueueEvent> {
        match queue.try_take(|_| true) {
            Polled::Event(event) => Some(event),
            _ => None,
        }
    }

    async fn post(queue: &ReadQueue, event: TransactionEvent) {
        assert!(queue.post(event, None).await.unwrap().is_accepted());
    }

    #[tokio::test]
    async fn take_preserves_insertion_order() {
        let queue = ReadQueue::new(0, 10, None);
        post(&queue, fragment(1, 0, true)).await;
        post(&queue, fragment(2, 0, false)).await;
        post(&queue, fragment(2, 1, true)).await;

        let seqnos: Vec<_> = std::iter::from_fn(|| take(&queue))
            .map(|event| (event.seqno(), event.as_transaction().unwrap().fragno))
            .collect();
        assert_eq!(seqnos, vec![(1, 0), (2, 0), (2, 1)]);
    }

    #[tokio::test]
    async fn control_for_open_transaction_waits_for_last_fragment() {
        let queue = ReadQueue::new(0, 10, None);
        post(&queue, fragment(5, 0, false)).await;

        let placement = queue
            .post_out_of_band(ControlEvent::new(ControlKind::OutOfBand, 5))
            .unwrap();
        assert_eq!(placement, Placement::Parked);
        assert_eq!(queue.depth(), 1);

        post(&queue, fragment(5, 1, true)).await;

        let kinds: Vec<_> = std::iter::from_fn(|| take(&queue)).collect();
        assert_eq!(kinds.len(), 3);
        assert!(kinds[0].as_transaction().is_some());
        assert!(kinds[1].as_transaction().unwrap().last_frag);
        assert_eq!(kinds[2].as_control().unwrap().seqno, 5);
    }

    #[tokio::test]
    async fn passed_anchor_is_emitted_with_current_position() {
        let queue = ReadQueue::new(0, 10, None);
        post(&queue, fragment(3, 0, true)).await;
        post(&queue, fragment(8, 0, true)).await;
        take(&queue);
        take(&queue);

        queue
            .post_out_of_band(ControlEvent::new(ControlKind::OutOfBand, 2))
            .unwrap();

        let control = take(&queue).unwrap();
        let control = control.as_control().unwrap();
        assert_eq!(control.seqno, 8);
        assert_eq!(control.header.as_ref().map(|h| h.seqno), Some(8));
    }

    #[tokio::test]
    async fn passed_anchor_is_inserted_before_later_transactions() {
        let queue = ReadQueue::new(0, 10, None);
        post(&queue, fragment(3, 0, true)).await;
        post(&queue, fragment(8, 0, true)).await;

        queue
            .post_out_of_band(ControlEvent::new(ControlKind::OutOfBand, 5))
            .unwrap();

        let events: Vec<_> = std::iter::from_fn(|| take(&queue)).collect();
        assert_eq!(events[0].seqno(), 3);
        assert_eq!(events[1].as_control().unwrap().seqno, 5);
        assert_eq!(events[2].seqno(), 8);
    }

    #[tokio::test]
    async fn sync_predicate_fires_once_after_matching_transaction() {
        let queue = ReadQueue::new(0, 10, None);
        queue.add_watch_sync_predicate(Arc::new(|event: &TransactionEvent| event.seqno >= 2));

        post(&queue, fragment(1, 0, true)).await;
        post(&queue, fragment(2, 0, false)).await;
        post(&queue, fragment(2, 1, true)).await;
        post(&queue, fragment(3, 0, true)).await;

        let controls: Vec<_> = std::iter::from_fn(|| take(&queue))
            .filter_map(|event| event.as_control().cloned())
            .collect();
        assert_eq!(controls.len(), 1);
        assert_eq!(controls[0].kind, ControlKind::Predicate);
        assert_eq!(controls[0].seqno, 2);
    }

    #[tokio::test]
    async fn auto_sync_respects_transaction_boundaries() {
        let queue = ReadQueue::new(0, 10, Some(2));
        post(&queue, fragment(1, 0, false)).await;
        post(&queue, fragment(1, 1, false)).await;
        post(&queue, fragment(1, 2, true)).await;
        post(&queue, fragment(2, 0, true)).await;

        let events: Vec<_> = std::iter::from_fn(|| take(&queue)).collect();
        assert_eq!(events.len(), 5);
        let sync = events[3].as_control().unwrap();
        assert_eq!(sync.kind, ControlKind::Sync);
        assert_eq!(sync.seqno, 1);
        assert_eq!(events[4].seqno(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn post_times_out_when_full() {
        let queue = ReadQueue::new(0, 1, None);
        post(&queue, fragment(1, 0, true)).await;

        let until = Instant::now() + Duration::from_millis(100);
        let offer = queue.post(fragment(2, 0, true), Some(until)).await.unwrap();
        assert!(matches!(offer, Offer::TimedOut(event) if event.seqno == 2));
    }

    #[tokio::test]
    async fn out_of_order_fragments_are_rejected() {
        let queue = ReadQueue::new(0, 10, None);
        post(&queue, fragment(4, 0, false)).await;

        let err = queue.post(fragment(5, 0, true), None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OrderingViolation);

        let err = queue.post(fragment(4, 2, true), None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OrderingViolation);
    }

    #[tokio::test]
    async fn draining_queue_hands_out_remaining_events_then_closes() {
        let queue = ReadQueue::new(0, 10, None);
        post(&queue, fragment(1, 0, true)).await;
        queue.begin_drain();

        let err = queue.post(fragment(2, 0, true), None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::QueueClosed);
        assert!(matches!(queue.try_take(|_| false), Polled::Event(_)));
        assert!(matches!(
            queue.try_take(|_| true),
            Polled::Closed { rollback: None }
        ));
        assert_eq!(queue.stats().discard_count, 1);
    }

    #[tokio::test]
    async fn drain_requested_mid_transaction_waits_for_last_fragment() {
        let queue = ReadQueue::new(0, 10, None);
        post(&queue, fragment(1, 0, false)).await;
        queue.begin_drain();
        assert_eq!(queue.state(), QueueState::Accepting);

        post(&queue, fragment(1, 1, true)).await;
        assert_eq!(queue.state(), QueueState::Draining);

        take(&queue);
        take(&queue);
        assert!(matches!(
            queue.try_take(|_| true),
            Polled::Closed { rollback: None }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn take_returns_empty_after_timeout() {
        let queue = ReadQueue::new(0, 10, None);

        let until = Instant::now() + Duration::from_millis(100);
        assert_eq!(queue.take(Some(until)).await, Take::Empty);

        post(&queue, fragment(1, 0, true)).await;
        assert!(matches!(queue.take(None).await, Take::Event(event) if event.seqno() == 1));
    }

    #[tokio::test]
    async fn control_at_tail_follows_last_posted_transaction() {
        let queue = ReadQueue::new(0, 10, None);
        post(&queue, fragment(2, 0, true)).await;

        let placement = queue
            .post_at_tail(ControlEvent::new(ControlKind::OutOfBand, 9))
            .unwrap();
        assert_eq!(placement, Placement::Queued);

        take(&queue);
        let control = take(&queue).unwrap();
        let control = control.as_control().unwrap();
        assert_eq!(control.seqno, 9);
        assert_eq!(control.header.as_ref().map(|h| h.seqno), Some(2));
    }

    #[tokio::test]
    async fn drain_emits_controls_whose_anchor_never_arrives() {
        let queue = ReadQueue::new(0, 10, None);
        post(&queue, fragment(2, 0, true)).await;

        let placement = queue
            .post_out_of_band(ControlEvent::new(ControlKind::OutOfBand, 7))
            .unwrap();
        assert_eq!(placement, Placement::Parked);

        queue.begin_drain();

        assert_eq!(take(&queue).unwrap().seqno(), 2);
        let control = take(&queue).unwrap();
        let control = control.as_control().unwrap();
        assert_eq!(control.seqno, 7);
        assert_eq!(control.header.as_ref().map(|h| h.seqno), Some(2));
        assert!(matches!(
            queue.try_take(|_| true),
            Polled::Closed { rollback: None }
        ));
    }

    #[tokio::test]
    async fn immediate_close_reports_rollback_of_partial_transaction() {
        let queue = ReadQueue::new(0, 10, None);
        post(&queue, fragment(1, 0, false)).await;
        post(&queue, fragment(1, 1, false)).await;
        take(&queue);

        assert_eq!(queue.close_immediately(), 1);
        assert!(matches!(
            queue.try_take(|_| true),
            Polled::Closed { rollback: Some(1) }
        ));
        assert_eq!(queue.stats().discard_count, 1);
    }
}
