//! Parallel queue.
//!
//! [`ParallelQueue`] accepts a single ordered stream of transaction fragments from one producer
//! and distributes it over a fixed number of channels, each drained by its own consumer. Shards
//! are mapped to channels by a [`Partitioner`] so per-shard order is preserved. Transactions
//! without a usable shard are serialized against every channel by the
//! [`SerializationCoordinator`], and the [`IntervalGuard`] keeps channels from drifting too far
//! apart in commit time.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use fanout_config::shared::ParallelQueueConfig;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::bail;
use crate::concurrency::deadline::deadline;
use crate::concurrency::shutdown::{ShutdownState, ShutdownTx, create_shutdown_channel};
use crate::error::{ErrorKind, FanoutError, FanoutResult};
use crate::fanout_error;
use crate::partition::{Partitioner, build_partitioner};
use crate::store::guard::{ChannelWatermarks, IntervalGuard};
use crate::store::read::{
    OrderScope, Polled, QueueState, ReadQueue, ReadQueueStats, SyncPredicate, validate_order,
};
use crate::store::serialization::SerializationCoordinator;
use crate::store::watch::{ProcessedRegistration, Watch, WatchRegistry};
use crate::types::{
    ControlEvent, ControlKind, EventHeader, Offer, QueueEvent, Seqno, Take, TransactionEvent,
    WatchId,
};

/// Status of a single channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelStatus {
    pub channel: usize,
    #[serde(flatten)]
    pub stats: ReadQueueStats,
    pub last_committed_seqno: Option<Seqno>,
    pub watermarks: ChannelWatermarks,
}

/// Snapshot of the queue for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueStatus {
    /// Number of serialization epochs entered so far.
    pub serialization_count: u64,
    /// Whether a run of unsafe transactions is currently in progress.
    pub serializing: bool,
    pub low_seqno: Option<Seqno>,
    pub hi_seqno: Option<Seqno>,
    /// Position a restarted pipeline must replay from.
    pub restart_seqno: Option<Seqno>,
    /// Fragments refused because the queue was shutting down.
    pub rejected: u64,
    pub channels: Vec<ChannelStatus>,
}

#[derive(Debug, Default)]
struct IntakeState {
    last: Option<EventHeader>,
}

#[derive(Debug)]
struct Inner {
    queues: Vec<ReadQueue>,
    partitioner: Arc<dyn Partitioner>,
    guard: IntervalGuard,
    coordinator: SerializationCoordinator,
    registry: WatchRegistry,
    intake: tokio::sync::Mutex<IntakeState>,
    shutdown_tx: ShutdownTx,
    first_seqno: OnceLock<Seqno>,
    rejected: AtomicU64,
}

/// Distributes an ordered transaction stream over independent channels.
///
/// Cloning is cheap and every clone refers to the same queue. A single task must call
/// [`ParallelQueue::accept`]; concurrent producers are serialized internally but their
/// interleaving is undefined. Each channel must be consumed by exactly one task.
#[derive(Debug, Clone)]
pub struct ParallelQueue {
    inner: Arc<Inner>,
}

impl ParallelQueue {
    /// Creates a queue with the partitioner named in `config`.
    pub fn from_config(config: &ParallelQueueConfig) -> FanoutResult<Self> {
        Self::new(config, build_partitioner(&config.partitioner))
    }

    /// Creates a queue with an explicit partitioner.
    ///
    /// Fails with [`ErrorKind::ConfigError`] if `config` is invalid.
    pub fn new(
        config: &ParallelQueueConfig,
        partitioner: Arc<dyn Partitioner>,
    ) -> FanoutResult<Self> {
        config.validate()?;

        let channels = config.channels;
        let queues = (0..channels)
            .map(|channel| ReadQueue::new(channel, config.max_queue_size, config.sync_interval))
            .collect();
        let (shutdown_tx, _) = create_shutdown_channel();

        info!(
            channels,
            max_queue_size = config.max_queue_size,
            max_offline_interval_secs = config.max_offline_interval_secs,
            max_delay_interval_secs = config.max_delay_interval_secs,
            serialization_channel = config.serialization_channel,
            "parallel queue configured"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                queues,
                partitioner,
                guard: IntervalGuard::new(
                    channels,
                    config.max_offline_interval(),
                    config.max_delay_interval(),
                ),
                coordinator: SerializationCoordinator::new(config.serialization_channel),
                registry: WatchRegistry::new(channels),
                intake: tokio::sync::Mutex::new(IntakeState::default()),
                shutdown_tx,
                first_seqno: OnceLock::new(),
                rejected: AtomicU64::new(0),
            }),
        })
    }

    pub fn channels(&self) -> usize {
        self.inner.queues.len()
    }

    /// Number of serialization epochs entered so far.
    pub fn serialization_count(&self) -> u64 {
        self.inner.coordinator.count()
    }

    /// Accepts the next fragment of the stream, waiting as long as needed.
    pub async fn accept(&self, event: TransactionEvent) -> FanoutResult<()> {
        match self.offer(event, None).await? {
            Offer::Accepted => Ok(()),
            Offer::TimedOut(event) => Err(fanout_error!(
                ErrorKind::InvalidState,
                "Accept without a deadline timed out",
                format!("seqno {} fragment {}", event.seqno, event.fragno)
            )),
        }
    }

    /// Accepts the next fragment of the stream, giving up after `timeout`.
    ///
    /// On timeout the fragment is handed back and nothing was accepted, the caller may offer it
    /// again later.
    pub async fn accept_timeout(
        &self,
        event: TransactionEvent,
        timeout: Duration,
    ) -> FanoutResult<Offer<TransactionEvent>> {
        self.offer(event, Some(Instant::now() + timeout)).await
    }

    async fn offer(
        &self,
        mut event: TransactionEvent,
        until: Option<Instant>,
    ) -> FanoutResult<Offer<TransactionEvent>> {
        let inner = &*self.inner;
        let mut intake = inner.intake.lock().await;
        let mut shutdown = inner.shutdown_tx.subscribe();

        let first = event.is_first_fragment();
        match shutdown.state() {
            ShutdownState::Running => {}
            ShutdownState::Graceful if !first => {}
            _ => {
                inner.rejected.fetch_add(1, Ordering::Relaxed);
                bail!(
                    ErrorKind::QueueShutdown,
                    "Cannot accept events after shutdown",
                    format!("seqno {} fragment {}", event.seqno, event.fragno)
                );
            }
        }

        validate_order(OrderScope::Intake, intake.last.as_ref(), &event)?;

        let channel = match intake.last.as_ref().and_then(|last| last.channel) {
            Some(channel) if !first => channel,
            _ => {
                if let Some(target) = inner.coordinator.drain_target(event.is_parallel_safe()) {
                    let drained = inner
                        .coordinator
                        .drain(
                            &inner.guard,
                            target,
                            until,
                            &mut shutdown,
                            ShutdownState::Graceful,
                        )
                        .await?;
                    if let Offer::TimedOut(()) = drained {
                        return Ok(Offer::TimedOut(event));
                    }
                }

                self.route(&event)?
            }
        };

        event.channel = Some(channel);
        let header = event.header();
        let seqno = event.seqno;
        let parallel_safe = event.is_parallel_safe();

        // Pending work is recorded before the post so the consumer can never release a
        // transaction the guard does not know about yet.
        if first {
            inner
                .guard
                .record_accepted(channel, seqno, event.commit_millis(), true);
        }

        let level = if first {
            ShutdownState::Graceful
        } else {
            ShutdownState::Immediate
        };
        let posted = tokio::select! {
            result = inner.queues[channel].post(event, until) => result,
            _ = shutdown.reached(level) => Err(fanout_error!(
                ErrorKind::Interrupted,
                "Accept interrupted by shutdown",
                format!("seqno {} fragment {}", header.seqno, header.fragno)
            )),
        };

        match posted {
            Ok(Offer::Accepted) => {}
            Ok(Offer::TimedOut(event)) => {
                if first {
                    inner.guard.record_discarded(channel);
                }
                return Ok(Offer::TimedOut(event));
            }
            Err(err) => {
                if first {
                    inner.guard.record_discarded(channel);
                }
                return Err(err);
            }
        }

        intake.last = Some(header);
        drop(intake);

        if first {
            let _ = inner.first_seqno.set(seqno);

            if parallel_safe {
                inner.coordinator.record_safe();
            } else {
                inner.coordinator.record_unsafe(seqno);
            }

            for id in inner.registry.on_accepted(seqno) {
                self.place_watch(channel, seqno, id);
            }
        }

        Ok(Offer::Accepted)
    }

    fn route(&self, event: &TransactionEvent) -> FanoutResult<usize> {
        let channels = self.channels();
        let channel = match event.shard_id.as_deref() {
            Some(shard_id) if event.is_parallel_safe() => {
                self.inner.partitioner.partition(shard_id, channels)
            }
            _ => self.inner.coordinator.channel(),
        };

        if channel >= channels {
            bail!(
                ErrorKind::InvalidChannel,
                "Partitioner returned a channel out of range",
                format!(
                    "shard {:?} mapped to channel {channel} of {channels}",
                    event.shard_id
                )
            );
        }

        Ok(channel)
    }

    fn place_watch(&self, channel: usize, seqno: Seqno, id: WatchId) {
        let control = ControlEvent::new(ControlKind::Watch(id), seqno);
        if let Err(err) = self.inner.queues[channel].post_out_of_band(control) {
            warn!(channel, seqno, %id, error = %err, "failed to place processed watch");
        }
    }

    /// Takes the next event of `channel`, waiting as long as needed.
    pub async fn consume(&self, channel: usize) -> FanoutResult<Take> {
        self.take_until(channel, None).await
    }

    /// Takes the next event of `channel`, returning [`Take::Empty`] after `timeout`.
    pub async fn consume_timeout(&self, channel: usize, timeout: Duration) -> FanoutResult<Take> {
        self.take_until(channel, Some(Instant::now() + timeout))
            .await
    }

    async fn take_until(&self, channel: usize, until: Option<Instant>) -> FanoutResult<Take> {
        let queue = self.queue(channel)?;
        let guard = &self.inner.guard;

        loop {
            let readable = queue.readable();
            let changed = guard.changed();
            tokio::pin!(readable);
            tokio::pin!(changed);
            readable.as_mut().enable();
            changed.as_mut().enable();

            let now = Instant::now();
            let forced_at = match queue.try_take(|transaction| {
                guard
                    .check_release(channel, transaction.commit_millis(), now)
                    .is_released()
            }) {
                Polled::Event(event) => {
                    self.on_taken(channel, &event);
                    return Ok(Take::Event(event));
                }
                Polled::Closed { rollback } => {
                    self.on_closed(channel);
                    return Ok(Take::Closed { rollback });
                }
                Polled::Blocked => guard.forced_release_at(channel),
                Polled::Empty => None,
            };

            tokio::select! {
                _ = &mut readable => {}
                _ = &mut changed => {}
                _ = deadline(forced_at) => {}
                _ = deadline(until) => return Ok(Take::Empty),
            }
        }
    }

    fn on_taken(&self, channel: usize, event: &QueueEvent) {
        match event {
            QueueEvent::Transaction(transaction) if transaction.last_frag => {
                self.inner.guard.record_released(
                    channel,
                    transaction.seqno,
                    transaction.commit_millis(),
                );
            }
            QueueEvent::Control(control) => {
                if let ControlKind::Watch(id) = control.kind {
                    self.inner.registry.resolve_processed(id, control.seqno);
                }
            }
            QueueEvent::Transaction(_) => {}
        }
    }

    fn on_closed(&self, channel: usize) {
        let all_closed = self
            .inner
            .queues
            .iter()
            .all(|queue| queue.state() == QueueState::Closed);

        if all_closed {
            debug!(channel, "all channels closed");
            self.inner.registry.close();
        }
    }

    /// Records that `channel` committed every transaction up to `seqno`.
    pub fn commit(&self, channel: usize, seqno: Seqno) -> FanoutResult<()> {
        self.queue(channel)?;
        self.inner.guard.record_committed(channel, seqno);
        self.inner
            .registry
            .commit(channel, seqno, &self.inner.guard);

        Ok(())
    }

    /// Returns a watch resolving once the transaction at `seqno` has been taken from its
    /// channel.
    ///
    /// The watch resolves with `seqno` itself. If no transaction carries exactly `seqno`, it
    /// resolves with the first accepted sequence number above it.
    pub fn watch_processed(&self, seqno: Seqno) -> FanoutResult<Watch> {
        let watch = match self.inner.registry.watch_processed(seqno)? {
            ProcessedRegistration::Deferred(watch) => return Ok(watch),
            ProcessedRegistration::Accepted(watch) => watch,
        };

        let control = ControlEvent::new(ControlKind::Watch(watch.id()), seqno);
        let placed = self
            .inner
            .queues
            .iter()
            .any(|queue| queue.post_if_holding(control.clone()).is_some());

        if !placed {
            self.inner.registry.resolve_processed(watch.id(), seqno);
        }

        Ok(watch)
    }

    /// Returns a watch resolving once every channel has committed through `seqno` or has no
    /// outstanding work.
    ///
    /// The watch resolves with the highest committed sequence number, at least `seqno`.
    pub fn watch_committed(&self, seqno: Seqno) -> FanoutResult<Watch> {
        self.inner
            .registry
            .watch_committed(seqno, &self.inner.guard)
    }

    /// Emits an out-of-band control event anchored to `anchor` on a single channel.
    ///
    /// If a channel still holds the anchor's transaction, the control follows its last
    /// fragment there. Otherwise the anchor has no pending channel and the control goes to the
    /// serialization channel. An anchor that was accepted elsewhere is emitted at that
    /// channel's current boundary, any other is parked until its stream passes the anchor.
    ///
    /// Returns the channel the control was posted to.
    pub fn post_out_of_band(&self, anchor: Seqno) -> FanoutResult<usize> {
        let inner = &*self.inner;
        let control = ControlEvent::new(ControlKind::OutOfBand, anchor);

        for queue in &inner.queues {
            if let Some(placement) = queue.post_if_holding(control.clone()) {
                debug!(
                    anchor,
                    channel = queue.channel(),
                    ?placement,
                    "out-of-band control follows its anchor"
                );
                return Ok(queue.channel());
            }
        }

        let queue = &inner.queues[inner.coordinator.channel()];
        let accepted = inner.guard.hi_seqno().is_some_and(|hi| hi >= anchor);
        let reached = queue.tail().is_some_and(|tail| tail.seqno >= anchor);
        let placement = if accepted && !reached {
            queue.post_at_tail(control)?
        } else {
            queue.post_out_of_band(control)?
        };
        debug!(
            anchor,
            channel = queue.channel(),
            ?placement,
            "out-of-band control without a pending channel"
        );

        Ok(queue.channel())
    }

    /// Registers `predicate` on every channel.
    ///
    /// Each channel emits a [`ControlKind::Predicate`] control after the first transaction it
    /// holds that matches.
    pub fn add_watch_sync_predicate(&self, predicate: SyncPredicate) {
        for queue in &self.inner.queues {
            queue.add_watch_sync_predicate(predicate.clone());
        }
    }

    /// Returns the head event of `channel` without taking it.
    pub fn peek(&self, channel: usize) -> FanoutResult<Option<QueueEvent>> {
        Ok(self.queue(channel)?.peek())
    }

    /// Reports a failure of the consumer of `channel`.
    ///
    /// A pending serialization drain is abandoned and the unsafe transaction waiting for it is
    /// not released.
    pub fn report_failure(&self, channel: usize, error: FanoutError) {
        self.inner.coordinator.report_failure(channel, error);
    }

    /// Position a restarted pipeline must replay the log from so that nothing is lost.
    ///
    /// Returns `None` before anything was accepted.
    pub fn restart_seqno(&self) -> Option<Seqno> {
        let first_seqno = self.inner.first_seqno.get().copied()?;
        let guard = &self.inner.guard;
        let registry = &self.inner.registry;

        let mut restart: Option<Seqno> = None;
        for channel in 0..self.channels() {
            let Some(accepted) = guard.last_accepted_seqno(channel) else {
                continue;
            };

            let committed = registry.committed_seqno(channel);
            if committed.is_some_and(|committed| committed >= accepted) {
                continue;
            }

            let from = committed.map_or(first_seqno, |committed| committed.saturating_add(1));
            restart = Some(restart.map_or(from, |restart| restart.min(from)));
        }

        restart.or_else(|| guard.hi_seqno().map(|hi| hi.saturating_add(1)))
    }

    pub fn status(&self) -> QueueStatus {
        let inner = &*self.inner;
        let channels = inner
            .queues
            .iter()
            .map(|queue| ChannelStatus {
                channel: queue.channel(),
                stats: queue.stats(),
                last_committed_seqno: inner.registry.committed_seqno(queue.channel()),
                watermarks: inner.guard.watermarks(queue.channel()),
            })
            .collect();

        QueueStatus {
            serialization_count: inner.coordinator.count(),
            serializing: inner.coordinator.in_progress(),
            low_seqno: inner.guard.low_seqno(),
            hi_seqno: inner.guard.hi_seqno(),
            restart_seqno: self.restart_seqno(),
            rejected: inner.rejected.load(Ordering::Relaxed),
            channels,
        }
    }

    /// Shuts the queue down.
    ///
    /// A graceful shutdown stops accepting new transactions, lets an open transaction receive
    /// its remaining fragments and leaves buffered content consumable. An immediate shutdown
    /// interrupts every waiter and drops everything not yet taken; a consumer that already took
    /// part of a transaction is told to roll it back.
    pub fn shutdown(&self, immediate: bool) {
        let inner = &*self.inner;
        if !inner.shutdown_tx.shutdown(immediate) {
            return;
        }

        if immediate {
            info!("shutting down parallel queue immediately");
            for queue in &inner.queues {
                let dropped = queue.close_immediately();
                for _ in 0..dropped {
                    inner.guard.record_discarded(queue.channel());
                }
            }
            inner.registry.close();
            return;
        }

        info!("shutting down parallel queue gracefully");
        inner.registry.cancel_deferred();
        for queue in &inner.queues {
            queue.begin_drain();
        }
    }

    /// Returns `true` once every channel is closed.
    pub fn is_closed(&self) -> bool {
        self.inner
            .queues
            .iter()
            .all(|queue| queue.state() == QueueState::Closed)
    }

    fn queue(&self, channel: usize) -> FanoutResult<&ReadQueue> {
        match self.inner.queues.get(channel) {
            Some(queue) => Ok(queue),
            None => Err(fanout_error!(
                ErrorKind::InvalidChannel,
                "Channel does not exist",
                format!("channel {channel} of {}", self.channels())
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use bytes::Bytes;
    use chrono::{DateTime, Utc};
    use fanout_config::shared::PartitionerConfig;
    use futures::poll;

    use super::*;
    use crate::types::UNKNOWN_SHARD_ID;

    fn config(channels: usize) -> ParallelQueueConfig {
        ParallelQueueConfig {
            channels,
            partitioner: PartitionerConfig::ShardMap {
                shards: BTreeMap::from([
                    ("a".to_string(), 0),
                    ("b".to_string(), 1),
                    ("c".to_string(), 2 % channels),
                ]),
            },
            max_queue_size: 16,
            ..ParallelQueueConfig::default()
        }
    }

    fn transaction(seqno: Seqno, shard_id: &str) -> TransactionEvent {
        TransactionEvent::new(
            seqno,
            Some(shard_id.to_string()),
            DateTime::from_timestamp_millis(1_700_000_000_000).unwrap_or_else(Utc::now),
            Bytes::new(),
        )
    }

    async fn next(queue: &ParallelQueue, channel: usize) -> Take {
        queue
            .consume_timeout(channel, Duration::from_millis(200))
            .await
            .unwrap()
    }

    #[test]
    fn invalid_configuration_is_rejected() {
        let config = ParallelQueueConfig {
            channels: 0,
            ..ParallelQueueConfig::default()
        };

        let err = ParallelQueue::from_config(&config).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConfigError);
    }

    #[tokio::test]
    async fn transactions_are_routed_by_shard() {
        let queue = ParallelQueue::from_config(&config(2)).unwrap();
        queue.accept(transaction(1, "a")).await.unwrap();
        queue.accept(transaction(2, "b")).await.unwrap();

        assert!(matches!(next(&queue, 0).await, Take::Event(event) if event.seqno() == 1));
        assert!(matches!(next(&queue, 1).await, Take::Event(event) if event.seqno() == 2));
        assert_eq!(next(&queue, 0).await, Take::Empty);
    }

    #[tokio::test]
    async fn unsafe_transaction_waits_for_drain() {
        let queue = ParallelQueue::from_config(&config(2)).unwrap();
        queue.accept(transaction(1, "b")).await.unwrap();

        let offer = queue
            .accept_timeout(transaction(2, UNKNOWN_SHARD_ID), Duration::from_millis(50))
            .await
            .unwrap();
        assert!(matches!(offer, Offer::TimedOut(event) if event.seqno == 2));
        assert_eq!(queue.serialization_count(), 0);

        assert!(matches!(next(&queue, 1).await, Take::Event(_)));
        let offer = queue
            .accept_timeout(transaction(2, UNKNOWN_SHARD_ID), Duration::from_millis(50))
            .await
            .unwrap();
        assert!(
            matches!(offer, Offer::TimedOut(_)),
            "taken but uncommitted work still holds the unsafe transaction back"
        );

        queue.commit(1, 1).unwrap();
        queue.accept(transaction(2, UNKNOWN_SHARD_ID)).await.unwrap();
        assert_eq!(queue.serialization_count(), 1);
        assert!(matches!(next(&queue, 0).await, Take::Event(event) if event.seqno() == 2));
    }

    #[tokio::test]
    async fn out_of_order_intake_is_rejected() {
        let queue = ParallelQueue::from_config(&config(2)).unwrap();
        queue.accept(transaction(5, "a")).await.unwrap();

        let err = queue.accept(transaction(4, "b")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OrderingViolation);
    }

    #[tokio::test]
    async fn processed_watch_resolves_with_target() {
        let queue = ParallelQueue::from_config(&config(2)).unwrap();
        let mut watch = queue.watch_processed(2).unwrap();

        queue.accept(transaction(1, "a")).await.unwrap();
        queue.accept(transaction(2, "b")).await.unwrap();
        assert!(poll!(&mut watch).is_pending());

        assert!(matches!(next(&queue, 1).await, Take::Event(event) if event.seqno() == 2));
        assert!(matches!(next(&queue, 1).await, Take::Event(QueueEvent::Control(_))));
        assert_eq!(watch.await.unwrap(), 2);
    }

    #[tokio::test]
    async fn commits_drive_restart_position() {
        let queue = ParallelQueue::from_config(&config(2)).unwrap();
        queue.accept(transaction(10, "a")).await.unwrap();
        queue.accept(transaction(11, "b")).await.unwrap();
        queue.accept(transaction(12, "a")).await.unwrap();
        assert_eq!(queue.restart_seqno(), Some(10));

        queue.commit(0, 10).unwrap();
        queue.commit(1, 11).unwrap();
        assert_eq!(queue.restart_seqno(), Some(11));

        queue.commit(0, 12).unwrap();
        assert_eq!(queue.restart_seqno(), Some(13));

        let status = queue.status();
        assert_eq!(status.hi_seqno, Some(12));
        assert_eq!(status.channels[0].last_committed_seqno, Some(12));
    }

    #[tokio::test]
    async fn invalid_channel_is_rejected() {
        let queue = ParallelQueue::from_config(&config(2)).unwrap();

        let err = queue.consume(7).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidChannel);
        let err = queue.commit(7, 1).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidChannel);
    }

    #[tokio::test]
    async fn graceful_shutdown_rejects_new_transactions() {
        let queue = ParallelQueue::from_config(&config(2)).unwrap();
        queue.accept(transaction(1, "a")).await.unwrap();
        queue.shutdown(false);

        let err = queue.accept(transaction(2, "a")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::QueueShutdown);
        assert_eq!(queue.status().rejected, 1);

        assert!(matches!(next(&queue, 0).await, Take::Event(_)));
        assert_eq!(next(&queue, 0).await, Take::Closed { rollback: None });
        assert_eq!(next(&queue, 1).await, Take::Closed { rollback: None });
        assert!(queue.is_closed());
    }
}
