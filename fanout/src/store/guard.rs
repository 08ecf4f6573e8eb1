//! Commit-time skew limiting between channels.
//!
//! Channels progress independently, so a channel that was starved of events could release a
//! transaction far behind what the other channels are about to release. The [`IntervalGuard`]
//! tracks, for every channel, the commit timestamps of its unreleased transactions and holds
//! back a channel whose next transaction trails the leading channel by more than the configured
//! offline interval. The leading timestamp is the oldest unreleased transaction of every other
//! channel with pending work, so the channel furthest ahead can always proceed. A held-back
//! channel is forcibly released once it has been blocked longer than the delay override.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::counter;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::sync::futures::Notified;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::metrics::{
    CHANNEL_LABEL, FANOUT_GUARD_BLOCKS_TOTAL, FANOUT_GUARD_FORCED_RELEASES_TOTAL,
};
use crate::types::Seqno;

const NO_TIMESTAMP: i64 = i64::MIN;
const NO_SEQNO: u64 = u64::MAX;

/// Watermarks of a single channel.
#[derive(Debug)]
struct ChannelWatermark {
    last_accepted_ts: AtomicI64,
    last_released_ts: AtomicI64,
    last_accepted_seqno: AtomicU64,
    last_released_seqno: AtomicU64,
    last_committed_seqno: AtomicU64,
    pending: AtomicUsize,
    unreleased: Mutex<VecDeque<i64>>,
    blocked_since: Mutex<Option<Instant>>,
}

impl ChannelWatermark {
    fn new() -> Self {
        Self {
            last_accepted_ts: AtomicI64::new(NO_TIMESTAMP),
            last_released_ts: AtomicI64::new(NO_TIMESTAMP),
            last_accepted_seqno: AtomicU64::new(NO_SEQNO),
            last_released_seqno: AtomicU64::new(NO_SEQNO),
            last_committed_seqno: AtomicU64::new(NO_SEQNO),
            pending: AtomicUsize::new(0),
            unreleased: Mutex::new(VecDeque::new()),
            blocked_since: Mutex::new(None),
        }
    }

    fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    fn blocked_since(&self) -> MutexGuard<'_, Option<Instant>> {
        lock(&self.blocked_since)
    }

    fn unreleased(&self) -> MutexGuard<'_, VecDeque<i64>> {
        lock(&self.unreleased)
    }

    /// Commit timestamp of the oldest unreleased transaction.
    fn oldest_unreleased(&self) -> Option<i64> {
        self.unreleased().front().copied()
    }
}

/// Snapshot of the watermarks of a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelWatermarks {
    pub last_accepted_timestamp: Option<DateTime<Utc>>,
    pub last_released_timestamp: Option<DateTime<Utc>>,
    pub last_accepted_seqno: Option<Seqno>,
    pub last_released_seqno: Option<Seqno>,
    pub pending: usize,
}

/// Decision returned by [`IntervalGuard::check_release`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    /// The transaction is within the offline interval of the leading channel.
    Allowed,
    /// The transaction trails the leading channel and must wait.
    Blocked,
    /// The transaction trails the leading channel but the delay override expired.
    Forced,
}

impl Release {
    pub fn is_released(self) -> bool {
        !matches!(self, Release::Blocked)
    }
}

/// Tracks per-channel watermarks and decides whether a channel may release its next
/// transaction.
///
/// The leading timestamp a channel is compared against is not the highest accepted timestamp of
/// the channels with pending work but the newest of their *oldest unreleased* timestamps,
/// excluding the channel itself. Two channels with backlogs can therefore never hold each
/// other back.
///
/// Committed positions are tracked alongside so the serialization drain can wait for earlier
/// work to be applied, not merely handed out.
///
/// Watermarks are atomics and only ever move forward. The per-channel list of unreleased commit
/// timestamps sits behind a short-lived lock that is never held across a wait.
#[derive(Debug)]
pub struct IntervalGuard {
    channels: Vec<ChannelWatermark>,
    max_offline_millis: i64,
    max_delay: Option<Duration>,
    changed: Notify,
}

impl IntervalGuard {
    /// Creates a guard for `channels` channels.
    ///
    /// `max_delay` of `None` disables the override: a lagging channel then waits until it is
    /// back inside the offline interval.
    pub fn new(channels: usize, max_offline: Duration, max_delay: Option<Duration>) -> Self {
        Self {
            channels: (0..channels).map(|_| ChannelWatermark::new()).collect(),
            max_offline_millis: i64::try_from(max_offline.as_millis()).unwrap_or(i64::MAX),
            max_delay,
            changed: Notify::new(),
        }
    }

    pub fn channels(&self) -> usize {
        self.channels.len()
    }

    /// Records a fragment posted to `channel`.
    ///
    /// The first fragment of a transaction increments the channel's pending count.
    pub fn record_accepted(&self, channel: usize, seqno: Seqno, commit_millis: i64, first: bool) {
        let watermark = &self.channels[channel];
        watermark
            .last_accepted_ts
            .fetch_max(commit_millis, Ordering::AcqRel);
        store_seqno_max(&watermark.last_accepted_seqno, seqno);
        if first {
            watermark.unreleased().push_back(commit_millis);
            watermark.pending.fetch_add(1, Ordering::AcqRel);
        }

        self.changed.notify_waiters();
    }

    /// Records that the last fragment of a transaction left `channel`.
    pub fn record_released(&self, channel: usize, seqno: Seqno, commit_millis: i64) {
        let watermark = &self.channels[channel];
        watermark
            .last_released_ts
            .fetch_max(commit_millis, Ordering::AcqRel);
        store_seqno_max(&watermark.last_released_seqno, seqno);
        if watermark.unreleased().pop_front().is_some() {
            decrement_pending(&watermark.pending);
        }

        self.changed.notify_waiters();
    }

    /// Records that `channel` committed every transaction up to `seqno`.
    pub fn record_committed(&self, channel: usize, seqno: Seqno) {
        store_seqno_max(&self.channels[channel].last_committed_seqno, seqno);
        self.changed.notify_waiters();
    }

    /// Records that an open transaction of `channel` was discarded before its release.
    pub fn record_discarded(&self, channel: usize) {
        let watermark = &self.channels[channel];
        if watermark.unreleased().pop_back().is_some() {
            decrement_pending(&watermark.pending);
        }
        self.changed.notify_waiters();
    }

    /// Returns `true` if `channel` may release a transaction committed at `commit_millis`.
    pub fn can_release(&self, channel: usize, commit_millis: i64) -> bool {
        self.check_release(channel, commit_millis, Instant::now())
            .is_released()
    }

    /// Decides whether `channel` may release a transaction committed at `commit_millis`.
    ///
    /// The leading timestamp is the newest of the oldest unreleased transactions of the other
    /// channels that still hold pending work. A transaction is released when it is at or past
    /// the leading timestamp, when it trails by at most the offline interval, or when the
    /// channel has been blocked for longer than the delay override.
    pub fn check_release(&self, channel: usize, commit_millis: i64, now: Instant) -> Release {
        let watermark = &self.channels[channel];

        let Some(high) = self.leading_timestamp(channel) else {
            self.clear_block(channel);
            return Release::Allowed;
        };

        if commit_millis >= high || high.saturating_sub(commit_millis) <= self.max_offline_millis
        {
            self.clear_block(channel);
            return Release::Allowed;
        }

        let mut blocked_since = watermark.blocked_since();
        let since = match *blocked_since {
            Some(since) => since,
            None => {
                *blocked_since = Some(now);
                debug!(
                    channel,
                    gap_ms = high - commit_millis,
                    "channel held back behind leading commit timestamp"
                );
                counter!(FANOUT_GUARD_BLOCKS_TOTAL, CHANNEL_LABEL => channel.to_string())
                    .increment(1);
                now
            }
        };

        match self.max_delay {
            Some(max_delay) if now.saturating_duration_since(since) >= max_delay => {
                warn!(
                    channel,
                    gap_ms = high - commit_millis,
                    blocked_ms = now.saturating_duration_since(since).as_millis() as u64,
                    "forcing release of lagging channel after delay override"
                );
                counter!(
                    FANOUT_GUARD_FORCED_RELEASES_TOTAL,
                    CHANNEL_LABEL => channel.to_string()
                )
                .increment(1);
                Release::Forced
            }
            _ => Release::Blocked,
        }
    }

    /// Returns when a blocked `channel` will be forcibly released, if ever.
    pub fn forced_release_at(&self, channel: usize) -> Option<Instant> {
        let max_delay = self.max_delay?;
        let since = (*self.channels[channel].blocked_since())?;

        Some(since + max_delay)
    }

    /// Returns `true` if no channel holds a pending transaction.
    pub fn is_drained(&self) -> bool {
        self.channels.iter().all(|watermark| watermark.pending() == 0)
    }

    /// Returns `true` if every channel released and committed everything it accepted.
    pub fn is_committed(&self) -> bool {
        self.channels.iter().all(|watermark| {
            watermark.pending() == 0
                && load_seqno(&watermark.last_released_seqno).is_none_or(|released| {
                    load_seqno(&watermark.last_committed_seqno)
                        .is_some_and(|committed| committed >= released)
                })
        })
    }

    /// Number of accepted but unreleased transactions of `channel`.
    pub fn pending(&self, channel: usize) -> usize {
        self.channels[channel].pending()
    }

    /// Highest sequence number accepted on `channel`.
    pub fn last_accepted_seqno(&self, channel: usize) -> Option<Seqno> {
        load_seqno(&self.channels[channel].last_accepted_seqno)
    }

    /// Highest sequence number accepted on any channel.
    pub fn hi_seqno(&self) -> Option<Seqno> {
        self.channels
            .iter()
            .filter_map(|watermark| load_seqno(&watermark.last_accepted_seqno))
            .max()
    }

    /// Lowest released sequence number among channels with pending work.
    ///
    /// Returns [`Self::hi_seqno`] when nothing is pending, and `None` when a channel with
    /// pending work has not released anything yet.
    pub fn low_seqno(&self) -> Option<Seqno> {
        let mut low: Option<Seqno> = None;
        for watermark in self.channels.iter().filter(|w| w.pending() > 0) {
            let released = load_seqno(&watermark.last_released_seqno)?;
            low = Some(low.map_or(released, |low| low.min(released)));
        }

        low.or_else(|| self.hi_seqno())
    }

    /// Returns a snapshot of the watermarks of `channel`.
    pub fn watermarks(&self, channel: usize) -> ChannelWatermarks {
        let watermark = &self.channels[channel];
        ChannelWatermarks {
            last_accepted_timestamp: load_timestamp(&watermark.last_accepted_ts),
            last_released_timestamp: load_timestamp(&watermark.last_released_ts),
            last_accepted_seqno: load_seqno(&watermark.last_accepted_seqno),
            last_released_seqno: load_seqno(&watermark.last_released_seqno),
            pending: watermark.pending(),
        }
    }

    /// Returns a future completing on the next watermark change.
    pub fn changed(&self) -> Notified<'_> {
        self.changed.notified()
    }

    fn leading_timestamp(&self, channel: usize) -> Option<i64> {
        self.channels
            .iter()
            .enumerate()
            .filter(|(index, watermark)| *index != channel && watermark.pending() > 0)
            .filter_map(|(_, watermark)| watermark.oldest_unreleased())
            .max()
    }

    fn clear_block(&self, channel: usize) {
        let mut blocked_since = self.channels[channel].blocked_since();
        if blocked_since.take().is_some() {
            debug!(channel, "channel back within offline interval");
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // Critical sections never panic midway, a poisoned lock still holds consistent data.
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn store_seqno_max(target: &AtomicU64, seqno: Seqno) {
    let _ = target.fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
        (current == NO_SEQNO || seqno > current).then_some(seqno)
    });
}

fn load_seqno(source: &AtomicU64) -> Option<Seqno> {
    let seqno = source.load(Ordering::Acquire);
    (seqno != NO_SEQNO).then_some(seqno)
}

fn load_timestamp(source: &AtomicI64) -> Option<DateTime<Utc>> {
    let millis = source.load(Ordering::Acquire);
    if millis == NO_TIMESTAMP {
        return None;
    }

    DateTime::from_timestamp_millis(millis)
}

fn decrement_pending(pending: &AtomicUsize) {
    let _ = pending.fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
        count.checked_sub(1)
    });
}
