use std::fmt;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Position of a transaction in the replicated log.
///
/// Sequence numbers are strictly increasing across transactions. All fragments of one
/// transaction share the same sequence number.
pub type Seqno = u64;

/// Shard identifier assigned to transactions whose shard could not be determined.
pub const UNKNOWN_SHARD_ID: &str = "#UNKNOWN";

/// Identifier handed out for every registered watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WatchId(pub u64);

impl fmt::Display for WatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "watch-{}", self.0)
    }
}

/// One fragment of a replicated transaction.
///
/// Large transactions are split into fragments numbered from zero. The fragment with
/// `last_frag` set closes the transaction. Fragments of one transaction are always routed to
/// the same channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionEvent {
    /// Sequence number of the transaction.
    pub seqno: Seqno,
    /// Position of this fragment within the transaction.
    pub fragno: u32,
    /// Whether this fragment closes the transaction.
    pub last_frag: bool,
    /// Shard the transaction belongs to, `None` when unassigned.
    #[serde(default)]
    pub shard_id: Option<String>,
    /// Source commit time of the transaction.
    pub commit_timestamp: DateTime<Utc>,
    /// Channel the fragment was routed to. Set by the queue on acceptance.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<usize>,
    /// Opaque payload forwarded to the applier.
    #[serde(default)]
    pub payload: Bytes,
}

impl TransactionEvent {
    /// Creates a single-fragment transaction.
    pub fn new(
        seqno: Seqno,
        shard_id: Option<String>,
        commit_timestamp: DateTime<Utc>,
        payload: Bytes,
    ) -> Self {
        Self::fragment(seqno, 0, true, shard_id, commit_timestamp, payload)
    }

    /// Creates one fragment of a possibly multi-fragment transaction.
    pub fn fragment(
        seqno: Seqno,
        fragno: u32,
        last_frag: bool,
        shard_id: Option<String>,
        commit_timestamp: DateTime<Utc>,
        payload: Bytes,
    ) -> Self {
        Self {
            seqno,
            fragno,
            last_frag,
            shard_id,
            commit_timestamp,
            channel: None,
            payload,
        }
    }

    /// Returns `true` if the transaction may run concurrently with other shards.
    ///
    /// Transactions with no shard, an empty shard or the [`UNKNOWN_SHARD_ID`] shard must be
    /// serialized against every other channel.
    pub fn is_parallel_safe(&self) -> bool {
        is_parallel_safe_shard(self.shard_id.as_deref())
    }

    /// Returns `true` if this fragment opens its transaction.
    pub fn is_first_fragment(&self) -> bool {
        self.fragno == 0
    }

    /// Commit timestamp in milliseconds since the Unix epoch.
    pub fn commit_millis(&self) -> i64 {
        self.commit_timestamp.timestamp_millis()
    }

    /// Returns the metadata of this fragment without its payload.
    pub fn header(&self) -> EventHeader {
        EventHeader {
            seqno: self.seqno,
            fragno: self.fragno,
            last_frag: self.last_frag,
            shard_id: self.shard_id.clone(),
            commit_timestamp: self.commit_timestamp,
            channel: self.channel,
        }
    }
}

/// Returns `true` if transactions of `shard_id` may be applied in parallel with other shards.
pub fn is_parallel_safe_shard(shard_id: Option<&str>) -> bool {
    match shard_id {
        None => false,
        Some(shard_id) => !shard_id.is_empty() && shard_id != UNKNOWN_SHARD_ID,
    }
}

/// Metadata of a transaction fragment without its payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventHeader {
    pub seqno: Seqno,
    pub fragno: u32,
    pub last_frag: bool,
    pub shard_id: Option<String>,
    pub commit_timestamp: DateTime<Utc>,
    pub channel: Option<usize>,
}

impl EventHeader {
    /// Returns `true` if the transaction of this fragment is still open.
    pub fn is_open(&self) -> bool {
        !self.last_frag
    }
}

/// Why a control event was inserted into a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "watch")]
pub enum ControlKind {
    /// Periodic marker emitted every `sync_interval` accepted events.
    Sync,
    /// Marker requested by the caller at an explicit position.
    OutOfBand,
    /// Marker emitted when a registered sync predicate first matched.
    Predicate,
    /// Marker resolving a processed watch once the consumer reaches it.
    Watch(WatchId),
}

/// Synthetic event carrying synchronization information through a channel.
///
/// Control events are only ever placed on a transaction boundary: a consumer never sees one
/// between two fragments of the same transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlEvent {
    /// Reason the event was emitted.
    pub kind: ControlKind,
    /// Position the event reports, at least the position it was anchored to.
    pub seqno: Seqno,
    /// Last transaction fragment emitted before this event on the same channel.
    pub header: Option<EventHeader>,
}

impl ControlEvent {
    pub fn new(kind: ControlKind, seqno: Seqno) -> Self {
        Self {
            kind,
            seqno,
            header: None,
        }
    }
}

/// Item delivered to a channel consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueEvent {
    /// A transaction fragment to apply.
    Transaction(TransactionEvent),
    /// A synchronization marker.
    Control(ControlEvent),
}

impl QueueEvent {
    /// Sequence number of the fragment or the position reported by the control event.
    pub fn seqno(&self) -> Seqno {
        match self {
            QueueEvent::Transaction(event) => event.seqno,
            QueueEvent::Control(event) => event.seqno,
        }
    }

    /// Returns the transaction fragment, if this is one.
    pub fn as_transaction(&self) -> Option<&TransactionEvent> {
        match self {
            QueueEvent::Transaction(event) => Some(event),
            QueueEvent::Control(_) => None,
        }
    }

    /// Returns the control event, if this is one.
    pub fn as_control(&self) -> Option<&ControlEvent> {
        match self {
            QueueEvent::Transaction(_) => None,
            QueueEvent::Control(event) => Some(event),
        }
    }
}

/// Result of taking from a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Take {
    /// The next event of the channel.
    Event(QueueEvent),
    /// No event became available before the timeout expired.
    Empty,
    /// The channel was shut down and fully drained.
    ///
    /// `rollback` holds the sequence number of a transaction whose earlier fragments were
    /// already taken but whose remaining fragments were discarded by an immediate shutdown. The
    /// consumer must roll back its partial work for that transaction.
    Closed { rollback: Option<Seqno> },
}

/// Result of offering an event under a timeout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Offer<T> {
    /// The item was accepted.
    Accepted,
    /// The timeout expired first and the item is handed back to the caller.
    TimedOut(T),
}

impl<T> Offer<T> {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Offer::Accepted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(shard_id: Option<&str>) -> TransactionEvent {
        TransactionEvent::new(1, shard_id.map(str::to_string), Utc::now(), Bytes::new())
    }

    #[test]
    fn unknown_or_missing_shards_are_not_parallel_safe() {
        assert!(!event(None).is_parallel_safe());
        assert!(!event(Some("")).is_parallel_safe());
        assert!(!event(Some(UNKNOWN_SHARD_ID)).is_parallel_safe());
        assert!(event(Some("orders")).is_parallel_safe());
    }

    #[test]
    fn transaction_event_deserializes_without_optional_fields() {
        let json = r#"{"seqno":7,"fragno":0,"last_frag":true,"commit_timestamp":"2024-01-01T00:00:00Z"}"#;
        let event: TransactionEvent = serde_json::from_str(json).unwrap();

        assert_eq!(event.seqno, 7);
        assert_eq!(event.shard_id, None);
        assert_eq!(event.channel, None);
        assert!(event.payload.is_empty());
    }
}
