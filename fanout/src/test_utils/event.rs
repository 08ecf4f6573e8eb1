use bytes::Bytes;
use chrono::{DateTime, TimeDelta, Utc};

use crate::types::{Seqno, TransactionEvent, UNKNOWN_SHARD_ID};

/// Commit time, in seconds since the Unix epoch, of the transaction at offset zero.
pub const BASE_COMMIT_SECS: i64 = 1_700_000_000;

/// Returns the name of the `index`-th test shard.
pub fn shard(index: usize) -> String {
    format!("shard-{index}")
}

/// Returns a commit time `millis` milliseconds after [`BASE_COMMIT_SECS`].
pub fn commit_time(millis: i64) -> DateTime<Utc> {
    let base = DateTime::from_timestamp(BASE_COMMIT_SECS, 0).expect("base commit time is valid");
    base + TimeDelta::milliseconds(millis)
}

/// Creates a single-fragment transaction committed `seqno` milliseconds after the base time.
pub fn transaction(seqno: Seqno, shard_id: &str) -> TransactionEvent {
    transaction_at(seqno, shard_id, seqno as i64)
}

/// Creates a single-fragment transaction committed at `millis` after the base time.
pub fn transaction_at(seqno: Seqno, shard_id: &str, millis: i64) -> TransactionEvent {
    TransactionEvent::new(
        seqno,
        Some(shard_id.to_string()),
        commit_time(millis),
        payload(seqno, 0),
    )
}

/// Creates a transaction that cannot be attributed to a single shard.
pub fn unsafe_transaction(seqno: Seqno) -> TransactionEvent {
    transaction(seqno, UNKNOWN_SHARD_ID)
}

/// Splits the transaction `seqno` of `shard_id` into `fragments` fragments.
pub fn fragmented(seqno: Seqno, shard_id: &str, fragments: u32) -> Vec<TransactionEvent> {
    (0..fragments)
        .map(|fragno| {
            TransactionEvent::fragment(
                seqno,
                fragno,
                fragno + 1 == fragments,
                Some(shard_id.to_string()),
                commit_time(seqno as i64),
                payload(seqno, fragno),
            )
        })
        .collect()
}

/// Creates `count` transactions starting at `first_seqno`, assigned to `shards` shards in turn.
pub fn round_robin_transactions(
    first_seqno: Seqno,
    count: usize,
    shards: usize,
) -> Vec<TransactionEvent> {
    (0..count)
        .map(|index| transaction(first_seqno + index as Seqno, &shard(index % shards)))
        .collect()
}

fn payload(seqno: Seqno, fragno: u32) -> Bytes {
    Bytes::from(format!("txn-{seqno}-{fragno}"))
}
