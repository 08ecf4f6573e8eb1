#![cfg(feature = "test-utils")]

use std::time::Duration;

use fanout::store::parallel::ParallelQueue;
use fanout::test_utils::event::{shard, transaction_at};
use fanout::test_utils::pipeline::test_queue_config;
use fanout::types::{QueueEvent, Take};
use fanout_telemetry::tracing::init_test_tracing;
use tokio::time::Instant;

fn guarded_queue(max_delay_interval_secs: i64) -> ParallelQueue {
    let mut config = test_queue_config(2);
    config.max_offline_interval_secs = 5;
    config.max_delay_interval_secs = max_delay_interval_secs;

    ParallelQueue::from_config(&config).unwrap()
}

fn seqno_of(take: Take) -> u64 {
    match take {
        Take::Event(QueueEvent::Transaction(transaction)) => transaction.seqno,
        other => panic!("expected a transaction, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn lagging_channel_waits_until_the_gap_closes() {
    init_test_tracing();
    let queue = guarded_queue(-1);

    queue.accept(transaction_at(1, &shard(0), 0)).await.unwrap();
    queue.accept(transaction_at(2, &shard(1), 20_000)).await.unwrap();

    let take = queue
        .consume_timeout(0, Duration::from_secs(60))
        .await
        .unwrap();
    assert_eq!(take, Take::Empty);

    // The leading channel is never held back.
    let take = queue
        .consume_timeout(1, Duration::from_millis(10))
        .await
        .unwrap();
    assert_eq!(seqno_of(take), 2);

    let take = queue
        .consume_timeout(0, Duration::from_millis(10))
        .await
        .unwrap();
    assert_eq!(seqno_of(take), 1);
}

#[tokio::test(start_paused = true)]
async fn blocked_consumer_wakes_when_the_leading_channel_releases() {
    init_test_tracing();
    let queue = guarded_queue(-1);

    queue.accept(transaction_at(1, &shard(0), 0)).await.unwrap();
    queue.accept(transaction_at(2, &shard(1), 20_000)).await.unwrap();

    let consumer = tokio::spawn({
        let queue = queue.clone();
        async move { queue.consume(0).await }
    });
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(!consumer.is_finished());

    queue.consume(1).await.unwrap();
    assert_eq!(seqno_of(consumer.await.unwrap().unwrap()), 1);
}

#[tokio::test(start_paused = true)]
async fn delay_override_forces_release() {
    init_test_tracing();
    let queue = guarded_queue(2);

    queue.accept(transaction_at(1, &shard(0), 0)).await.unwrap();
    queue.accept(transaction_at(2, &shard(1), 20_000)).await.unwrap();

    let started = Instant::now();
    let take = queue
        .consume_timeout(0, Duration::from_secs(10))
        .await
        .unwrap();
    let waited = started.elapsed();

    assert_eq!(seqno_of(take), 1);
    assert!(waited >= Duration::from_secs(2));
    assert!(waited < Duration::from_secs(10));
}

#[tokio::test(start_paused = true)]
async fn gap_within_offline_interval_does_not_block() {
    init_test_tracing();
    let queue = guarded_queue(-1);

    queue.accept(transaction_at(1, &shard(0), 0)).await.unwrap();
    queue.accept(transaction_at(2, &shard(1), 4_000)).await.unwrap();

    let take = queue
        .consume_timeout(0, Duration::from_millis(10))
        .await
        .unwrap();
    assert_eq!(seqno_of(take), 1);
}

#[tokio::test(start_paused = true)]
async fn channel_ahead_of_the_others_is_never_blocked() {
    init_test_tracing();
    let queue = guarded_queue(-1);

    // The source clock moved backwards between the two transactions.
    queue.accept(transaction_at(1, &shard(0), 30_000)).await.unwrap();
    queue.accept(transaction_at(2, &shard(1), 0)).await.unwrap();

    let take = queue
        .consume_timeout(0, Duration::from_millis(10))
        .await
        .unwrap();
    assert_eq!(seqno_of(take), 1);

    let take = queue
        .consume_timeout(1, Duration::from_millis(10))
        .await
        .unwrap();
    assert_eq!(seqno_of(take), 2);
}

#[tokio::test(start_paused = true)]
async fn graceful_drain_ignores_the_guard() {
    init_test_tracing();
    let queue = guarded_queue(-1);

    queue.accept(transaction_at(1, &shard(0), 0)).await.unwrap();
    queue.accept(transaction_at(2, &shard(1), 20_000)).await.unwrap();
    queue.shutdown(false);

    let take = queue
        .consume_timeout(0, Duration::from_millis(10))
        .await
        .unwrap();
    assert_eq!(seqno_of(take), 1);
}
