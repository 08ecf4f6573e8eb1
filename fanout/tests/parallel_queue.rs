#![cfg(feature = "test-utils")]

use std::sync::Arc;
use std::time::Duration;

use fanout::error::ErrorKind;
use fanout::store::parallel::ParallelQueue;
use fanout::test_utils::event::{
    fragmented, round_robin_transactions, shard, transaction, transaction_at, unsafe_transaction,
};
use fanout::test_utils::pipeline::test_queue_config;
use fanout::types::{ControlKind, Offer, QueueEvent, Take, TransactionEvent};
use fanout_telemetry::tracing::init_test_tracing;
use rand::Rng;

const SHORT_WAIT: Duration = Duration::from_millis(50);

async fn take_event(queue: &ParallelQueue, channel: usize) -> QueueEvent {
    match queue.consume_timeout(channel, Duration::from_secs(5)).await.unwrap() {
        Take::Event(event) => event,
        other => panic!("expected an event on channel {channel}, got {other:?}"),
    }
}

async fn take_transaction(queue: &ParallelQueue, channel: usize) -> TransactionEvent {
    match take_event(queue, channel).await {
        QueueEvent::Transaction(transaction) => transaction,
        QueueEvent::Control(control) => panic!("expected a transaction, got {control:?}"),
    }
}

#[tokio::test]
async fn transactions_are_spread_by_shard() {
    init_test_tracing();
    let queue = ParallelQueue::from_config(&test_queue_config(3)).unwrap();

    for event in round_robin_transactions(1, 90, 3) {
        queue.accept(event).await.unwrap();
    }

    for channel in 0..3 {
        let mut previous = 0;
        for _ in 0..30 {
            let transaction = take_transaction(&queue, channel).await;
            assert_eq!(transaction.shard_id, Some(shard(channel)));
            assert_eq!(transaction.channel, Some(channel));
            assert!(transaction.seqno > previous);
            previous = transaction.seqno;
        }

        let take = queue.consume_timeout(channel, SHORT_WAIT).await.unwrap();
        assert_eq!(take, Take::Empty);
    }

    let status = queue.status();
    assert_eq!(status.hi_seqno, Some(90));
    assert_eq!(status.serialization_count, 0);
    assert!(status.channels.iter().all(|channel| channel.stats.accept_count == 30));
}

#[tokio::test]
async fn fragments_of_a_transaction_stay_on_one_channel() {
    init_test_tracing();
    let queue = ParallelQueue::from_config(&test_queue_config(2)).unwrap();

    for event in fragmented(1, &shard(1), 4) {
        queue.accept(event).await.unwrap();
    }
    queue.accept(transaction(2, &shard(1))).await.unwrap();

    let mut taken = Vec::new();
    for _ in 0..5 {
        let transaction = take_transaction(&queue, 1).await;
        taken.push((transaction.seqno, transaction.fragno, transaction.last_frag));
    }

    assert_eq!(
        taken,
        vec![
            (1, 0, false),
            (1, 1, false),
            (1, 2, false),
            (1, 3, true),
            (2, 0, true)
        ]
    );
    assert_eq!(queue.peek(0).unwrap(), None);
}

#[tokio::test]
async fn ordering_violations_are_rejected() {
    init_test_tracing();
    let queue = ParallelQueue::from_config(&test_queue_config(2)).unwrap();

    queue.accept(transaction(5, &shard(0))).await.unwrap();

    let err = queue.accept(transaction(3, &shard(1))).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::OrderingViolation);

    let fragments = fragmented(6, &shard(1), 3);
    queue.accept(fragments[0].clone()).await.unwrap();
    let err = queue.accept(fragments[2].clone()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::OrderingViolation);

    let err = queue.accept(transaction(7, &shard(0))).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::OrderingViolation);

    // The rejected fragments left the stream where it was.
    queue.accept(fragments[1].clone()).await.unwrap();
    queue.accept(fragments[2].clone()).await.unwrap();
    queue.accept(transaction(7, &shard(0))).await.unwrap();
}

#[tokio::test]
async fn unknown_channel_is_rejected() {
    init_test_tracing();
    let queue = ParallelQueue::from_config(&test_queue_config(2)).unwrap();

    let err = queue.consume_timeout(2, SHORT_WAIT).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidChannel);

    let err = queue.commit(7, 1).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidChannel);
}

#[tokio::test(start_paused = true)]
async fn full_channel_hands_the_event_back_on_timeout() {
    init_test_tracing();
    let mut config = test_queue_config(2);
    config.max_queue_size = 2;
    let queue = ParallelQueue::from_config(&config).unwrap();

    queue.accept(transaction(1, &shard(0))).await.unwrap();
    queue.accept(transaction(2, &shard(0))).await.unwrap();

    let offer = queue
        .accept_timeout(transaction(3, &shard(0)), Duration::from_millis(100))
        .await
        .unwrap();
    let Offer::TimedOut(event) = offer else {
        panic!("expected the full channel to time out");
    };
    assert_eq!(event.seqno, 3);

    assert_eq!(take_transaction(&queue, 0).await.seqno, 1);
    let offer = queue
        .accept_timeout(event, Duration::from_millis(100))
        .await
        .unwrap();
    assert!(offer.is_accepted());
}

#[tokio::test]
async fn out_of_band_control_follows_its_anchor() {
    init_test_tracing();
    let queue = ParallelQueue::from_config(&test_queue_config(2)).unwrap();

    queue.accept(transaction(1, &shard(0))).await.unwrap();
    let mut fragments = fragmented(2, &shard(1), 3);
    queue.accept(fragments.remove(0)).await.unwrap();
    queue.accept(fragments.remove(0)).await.unwrap();

    assert_eq!(queue.post_out_of_band(2).unwrap(), 1);

    // The anchor is still open, so the control waits for its last fragment.
    assert_eq!(take_transaction(&queue, 1).await.fragno, 0);
    assert_eq!(take_transaction(&queue, 1).await.fragno, 1);
    let take = queue.consume_timeout(1, SHORT_WAIT).await.unwrap();
    assert_eq!(take, Take::Empty);

    queue.accept(fragments.remove(0)).await.unwrap();
    assert!(take_transaction(&queue, 1).await.last_frag);
    let QueueEvent::Control(control) = take_event(&queue, 1).await else {
        panic!("expected a control event");
    };
    assert_eq!(control.kind, ControlKind::OutOfBand);
    assert_eq!(control.seqno, 2);

    // Channel 0 never held the anchor.
    assert_eq!(take_transaction(&queue, 0).await.seqno, 1);
    let take = queue.consume_timeout(0, SHORT_WAIT).await.unwrap();
    assert_eq!(take, Take::Empty);
}

#[tokio::test]
async fn out_of_band_control_without_pending_channel_waits_on_serialization_channel() {
    init_test_tracing();
    let queue = ParallelQueue::from_config(&test_queue_config(2)).unwrap();

    queue.accept(transaction(1, &shard(1))).await.unwrap();
    assert_eq!(queue.post_out_of_band(5).unwrap(), 0);

    assert_eq!(take_transaction(&queue, 1).await.seqno, 1);
    queue.commit(1, 1).unwrap();
    let take = queue.consume_timeout(0, SHORT_WAIT).await.unwrap();
    assert_eq!(take, Take::Empty);

    queue.accept(unsafe_transaction(5)).await.unwrap();

    assert_eq!(take_transaction(&queue, 0).await.seqno, 5);
    let QueueEvent::Control(control) = take_event(&queue, 0).await else {
        panic!("expected a control event");
    };
    assert_eq!(control.kind, ControlKind::OutOfBand);
    assert_eq!(control.seqno, 5);
    assert_eq!(control.header.map(|header| header.seqno), Some(5));

    let take = queue.consume_timeout(1, SHORT_WAIT).await.unwrap();
    assert_eq!(take, Take::Empty);
}

#[tokio::test]
async fn out_of_band_control_for_a_taken_anchor_is_emitted_right_away() {
    init_test_tracing();
    let queue = ParallelQueue::from_config(&test_queue_config(2)).unwrap();

    queue.accept(transaction(1, &shard(1))).await.unwrap();
    assert_eq!(take_transaction(&queue, 1).await.seqno, 1);

    assert_eq!(queue.post_out_of_band(1).unwrap(), 0);

    let QueueEvent::Control(control) = take_event(&queue, 0).await else {
        panic!("expected a control event");
    };
    assert_eq!(control.kind, ControlKind::OutOfBand);
    assert_eq!(control.seqno, 1);
}

#[tokio::test]
async fn graceful_shutdown_emits_out_of_band_controls_still_waiting() {
    init_test_tracing();
    let queue = ParallelQueue::from_config(&test_queue_config(2)).unwrap();

    assert_eq!(queue.post_out_of_band(5).unwrap(), 0);
    let take = queue.consume_timeout(0, SHORT_WAIT).await.unwrap();
    assert_eq!(take, Take::Empty);

    queue.shutdown(false);

    let QueueEvent::Control(control) = take_event(&queue, 0).await else {
        panic!("expected a control event");
    };
    assert_eq!(control.kind, ControlKind::OutOfBand);
    assert_eq!(control.seqno, 5);
    assert_eq!(control.header, None);
    assert_eq!(
        queue.consume(0).await.unwrap(),
        Take::Closed { rollback: None }
    );
}

#[tokio::test]
async fn sync_controls_are_emitted_periodically() {
    init_test_tracing();
    let mut config = test_queue_config(1);
    config.sync_interval = Some(2);
    let queue = ParallelQueue::from_config(&config).unwrap();

    for seqno in 1..=4 {
        queue.accept(transaction(seqno, &shard(0))).await.unwrap();
    }

    let mut kinds = Vec::new();
    for _ in 0..6 {
        kinds.push(match take_event(&queue, 0).await {
            QueueEvent::Transaction(transaction) => format!("txn-{}", transaction.seqno),
            QueueEvent::Control(control) => format!("{:?}-{}", control.kind, control.seqno),
        });
    }

    assert_eq!(
        kinds,
        vec!["txn-1", "txn-2", "Sync-2", "txn-3", "txn-4", "Sync-4"]
    );
}

#[tokio::test]
async fn sync_predicate_fires_once_after_first_match() {
    init_test_tracing();
    let queue = ParallelQueue::from_config(&test_queue_config(1)).unwrap();
    queue.add_watch_sync_predicate(Arc::new(|event: &TransactionEvent| event.seqno >= 2));

    for seqno in 1..=3 {
        queue.accept(transaction(seqno, &shard(0))).await.unwrap();
    }

    let mut seqnos = Vec::new();
    for _ in 0..4 {
        seqnos.push(match take_event(&queue, 0).await {
            QueueEvent::Transaction(transaction) => (transaction.seqno, None),
            QueueEvent::Control(control) => (control.seqno, Some(control.kind)),
        });
    }

    assert_eq!(
        seqnos,
        vec![
            (1, None),
            (2, None),
            (2, Some(ControlKind::Predicate)),
            (3, None)
        ]
    );
}

#[tokio::test]
async fn status_is_serializable() {
    init_test_tracing();
    let queue = ParallelQueue::from_config(&test_queue_config(2)).unwrap();

    queue.accept(transaction_at(1, &shard(0), 10)).await.unwrap();
    queue.accept(transaction_at(2, &shard(1), 20)).await.unwrap();
    take_transaction(&queue, 0).await;
    queue.commit(0, 1).unwrap();

    let status = queue.status();
    assert_eq!(status.low_seqno, None);
    assert_eq!(status.hi_seqno, Some(2));
    assert_eq!(status.restart_seqno, Some(1));
    assert_eq!(status.channels[0].last_committed_seqno, Some(1));
    assert_eq!(status.channels[1].watermarks.pending, 1);

    let value = serde_json::to_value(&status).unwrap();
    assert_eq!(value["hi_seqno"], 2);
    assert_eq!(value["channels"][1]["state"], "accepting");
}

#[tokio::test]
async fn random_drain_order_delivers_every_transaction_once() {
    const TRANSACTIONS: u64 = 150;
    const CHANNELS: usize = 4;

    init_test_tracing();
    let queue = ParallelQueue::from_config(&test_queue_config(CHANNELS)).unwrap();
    let mut rng = rand::thread_rng();

    let mut events = Vec::new();
    for seqno in 1..=TRANSACTIONS {
        let shard_id = shard(rng.gen_range(0..CHANNELS));
        match seqno % 10 {
            0 => events.push(unsafe_transaction(seqno)),
            3 | 6 => events.extend(fragmented(seqno, &shard_id, rng.gen_range(2..=4))),
            _ => events.push(transaction(seqno, &shard_id)),
        }
    }

    let producer = tokio::spawn({
        let queue = queue.clone();
        async move {
            for event in events {
                queue.accept(event).await?;
            }
            queue.shutdown(false);
            Ok::<_, fanout::error::FanoutError>(())
        }
    });

    let mut delivered = Vec::new();
    let mut next_fragno = vec![0; CHANNELS];
    let mut open: Vec<usize> = (0..CHANNELS).collect();
    while !open.is_empty() {
        let index = rng.gen_range(0..open.len());
        let channel = open[index];

        for _ in 0..rng.gen_range(1..=5) {
            match queue.consume_timeout(channel, SHORT_WAIT).await.unwrap() {
                Take::Event(QueueEvent::Transaction(transaction)) => {
                    assert_eq!(transaction.fragno, next_fragno[channel]);
                    if transaction.last_frag {
                        next_fragno[channel] = 0;
                        delivered.push(transaction.seqno);
                        queue.commit(channel, transaction.seqno).unwrap();
                    } else {
                        next_fragno[channel] += 1;
                    }
                }
                Take::Event(QueueEvent::Control(_)) => {}
                Take::Empty => break,
                Take::Closed { rollback } => {
                    assert_eq!(rollback, None);
                    open.swap_remove(index);
                    break;
                }
            }
        }
    }

    producer.await.unwrap().unwrap();

    let count = delivered.len();
    delivered.sort_unstable();
    delivered.dedup();
    assert_eq!(delivered.len(), count, "a transaction was delivered twice");
    assert_eq!(delivered, (1..=TRANSACTIONS).collect::<Vec<_>>());
}
