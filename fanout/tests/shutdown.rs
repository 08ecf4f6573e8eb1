#![cfg(feature = "test-utils")]

use std::time::Duration;

use fanout::applier::memory::MemoryApplier;
use fanout::error::ErrorKind;
use fanout::log::memory::MemoryLog;
use fanout::store::parallel::ParallelQueue;
use fanout::test_utils::event::{fragmented, shard, transaction};
use fanout::test_utils::pipeline::{create_pipeline, test_pipeline_config, test_queue_config};
use fanout::test_utils::test_applier::TestApplierWrapper;
use fanout::pipeline::Pipeline;
use fanout::types::{QueueEvent, Take};
use fanout_telemetry::tracing::init_test_tracing;
use rand::random;

async fn take(queue: &ParallelQueue, channel: usize) -> Take {
    queue
        .consume_timeout(channel, Duration::from_secs(5))
        .await
        .unwrap()
}

async fn wait_until<F>(mut condition: F)
where
    F: FnMut() -> bool,
{
    tokio::time::timeout(Duration::from_secs(30), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition was not reached in time");
}

#[tokio::test]
async fn graceful_shutdown_finishes_the_open_transaction() {
    init_test_tracing();
    let queue = ParallelQueue::from_config(&test_queue_config(2)).unwrap();

    let fragments = fragmented(1, &shard(0), 3);
    queue.accept(fragments[0].clone()).await.unwrap();
    queue.accept(fragments[1].clone()).await.unwrap();

    queue.shutdown(false);

    let err = queue.accept(transaction(2, &shard(1))).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::QueueShutdown);

    queue.accept(fragments[2].clone()).await.unwrap();

    for fragno in 0..3 {
        let Take::Event(QueueEvent::Transaction(transaction)) = take(&queue, 0).await else {
            panic!("expected fragment {fragno}");
        };
        assert_eq!(transaction.fragno, fragno);
    }
    assert_eq!(take(&queue, 0).await, Take::Closed { rollback: None });
    assert!(!queue.is_closed());
    assert_eq!(take(&queue, 1).await, Take::Closed { rollback: None });
    assert!(queue.is_closed());

    assert_eq!(queue.status().rejected, 1);
}

#[tokio::test]
async fn immediate_shutdown_discards_and_requests_rollback() {
    init_test_tracing();
    let queue = ParallelQueue::from_config(&test_queue_config(2)).unwrap();

    let fragments = fragmented(1, &shard(0), 4);
    for fragment in &fragments[..3] {
        queue.accept(fragment.clone()).await.unwrap();
    }
    take(&queue, 0).await;
    take(&queue, 0).await;

    queue.shutdown(true);

    assert_eq!(take(&queue, 0).await, Take::Closed { rollback: Some(1) });
    assert_eq!(take(&queue, 1).await, Take::Closed { rollback: None });

    let err = queue.accept(fragments[3].clone()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::QueueShutdown);

    let status = queue.status();
    assert_eq!(status.restart_seqno, Some(1));
    assert_eq!(status.channels[0].stats.discard_count, 1);
}

#[tokio::test]
async fn immediate_shutdown_interrupts_blocked_producer() {
    init_test_tracing();
    let mut config = test_queue_config(1);
    config.max_queue_size = 1;
    let queue = ParallelQueue::from_config(&config).unwrap();

    queue.accept(transaction(1, &shard(0))).await.unwrap();
    let producer = tokio::spawn({
        let queue = queue.clone();
        async move { queue.accept(transaction(2, &shard(0))).await }
    });
    tokio::task::yield_now().await;

    queue.shutdown(true);

    let err = producer.await.unwrap().unwrap_err();
    assert!(matches!(
        err.kind(),
        ErrorKind::Interrupted | ErrorKind::QueueShutdown | ErrorKind::QueueClosed
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn restart_replays_the_unfinished_transaction() {
    init_test_tracing();
    let log = MemoryLog::new();
    log.append(transaction(1, &shard(0))).unwrap();
    log.append(transaction(2, &shard(1))).unwrap();
    let fragments = fragmented(3, &shard(0), 4);
    for fragment in &fragments[..3] {
        log.append(fragment.clone()).unwrap();
    }

    let applier = TestApplierWrapper::wrap(MemoryApplier::new());
    let mut pipeline = create_pipeline(random(), 2, log.reader(), applier.clone());
    let queue = pipeline.queue().clone();
    let commits = applier.wait_for_commits(2).await;

    pipeline.start().unwrap();
    commits.notified().await;
    wait_until(|| queue.status().hi_seqno == Some(3)).await;

    pipeline.shutdown_and_wait(true).await.unwrap();

    let restart = queue.restart_seqno().unwrap();
    assert!(restart <= 3);
    assert!(
        applier
            .committed()
            .await
            .iter()
            .all(|committed| committed.seqno != 3)
    );

    // The log catches up and a new pipeline resumes from the restart position.
    log.append(fragments[3].clone()).unwrap();
    let replay = TestApplierWrapper::wrap(MemoryApplier::new());
    let mut pipeline = create_pipeline(random(), 2, log.reader_from(restart), replay.clone());
    let replayed = replay
        .notify_on_commits(|committed| committed.iter().any(|committed| committed.seqno == 3))
        .await;

    pipeline.start().unwrap();
    replayed.notified().await;
    pipeline.shutdown_and_wait(false).await.unwrap();

    let transaction = replay
        .wrapped()
        .committed()
        .await
        .into_iter()
        .find(|transaction| transaction.seqno == 3)
        .unwrap();
    assert_eq!(transaction.fragments.len(), 4);
}

#[tokio::test(flavor = "multi_thread")]
async fn graceful_shutdown_escalates_when_a_transaction_never_completes() {
    init_test_tracing();
    let log = MemoryLog::new();
    let fragments = fragmented(1, &shard(0), 3);
    log.append(fragments[0].clone()).unwrap();
    log.append(fragments[1].clone()).unwrap();

    let mut config = test_pipeline_config(random(), 2);
    config.shutdown_timeout_ms = 200;
    let applier = MemoryApplier::new();
    let mut pipeline = Pipeline::new(config, log.reader(), applier.clone()).unwrap();
    let queue = pipeline.queue().clone();

    pipeline.start().unwrap();
    wait_until(|| queue.status().channels[0].stats.accept_count == 2).await;

    pipeline.shutdown_and_wait(false).await.unwrap();

    assert!(queue.is_closed());
    assert!(applier.committed().await.is_empty());
    assert_eq!(queue.restart_seqno(), Some(1));
}
