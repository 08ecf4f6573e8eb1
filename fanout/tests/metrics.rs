#![cfg(feature = "test-utils")]

use fanout::store::parallel::ParallelQueue;
use fanout::test_utils::event::{shard, transaction, unsafe_transaction};
use fanout::test_utils::pipeline::test_queue_config;
use fanout_telemetry::metrics::init_metrics_handle;
use fanout_telemetry::tracing::init_test_tracing;

#[tokio::test]
async fn queue_activity_is_exported() {
    init_test_tracing();
    let handle = init_metrics_handle().unwrap();

    let queue = ParallelQueue::from_config(&test_queue_config(2)).unwrap();
    queue.accept(transaction(1, &shard(1))).await.unwrap();
    queue.consume(1).await.unwrap();
    queue.commit(1, 1).unwrap();
    queue.accept(unsafe_transaction(2)).await.unwrap();

    let rendered = handle.render();
    assert!(rendered.contains("fanout_fragments_accepted_total"));
    assert!(rendered.contains("fanout_channel_depth"));
    assert!(
        rendered
            .lines()
            .any(|line| line == "fanout_serializations_total 1")
    );

    // The handle is cached, a second call renders the same recorder.
    let again = init_metrics_handle().unwrap();
    assert!(again.render().contains("fanout_serializations_total"));
}
