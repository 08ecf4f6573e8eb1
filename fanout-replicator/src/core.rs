use fanout::log::file::JsonLinesLogReader;
use fanout::pipeline::{Pipeline, PipelineShutdown};
use fanout::store::parallel::ParallelQueue;
use fanout_config::shared::ReplicatorConfig;
use tokio::signal::unix::{Signal, SignalKind, signal};
use tracing::{info, warn};

use crate::applier::LoggingApplier;
use crate::error::ReplicatorResult;

/// Starts the replicator service with the provided configuration.
///
/// Opens the log, starts the pipeline and runs it until the log is drained and a shutdown
/// signal arrives, or until a worker fails.
pub async fn start_replicator_with_config(
    replicator_config: ReplicatorConfig,
) -> ReplicatorResult<()> {
    info!("starting replicator service");

    log_config(&replicator_config);

    let reader = JsonLinesLogReader::open(
        &replicator_config.log.path,
        replicator_config.log.start_seqno,
    )
    .await?;
    let applier = LoggingApplier::new();

    let pipeline = Pipeline::new(replicator_config.pipeline, reader, applier.clone())?;
    let queue = pipeline.queue().clone();

    let result = start_pipeline(pipeline).await;

    log_final_status(&queue);
    info!(
        committed = applier.committed_count(),
        rolled_back = applier.rolled_back_count(),
        "replicator stopped"
    );

    result
}

fn log_config(config: &ReplicatorConfig) {
    let queue = &config.pipeline.queue;
    info!(
        pipeline_id = config.pipeline.id,
        channels = queue.channels,
        partitioner = ?queue.partitioner,
        max_offline_interval_secs = queue.max_offline_interval_secs,
        max_delay_interval_secs = queue.max_delay_interval_secs,
        max_queue_size = queue.max_queue_size,
        sync_interval = queue.sync_interval,
        serialization_channel = queue.serialization_channel,
        "pipeline config"
    );
    info!(
        path = %config.log.path.display(),
        start_seqno = config.log.start_seqno,
        "log config"
    );
}

fn log_final_status(queue: &ParallelQueue) {
    match serde_json::to_string(&queue.status()) {
        Ok(status) => {
            info!("final queue status");
            println!("{status}");
        }
        Err(err) => warn!(error = %err, "failed to serialize the final queue status"),
    }
}

async fn start_pipeline(
    mut pipeline: Pipeline<JsonLinesLogReader, LoggingApplier>,
) -> ReplicatorResult<()> {
    // Register the handlers before starting so an early signal is not missed.
    let sigterm = signal(SignalKind::terminate())?;

    pipeline.start()?;

    let shutdown_handle = tokio::spawn(listen_for_shutdown(pipeline.shutdown_handle(), sigterm));

    let result = pipeline.wait().await;

    // The pipeline may stop on its own after a failure, the listener is no longer needed.
    if !shutdown_handle.is_finished() {
        shutdown_handle.abort();
    }

    result?;

    info!("pipeline finished");

    Ok(())
}

/// Requests a graceful shutdown on the first signal and an immediate one on the second.
async fn listen_for_shutdown(shutdown: PipelineShutdown, mut sigterm: Signal) {
    for immediate in [false, true] {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(err) = result {
                    warn!(error = %err, "failed to listen for sigint");
                    return;
                }
                info!(immediate, "sigint (ctrl+c) received, shutting down pipeline");
            }
            _ = sigterm.recv() => {
                info!(immediate, "sigterm received, shutting down pipeline");
            }
        }

        shutdown.shutdown(immediate);
    }
}
