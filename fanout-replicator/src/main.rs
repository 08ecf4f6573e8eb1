//! Fanout replicator service binary.
//!
//! Replays a JSON-lines transaction log through a parallel distribution pipeline and reports
//! what every channel applied. Includes telemetry and graceful shutdown on SIGINT/SIGTERM.

use std::net::SocketAddr;

use fanout_config::load_config;
use fanout_config::shared::ReplicatorConfig;
use fanout_telemetry::metrics::init_metrics;
use fanout_telemetry::tracing::init_tracing;
use tracing::error;

use crate::core::start_replicator_with_config;
use crate::error::{ReplicatorError, ReplicatorResult};

mod applier;
mod core;
mod error;

/// Entry point for the replicator service.
///
/// Loads and validates the configuration, initializes tracing, starts the async runtime and
/// launches the pipeline.
fn main() -> ReplicatorResult<()> {
    let replicator_config = load_config::<ReplicatorConfig>()?;
    replicator_config.validate()?;

    let _log_flusher = init_tracing(
        env!("CARGO_BIN_NAME"),
        Some(replicator_config.pipeline.id),
    )
    .map_err(ReplicatorError::telemetry)?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main(replicator_config))?;

    Ok(())
}

async fn async_main(replicator_config: ReplicatorConfig) -> ReplicatorResult<()> {
    // The exporter spawns its listener on the current runtime.
    if let Some(address) = &replicator_config.metrics_listen_address {
        let address: SocketAddr = address.parse().map_err(ReplicatorError::telemetry)?;
        init_metrics(address, replicator_config.pipeline.id).map_err(ReplicatorError::telemetry)?;
    }

    if let Err(err) = start_replicator_with_config(replicator_config).await {
        error!(category = err.category(), "{err}");
        return Err(err);
    }

    Ok(())
}
