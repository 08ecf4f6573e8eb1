use std::net::SocketAddr;
use std::sync::Mutex;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

// The Prometheus recorder is process global and can only be installed once. Tests call the
// initializer repeatedly, so the handle is cached.
static PROMETHEUS_HANDLE: Mutex<Option<PrometheusHandle>> = Mutex::new(None);

/// Installs the Prometheus recorder and returns a handle that renders the current metrics.
///
/// Repeated calls return the cached handle.
pub fn init_metrics_handle() -> Result<PrometheusHandle, BuildError> {
    let mut prometheus_handle = PROMETHEUS_HANDLE
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());

    if let Some(handle) = &*prometheus_handle {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    *prometheus_handle = Some(handle.clone());

    Ok(handle)
}

/// Installs the Prometheus recorder with an HTTP listener serving `/metrics` on `address`.
///
/// Must be called from within a Tokio runtime since the listener is spawned on it.
pub fn init_metrics(address: SocketAddr, pipeline_id: u64) -> Result<(), BuildError> {
    PrometheusBuilder::new()
        .with_http_listener(address)
        .add_global_label("pipeline_id", pipeline_id.to_string())
        .install()?;

    ::tracing::info!(%address, "metrics exporter listening");

    Ok(())
}
