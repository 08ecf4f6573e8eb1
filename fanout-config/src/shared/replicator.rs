use serde::{Deserialize, Serialize};

use crate::Config;
use crate::shared::{LogConfig, PipelineConfig, ValidationError};

/// Complete configuration of the replicator service.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReplicatorConfig {
    /// Pipeline settings.
    pub pipeline: PipelineConfig,
    /// Log the pipeline replays.
    pub log: LogConfig,
    /// Address the Prometheus exporter listens on. Metrics are disabled when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics_listen_address: Option<String>,
}

impl ReplicatorConfig {
    /// Validates the complete replicator configuration.
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.pipeline.validate()?;

        if let Some(address) = &self.metrics_listen_address
            && address.parse::<std::net::SocketAddr>().is_err()
        {
            return Err(ValidationError::InvalidFieldValue {
                field: "metrics_listen_address".to_string(),
                constraint: format!("`{address}` is not a socket address"),
            });
        }

        Ok(())
    }
}

impl Config for ReplicatorConfig {
    const LIST_PARSE_KEYS: &'static [&'static str] = &[];
}
