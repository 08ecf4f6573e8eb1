use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::shared::{ParallelQueueConfig, ValidationError};

/// Configuration for a distribution pipeline.
///
/// A pipeline feeds the transaction log into a parallel queue and runs one apply worker per
/// channel.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Identifier used to tag logs and metrics of this pipeline.
    pub id: u64,
    /// Parallel queue settings.
    #[serde(default)]
    pub queue: ParallelQueueConfig,
    /// Milliseconds the feeder waits before polling the log again when no data is available.
    #[serde(default = "default_idle_wait_ms")]
    pub idle_wait_ms: u64,
    /// Milliseconds a graceful shutdown may take before it is escalated to an immediate one.
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
}

impl PipelineConfig {
    /// Default idle wait of the feeder.
    pub const DEFAULT_IDLE_WAIT_MS: u64 = 100;

    /// Default graceful shutdown budget.
    pub const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 30_000;

    /// Returns the feeder idle wait as a [`Duration`].
    pub fn idle_wait(&self) -> Duration {
        Duration::from_millis(self.idle_wait_ms)
    }

    /// Returns the graceful shutdown budget as a [`Duration`].
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// Validates pipeline settings.
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.queue.validate()?;

        if self.idle_wait_ms == 0 {
            return Err(ValidationError::InvalidFieldValue {
                field: "idle_wait_ms".to_string(),
                constraint: "must be greater than 0".to_string(),
            });
        }

        Ok(())
    }
}

fn default_idle_wait_ms() -> u64 {
    PipelineConfig::DEFAULT_IDLE_WAIT_MS
}

fn default_shutdown_timeout_ms() -> u64 {
    PipelineConfig::DEFAULT_SHUTDOWN_TIMEOUT_MS
}
