use fanout::error::FanoutError;
use fanout_config::LoadConfigError;
use fanout_config::shared::ValidationError;
use thiserror::Error;

/// Result type for replicator operations.
pub type ReplicatorResult<T> = Result<T, ReplicatorError>;

/// Error type for the replicator service.
///
/// Wraps [`FanoutError`] for pipeline errors and provides variants for the setup steps that
/// run before the pipeline starts.
#[derive(Debug, Error)]
pub enum ReplicatorError {
    /// Pipeline error.
    #[error(transparent)]
    Fanout(#[from] FanoutError),

    /// The configuration could not be loaded.
    #[error("configuration error: {0}")]
    LoadConfig(#[from] LoadConfigError),

    /// The loaded configuration is invalid.
    #[error("invalid configuration: {0}")]
    InvalidConfig(#[from] ValidationError),

    /// Telemetry could not be installed.
    #[error("telemetry error: {0}")]
    Telemetry(Box<dyn std::error::Error + Send + Sync>),

    /// I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl ReplicatorError {
    /// Creates a telemetry error from any error source.
    pub fn telemetry<E: std::error::Error + Send + Sync + 'static>(err: E) -> Self {
        ReplicatorError::Telemetry(Box::new(err))
    }

    /// Returns a short category label for this error.
    pub fn category(&self) -> &'static str {
        match self {
            ReplicatorError::Fanout(_) => "pipeline error",
            ReplicatorError::LoadConfig(_) | ReplicatorError::InvalidConfig(_) => {
                "configuration error"
            }
            ReplicatorError::Telemetry(_) => "telemetry error",
            ReplicatorError::Io(_) => "i/o error",
        }
    }

    /// Returns the wrapped [`FanoutError`] when the failure came from the pipeline.
    pub fn as_fanout_error(&self) -> Option<&FanoutError> {
        match self {
            ReplicatorError::Fanout(err) => Some(err),
            _ => None,
        }
    }
}
