//! Configuration types and loading for fanout services.
//!
//! The [`shared`] module holds the settings consumed by the distribution core and the
//! replicator binary, while [`load_config`] assembles them from configuration files and
//! environment variable overrides.

mod environment;
mod load;
pub mod shared;

pub use environment::Environment;
pub use load::{Config, LoadConfigError, load_config, load_config_from};
