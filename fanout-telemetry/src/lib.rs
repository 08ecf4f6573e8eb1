//! Tracing and metrics initialization shared by fanout binaries and tests.

pub mod metrics;
pub mod tracing;
