//! Worker implementations for pipeline operations.

pub mod base;
pub mod channel;
pub mod feeder;
