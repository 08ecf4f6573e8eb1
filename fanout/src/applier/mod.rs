//! Consumers of channel output.

pub mod base;
pub mod memory;

pub use base::Applier;
