//! Sources of the ordered transaction stream.

pub mod base;
pub mod file;
pub mod memory;

pub use base::LogReader;
