//! Common types used throughout the fan-out stack.
//!
//! Re-exports the transaction fragments accepted from the log, the control events synthesized
//! by the queue and the values returned to channel consumers.

mod event;

pub use event::*;
