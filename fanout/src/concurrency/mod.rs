//! Concurrency utilities shared by the queue, the workers and the pipeline.
//!
//! The [`shutdown`] module broadcasts a two-level stop request: a graceful request stops new
//! transactions from entering the queue while an immediate request interrupts every blocked
//! waiter. The [`deadline`] module provides an optional sleep that can sit in a `select!` arm
//! whether or not a deadline exists.

pub mod deadline;
pub mod shutdown;
