//! Utilities for testing the queue and the pipeline.
//!
//! - [`event`] builds transactions and fragments with predictable commit times.
//! - [`notify`] waits on notifications with a timeout so that a missed condition fails the
//!   test instead of hanging it.
//! - [`test_applier`] wraps an [`crate::applier::Applier`], records commits and can inject
//!   failures or delays.
//! - [`pipeline`] creates queue and pipeline configurations suited for tests.

pub mod event;
pub mod notify;
pub mod pipeline;
pub mod test_applier;
