//! Transaction distribution.
//!
//! [`parallel::ParallelQueue`] is the only [`base::EventStore`] implementation. It is built from
//! one [`read::ReadQueue`] per channel, an [`guard::IntervalGuard`] bounding commit-time skew
//! between channels, a [`serialization::SerializationCoordinator`] for transactions that touch
//! every shard and a [`watch::WatchRegistry`] resolving position watches.

pub mod base;
pub mod guard;
pub mod parallel;
pub mod read;
pub mod serialization;
pub mod watch;
