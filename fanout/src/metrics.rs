//! Metric names and labels emitted by the queue and its workers.

/// Label for the channel index in metrics.
pub const CHANNEL_LABEL: &str = "channel";

/// Label for pipeline ID in metrics.
pub const PIPELINE_ID_LABEL: &str = "pipeline_id";

/// Label for the outcome of a guard decision.
pub const RELEASE_LABEL: &str = "release";

/// Label for control event kinds.
pub const CONTROL_KIND_LABEL: &str = "control_kind";

// Queue metrics

/// Counter for transaction fragments accepted into a channel.
pub const FANOUT_FRAGMENTS_ACCEPTED_TOTAL: &str = "fanout_fragments_accepted_total";

/// Counter for fragments discarded or rejected because of a shutdown.
pub const FANOUT_FRAGMENTS_DISCARDED_TOTAL: &str = "fanout_fragments_discarded_total";

/// Counter for control events placed into a channel.
pub const FANOUT_CONTROL_EVENTS_TOTAL: &str = "fanout_control_events_total";

/// Gauge for the number of items buffered in a channel.
pub const FANOUT_CHANNEL_DEPTH: &str = "fanout_channel_depth";

// Interval guard metrics

/// Counter for channels held back because they trail the leading channel.
pub const FANOUT_GUARD_BLOCKS_TOTAL: &str = "fanout_guard_blocks_total";

/// Counter for held-back channels released by the delay override.
pub const FANOUT_GUARD_FORCED_RELEASES_TOTAL: &str = "fanout_guard_forced_releases_total";

// Serialization metrics

/// Counter for serialization epochs entered.
pub const FANOUT_SERIALIZATIONS_TOTAL: &str = "fanout_serializations_total";

/// Histogram for the time spent waiting for channels to drain before a serialization boundary.
pub const FANOUT_SERIALIZATION_DRAIN_DURATION_SECONDS: &str =
    "fanout_serialization_drain_duration_seconds";

// Worker metrics

/// Counter for transactions applied by channel workers.
pub const FANOUT_TRANSACTIONS_APPLIED_TOTAL: &str = "fanout_transactions_applied_total";

/// Histogram for the time between a transaction's commit and its application.
pub const FANOUT_APPLY_LAG_SECONDS: &str = "fanout_apply_lag_seconds";
