use thiserror::Error;

/// Errors raised when validating fanout configuration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    /// The parallel queue needs at least one channel.
    #[error("`channels` cannot be zero")]
    ChannelsZero,
    /// Per-channel buffers need room for at least one fragment.
    #[error("`max_queue_size` cannot be zero")]
    MaxQueueSizeZero,
    /// The serialization channel must be one of the configured channels.
    #[error("`serialization_channel` {channel} is out of range for {channels} channels")]
    SerializationChannelOutOfRange { channel: usize, channels: usize },
    /// A field holds a value outside of its allowed range.
    #[error("invalid value for `{field}`: {constraint}")]
    InvalidFieldValue { field: String, constraint: String },
}
