use std::time::Duration;

use crate::ring::ChannelId;

/// Errors that can occur in ring channel operations.
#[derive(Debug, thiserror::Error)]
pub enum RingError {
    /// A channel with zero capacity (or a zero-sized block) was requested.
    #[error("invalid channel capacity: {0}")]
    InvalidCapacity(usize),

    /// No live channel is registered under this id.
    #[error("unknown channel {0}")]
    UnknownChannel(ChannelId),

    /// The channel has been destroyed.
    #[error("channel {0} closed")]
    Closed(ChannelId),

    /// A record larger than the channel capacity can never be written.
    #[error("record too large ({size} bytes, capacity {capacity})")]
    RecordTooLarge { size: usize, capacity: usize },

    /// A bounded wait expired.
    #[error("channel {channel} wait timed out after {timeout:?}")]
    Timeout {
        channel: ChannelId,
        timeout: Duration,
    },
}

pub type Result<T> = std::result::Result<T, RingError>;
