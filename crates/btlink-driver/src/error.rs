use std::time::Duration;

/// Errors that can occur in driver operations.
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    /// Ring channel error.
    #[error("ring error: {0}")]
    Ring(#[from] btlink_ring::RingError),

    /// Framing error.
    #[error("frame error: {0}")]
    Frame(#[from] btlink_frame::FrameError),

    /// The driver has not been initialised (or has exited).
    #[error("driver not enabled")]
    NotEnabled,

    /// The co-processor has not reported ready.
    #[error("co-processor not ready")]
    NotReady,

    /// The first `initialize` needs an HCI host.
    #[error("an HCI host is required on first initialisation")]
    HostRequired,

    /// A caller-supplied argument was rejected.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Only TWS channels 0 and 1 exist.
    #[error("invalid TWS channel index {0}")]
    InvalidTwsIndex(usize),

    /// The co-processor has not left a packet in the TWS rx slot.
    #[error("no TWS data on channel {0}")]
    TwsNoData(usize),

    /// The previous packet in the TWS tx slot has not been read yet.
    #[error("TWS channel {0} still holds an unread packet")]
    TwsBusy(usize),

    /// Another crypto operation is still pending.
    #[error("crypto operation already pending")]
    CryptoBusy,

    /// The co-processor did not report ready in time.
    #[error("co-processor not ready after {0:?}")]
    ReadyTimeout(Duration),

    /// The co-processor did not complete a mailbox request in time.
    #[error("mailbox message {msg_id:#04x} timed out after {timeout:?}")]
    MailboxTimeout { msg_id: u8, timeout: Duration },

    /// The platform failed to load, start or stop the co-processor.
    #[error("platform error: {0}")]
    Platform(String),

    /// Invalid device address string.
    #[error("invalid device address '{0}'")]
    InvalidAddress(String),

    /// Configuration file could not be read.
    #[error("config I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration JSON could not be parsed.
    #[error("config error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, DriverError>;
