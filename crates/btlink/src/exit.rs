use std::fmt;
use std::io;

use btlink_driver::DriverError;
use btlink_frame::FrameError;
use btlink_ring::RingError;

// Process exit codes.
pub const SUCCESS: i32 = 0;
pub const FAILURE: i32 = 1;
pub const LINK_ERROR: i32 = 3;
pub const HEALTH_CHECK_FAILED: i32 = 30;
pub const PERMISSION_DENIED: i32 = 50;
pub const DATA_INVALID: i32 = 60;
pub const USAGE: i32 = 64;
pub const TIMEOUT: i32 = 124;
pub const INTERNAL: i32 = 125;

pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug)]
pub struct CliError {
    pub code: i32,
    pub message: String,
}

impl CliError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CliError {}

pub fn io_error(context: &str, err: io::Error) -> CliError {
    let code = match err.kind() {
        io::ErrorKind::NotFound => USAGE,
        io::ErrorKind::PermissionDenied => PERMISSION_DENIED,
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TIMEOUT,
        _ => INTERNAL,
    };
    CliError::new(code, format!("{context}: {err}"))
}

pub fn ring_error(context: &str, err: RingError) -> CliError {
    match err {
        RingError::Timeout { .. } => CliError::new(TIMEOUT, format!("{context}: {err}")),
        other => CliError::new(LINK_ERROR, format!("{context}: {other}")),
    }
}

pub fn frame_error(context: &str, err: FrameError) -> CliError {
    match err {
        FrameError::Ring(err) => ring_error(context, err),
        FrameError::WouldBlock | FrameError::Stalled { .. } => {
            CliError::new(TIMEOUT, format!("{context}: {err}"))
        }
        FrameError::PayloadTooLarge { .. } | FrameError::EmptyPayload => {
            CliError::new(DATA_INVALID, format!("{context}: {err}"))
        }
        other => CliError::new(LINK_ERROR, format!("{context}: {other}")),
    }
}

pub fn driver_error(context: &str, err: DriverError) -> CliError {
    match err {
        DriverError::Ring(err) => ring_error(context, err),
        DriverError::Frame(err) => frame_error(context, err),
        DriverError::Io(err) => io_error(context, err),
        DriverError::Json(_) => CliError::new(DATA_INVALID, format!("{context}: {err}")),
        DriverError::ReadyTimeout(_) | DriverError::MailboxTimeout { .. } => {
            CliError::new(TIMEOUT, format!("{context}: {err}"))
        }
        DriverError::InvalidArgument(_)
        | DriverError::InvalidTwsIndex(_)
        | DriverError::InvalidAddress(_) => CliError::new(USAGE, format!("{context}: {err}")),
        DriverError::Platform(_) | DriverError::TwsNoData(_) | DriverError::TwsBusy(_) => {
            CliError::new(FAILURE, format!("{context}: {err}"))
        }
        other => CliError::new(INTERNAL, format!("{context}: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn timeouts_map_to_124() {
        let err = driver_error("boot", DriverError::ReadyTimeout(Duration::from_secs(1)));
        assert_eq!(err.code, TIMEOUT);
        assert!(err.message.starts_with("boot: "));
    }

    #[test]
    fn nested_frame_errors_unwrap() {
        let err = driver_error("send", DriverError::Frame(FrameError::WouldBlock));
        assert_eq!(err.code, TIMEOUT);
        let err = driver_error("send", DriverError::Frame(FrameError::EmptyPayload));
        assert_eq!(err.code, DATA_INVALID);
    }

    #[test]
    fn missing_config_is_usage() {
        let err = driver_error(
            "config",
            DriverError::Io(io::Error::from(io::ErrorKind::NotFound)),
        );
        assert_eq!(err.code, USAGE);
    }
}
