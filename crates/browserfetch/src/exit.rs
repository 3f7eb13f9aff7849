use std::fmt;
use std::io;

use browserfetch_broker::BrokerError;
use browserfetch_frame::FrameError;
use browserfetch_transport::TransportError;

pub const SUCCESS: i32 = 0;
pub const FAILURE: i32 = 1;
pub const TRANSPORT_ERROR: i32 = 3;
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
        io::ErrorKind::PermissionDenied => PERMISSION_DENIED,
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TIMEOUT,
        io::ErrorKind::ConnectionRefused | io::ErrorKind::AddrInUse => TRANSPORT_ERROR,
        _ => INTERNAL,
    };
    CliError::new(code, format!("{context}: {err}"))
}

pub fn transport_error(context: &str, err: TransportError) -> CliError {
    match err {
        TransportError::Bind { source, .. } | TransportError::Io(source) => {
            io_error(context, source)
        }
        other => CliError::new(TRANSPORT_ERROR, format!("{context}: {other}")),
    }
}

pub fn frame_error(context: &str, err: FrameError) -> CliError {
    match err {
        FrameError::Json(_) | FrameError::PayloadTooLarge { .. } => {
            CliError::new(DATA_INVALID, format!("{context}: {err}"))
        }
        other => CliError::new(INTERNAL, format!("{context}: {other}")),
    }
}

pub fn broker_error(context: &str, err: BrokerError) -> CliError {
    match err {
        BrokerError::Transport(err) => transport_error(context, err),
        BrokerError::Frame(err) => frame_error(context, err),
        BrokerError::Timeout(_) => CliError::new(TIMEOUT, format!("{context}: {err}")),
        BrokerError::Browser(_) | BrokerError::DuplicateHost(_) => {
            CliError::new(FAILURE, format!("{context}: {err}"))
        }
        BrokerError::InvalidUrl(_) => CliError::new(USAGE, format!("{context}: {err}")),
        BrokerError::Json(_) | BrokerError::Protocol(_) | BrokerError::Handshake(_) => {
            CliError::new(DATA_INVALID, format!("{context}: {err}"))
        }
        BrokerError::ConnectionClosed(_) | BrokerError::UpstreamLost => {
            CliError::new(TRANSPORT_ERROR, format!("{context}: {err}"))
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
        let err = broker_error("eval failed", BrokerError::Timeout(Duration::from_secs(1)));
        assert_eq!(err.code, TIMEOUT);
        assert_eq!(err.message, "eval failed: no reply within 1s");
    }

    #[test]
    fn nested_errors_keep_their_category() {
        let err = broker_error(
            "start failed",
            BrokerError::Transport(TransportError::Bind {
                addr: "127.0.0.1:80".to_string(),
                source: io::Error::from(io::ErrorKind::PermissionDenied),
            }),
        );
        assert_eq!(err.code, PERMISSION_DENIED);

        let err = broker_error(
            "fetch failed",
            BrokerError::InvalidUrl("nope: relative URL without a base".to_string()),
        );
        assert_eq!(err.code, USAGE);

        let err = broker_error("fetch failed", BrokerError::Browser("TypeError".to_string()));
        assert_eq!(err.code, FAILURE);
    }
}
