use std::fmt;
use std::io;

use streamrpc_channel::CallError;
use streamrpc_frame::FrameError;
use streamrpc_transport::TransportError;

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
        io::ErrorKind::ConnectionRefused
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::BrokenPipe => FAILURE,
        _ => INTERNAL,
    };
    CliError::new(code, format!("{context}: {err}"))
}

pub fn transport_error(context: &str, err: TransportError) -> CliError {
    match err {
        TransportError::Connect { source, endpoint }
            if matches!(
                source.kind(),
                io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused
            ) =>
        {
            CliError::new(TRANSPORT_ERROR, format!("{context}: {endpoint}: {source}"))
        }
        TransportError::Bind { source, .. }
        | TransportError::Connect { source, .. }
        | TransportError::Accept(source)
        | TransportError::Io(source) => io_error(context, source),
        TransportError::InvalidEndpoint(_) => CliError::new(USAGE, format!("{context}: {err}")),
        other => CliError::new(TRANSPORT_ERROR, format!("{context}: {other}")),
    }
}

pub fn frame_error(context: &str, err: FrameError) -> CliError {
    match err {
        FrameError::Io(source) => io_error(context, source),
        FrameError::PayloadTooLarge { .. }
        | FrameError::VersionMismatch { .. }
        | FrameError::Envelope(_) => CliError::new(DATA_INVALID, format!("{context}: {err}")),
        FrameError::ConnectionClosed | FrameError::ShortRead { .. } => {
            CliError::new(FAILURE, format!("{context}: {err}"))
        }
    }
}

pub fn call_error(context: &str, err: CallError) -> CliError {
    match err {
        CallError::Transport(err) => transport_error(context, err),
        CallError::Frame(err) => frame_error(context, err),
        CallError::Encoding(_) => CliError::new(DATA_INVALID, format!("{context}: {err}")),
        CallError::Timeout(_) => CliError::new(TIMEOUT, format!("{context}: {err}")),
        other => CliError::new(FAILURE, format!("{context}: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn refused_connect_is_transport_error() {
        let err = TransportError::Connect {
            endpoint: "unix:/tmp/missing.sock".to_string(),
            source: io::Error::from(io::ErrorKind::NotFound),
        };
        assert_eq!(transport_error("connect failed", err).code, TRANSPORT_ERROR);
    }

    #[test]
    fn invalid_endpoint_is_usage() {
        let err = TransportError::InvalidEndpoint("tcp:".to_string());
        assert_eq!(transport_error("bad endpoint", err).code, USAGE);
    }

    #[test]
    fn call_errors_map_to_codes() {
        assert_eq!(call_error("c", CallError::Timeout(Duration::from_secs(1))).code, TIMEOUT);
        assert_eq!(call_error("c", CallError::Failed("no".into())).code, FAILURE);
        assert_eq!(
            call_error("c", CallError::Frame(FrameError::PayloadTooLarge { size: 2, max: 1 })).code,
            DATA_INVALID
        );
        let message = call_error(
            "call failed",
            CallError::MethodNotFound {
                method: "Nope".into(),
            },
        )
        .message;
        assert_eq!(message, "call failed: Not Implemented");
    }

    #[test]
    fn io_timeouts_map_to_timeout() {
        let err = io::Error::from(io::ErrorKind::TimedOut);
        assert_eq!(io_error("read", err).code, TIMEOUT);
    }
}
