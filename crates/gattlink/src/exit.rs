use std::fmt;
use std::io;

use gattlink_frame::FrameError;
use gattlink_session::SessionError;
use gattlink_transport::TransportError;

// Process exit codes. 124 matches timeout(1); 64 and 125 follow sysexits/shell usage.
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
        _ => INTERNAL,
    };
    CliError::new(code, format!("{context}: {err}"))
}

pub fn transport_error(context: &str, err: TransportError) -> CliError {
    match err {
        TransportError::Io(source) => io_error(context, source),
        TransportError::InvalidDescriptor(_) => CliError::new(USAGE, format!("{context}: {err}")),
        TransportError::Config { .. } => CliError::new(DATA_INVALID, format!("{context}: {err}")),
        other => CliError::new(TRANSPORT_ERROR, format!("{context}: {other}")),
    }
}

pub fn frame_error(context: &str, err: FrameError) -> CliError {
    if err.is_protocol() {
        return CliError::new(DATA_INVALID, format!("{context}: {err}"));
    }
    match err {
        FrameError::InvalidChunkSize => CliError::new(USAGE, format!("{context}: {err}")),
        other => CliError::new(INTERNAL, format!("{context}: {other}")),
    }
}

pub fn session_error(context: &str, err: SessionError) -> CliError {
    if err.is_timeout() {
        return CliError::new(TIMEOUT, format!("{context}: {err}"));
    }
    match err {
        SessionError::Transport(err) => transport_error(context, err),
        SessionError::Frame(err) => frame_error(context, err),
        SessionError::Io(err) => io_error(context, err),
        SessionError::BridgeNotReady(_) => CliError::new(TIMEOUT, format!("{context}: {err}")),
        // The radio link itself failed; retrying may help.
        SessionError::PeerDisconnected { .. } => {
            CliError::new(TRANSPORT_ERROR, format!("{context}: {err}"))
        }
        SessionError::SetupFailed { ref cause, .. } => {
            let code = match cause.as_ref() {
                SessionError::Transport(_) => TRANSPORT_ERROR,
                _ => FAILURE,
            };
            CliError::new(code, format!("{context}: {err}"))
        }
        SessionError::ServiceNotFound(_)
        | SessionError::NoActivePeer
        | SessionError::ChannelUnavailable(_) => CliError::new(FAILURE, format!("{context}: {err}")),
        other => CliError::new(INTERNAL, format!("{context}: {other}")),
    }
}
