use std::sync::Arc;
use std::time::Duration;

use gattlink_transport::Address;
use uuid::Uuid;

/// Errors that can occur in session operations.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Radio transport or host-stack error.
    #[error("transport error: {0}")]
    Transport(#[from] gattlink_transport::TransportError),

    /// Framing or channel lookup error.
    #[error("frame error: {0}")]
    Frame(#[from] gattlink_frame::FrameError),

    /// No peer sent the start signal within the setup bound.
    #[error("setup timed out after {0:?} waiting for the start signal")]
    SetupTimeout(Duration),

    /// No matching peripheral was found and subscribed within the scan bound.
    #[error("scan timed out after {0:?}")]
    ScanTimeout(Duration),

    /// A notify-based send found nobody listening.
    #[error("channel unavailable: {0}")]
    ChannelUnavailable(String),

    /// The bridge worker did not report ready in time.
    #[error("event loop bridge not ready after {0:?}")]
    BridgeNotReady(Duration),

    /// The bridge has not been started, or was stopped.
    #[error("event loop bridge is not running")]
    BridgeNotRunning,

    /// A submitted operation did not complete in time. It may still complete later.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// Disconnect was requested with no peer link active.
    #[error("no active peer")]
    NoActivePeer,

    /// The peer does not expose the target service or its required channels.
    #[error("service {0} not found on peer")]
    ServiceNotFound(Uuid),

    /// The peer dropped the link before the session reached streaming.
    #[error("peer {peer} disconnected during setup (reason 0x{reason:02x})")]
    PeerDisconnected { peer: Address, reason: u8 },

    /// A discovery or subscription step failed against a connected peer.
    #[error("setup with {peer} failed: {cause}")]
    SetupFailed {
        peer: Address,
        #[source]
        cause: Arc<SessionError>,
    },

    /// The operation is not valid in the session's current state.
    #[error("cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: &'static str,
    },

    /// The worker dropped the operation before it produced a result.
    #[error("operation aborted by the event loop worker")]
    OperationAborted,

    /// A blocking submit was issued from the worker thread itself.
    #[error("submit called from the event loop worker thread")]
    ReentrantSubmit,

    /// Worker thread could not be spawned.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SessionError {
    /// True for timeouts of a blocking setup call or of the bridge itself.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::SetupTimeout(_) | Self::ScanTimeout(_) | Self::Timeout(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;
