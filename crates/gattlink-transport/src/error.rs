use std::path::PathBuf;

use crate::gatt::{Address, AttributeHandle, ConnectionId};

/// Errors that can occur in radio transport and host-stack operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The transport descriptor string could not be parsed.
    #[error("invalid transport descriptor '{0}' (expected <scheme>:<target>)")]
    InvalidDescriptor(String),

    /// The descriptor names a transport this build cannot open.
    #[error("unsupported transport scheme '{0}'")]
    UnsupportedScheme(String),

    /// Failed to open the radio transport.
    #[error("failed to open transport {descriptor}: {reason}")]
    Open { descriptor: String, reason: String },

    /// The radio link has been closed.
    #[error("transport closed")]
    Closed,

    /// The device has not been powered on.
    #[error("device not powered on")]
    NotPowered,

    /// No device with this address is reachable.
    #[error("unknown peer {0}")]
    UnknownPeer(Address),

    /// The peer exists but is not accepting connections.
    #[error("peer {0} is not connectable")]
    NotConnectable(Address),

    /// The connection does not exist (or no longer exists).
    #[error("connection {0} is not active")]
    NotConnected(ConnectionId),

    /// No attribute is published under this handle.
    #[error("unknown attribute handle {0}")]
    UnknownHandle(AttributeHandle),

    /// The remote attribute server rejected the request.
    #[error("request rejected by peer: {0}")]
    Rejected(String),

    /// MTU exchange failed.
    #[error("MTU exchange failed: {0}")]
    MtuExchange(String),

    /// Failed to read or parse a device configuration file.
    #[error("invalid device config {path}: {reason}")]
    Config { path: PathBuf, reason: String },

    /// An I/O error occurred on the transport.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TransportError>;
