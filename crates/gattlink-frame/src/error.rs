use crate::channel::ChannelRole;

/// Errors that can occur during frame encoding/decoding and channel lookup.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// A received frame carried no marker byte.
    #[error("empty frame (missing marker byte)")]
    EmptyFrame,

    /// A received frame starts with a marker byte this protocol does not define.
    #[error("unknown frame marker 0x{0:02x}")]
    UnknownMarker(u8),

    /// Messages cannot be split into zero-byte chunks.
    #[error("chunk size must be at least 1 byte")]
    InvalidChunkSize,

    /// The role was looked up before publication or discovery bound it.
    #[error("channel {0} is not bound")]
    ChannelNotBound(ChannelRole),

    /// The role already has a handle for this session.
    #[error("channel {0} is already bound")]
    ChannelAlreadyBound(ChannelRole),
}

impl FrameError {
    /// True for errors caused by malformed bytes from the peer.
    pub fn is_protocol(&self) -> bool {
        matches!(self, Self::EmptyFrame | Self::UnknownMarker(_))
    }
}

pub type Result<T> = std::result::Result<T, FrameError>;
