//! Marker-byte message framing over GATT characteristics.
//!
//! A message travels as a sequence of frames, each one characteristic value:
//! - A 1-byte marker: `0x01` when more frames follow, `0x00` on the last one
//! - Up to `MTU - 3 - 1` bytes of payload
//!
//! [`MessageReassembler`] turns the received frames back into whole messages,
//! and [`ChannelRegistry`] maps the session's logical channels to attribute
//! handles.

pub mod channel;
pub mod codec;
pub mod error;
pub mod reassembler;

pub use channel::{
    ChannelRegistry, ChannelRole, ChannelScheme, Side, CLIENT_TO_SERVER_UUID, CONTROL_UUID,
    IDENTITY_UUID, SERVER_TO_CLIENT_UUID,
};
pub use codec::{
    chunk_size_for_mtu, classify, decode_frame, encode_frame, encode_message, Frame, FrameConfig,
    Marker, ATT_HEADER_SIZE, DEFAULT_CHUNK_SIZE, MARKER_SIZE,
};
pub use error::{FrameError, Result};
pub use reassembler::{MessageReassembler, Progress};
