use bytes::{Buf, BufMut, Bytes, BytesMut};
use gattlink_transport::DEFAULT_ATT_MTU;

use crate::error::{FrameError, Result};

/// Every frame starts with a single marker byte.
pub const MARKER_SIZE: usize = 1;

/// ATT opcode + handle overhead on every notification or write.
pub const ATT_HEADER_SIZE: usize = 3;

/// Chunk size on a link that never negotiated its MTU (23 - 3 - 1 = 19).
pub const DEFAULT_CHUNK_SIZE: usize = DEFAULT_ATT_MTU as usize - ATT_HEADER_SIZE - MARKER_SIZE;

/// Frame marker byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Marker {
    /// Last (or only) frame of a message.
    Final = 0x00,
    /// More frames of the same message follow.
    Continuation = 0x01,
}

impl Marker {
    pub const fn as_byte(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for Marker {
    type Error = FrameError;

    fn try_from(byte: u8) -> Result<Self> {
        match byte {
            0x00 => Ok(Self::Final),
            0x01 => Ok(Self::Continuation),
            other => Err(FrameError::UnknownMarker(other)),
        }
    }
}

/// One wire unit: a marker byte and a chunk of message payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub marker: Marker,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(marker: Marker, payload: impl Into<Bytes>) -> Self {
        Self {
            marker,
            payload: payload.into(),
        }
    }

    pub fn more_follows(&self) -> bool {
        self.marker == Marker::Continuation
    }

    /// The total wire size of this frame (marker + payload).
    pub fn wire_size(&self) -> usize {
        MARKER_SIZE + self.payload.len()
    }

    /// Serialize into a fresh buffer, ready to hand to a characteristic write.
    pub fn to_bytes(&self) -> Bytes {
        let mut dst = BytesMut::with_capacity(self.wire_size());
        encode_frame(self, &mut dst);
        dst.freeze()
    }
}

/// Append one frame in wire format.
///
/// ```text
/// ┌──────────────┬─────────────────────────┐
/// │ Marker (1B)  │ Payload (0..chunk bytes) │
/// │ 0x01 / 0x00  │                          │
/// └──────────────┴─────────────────────────┘
/// ```
pub fn encode_frame(frame: &Frame, dst: &mut BytesMut) {
    dst.reserve(frame.wire_size());
    dst.put_u8(frame.marker.as_byte());
    dst.put_slice(&frame.payload);
}

/// Split a message into frames of at most `chunk_size` payload bytes.
///
/// Every frame but the last is a continuation. A zero-length message still
/// yields one empty final frame.
pub fn encode_message(message: impl Into<Bytes>, chunk_size: usize) -> Result<Vec<Frame>> {
    if chunk_size == 0 {
        return Err(FrameError::InvalidChunkSize);
    }
    let message = message.into();
    if message.is_empty() {
        return Ok(vec![Frame::new(Marker::Final, Bytes::new())]);
    }

    let count = message.len().div_ceil(chunk_size);
    let mut frames = Vec::with_capacity(count);
    let mut start = 0;
    while start < message.len() {
        let end = (start + chunk_size).min(message.len());
        let marker = if end == message.len() {
            Marker::Final
        } else {
            Marker::Continuation
        };
        frames.push(Frame::new(marker, message.slice(start..end)));
        start = end;
    }
    Ok(frames)
}

/// Parse one received characteristic value as a frame.
pub fn decode_frame(mut raw: Bytes) -> Result<Frame> {
    if raw.is_empty() {
        return Err(FrameError::EmptyFrame);
    }
    let marker = Marker::try_from(raw[0])?;
    raw.advance(MARKER_SIZE);
    Ok(Frame {
        marker,
        payload: raw,
    })
}

/// Whether more frames follow `raw`, without copying the payload.
pub fn classify(raw: &[u8]) -> Result<bool> {
    let byte = raw.first().ok_or(FrameError::EmptyFrame)?;
    Ok(Marker::try_from(*byte)? == Marker::Continuation)
}

/// Largest payload chunk that fits a single ATT PDU at `mtu`.
pub fn chunk_size_for_mtu(mtu: u16) -> usize {
    (mtu as usize)
        .saturating_sub(ATT_HEADER_SIZE + MARKER_SIZE)
        .max(1)
}

/// Configuration for the frame codec.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Outbound chunk size in bytes. Default: [`DEFAULT_CHUNK_SIZE`].
    pub chunk_size: usize,
    /// Emit "message started" for messages that arrive as a single frame.
    pub announce_single_frame_messages: bool,
}

impl FrameConfig {
    /// Configuration whose chunk size fills a PDU at `mtu`.
    pub fn for_mtu(mtu: u16) -> Self {
        Self {
            chunk_size: chunk_size_for_mtu(mtu),
            ..Self::default()
        }
    }
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            announce_single_frame_messages: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ten_bytes_in_chunks_of_four() {
        let message: Vec<u8> = (0u8..10).collect();
        let frames = encode_message(message.clone(), 4).unwrap();
        let wire: Vec<Bytes> = frames.iter().map(Frame::to_bytes).collect();

        assert_eq!(wire.len(), 3);
        assert_eq!(wire[0].as_ref(), &[0x01, 0, 1, 2, 3]);
        assert_eq!(wire[1].as_ref(), &[0x01, 4, 5, 6, 7]);
        assert_eq!(wire[2].as_ref(), &[0x00, 8, 9]);
    }

    #[test]
    fn empty_message_is_one_final_frame() {
        let frames = encode_message(Bytes::new(), 4).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].to_bytes().as_ref(), &[0x00]);
    }

    #[test]
    fn exact_multiple_ends_with_full_final_frame() {
        let frames = encode_message(vec![7u8; 8], 4).unwrap();
        assert_eq!(frames.len(), 2);
        assert!(frames[0].more_follows());
        assert!(!frames[1].more_follows());
        assert_eq!(frames[1].payload.len(), 4);
    }

    #[test]
    fn single_chunk_is_marked_final() {
        let frames = encode_message(&b"hi"[..], 19).unwrap();
        assert_eq!(frames, vec![Frame::new(Marker::Final, &b"hi"[..])]);
    }

    #[test]
    fn zero_chunk_size_is_rejected() {
        assert!(matches!(
            encode_message(&b"x"[..], 0),
            Err(FrameError::InvalidChunkSize)
        ));
    }

    #[test]
    fn decode_splits_marker_from_payload() {
        let frame = decode_frame(Bytes::from_static(&[0x01, 0xAA, 0xBB])).unwrap();
        assert_eq!(frame.marker, Marker::Continuation);
        assert_eq!(frame.payload.as_ref(), &[0xAA, 0xBB]);
    }

    #[test]
    fn decode_rejects_empty_and_unknown() {
        assert!(matches!(
            decode_frame(Bytes::new()),
            Err(FrameError::EmptyFrame)
        ));
        let err = decode_frame(Bytes::from_static(&[0x7F, 0x00])).unwrap_err();
        assert!(matches!(err, FrameError::UnknownMarker(0x7F)));
        assert!(err.is_protocol());
    }

    #[test]
    fn classify_reads_marker_only() {
        assert!(classify(&[0x01]).unwrap());
        assert!(!classify(&[0x00, 1, 2]).unwrap());
        assert!(classify(&[]).is_err());
        assert!(classify(&[0x02]).is_err());
    }

    #[test]
    fn chunk_size_tracks_mtu() {
        assert_eq!(chunk_size_for_mtu(DEFAULT_ATT_MTU), DEFAULT_CHUNK_SIZE);
        assert_eq!(chunk_size_for_mtu(515), 511);
        assert_eq!(chunk_size_for_mtu(0), 1);
        assert_eq!(FrameConfig::for_mtu(247).chunk_size, 243);
    }

    #[test]
    fn frames_never_exceed_chunk_size() {
        for chunk_size in [1usize, 3, 19, 64] {
            let frames = encode_message(vec![0x55u8; 200], chunk_size).unwrap();
            assert!(frames.iter().all(|f| f.payload.len() <= chunk_size));
            assert_eq!(frames.iter().filter(|f| !f.more_follows()).count(), 1);
            assert!(!frames.last().unwrap().more_follows());
        }
    }
}
