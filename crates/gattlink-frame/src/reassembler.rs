use bytes::{Bytes, BytesMut};
use tracing::trace;

use crate::codec::{decode_frame, Frame, FrameConfig, Marker};
use crate::error::Result;

/// Outcome of feeding one frame to a [`MessageReassembler`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Progress {
    /// This frame opened a new message. Always reported before `completed`.
    pub started: bool,
    /// The message this frame finished, if any.
    pub completed: Option<Bytes>,
}

/// Accumulates frames of one direction into whole messages.
///
/// The buffer is empty exactly between messages: a final frame snapshots and
/// clears it in one step, so a partial message is never observable outside.
#[derive(Debug, Default)]
pub struct MessageReassembler {
    buffer: BytesMut,
    in_progress: bool,
    announce_single_frame: bool,
}

impl MessageReassembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: &FrameConfig) -> Self {
        Self {
            announce_single_frame: config.announce_single_frame_messages,
            ..Self::default()
        }
    }

    /// Feed one decoded frame.
    ///
    /// A final frame with no preceding continuation completes a one-frame
    /// message. It only reports `started` when single-frame announcements
    /// are enabled.
    pub fn consume(&mut self, frame: Frame) -> Progress {
        match frame.marker {
            Marker::Continuation => {
                let started = !self.in_progress;
                self.in_progress = true;
                self.buffer.extend_from_slice(&frame.payload);
                trace!(
                    chunk = frame.payload.len(),
                    buffered = self.buffer.len(),
                    "continuation frame"
                );
                Progress {
                    started,
                    completed: None,
                }
            }
            Marker::Final => {
                let started = !self.in_progress && self.announce_single_frame;
                self.buffer.extend_from_slice(&frame.payload);
                self.in_progress = false;
                let message = self.buffer.split().freeze();
                trace!(len = message.len(), "message reassembled");
                Progress {
                    started,
                    completed: Some(message),
                }
            }
        }
    }

    /// Decode `raw` and feed it. Malformed frames leave the buffer untouched.
    pub fn consume_raw(&mut self, raw: Bytes) -> Result<Progress> {
        let frame = decode_frame(raw)?;
        Ok(self.consume(frame))
    }

    /// Drop any partial message. Returns the number of discarded bytes.
    pub fn reset(&mut self) -> usize {
        let discarded = self.buffer.len();
        self.buffer.clear();
        self.in_progress = false;
        discarded
    }

    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// True while a message has started but not finished.
    pub fn in_progress(&self) -> bool {
        self.in_progress
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode_message;

    fn run(reassembler: &mut MessageReassembler, frames: Vec<Frame>) -> (usize, Vec<Bytes>) {
        let mut started = 0;
        let mut completed = Vec::new();
        for frame in frames {
            let progress = reassembler.consume(frame);
            if progress.started {
                assert!(completed.len() + 1 > started, "started fired twice");
                started += 1;
            }
            completed.extend(progress.completed);
        }
        (started, completed)
    }

    #[test]
    fn ten_byte_message_starts_once_and_completes_once() {
        let message: Vec<u8> = (10u8..20).collect();
        let mut reassembler = MessageReassembler::new();
        let (started, completed) = run(&mut reassembler, encode_message(message.clone(), 4).unwrap());
        assert_eq!(started, 1);
        assert_eq!(completed, vec![Bytes::from(message)]);
        assert_eq!(reassembler.buffered_len(), 0);
        assert!(!reassembler.in_progress());
    }

    #[test]
    fn empty_message_completes_without_start() {
        let mut reassembler = MessageReassembler::new();
        let progress = reassembler
            .consume_raw(Bytes::from_static(&[0x00]))
            .unwrap();
        assert!(!progress.started);
        assert_eq!(progress.completed, Some(Bytes::new()));
    }

    #[test]
    fn single_frame_start_can_be_announced() {
        let config = FrameConfig {
            announce_single_frame_messages: true,
            ..FrameConfig::default()
        };
        let mut reassembler = MessageReassembler::with_config(&config);
        let progress = reassembler
            .consume_raw(Bytes::from_static(&[0x00, 0x42]))
            .unwrap();
        assert!(progress.started);
        assert_eq!(progress.completed.as_deref(), Some(&[0x42][..]));

        // Multi-frame messages still announce exactly once.
        let (started, completed) =
            run(&mut reassembler, encode_message(vec![1u8; 9], 4).unwrap());
        assert_eq!(started, 1);
        assert_eq!(completed.len(), 1);
    }

    #[test]
    fn empty_leading_continuation_announces_once() {
        let mut reassembler = MessageReassembler::new();
        let frames = vec![
            Frame::new(Marker::Continuation, Bytes::new()),
            Frame::new(Marker::Continuation, &b"ab"[..]),
            Frame::new(Marker::Final, &b"c"[..]),
        ];
        let (started, completed) = run(&mut reassembler, frames);
        assert_eq!(started, 1);
        assert_eq!(completed, vec![Bytes::from_static(b"abc")]);
    }

    #[test]
    fn back_to_back_messages_do_not_bleed() {
        let mut reassembler = MessageReassembler::new();
        let mut frames = encode_message(&b"first message"[..], 3).unwrap();
        frames.extend(encode_message(&b"second"[..], 3).unwrap());
        frames.extend(encode_message(Bytes::new(), 3).unwrap());
        let (started, completed) = run(&mut reassembler, frames);
        assert_eq!(started, 2);
        assert_eq!(
            completed,
            vec![
                Bytes::from_static(b"first message"),
                Bytes::from_static(b"second"),
                Bytes::new(),
            ]
        );
    }

    #[test]
    fn unknown_marker_is_dropped_without_touching_buffer() {
        let mut reassembler = MessageReassembler::new();
        reassembler
            .consume_raw(Bytes::from_static(&[0x01, 1, 2]))
            .unwrap();
        assert!(reassembler
            .consume_raw(Bytes::from_static(&[0x09, 3]))
            .is_err());
        assert_eq!(reassembler.buffered_len(), 2);
        let progress = reassembler
            .consume_raw(Bytes::from_static(&[0x00, 3]))
            .unwrap();
        assert_eq!(progress.completed.as_deref(), Some(&[1, 2, 3][..]));
    }

    #[test]
    fn reset_discards_partial_message() {
        let mut reassembler = MessageReassembler::new();
        reassembler
            .consume_raw(Bytes::from_static(&[0x01, 1, 2, 3]))
            .unwrap();
        assert_eq!(reassembler.reset(), 3);
        assert_eq!(reassembler.buffered_len(), 0);
        let progress = reassembler
            .consume_raw(Bytes::from_static(&[0x01, 9]))
            .unwrap();
        assert!(progress.started);
    }

    #[test]
    fn roundtrip_across_lengths_and_chunk_sizes() {
        let mut reassembler = MessageReassembler::new();
        for len in [0usize, 1, 2, 5, 19, 20, 100] {
            let message: Vec<u8> = (0..len).map(|i| (i * 31 % 251) as u8).collect();
            for chunk_size in [1usize, 2, 7, 19, 512] {
                let wire: Vec<Bytes> = encode_message(message.clone(), chunk_size)
                    .unwrap()
                    .iter()
                    .map(Frame::to_bytes)
                    .collect();
                let mut out = None;
                for raw in wire {
                    out = reassembler.consume_raw(raw).unwrap().completed;
                }
                assert_eq!(out.as_deref(), Some(message.as_slice()));
                assert_eq!(reassembler.buffered_len(), 0);
            }
        }
    }
}
