//! Reassembly of frames from arbitrary socket reads.
//!
//! Bytes accumulate in a `BytesMut`; a frame body is split off and frozen
//! without copying. Two states:
//!
//! - `AwaitingHeader`: fewer than 16 unparsed bytes
//! - `AwaitingBody`: header validated, body still incomplete
//!
//! Frames are yielded strictly in arrival order. When a header fails
//! validation, every frame completed before it has already been handed out
//! by [`FrameBuffer::next_frame`], so a reader never loses good frames that
//! shared a socket read with a bad one.

use bytes::{Buf, Bytes, BytesMut};

use super::wire_format::{Header, DEFAULT_MAX_PAYLOAD_SIZE, HEADER_SIZE};
use super::Frame;
use crate::error::Result;

const INITIAL_CAPACITY: usize = 64 * 1024;

#[derive(Debug, Clone, Copy)]
enum State {
    AwaitingHeader,
    AwaitingBody(Header),
}

/// Incremental frame decoder for one inbound byte stream.
pub struct FrameBuffer {
    buffer: BytesMut,
    state: State,
    max_payload_size: u32,
}

impl FrameBuffer {
    /// Buffer accepting bodies up to 8 MiB.
    pub fn new() -> Self {
        Self::with_max_payload(DEFAULT_MAX_PAYLOAD_SIZE)
    }

    pub fn with_max_payload(max_payload_size: u32) -> Self {
        Self {
            buffer: BytesMut::with_capacity(INITIAL_CAPACITY),
            state: State::AwaitingHeader,
            max_payload_size,
        }
    }

    /// Append `data` and drain every frame it completes.
    ///
    /// # Errors
    ///
    /// Bad magic or an oversized body. Frames completed before the offending
    /// header are dropped in that case; use [`extend`](Self::extend) plus
    /// [`next_frame`](Self::next_frame) when they matter.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Frame>> {
        self.extend(data);

        let mut frames = Vec::new();
        while let Some(frame) = self.next_frame()? {
            frames.push(frame);
        }
        Ok(frames)
    }

    /// Append data without extracting frames.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Next complete frame, `Ok(None)` when more bytes are needed.
    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        if let State::AwaitingHeader = self.state {
            let Some(header) = Header::decode(&self.buffer) else {
                return Ok(None);
            };
            header.validate(self.max_payload_size)?;
            self.buffer.advance(HEADER_SIZE);
            self.state = State::AwaitingBody(header);
        }

        let State::AwaitingBody(header) = self.state else {
            return Ok(None);
        };
        let body_length = header.body_length as usize;
        if self.buffer.len() < body_length {
            return Ok(None);
        }

        let payload = if body_length == 0 {
            Bytes::new()
        } else {
            self.buffer.split_to(body_length).freeze()
        };
        self.state = State::AwaitingHeader;
        Ok(Some(Frame::new(header, payload)))
    }

    /// Buffered bytes not yet returned as frames, parsed header excluded.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Drop buffered bytes and any half-read frame.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.state = State::AwaitingHeader;
    }

    #[cfg(test)]
    fn awaiting_body(&self) -> bool {
        matches!(self.state, State::AwaitingBody(_))
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ExchangeError;
    use crate::protocol::flags;

    fn make_frame_bytes(request_id: u64, payload: &[u8]) -> Vec<u8> {
        let header = Header::new(
            flags::compose(true, true, false, 1),
            0,
            request_id,
            payload.len() as u32,
        );
        let mut bytes = header.encode().to_vec();
        bytes.extend_from_slice(payload);
        bytes
    }

    #[test]
    fn test_single_complete_frame() {
        let mut buffer = FrameBuffer::new();
        let frames = buffer.push(&make_frame_bytes(42, b"hello")).unwrap();

        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].request_id(), 42);
        assert_eq!(&frames[0].payload[..], b"hello");
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_multiple_frames_in_one_push() {
        let mut buffer = FrameBuffer::new();

        let mut combined = make_frame_bytes(1, b"first");
        combined.extend_from_slice(&make_frame_bytes(2, b"second"));
        combined.extend_from_slice(&make_frame_bytes(3, b""));

        let frames = buffer.push(&combined).unwrap();
        let ids: Vec<u64> = frames.iter().map(|f| f.request_id()).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_fragmented_header_and_payload() {
        let mut buffer = FrameBuffer::new();
        let payload = b"this is a longer payload that will be fragmented";
        let frame_bytes = make_frame_bytes(7, payload);

        assert!(buffer.push(&frame_bytes[..5]).unwrap().is_empty());
        assert!(!buffer.awaiting_body());

        assert!(buffer
            .push(&frame_bytes[5..HEADER_SIZE + 10])
            .unwrap()
            .is_empty());
        assert!(buffer.awaiting_body());

        let frames = buffer.push(&frame_bytes[HEADER_SIZE + 10..]).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0].payload[..], payload);
        assert!(!buffer.awaiting_body());
    }

    #[test]
    fn test_byte_at_a_time() {
        let mut buffer = FrameBuffer::new();
        let mut all_frames = Vec::new();

        for byte in make_frame_bytes(9, b"hi") {
            all_frames.extend(buffer.push(&[byte]).unwrap());
        }

        assert_eq!(all_frames.len(), 1);
        assert_eq!(&all_frames[0].payload[..], b"hi");
    }

    #[test]
    fn test_bad_magic_is_protocol_error() {
        let mut buffer = FrameBuffer::new();
        let mut bytes = make_frame_bytes(1, b"x");
        bytes[1] = 0x00;

        match buffer.push(&bytes) {
            Err(ExchangeError::Protocol(msg)) => assert!(msg.contains("magic")),
            other => panic!("unexpected: {:?}", other.map(|f| f.len())),
        }
    }

    #[test]
    fn test_max_payload_validation() {
        let mut buffer = FrameBuffer::with_max_payload(100);
        let header = Header::new(flags::compose(true, true, false, 1), 0, 42, 1000);

        match buffer.push(&header.encode()) {
            Err(ExchangeError::PayloadTooLarge {
                id,
                two_way_request,
                ..
            }) => {
                assert_eq!(id, 42);
                assert!(two_way_request);
            }
            other => panic!("unexpected: {:?}", other.map(|f| f.len())),
        }
    }

    #[test]
    fn test_good_frames_before_bad_header_survive() {
        let mut buffer = FrameBuffer::new();
        let mut data = make_frame_bytes(1, b"ok");
        data.extend_from_slice(&[0u8; HEADER_SIZE]);
        buffer.extend(&data);

        let first = buffer.next_frame().unwrap().unwrap();
        assert_eq!(first.request_id(), 1);
        assert!(buffer.next_frame().is_err());
    }

    #[test]
    fn test_clear_resets_state() {
        let mut buffer = FrameBuffer::new();
        let frame_bytes = make_frame_bytes(42, b"test");
        buffer.push(&frame_bytes[..HEADER_SIZE]).unwrap();
        assert!(buffer.awaiting_body());

        buffer.clear();
        assert!(!buffer.awaiting_body());
        assert!(buffer.is_empty());
    }
}
