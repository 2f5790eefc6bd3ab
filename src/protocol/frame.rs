//! A validated header together with its complete body.
//!
//! # Example
//!
//! ```
//! use exchange_rpc::protocol::{Frame, Header, flags};
//! use bytes::Bytes;
//!
//! let header = Header::new(flags::REQUEST | flags::TWO_WAY | 1, 0, 42, 5);
//! let frame = Frame::new(header, Bytes::from_static(b"hello"));
//!
//! assert_eq!(frame.request_id(), 42);
//! assert!(frame.is_request());
//! assert_eq!(frame.payload(), b"hello");
//! ```

use bytes::Bytes;

use super::wire_format::{Header, HEADER_SIZE};

/// One unit as read off the wire, before message decoding.
#[derive(Debug, Clone)]
pub struct Frame {
    pub header: Header,
    /// Body, shared with the read buffer it was split from.
    pub payload: Bytes,
}

impl Frame {
    pub fn new(header: Header, payload: Bytes) -> Self {
        Self { header, payload }
    }

    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    #[inline]
    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    #[inline]
    pub fn request_id(&self) -> u64 {
        self.header.request_id
    }

    /// Raw status byte, meaningful for responses only.
    #[inline]
    pub fn status(&self) -> u8 {
        self.header.status
    }

    #[inline]
    pub fn is_request(&self) -> bool {
        self.header.is_request()
    }

    #[inline]
    pub fn is_two_way(&self) -> bool {
        self.header.is_two_way()
    }

    #[inline]
    pub fn is_event(&self) -> bool {
        self.header.is_event()
    }
}

/// Header and body in one contiguous buffer.
///
/// # Example
///
/// ```
/// use exchange_rpc::protocol::{build_frame, Header, flags};
///
/// let header = Header::new(flags::REQUEST | 1, 0, 42, 5);
/// let bytes = build_frame(&header, b"hello");
/// assert_eq!(bytes.len(), 16 + 5);
/// ```
pub fn build_frame(header: &Header, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
    buf.extend_from_slice(&header.encode());
    buf.extend_from_slice(payload);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::flags;

    #[test]
    fn test_frame_accessors() {
        let header = Header::new(flags::compose(false, false, false, 1), 20, 42, 5);
        let frame = Frame::new(header, Bytes::from_static(b"hello"));

        assert_eq!(frame.request_id(), 42);
        assert_eq!(frame.status(), 20);
        assert!(!frame.is_request());
        assert!(!frame.is_event());
        assert_eq!(frame.payload_len(), 5);
    }

    #[test]
    fn test_build_frame_roundtrip() {
        use super::super::FrameBuffer;

        let header = Header::new(flags::compose(true, true, true, 2), 0, 456, 10);
        let payload = b"0123456789";
        let bytes = build_frame(&header, payload);

        let mut buffer = FrameBuffer::new();
        let frames = buffer.push(&bytes).unwrap();

        assert_eq!(frames.len(), 1);
        let frame = &frames[0];
        assert_eq!(frame.request_id(), 456);
        assert_eq!(frame.payload(), payload);
        assert!(frame.is_event());
        assert!(frame.is_two_way());
    }

    #[test]
    fn test_build_frame_empty_payload() {
        let header = Header::new(flags::REQUEST, 0, 1, 0);
        assert_eq!(build_frame(&header, b"").len(), HEADER_SIZE);
    }
}
