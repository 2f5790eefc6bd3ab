//! Wire format encoding and decoding.
//!
//! Implements the 16-byte header format:
//! ```text
//! ┌──────────┬───────┬────────┬──────────────┬──────────┐
//! │ Magic    │ Flags │ Status │ Request ID   │ Length   │
//! │ 2 bytes  │ 1 byte│ 1 byte │ 8 bytes      │ 4 bytes  │
//! │ 0xDABB   │       │        │ uint64 BE    │ uint32 BE│
//! └──────────┴───────┴────────┴──────────────┴──────────┘
//! ```
//!
//! All multi-byte integers are Big Endian.

use crate::error::{ExchangeError, Result};

/// Header size in bytes (fixed, exactly 16).
pub const HEADER_SIZE: usize = 16;

/// Magic constant identifying the protocol.
pub const MAGIC: u16 = 0xDABB;

/// High byte of the magic.
pub const MAGIC_HIGH: u8 = (MAGIC >> 8) as u8;

/// Low byte of the magic.
pub const MAGIC_LOW: u8 = MAGIC as u8;

/// Default maximum body size (8 MiB).
pub const DEFAULT_MAX_PAYLOAD_SIZE: u32 = 8 * 1024 * 1024;

/// Flag constants for the protocol.
pub mod flags {
    /// Message type: request (1) or response (0).
    pub const REQUEST: u8 = 0b1000_0000;
    /// Caller waits for a response.
    pub const TWO_WAY: u8 = 0b0100_0000;
    /// Protocol-internal event (heartbeat, read-only notice).
    pub const EVENT: u8 = 0b0010_0000;
    /// Low five bits carry the body serialization id.
    pub const SERIALIZATION_MASK: u8 = 0b0001_1111;

    /// Check if a specific flag is set.
    #[inline]
    pub fn has_flag(flags: u8, flag: u8) -> bool {
        flags & flag != 0
    }

    /// Build a flag byte from its parts.
    #[inline]
    pub fn compose(request: bool, two_way: bool, event: bool, serialization_id: u8) -> u8 {
        let mut flags = serialization_id & SERIALIZATION_MASK;
        if request {
            flags |= REQUEST;
        }
        if two_way {
            flags |= TWO_WAY;
        }
        if event {
            flags |= EVENT;
        }
        flags
    }
}

/// Decoded header from wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Magic constant as read from the wire.
    pub magic: u16,
    /// Flags byte (see `flags` module).
    pub flags: u8,
    /// Status byte, meaningful for responses only.
    pub status: u8,
    /// Correlation id.
    pub request_id: u64,
    /// Body length in bytes.
    pub body_length: u32,
}

impl Header {
    /// Create a new header with the protocol magic.
    pub fn new(flags: u8, status: u8, request_id: u64, body_length: u32) -> Self {
        Self {
            magic: MAGIC,
            flags,
            status,
            request_id,
            body_length,
        }
    }

    /// Encode header to bytes (Big Endian).
    ///
    /// # Example
    ///
    /// ```
    /// use exchange_rpc::protocol::{Header, flags};
    ///
    /// let header = Header::new(flags::REQUEST | flags::TWO_WAY | 1, 0, 42, 100);
    /// let bytes = header.encode();
    /// assert_eq!(bytes.len(), 16);
    /// assert_eq!(&bytes[..2], &[0xDA, 0xBB]);
    /// ```
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        self.encode_into(&mut buf);
        buf
    }

    /// Encode header into an existing buffer.
    ///
    /// # Panics
    ///
    /// Panics if buffer is smaller than `HEADER_SIZE` (16 bytes).
    pub fn encode_into(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= HEADER_SIZE);
        buf[0..2].copy_from_slice(&self.magic.to_be_bytes());
        buf[2] = self.flags;
        buf[3] = self.status;
        buf[4..12].copy_from_slice(&self.request_id.to_be_bytes());
        buf[12..16].copy_from_slice(&self.body_length.to_be_bytes());
    }

    /// Decode header from bytes (Big Endian).
    ///
    /// Returns `None` if buffer is too short. The magic is not checked here,
    /// see [`Header::validate`].
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_SIZE {
            return None;
        }
        let mut id = [0u8; 8];
        id.copy_from_slice(&buf[4..12]);
        Some(Self {
            magic: u16::from_be_bytes([buf[0], buf[1]]),
            flags: buf[2],
            status: buf[3],
            request_id: u64::from_be_bytes(id),
            body_length: u32::from_be_bytes([buf[12], buf[13], buf[14], buf[15]]),
        })
    }

    /// Validate the header for protocol compliance.
    ///
    /// Checks:
    /// - Magic matches [`MAGIC`]
    /// - Body length doesn't exceed max
    pub fn validate(&self, max_payload_size: u32) -> Result<()> {
        if self.magic != MAGIC {
            return Err(ExchangeError::Protocol(format!(
                "Invalid magic 0x{:04X}, expected 0x{:04X}",
                self.magic, MAGIC
            )));
        }

        if self.body_length > max_payload_size {
            return Err(ExchangeError::PayloadTooLarge {
                id: self.request_id,
                two_way_request: self.is_request() && self.is_two_way(),
                size: self.body_length,
                max: max_payload_size,
            });
        }

        Ok(())
    }

    /// Check if this is a request.
    #[inline]
    pub fn is_request(&self) -> bool {
        flags::has_flag(self.flags, flags::REQUEST)
    }

    /// Check if this is a response.
    #[inline]
    pub fn is_response(&self) -> bool {
        !self.is_request()
    }

    /// Check if the caller waits for a response.
    #[inline]
    pub fn is_two_way(&self) -> bool {
        flags::has_flag(self.flags, flags::TWO_WAY)
    }

    /// Check if this is a protocol event.
    #[inline]
    pub fn is_event(&self) -> bool {
        flags::has_flag(self.flags, flags::EVENT)
    }

    /// Body serialization id.
    #[inline]
    pub fn serialization_id(&self) -> u8 {
        self.flags & flags::SERIALIZATION_MASK
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_encode_decode_roundtrip() {
        let original = Header::new(flags::compose(true, true, false, 1), 0, 42, 100);
        let encoded = original.encode();
        let decoded = Header::decode(&encoded).unwrap();
        assert_eq!(original, decoded);
    }

    #[test]
    fn test_header_big_endian_byte_order() {
        let header = Header::new(0xC1, 0x14, 0x0102030405060708, 0x090A0B0C);
        let bytes = header.encode();

        assert_eq!(&bytes[0..2], &[0xDA, 0xBB]);
        assert_eq!(bytes[2], 0xC1);
        assert_eq!(bytes[3], 0x14);
        assert_eq!(
            &bytes[4..12],
            &[0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08]
        );
        assert_eq!(&bytes[12..16], &[0x09, 0x0A, 0x0B, 0x0C]);
    }

    #[test]
    fn test_decode_too_short_buffer() {
        let buf = [0u8; HEADER_SIZE - 1];
        assert!(Header::decode(&buf).is_none());
    }

    #[test]
    fn test_validate_bad_magic() {
        let mut bytes = Header::new(flags::REQUEST, 0, 1, 0).encode();
        bytes[0] = 0x00;
        let header = Header::decode(&bytes).unwrap();
        let err = header.validate(DEFAULT_MAX_PAYLOAD_SIZE).unwrap_err();
        assert!(err.to_string().contains("Invalid magic"));
    }

    #[test]
    fn test_validate_payload_too_large_keeps_id() {
        let header = Header::new(flags::compose(true, true, false, 1), 0, 77, 1_000);
        match header.validate(100) {
            Err(ExchangeError::PayloadTooLarge {
                id,
                two_way_request,
                size,
                max,
            }) => {
                assert_eq!(id, 77);
                assert!(two_way_request);
                assert_eq!(size, 1_000);
                assert_eq!(max, 100);
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_flag_composition() {
        let f = flags::compose(true, true, true, 2);
        assert_eq!(f, 0xE2);

        let header = Header::new(f, 0, 0, 0);
        assert!(header.is_request());
        assert!(header.is_two_way());
        assert!(header.is_event());
        assert_eq!(header.serialization_id(), 2);

        let response = Header::new(flags::compose(false, false, false, 1), 20, 9, 0);
        assert!(response.is_response());
        assert!(!response.is_two_way());
        assert_eq!(response.serialization_id(), 1);
    }

    #[test]
    fn test_serialization_id_is_masked() {
        assert_eq!(flags::compose(false, false, false, 0xFF), 0x1F);
    }
}
