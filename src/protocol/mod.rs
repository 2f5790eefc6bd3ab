//! Protocol module - wire format, framing, and decoded units.
//!
//! - 16-byte header encoding/decoding
//! - Frame buffer for accumulating partial reads
//! - Frame struct with typed accessors
//! - Request/response model and the codec translating it to frames

mod codec;
mod frame;
mod frame_buffer;
mod message;
mod status;
mod wire_format;

pub use codec::ExchangeCodec;
pub use frame::{build_frame, Frame};
pub use frame_buffer::FrameBuffer;
pub use message::{Event, Message, Request, Response};
pub use status::Status;
pub use wire_format::{
    flags, Header, DEFAULT_MAX_PAYLOAD_SIZE, HEADER_SIZE, MAGIC, MAGIC_HIGH, MAGIC_LOW,
};
