//! Translation between [`Message`]s and frames.
//!
//! The header carries everything needed to route a unit; bodies are opaque
//! bytes except for error responses and events, whose bodies are encoded
//! with the serialization named in the header flags.

use bytes::Bytes;

use super::message::{Event, Message, Request, Response};
use super::wire_format::{flags, Header, DEFAULT_MAX_PAYLOAD_SIZE};
use super::{Frame, Status};
use crate::codec::Serialization;
use crate::error::{ExchangeError, Result};
use crate::writer::OutboundFrame;

/// Body of a read-only event.
const READONLY_EVENT: &str = "R";

/// Message codec bound to one body serialization.
#[derive(Debug, Clone, Copy)]
pub struct ExchangeCodec {
    serialization: Serialization,
    max_payload: u32,
}

impl ExchangeCodec {
    pub fn new(serialization: Serialization) -> Self {
        Self {
            serialization,
            max_payload: DEFAULT_MAX_PAYLOAD_SIZE,
        }
    }

    /// Limit on outbound body size.
    pub fn with_max_payload(mut self, max_payload: u32) -> Self {
        self.max_payload = max_payload;
        self
    }

    #[inline]
    pub fn serialization(&self) -> Serialization {
        self.serialization
    }

    #[inline]
    pub fn max_payload(&self) -> u32 {
        self.max_payload
    }

    /// Encode a message into a contiguous frame.
    pub fn encode(&self, message: &Message) -> Result<Bytes> {
        let frame = self.encode_frame(message)?;
        Ok(Bytes::from(build_frame_bytes(&frame)))
    }

    /// Encode a message into header and body parts for the writer task.
    ///
    /// # Errors
    ///
    /// Fails with [`ExchangeError::PayloadTooLarge`] when the body exceeds the
    /// configured limit, or with a serialization error.
    pub fn encode_frame(&self, message: &Message) -> Result<OutboundFrame> {
        let ser_id = self.serialization.id();
        let (flag_byte, status, id, body, two_way_request) = match message {
            Message::Request(req) => {
                let body = match req.event {
                    Some(Event::Heartbeat) => Bytes::new(),
                    Some(Event::ReadOnly) => {
                        Bytes::from(self.serialization.encode(READONLY_EVENT)?)
                    }
                    None => req.payload.clone(),
                };
                let flag_byte = flags::compose(true, req.two_way, req.is_event(), ser_id);
                (flag_byte, 0, req.id, body, req.two_way)
            }
            Message::Response(res) => {
                let body = if res.status.is_ok() {
                    res.result.clone()
                } else {
                    let detail = res.error.as_deref().unwrap_or_default();
                    Bytes::from(self.serialization.encode(detail)?)
                };
                let flag_byte = flags::compose(false, false, res.event, ser_id);
                (flag_byte, res.status.to_u8(), res.id, body, false)
            }
        };

        let size = u32::try_from(body.len()).unwrap_or(u32::MAX);
        if size > self.max_payload {
            return Err(ExchangeError::PayloadTooLarge {
                id,
                two_way_request,
                size,
                max: self.max_payload,
            });
        }

        let header = Header::new(flag_byte, status, id, size);
        Ok(OutboundFrame::new(&header, body))
    }

    /// Decode a validated frame.
    ///
    /// Never fails: a request whose body cannot be interpreted comes back
    /// with [`Request::broken`] set, and an uninterpretable response comes
    /// back as a `BAD_RESPONSE` for its caller.
    pub fn decode(&self, frame: Frame) -> Message {
        let header = frame.header;
        let serialization = Serialization::from_id(header.serialization_id());

        if header.is_request() {
            let mut req = Request {
                id: header.request_id,
                two_way: header.is_two_way(),
                event: None,
                payload: Bytes::new(),
                broken: None,
            };
            let Some(serialization) = serialization else {
                req.broken = Some(
                    ExchangeError::UnknownSerialization(header.serialization_id()).to_string(),
                );
                return Message::Request(req);
            };

            if header.is_event() {
                req.event = Some(Event::Heartbeat);
                if !frame.payload.is_empty() {
                    match serialization.decode::<String>(&frame.payload) {
                        Ok(data) if data == READONLY_EVENT => req.event = Some(Event::ReadOnly),
                        Ok(_) => {}
                        Err(e) => req.broken = Some(e.to_string()),
                    }
                }
            } else {
                req.payload = frame.payload;
            }
            return Message::Request(req);
        }

        let id = header.request_id;
        let Some(status) = Status::from_u8(header.status) else {
            return Message::Response(Response::error(
                id,
                Status::BadResponse,
                format!("unknown status byte {}", header.status),
            ));
        };
        let Some(serialization) = serialization else {
            return Message::Response(Response::error(
                id,
                Status::BadResponse,
                ExchangeError::UnknownSerialization(header.serialization_id()).to_string(),
            ));
        };

        let response = if status.is_ok() {
            Response {
                event: header.is_event(),
                ..Response::ok(id, frame.payload)
            }
        } else {
            match serialization.decode::<String>(&frame.payload) {
                Ok(detail) => Response::error(id, status, detail),
                Err(e) => Response::error(
                    id,
                    Status::BadResponse,
                    format!("undecodable error detail for status {}: {}", status, e),
                ),
            }
        };
        Message::Response(response)
    }
}

impl Default for ExchangeCodec {
    fn default() -> Self {
        Self::new(Serialization::default())
    }
}

fn build_frame_bytes(frame: &OutboundFrame) -> Vec<u8> {
    let mut buf = Vec::with_capacity(frame.size());
    buf.extend_from_slice(&frame.header);
    buf.extend_from_slice(&frame.payload);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::FrameBuffer;

    fn roundtrip(codec: &ExchangeCodec, message: &Message) -> Message {
        let bytes = codec.encode(message).unwrap();
        let mut buffer = FrameBuffer::new();
        let mut frames = buffer.push(&bytes).unwrap();
        assert_eq!(frames.len(), 1);
        codec.decode(frames.remove(0))
    }

    #[test]
    fn test_request_header_layout() {
        let codec = ExchangeCodec::default();
        let bytes = codec
            .encode(&Request::new(5, Bytes::from_static(b"abc")).into())
            .unwrap();

        let header = Header::decode(&bytes).unwrap();
        assert_eq!(header.flags, 0xC1);
        assert_eq!(header.request_id, 5);
        assert_eq!(header.body_length, 3);
        assert_eq!(&bytes[16..], b"abc");
    }

    #[test]
    fn test_heartbeat_has_empty_body() {
        let codec = ExchangeCodec::default();
        let bytes = codec.encode(&Request::heartbeat(8).into()).unwrap();
        assert_eq!(bytes.len(), 16);
        assert_eq!(bytes[2], 0xE1);

        let decoded = roundtrip(&codec, &Request::heartbeat(8).into());
        assert!(decoded.is_heartbeat());
    }

    #[test]
    fn test_readonly_event_body() {
        let codec = ExchangeCodec::new(Serialization::Json);
        let bytes = codec.encode(&Request::readonly_event(3).into()).unwrap();
        assert_eq!(&bytes[16..], b"\"R\"");

        match roundtrip(&codec, &Request::readonly_event(3).into()) {
            Message::Request(req) => {
                assert_eq!(req.event, Some(Event::ReadOnly));
                assert!(!req.two_way);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_error_response_carries_detail() {
        let codec = ExchangeCodec::default();
        let res = Response::error(11, Status::ServiceError, "no stock");
        let bytes = codec.encode(&Message::from(res.clone())).unwrap();
        assert_eq!(bytes[3], 70);

        let decoded = roundtrip(&codec, &res.clone().into());
        assert_eq!(decoded, Message::Response(res));
    }

    #[test]
    fn test_unknown_serialization_on_request_is_broken() {
        let codec = ExchangeCodec::default();
        let header = Header::new(flags::compose(true, true, false, 9), 0, 4, 1);
        let frame = Frame::new(header, Bytes::from_static(b"x"));

        match codec.decode(frame) {
            Message::Request(req) => {
                assert_eq!(req.id, 4);
                assert!(req.broken.is_some());
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_serialization_on_response_is_bad_response() {
        let codec = ExchangeCodec::default();
        let header = Header::new(flags::compose(false, false, false, 9), 20, 4, 0);

        match codec.decode(Frame::new(header, Bytes::new())) {
            Message::Response(res) => assert_eq!(res.status, Status::BadResponse),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_status_is_bad_response() {
        let codec = ExchangeCodec::default();
        let header = Header::new(flags::compose(false, false, false, 1), 21, 4, 0);

        match codec.decode(Frame::new(header, Bytes::new())) {
            Message::Response(res) => {
                assert_eq!(res.status, Status::BadResponse);
                assert_eq!(res.id, 4);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_oversized_body_rejected_on_encode() {
        let codec = ExchangeCodec::default().with_max_payload(4);
        let err = codec
            .encode_frame(&Request::new(1, Bytes::from_static(b"too long")).into())
            .unwrap_err();
        assert!(matches!(err, ExchangeError::PayloadTooLarge { id: 1, .. }));
    }
}
