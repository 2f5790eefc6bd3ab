//! Decoded protocol units: requests and responses.

use bytes::Bytes;

use super::Status;
use crate::error::{ExchangeError, Result};

/// Protocol-internal event carried by a request with the event flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// Keep-alive probe, empty body.
    Heartbeat,
    /// The sender is shutting down and accepts no new calls.
    ReadOnly,
}

/// Outbound or inbound call.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub id: u64,
    /// Caller waits for a response.
    pub two_way: bool,
    pub event: Option<Event>,
    pub payload: Bytes,
    /// Set when the body could not be interpreted; answered with `BAD_REQUEST`.
    pub broken: Option<String>,
}

impl Request {
    /// Two-way application request.
    pub fn new(id: u64, payload: Bytes) -> Self {
        Self {
            id,
            two_way: true,
            event: None,
            payload,
            broken: None,
        }
    }

    /// One-way application request.
    pub fn oneway(id: u64, payload: Bytes) -> Self {
        Self {
            two_way: false,
            ..Self::new(id, payload)
        }
    }

    /// Two-way heartbeat probe.
    pub fn heartbeat(id: u64) -> Self {
        Self {
            event: Some(Event::Heartbeat),
            ..Self::new(id, Bytes::new())
        }
    }

    /// One-way read-only notice.
    pub fn readonly_event(id: u64) -> Self {
        Self {
            event: Some(Event::ReadOnly),
            ..Self::oneway(id, Bytes::new())
        }
    }

    #[inline]
    pub fn is_heartbeat(&self) -> bool {
        self.event == Some(Event::Heartbeat)
    }

    #[inline]
    pub fn is_event(&self) -> bool {
        self.event.is_some()
    }
}

/// Answer to a two-way request.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    /// Id of the request being answered.
    pub id: u64,
    pub status: Status,
    /// Acknowledges an event request (heartbeat).
    pub event: bool,
    /// Result body, meaningful when `status` is `Ok`.
    pub result: Bytes,
    /// Error detail, set when `status` is not `Ok`.
    pub error: Option<String>,
}

impl Response {
    /// Successful response carrying `result`.
    pub fn ok(id: u64, result: Bytes) -> Self {
        Self {
            id,
            status: Status::Ok,
            event: false,
            result,
            error: None,
        }
    }

    /// Failed response with a status and detail message.
    pub fn error(id: u64, status: Status, message: impl Into<String>) -> Self {
        Self {
            id,
            status,
            event: false,
            result: Bytes::new(),
            error: Some(message.into()),
        }
    }

    /// Acknowledgement of a heartbeat request.
    pub fn heartbeat(id: u64) -> Self {
        Self {
            event: true,
            ..Self::ok(id, Bytes::new())
        }
    }

    /// Convert into the caller-facing result.
    ///
    /// `Ok` yields the body. Timeouts map to [`ExchangeError::Timeout`], a
    /// torn down channel to [`ExchangeError::ChannelInactive`], and every
    /// other status to [`ExchangeError::Remote`].
    pub fn into_result(self) -> Result<Bytes> {
        let message = self.error.unwrap_or_default();
        match self.status {
            Status::Ok => Ok(self.result),
            Status::ClientTimeout | Status::ServerTimeout => Err(ExchangeError::Timeout {
                status: self.status,
                message,
            }),
            Status::ChannelInactive => Err(ExchangeError::ChannelInactive(message)),
            status => Err(ExchangeError::Remote { status, message }),
        }
    }
}

/// A decoded protocol unit.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request(Request),
    Response(Response),
}

impl Message {
    /// Correlation id of the unit.
    pub fn id(&self) -> u64 {
        match self {
            Message::Request(req) => req.id,
            Message::Response(res) => res.id,
        }
    }

    /// Heartbeat requests and heartbeat acknowledgements.
    pub fn is_heartbeat(&self) -> bool {
        match self {
            Message::Request(req) => req.is_heartbeat(),
            Message::Response(res) => res.event,
        }
    }
}

impl From<Request> for Message {
    fn from(req: Request) -> Self {
        Message::Request(req)
    }
}

impl From<Response> for Message {
    fn from(res: Response) -> Self {
        Message::Response(res)
    }
}
