//! Error types for the exchange layer.

use thiserror::Error;

use crate::protocol::Status;

/// Main error type for all exchange operations.
#[derive(Debug, Error)]
pub enum ExchangeError {
    /// I/O error on the underlying stream.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Connect or bind failed.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The endpoint is already bound by this exchange context.
    #[error("Endpoint already bound: {0}")]
    AlreadyBound(String),

    /// Endpoint descriptor could not be parsed or carries a bad parameter.
    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// Protocol error (bad magic, malformed header, etc.).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Declared body length exceeds the channel payload limit.
    #[error("Payload size {size} of message {id} exceeds maximum {max}")]
    PayloadTooLarge {
        /// Correlation id recovered from the offending header.
        id: u64,
        /// Whether the offending frame was a two-way request.
        two_way_request: bool,
        /// Declared body length.
        size: u32,
        /// Configured limit.
        max: u32,
    },

    /// Serialization id in a header is not known to this side.
    #[error("Unknown serialization id: {0}")]
    UnknownSerialization(u8),

    /// MsgPack serialization error.
    #[error("MsgPack encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    /// MsgPack deserialization error.
    #[error("MsgPack decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Business fault raised by an application handler.
    #[error("Application error: {0}")]
    Application(String),

    /// The application handler does not know the requested service.
    #[error("Service not found: {0}")]
    ServiceNotFound(String),

    /// The peer answered with a failure status.
    #[error("Remote failure ({status}): {message}")]
    Remote {
        /// Status carried by the response.
        status: Status,
        /// Error detail carried by the response.
        message: String,
    },

    /// The call did not complete in time.
    #[error("Timeout ({status}): {message}")]
    Timeout {
        /// `ClientTimeout` or `ServerTimeout`.
        status: Status,
        /// Human readable detail.
        message: String,
    },

    /// The owning channel is closing or closed.
    #[error("Channel inactive: {0}")]
    ChannelInactive(String),

    /// The worker pool has no free slot for another reply.
    #[error("Server thread pool exhausted")]
    ThreadPoolExhausted,

    /// Backpressure timeout - write queue full.
    #[error("Backpressure timeout")]
    BackpressureTimeout,

    /// A call with the same correlation id is still pending.
    #[error("Request id {0} is already pending")]
    DuplicateRequestId(u64),
}

impl ExchangeError {
    /// Status code used when this error is reported to a peer.
    pub fn status(&self) -> Status {
        match self {
            ExchangeError::Application(_) => Status::ServiceError,
            ExchangeError::ServiceNotFound(_) => Status::ServiceNotFound,
            ExchangeError::Remote { status, .. } | ExchangeError::Timeout { status, .. } => *status,
            ExchangeError::ChannelInactive(_) => Status::ChannelInactive,
            ExchangeError::ThreadPoolExhausted => Status::ServerThreadpoolExhausted,
            ExchangeError::Protocol(_)
            | ExchangeError::PayloadTooLarge { .. }
            | ExchangeError::UnknownSerialization(_) => Status::BadRequest,
            _ => Status::ServerError,
        }
    }

    /// Whether this is a caller-side or server-side timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, ExchangeError::Timeout { .. })
    }
}

/// Result type alias using ExchangeError.
pub type Result<T> = std::result::Result<T, ExchangeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fault_class_mapping() {
        assert_eq!(
            ExchangeError::Application("boom".into()).status(),
            Status::ServiceError
        );
        assert_eq!(
            ExchangeError::ServiceNotFound("echo".into()).status(),
            Status::ServiceNotFound
        );
        assert_eq!(
            ExchangeError::Transport("refused".into()).status(),
            Status::ServerError
        );
        assert_eq!(
            ExchangeError::ThreadPoolExhausted.status(),
            Status::ServerThreadpoolExhausted
        );
    }

    #[test]
    fn test_timeout_keeps_its_status() {
        let err = ExchangeError::Timeout {
            status: Status::ServerTimeout,
            message: "slow".into(),
        };
        assert!(err.is_timeout());
        assert_eq!(err.status(), Status::ServerTimeout);
    }
}
