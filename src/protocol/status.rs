//! Response status codes carried in the header status byte.

use std::fmt;

/// Outcome of a call, as carried by a response.
///
/// Numeric values are the wire values of the status byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Status {
    /// Call succeeded, the body is the result.
    Ok = 20,
    /// The caller's deadline fired before a response arrived.
    ClientTimeout = 30,
    /// The remote could not process the call in time.
    ServerTimeout = 31,
    /// The owning channel closed before a response arrived (local only).
    ChannelInactive = 35,
    /// The request could not be decoded by the remote.
    BadRequest = 40,
    /// The response could not be decoded locally.
    BadResponse = 50,
    /// The remote has no such service.
    ServiceNotFound = 60,
    /// The remote service raised a business fault.
    ServiceError = 70,
    /// Unexpected failure on the remote side.
    ServerError = 80,
    /// Unexpected failure on the caller side.
    ClientError = 90,
    /// The remote worker pool had no free slot.
    ServerThreadpoolExhausted = 100,
}

impl Status {
    /// Parse a wire status byte.
    pub fn from_u8(value: u8) -> Option<Self> {
        let status = match value {
            20 => Status::Ok,
            30 => Status::ClientTimeout,
            31 => Status::ServerTimeout,
            35 => Status::ChannelInactive,
            40 => Status::BadRequest,
            50 => Status::BadResponse,
            60 => Status::ServiceNotFound,
            70 => Status::ServiceError,
            80 => Status::ServerError,
            90 => Status::ClientError,
            100 => Status::ServerThreadpoolExhausted,
            _ => return None,
        };
        Some(status)
    }

    /// Wire value of this status.
    #[inline]
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Check if this is a success status.
    #[inline]
    pub fn is_ok(self) -> bool {
        self == Status::Ok
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Status::Ok => "OK",
            Status::ClientTimeout => "CLIENT_TIMEOUT",
            Status::ServerTimeout => "SERVER_TIMEOUT",
            Status::ChannelInactive => "CHANNEL_INACTIVE",
            Status::BadRequest => "BAD_REQUEST",
            Status::BadResponse => "BAD_RESPONSE",
            Status::ServiceNotFound => "SERVICE_NOT_FOUND",
            Status::ServiceError => "SERVICE_ERROR",
            Status::ServerError => "SERVER_ERROR",
            Status::ClientError => "CLIENT_ERROR",
            Status::ServerThreadpoolExhausted => "SERVER_THREADPOOL_EXHAUSTED",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_values() {
        assert_eq!(Status::Ok.to_u8(), 20);
        assert_eq!(Status::ClientTimeout.to_u8(), 30);
        assert_eq!(Status::ServiceError.to_u8(), 70);
        assert_eq!(Status::ServerThreadpoolExhausted.to_u8(), 100);
    }

    #[test]
    fn test_from_u8_rejects_unknown() {
        assert_eq!(Status::from_u8(80), Some(Status::ServerError));
        assert_eq!(Status::from_u8(0), None);
        assert_eq!(Status::from_u8(21), None);
    }

    #[test]
    fn test_display() {
        assert_eq!(Status::BadRequest.to_string(), "BAD_REQUEST");
        assert!(Status::Ok.is_ok());
        assert!(!Status::ServerError.is_ok());
    }
}
