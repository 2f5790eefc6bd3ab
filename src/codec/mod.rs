//! Codec module - body serialization.
//!
//! Bodies of error responses and events, and typed payloads of
//! [`call_typed`](crate::ExchangeClient::call_typed) and
//! [`TypedHandler`](crate::handler::TypedHandler), are encoded with the
//! serialization announced in the low five bits of the header flags:
//!
//! - [`MsgPackCodec`] - id 1, MessagePack using `rmp-serde` (default)
//! - [`JsonCodec`] - id 2, JSON using `serde_json`
//!
//! Codecs are marker structs with static methods; [`Serialization`] selects
//! one at runtime from a wire id or an endpoint parameter.
//!
//! # Example
//!
//! ```
//! use exchange_rpc::codec::Serialization;
//!
//! let ser: Serialization = "json".parse().unwrap();
//! let encoded = ser.encode(&"hello").unwrap();
//! let decoded: String = ser.decode(&encoded).unwrap();
//! assert_eq!(decoded, "hello");
//! assert_eq!(Serialization::from_id(ser.id()), Some(ser));
//! ```

mod json;
mod msgpack;

use std::fmt;
use std::str::FromStr;

pub use json::JsonCodec;
pub use msgpack::MsgPackCodec;

use crate::error::{ExchangeError, Result};

/// Body serialization, identified on the wire by a 5-bit id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Serialization {
    #[default]
    MsgPack,
    Json,
}

impl Serialization {
    /// Wire id of this serialization.
    #[inline]
    pub fn id(self) -> u8 {
        match self {
            Serialization::MsgPack => 1,
            Serialization::Json => 2,
        }
    }

    /// Look up a serialization by wire id.
    pub fn from_id(id: u8) -> Option<Self> {
        match id {
            1 => Some(Serialization::MsgPack),
            2 => Some(Serialization::Json),
            _ => None,
        }
    }

    /// Parameter name of this serialization (`msgpack` or `json`).
    pub fn name(self) -> &'static str {
        match self {
            Serialization::MsgPack => "msgpack",
            Serialization::Json => "json",
        }
    }

    pub fn encode<T: serde::Serialize + ?Sized>(self, value: &T) -> Result<Vec<u8>> {
        match self {
            Serialization::MsgPack => MsgPackCodec::encode(value),
            Serialization::Json => JsonCodec::encode(value),
        }
    }

    pub fn decode<T: serde::de::DeserializeOwned>(self, bytes: &[u8]) -> Result<T> {
        match self {
            Serialization::MsgPack => MsgPackCodec::decode(bytes),
            Serialization::Json => JsonCodec::decode(bytes),
        }
    }
}

impl FromStr for Serialization {
    type Err = ExchangeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "msgpack" | "messagepack" => Ok(Serialization::MsgPack),
            "json" => Ok(Serialization::Json),
            other => Err(ExchangeError::InvalidEndpoint(format!(
                "unknown serialization '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for Serialization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_stable() {
        assert_eq!(Serialization::MsgPack.id(), 1);
        assert_eq!(Serialization::Json.id(), 2);
        assert_eq!(Serialization::from_id(3), None);
        assert_eq!(Serialization::default(), Serialization::MsgPack);
    }

    #[test]
    fn test_parse_names() {
        assert_eq!(
            "MsgPack".parse::<Serialization>().unwrap(),
            Serialization::MsgPack
        );
        assert_eq!("json".parse::<Serialization>().unwrap(), Serialization::Json);
        assert!(matches!(
            "hessian2".parse::<Serialization>(),
            Err(ExchangeError::InvalidEndpoint(_))
        ));
    }

    #[test]
    fn test_same_value_differs_per_serialization() {
        let a = Serialization::MsgPack.encode("R").unwrap();
        let b = Serialization::Json.encode("R").unwrap();
        assert_ne!(a, b);
        assert_eq!(b, b"\"R\"".to_vec());
    }
}
