//! Transport module - TCP socket handling.
//!
//! Provides the byte stream a channel runs over; the exchange layer only
//! needs split read/write halves, so any `AsyncRead + AsyncWrite` stream can
//! be handed to [`Channel::spawn`](crate::channel::Channel::spawn) directly.

mod tcp;

pub use tcp::{connect, resolve, Acceptor};
