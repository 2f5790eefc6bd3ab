//! # exchange-rpc
//!
//! Request/response exchange layer over TCP.
//!
//! Every unit on the wire is a 16-byte header followed by a serialized body.
//! The header carries a magic number, request/two-way/event flags, the body
//! serialization id, a response status, a 64-bit correlation id and the body
//! length. On top of that framing this crate provides:
//!
//! - correlation of concurrent two-way calls with per-call timeouts
//! - one-way requests
//! - heartbeats that detect and close dead connections
//! - a bounded worker pool for application replies
//! - graceful client and server shutdown with a read-only announcement
//!
//! ## Example
//!
//! ```ignore
//! use exchange_rpc::{handler_fn, ExchangeContext, Exchanger, HeaderExchanger};
//!
//! #[tokio::main]
//! async fn main() -> exchange_rpc::Result<()> {
//!     let ctx = ExchangeContext::new();
//!     let echo = handler_fn(|_channel, payload| async move { Ok(payload) });
//!
//!     let server = HeaderExchanger
//!         .bind(&ctx, &"127.0.0.1:0".parse()?, echo.clone())
//!         .await?;
//!     let endpoint = format!("exchange://{}?timeout=500", server.local_addr()).parse()?;
//!     let client = HeaderExchanger.connect(&ctx, &endpoint, echo).await?;
//!
//!     let body = client.call(bytes::Bytes::from_static(b"hello")).await?;
//!     assert_eq!(&body[..], b"hello");
//!
//!     client.close_default().await;
//!     server.close_default().await;
//!     Ok(())
//! }
//! ```

pub mod channel;
pub mod client;
pub mod codec;
pub mod config;
pub mod context;
pub mod correlation;
pub mod error;
pub mod exchanger;
pub mod handler;
pub mod protocol;
pub mod server;
pub mod transport;
pub mod writer;

mod heartbeat;
mod util;

pub use channel::{Channel, ChannelState, ChannelStats};
pub use client::ExchangeClient;
pub use codec::Serialization;
pub use config::{Endpoint, ExchangeConfig};
pub use context::ExchangeContext;
pub use correlation::ResponseFuture;
pub use error::{ExchangeError, Result};
pub use exchanger::{Exchanger, HeaderExchanger};
pub use handler::{handler_fn, ExchangeHandler, TypedHandler};
pub use protocol::Status;
pub use server::ExchangeServer;
