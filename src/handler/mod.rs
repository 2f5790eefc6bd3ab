//! Handler module - application contract and request routing.
//!
//! Provides:
//! - [`ExchangeHandler`] - the application's `reply` plus lifecycle hooks
//! - [`handler_fn`] and [`TypedHandler`] - closure adapters
//! - [`HeaderExchangeHandler`] - routes decoded units to the registry or
//!   the application
//!
//! # Example
//!
//! ```ignore
//! use exchange_rpc::handler::handler_fn;
//!
//! let echo = handler_fn(|_channel, payload| async move { Ok(payload) });
//! let server = HeaderExchanger.bind(&ctx, &endpoint, echo).await?;
//! ```

mod application;
mod router;

pub use application::{handler_fn, ExchangeHandler, FnHandler, TypedHandler};
pub use router::HeaderExchangeHandler;
