//! Application handler contract and closure adapters.
//!
//! # Example
//!
//! ```ignore
//! use exchange_rpc::handler::{handler_fn, TypedHandler};
//! use exchange_rpc::ExchangeError;
//!
//! // Raw bytes in, raw bytes out
//! let echo = handler_fn(|_channel, payload| async move { Ok(payload) });
//!
//! // Typed request/response through the channel serialization
//! let add = TypedHandler::new(|(a, b): (i64, i64)| async move {
//!     a.checked_add(b)
//!         .ok_or_else(|| ExchangeError::Application("overflow".into()))
//! });
//! ```

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::channel::Channel;
use crate::error::{ExchangeError, Result};
use crate::protocol::Message;

/// Business logic answering requests that arrive on a channel.
///
/// `reply` runs on the exchange worker pool, never for heartbeat or other
/// protocol events. The hooks run on the channel's read task and must not
/// block.
#[async_trait]
pub trait ExchangeHandler: Send + Sync + 'static {
    /// Answer a request. The returned body becomes an `OK` response for
    /// two-way requests and is discarded for one-way ones.
    ///
    /// Return [`ExchangeError::Application`] for business faults and
    /// [`ExchangeError::ServiceNotFound`] for unknown services.
    async fn reply(&self, channel: &Arc<Channel>, payload: Bytes) -> Result<Bytes>;

    /// A channel became connected.
    fn connected(&self, _channel: &Channel) {}

    /// A channel closed. Its pending calls have already been failed.
    fn disconnected(&self, _channel: &Channel) {}

    /// A failure that has no caller to report to.
    fn caught(&self, _channel: &Channel, _error: &ExchangeError) {}

    /// A message was handed to the writer.
    fn sent(&self, _channel: &Channel, _message: &Message) {}
}

/// Handler built from a closure over raw bytes.
pub struct FnHandler<F> {
    f: F,
}

/// Wrap a closure `(channel, payload) -> Future<Output = Result<Bytes>>`.
pub fn handler_fn<F, Fut>(f: F) -> Arc<FnHandler<F>>
where
    F: Fn(Arc<Channel>, Bytes) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Bytes>> + Send + 'static,
{
    Arc::new(FnHandler { f })
}

#[async_trait]
impl<F, Fut> ExchangeHandler for FnHandler<F>
where
    F: Fn(Arc<Channel>, Bytes) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Bytes>> + Send + 'static,
{
    async fn reply(&self, channel: &Arc<Channel>, payload: Bytes) -> Result<Bytes> {
        (self.f)(channel.clone(), payload).await
    }
}

/// Wrapper that decodes the request and encodes the response with the
/// channel's serialization before and after calling the closure.
pub struct TypedHandler<F, Req, Resp, Fut> {
    handler: F,
    _phantom: PhantomData<fn(Req) -> (Resp, Fut)>,
}

impl<F, Req, Resp, Fut> TypedHandler<F, Req, Resp, Fut>
where
    F: Fn(Req) -> Fut + Send + Sync + 'static,
    Req: DeserializeOwned + Send + 'static,
    Resp: Serialize + Send + 'static,
    Fut: Future<Output = Result<Resp>> + Send + 'static,
{
    pub fn new(handler: F) -> Arc<Self> {
        Arc::new(Self {
            handler,
            _phantom: PhantomData,
        })
    }
}

#[async_trait]
impl<F, Req, Resp, Fut> ExchangeHandler for TypedHandler<F, Req, Resp, Fut>
where
    F: Fn(Req) -> Fut + Send + Sync + 'static,
    Req: DeserializeOwned + Send + 'static,
    Resp: Serialize + Send + 'static,
    Fut: Future<Output = Result<Resp>> + Send + 'static,
{
    async fn reply(&self, channel: &Arc<Channel>, payload: Bytes) -> Result<Bytes> {
        let serialization = channel.serialization();
        let request: Req = serialization.decode(&payload)?;
        let response = (self.handler)(request).await?;
        Ok(Bytes::from(serialization.encode(&response)?))
    }
}
