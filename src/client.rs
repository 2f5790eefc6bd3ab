//! Client side of an exchange connection.
//!
//! An [`ExchangeClient`] wraps a single connected [`Channel`] and adds the
//! caller-facing conveniences: default request timeouts, typed calls, an
//! optional heartbeat and a graceful close.
//!
//! # Example
//!
//! ```ignore
//! use exchange_rpc::{ExchangeContext, Exchanger, HeaderExchanger};
//!
//! let ctx = ExchangeContext::new();
//! let endpoint = "exchange://127.0.0.1:20880?timeout=500".parse()?;
//! let client = HeaderExchanger.connect(&ctx, &endpoint, handler).await?;
//!
//! let body = client.call(Bytes::from_static(b"ping")).await?;
//! client.close(Duration::from_secs(1)).await;
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info};

use crate::channel::Channel;
use crate::config::ExchangeConfig;
use crate::correlation::ResponseFuture;
use crate::error::Result;
use crate::heartbeat::Heartbeat;

/// A connected exchange client.
///
/// Dropping the client closes its channel without waiting for pending calls.
pub struct ExchangeClient {
    channel: Arc<Channel>,
    config: ExchangeConfig,
    heartbeat: Mutex<Option<Heartbeat>>,
}

impl ExchangeClient {
    /// Wrap a connected channel. With `start_heartbeat` the heartbeat timer
    /// is armed right away, otherwise it waits for
    /// [`start_heartbeat`](Self::start_heartbeat).
    pub(crate) fn new(channel: Arc<Channel>, config: ExchangeConfig, start_heartbeat: bool) -> Self {
        let client = Self {
            channel,
            config,
            heartbeat: Mutex::new(None),
        };
        if start_heartbeat {
            client.start_heartbeat();
        }
        client
    }

    /// Issue a two-way request with the configured default timeout.
    pub async fn request(&self, payload: Bytes) -> Result<ResponseFuture> {
        self.request_with_timeout(payload, self.config.request_timeout)
            .await
    }

    /// Issue a two-way request that fails with a timeout status after
    /// `timeout`.
    pub async fn request_with_timeout(
        &self,
        payload: Bytes,
        timeout: Duration,
    ) -> Result<ResponseFuture> {
        self.channel.request(payload, timeout).await
    }

    /// Request and wait for the response body.
    pub async fn call(&self, payload: Bytes) -> Result<Bytes> {
        self.request(payload).await?.await
    }

    /// Request with serde types, using the configured default timeout.
    pub async fn call_typed<Req, Resp>(&self, request: &Req) -> Result<Resp>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        self.channel
            .call_typed(request, self.config.request_timeout)
            .await
    }

    /// Fire-and-forget request. Nothing is registered and no response is
    /// expected.
    pub async fn send(&self, payload: Bytes) -> Result<()> {
        self.channel.send_oneway(payload).await
    }

    /// Arm the heartbeat timer. No-op when heartbeats are disabled or the
    /// timer already runs.
    pub fn start_heartbeat(&self) {
        let Some(interval) = self.config.heartbeat else {
            return;
        };
        let mut slot = self.heartbeat.lock();
        if slot.is_some() {
            return;
        }
        *slot = Some(Heartbeat::spawn(
            Arc::downgrade(&self.channel),
            interval,
            self.config.heartbeat_misses,
            self.channel.shutdown_token().child_token(),
            |channel| vec![channel.clone()],
        ));
    }

    /// Stop the heartbeat timer, if any.
    pub fn stop_heartbeat(&self) {
        self.heartbeat.lock().take();
    }

    pub fn is_heartbeat_running(&self) -> bool {
        self.heartbeat.lock().is_some()
    }

    /// Graceful close.
    ///
    /// New calls are refused at once. Pending calls get up to `grace` to
    /// complete; whatever is still pending afterwards fails with
    /// `CHANNEL_INACTIVE` when the channel goes down. Idempotent.
    pub async fn close(&self, grace: Duration) {
        if self.channel.is_closed() {
            return;
        }
        self.channel.begin_close();
        self.stop_heartbeat();

        let registry = self.channel.registry();
        if !registry.wait_drained(self.channel.id(), grace).await {
            debug!(
                channel = self.channel.id(),
                pending = self.channel.pending_calls(),
                "close grace elapsed with calls pending"
            );
        }

        self.channel.close();
        self.channel.closed().await;
        info!(channel = self.channel.id(), remote = %self.channel.remote_addr(), "client closed");
    }

    /// [`close`](Self::close) with the configured close timeout.
    pub async fn close_default(&self) {
        self.close(self.config.close_timeout).await
    }

    /// Resolves once the connection is gone, whichever side closed it.
    pub async fn closed(&self) {
        self.channel.closed().await
    }

    pub fn is_connected(&self) -> bool {
        self.channel.is_connected()
    }

    /// The server announced it is shutting down.
    pub fn is_readonly(&self) -> bool {
        self.channel.is_readonly()
    }

    pub fn channel(&self) -> &Arc<Channel> {
        &self.channel
    }

    pub fn config(&self) -> &ExchangeConfig {
        &self.config
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.channel.local_addr()
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.channel.remote_addr()
    }
}

impl Drop for ExchangeClient {
    fn drop(&mut self) {
        self.channel.close();
    }
}
