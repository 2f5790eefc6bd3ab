//! Server side: accept loop, channel table and graceful shutdown.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::channel::{Channel, ChannelParts};
use crate::config::ExchangeConfig;
use crate::context::BoundAddress;
use crate::correlation::ResponseFuture;
use crate::error::{ExchangeError, Result};
use crate::handler::HeaderExchangeHandler;
use crate::heartbeat::Heartbeat;
use crate::protocol::{ExchangeCodec, Message, Request};
use crate::transport::Acceptor;

/// Pause after a failed `accept` before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

struct ServerInner {
    local_addr: SocketAddr,
    config: ExchangeConfig,
    router: Arc<HeaderExchangeHandler>,
    channels: RwLock<HashMap<u64, Arc<Channel>>>,
    heartbeat: Mutex<Option<Heartbeat>>,
    bound: Mutex<Option<BoundAddress>>,
    /// Parent of every channel token.
    shutdown: CancellationToken,
    /// Stops the accept loop only.
    accepting: CancellationToken,
    closing: CancellationToken,
    terminated: CancellationToken,
}

impl ServerInner {
    fn channels(&self) -> Vec<Arc<Channel>> {
        self.channels.read().values().cloned().collect()
    }

    fn register(self: &Arc<Self>, stream: TcpStream, remote_addr: SocketAddr) {
        let local_addr = stream.local_addr().unwrap_or(self.local_addr);
        let (reader, writer) = stream.into_split();

        let codec = ExchangeCodec::new(self.config.serialization)
            .with_max_payload(self.config.max_payload);
        let channel = Channel::spawn(
            reader,
            writer,
            ChannelParts {
                id: self.router.registry().next_channel_id(),
                local_addr,
                remote_addr,
                codec,
                writer: self.config.writer.clone(),
                router: self.router.clone(),
                shutdown: self.shutdown.child_token(),
            },
        );
        debug!(channel = channel.id(), remote = %remote_addr, "channel accepted");
        self.channels.write().insert(channel.id(), channel.clone());

        let server = Arc::downgrade(self);
        tokio::spawn(async move {
            channel.closed().await;
            if let Some(server) = server.upgrade() {
                server.channels.write().remove(&channel.id());
            }
        });
    }
}

/// A bound exchange server.
///
/// Every accepted connection becomes a [`Channel`] whose requests are routed
/// to the application handler given at bind time. Dropping the server closes
/// all of its channels and releases the address without a grace period.
pub struct ExchangeServer {
    inner: Arc<ServerInner>,
}

impl ExchangeServer {
    pub(crate) fn start(
        acceptor: Acceptor,
        config: ExchangeConfig,
        router: Arc<HeaderExchangeHandler>,
        shutdown: CancellationToken,
        bound: BoundAddress,
    ) -> Result<Self> {
        let local_addr = acceptor.local_addr()?;
        let accepting = shutdown.child_token();

        let inner = Arc::new(ServerInner {
            local_addr,
            config,
            router,
            channels: RwLock::new(HashMap::new()),
            heartbeat: Mutex::new(None),
            bound: Mutex::new(Some(bound)),
            shutdown,
            accepting: accepting.clone(),
            closing: CancellationToken::new(),
            terminated: CancellationToken::new(),
        });

        if let Some(interval) = inner.config.heartbeat {
            let heartbeat = Heartbeat::spawn(
                Arc::downgrade(&inner),
                interval,
                inner.config.heartbeat_misses,
                inner.shutdown.child_token(),
                |server| server.channels(),
            );
            *inner.heartbeat.lock() = Some(heartbeat);
        }

        tokio::spawn(accept_loop(acceptor, Arc::downgrade(&inner), accepting));
        info!(addr = %local_addr, threads = inner.config.threads, "exchange server bound");
        Ok(Self { inner })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub fn config(&self) -> &ExchangeConfig {
        &self.inner.config
    }

    /// Whether new connections are still accepted.
    pub fn is_bound(&self) -> bool {
        !self.inner.accepting.is_cancelled()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.terminated.is_cancelled()
    }

    /// Currently open channels.
    pub fn channels(&self) -> Vec<Arc<Channel>> {
        self.inner.channels()
    }

    pub fn channel(&self, id: u64) -> Option<Arc<Channel>> {
        self.inner.channels.read().get(&id).cloned()
    }

    /// Application replies currently running.
    pub fn in_flight(&self) -> usize {
        self.inner.router.in_flight()
    }

    /// Server-initiated two-way request on one channel.
    pub async fn request(
        &self,
        channel_id: u64,
        payload: Bytes,
        timeout: Duration,
    ) -> Result<ResponseFuture> {
        let channel = self.channel(channel_id).ok_or_else(|| {
            ExchangeError::ChannelInactive(format!("no channel {} on this server", channel_id))
        })?;
        channel.request(payload, timeout).await
    }

    /// One-way request to every connected channel. Returns how many
    /// channels accepted it.
    pub async fn broadcast(&self, payload: Bytes) -> Result<usize> {
        let mut delivered = 0;
        for channel in self.channels() {
            match channel.send_oneway(payload.clone()).await {
                Ok(()) => delivered += 1,
                Err(e) => debug!(channel = channel.id(), error = %e, "broadcast skipped channel"),
            }
        }
        Ok(delivered)
    }

    /// Graceful shutdown.
    ///
    /// Stops accepting, tells every peer the server is going read-only, then
    /// gives running replies and pending server-initiated calls up to `grace`
    /// before closing all channels and releasing the address. Idempotent.
    pub async fn close(&self, grace: Duration) {
        let inner = &self.inner;
        if inner.closing.is_cancelled() {
            inner.terminated.cancelled().await;
            return;
        }
        inner.closing.cancel();
        inner.accepting.cancel();

        let deadline = tokio::time::Instant::now().checked_add(grace);
        let channels = inner.channels();
        for channel in &channels {
            let id = channel.registry().next_id();
            if let Err(e) = channel
                .send(&Message::Request(Request::readonly_event(id)))
                .await
            {
                debug!(channel = channel.id(), error = %e, "read-only event not sent");
            }
            channel.begin_close();
        }

        if !inner.router.wait_idle(grace).await {
            warn!(in_flight = inner.router.in_flight(), "close grace elapsed with replies running");
        }
        for channel in &channels {
            let remaining = match deadline {
                Some(deadline) => deadline.saturating_duration_since(tokio::time::Instant::now()),
                None => grace,
            };
            channel
                .registry()
                .wait_drained(channel.id(), remaining)
                .await;
        }

        inner.heartbeat.lock().take();
        inner.shutdown.cancel();
        for channel in &channels {
            channel.closed().await;
        }
        inner.bound.lock().take();
        inner.terminated.cancel();
        info!(addr = %inner.local_addr, "exchange server closed");
    }

    /// [`close`](Self::close) with the configured close timeout.
    pub async fn close_default(&self) {
        self.close(self.inner.config.close_timeout).await
    }
}

impl Drop for ExchangeServer {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
    }
}

async fn accept_loop(acceptor: Acceptor, server: Weak<ServerInner>, cancel: CancellationToken) {
    loop {
        let accepted = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            accepted = acceptor.accept() => accepted,
        };
        let Some(inner) = server.upgrade() else {
            break;
        };

        match accepted {
            Ok((stream, remote_addr)) => inner.register(stream, remote_addr),
            Err(e) => {
                warn!(addr = %inner.local_addr, error = %e, "accept failed");
                drop(inner);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(ACCEPT_BACKOFF) => {}
                }
            }
        }
    }
    debug!("accept loop finished");
}
