//! One logical connection: state machine, send path and read loop.
//!
//! A channel owns two tasks. The writer task (see [`crate::writer`]) is the
//! only thing touching the write half. The read task decodes frames in
//! arrival order and hands each unit to the router; when it stops, for
//! whatever reason, it runs the teardown exactly once:
//!
//! 1. state becomes `Closed` and the writer is told to stop
//! 2. every pending call of the channel is failed with `CHANNEL_INACTIVE`
//! 3. the application's `disconnected` hook runs
//! 4. [`Channel::closed`] resolves
//!
//! ```text
//!            begin_close()            close() / EOF / error
//! Connected ─────────────► Closing ───────────────────────► Closed
//!     └────────────────────────────────────────────────────────┘
//! ```

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::codec::Serialization;
use crate::correlation::{CorrelationRegistry, ResponseFuture};
use crate::error::{ExchangeError, Result};
use crate::handler::HeaderExchangeHandler;
use crate::protocol::{ExchangeCodec, Frame, FrameBuffer, Message, Request, Response, Status};
use crate::writer::{spawn_writer_task, WriterConfig, WriterHandle};

/// Read buffer size per socket read.
const READ_CHUNK_SIZE: usize = 64 * 1024;

/// Connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChannelState {
    Connecting = 0,
    Connected = 1,
    /// No new calls; in-flight responses are still delivered.
    Closing = 2,
    Closed = 3,
}

impl ChannelState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ChannelState::Connecting,
            1 => ChannelState::Connected,
            2 => ChannelState::Closing,
            _ => ChannelState::Closed,
        }
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChannelState::Connecting => "connecting",
            ChannelState::Connected => "connected",
            ChannelState::Closing => "closing",
            ChannelState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Snapshot of a channel's traffic counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelStats {
    pub frames_in: u64,
    pub frames_out: u64,
    /// Heartbeat requests written.
    pub heartbeats_sent: u64,
    /// Heartbeat requests read.
    pub heartbeats_received: u64,
}

#[derive(Default)]
struct Counters {
    frames_in: AtomicU64,
    frames_out: AtomicU64,
    heartbeats_sent: AtomicU64,
    heartbeats_received: AtomicU64,
}

/// Everything a channel needs besides its socket halves.
pub struct ChannelParts {
    /// From [`CorrelationRegistry::next_channel_id`]; pending calls are keyed
    /// by it.
    pub id: u64,
    pub local_addr: SocketAddr,
    pub remote_addr: SocketAddr,
    pub codec: ExchangeCodec,
    pub writer: WriterConfig,
    pub router: Arc<HeaderExchangeHandler>,
    /// Cancelling this token closes the channel.
    pub shutdown: CancellationToken,
}

/// A logical bidirectional connection.
pub struct Channel {
    id: u64,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    state: AtomicU8,
    codec: ExchangeCodec,
    writer: WriterHandle,
    writer_task: Mutex<Option<JoinHandle<Result<()>>>>,
    router: Arc<HeaderExchangeHandler>,
    /// Set by inbound traffic, cleared by each heartbeat tick.
    read_activity: AtomicBool,
    heartbeat_misses: AtomicU32,
    readonly: AtomicBool,
    counters: Counters,
    shutdown: CancellationToken,
    terminated: CancellationToken,
}

impl Channel {
    /// Start the writer and read tasks over the given socket halves.
    ///
    /// Must be called within a tokio runtime.
    pub fn spawn<R, W>(reader: R, writer: W, parts: ChannelParts) -> Arc<Channel>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (writer_handle, writer_task) =
            spawn_writer_task(writer, parts.writer, parts.shutdown.clone());

        let channel = Arc::new(Channel {
            id: parts.id,
            local_addr: parts.local_addr,
            remote_addr: parts.remote_addr,
            state: AtomicU8::new(ChannelState::Connecting as u8),
            codec: parts.codec,
            writer: writer_handle,
            writer_task: Mutex::new(Some(writer_task)),
            router: parts.router,
            read_activity: AtomicBool::new(false),
            heartbeat_misses: AtomicU32::new(0),
            readonly: AtomicBool::new(false),
            counters: Counters::default(),
            shutdown: parts.shutdown,
            terminated: CancellationToken::new(),
        });

        channel.set_state(ChannelState::Connected);
        channel.router.connected(&channel);
        tokio::spawn(read_loop(channel.clone(), reader));
        channel
    }

    /// Channel id, unique within the exchange context.
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    #[inline]
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    #[inline]
    pub fn state(&self) -> ChannelState {
        ChannelState::from_u8(self.state.load(Ordering::Acquire))
    }

    #[inline]
    pub fn is_connected(&self) -> bool {
        self.state() == ChannelState::Connected
    }

    /// The peer announced it is shutting down.
    #[inline]
    pub fn is_readonly(&self) -> bool {
        self.readonly.load(Ordering::Acquire)
    }

    pub(crate) fn set_readonly(&self) {
        self.readonly.store(true, Ordering::Release);
    }

    /// Body serialization used on this channel.
    #[inline]
    pub fn serialization(&self) -> Serialization {
        self.codec.serialization()
    }

    pub fn registry(&self) -> &Arc<CorrelationRegistry> {
        self.router.registry()
    }

    /// Calls issued on this channel still waiting for a response.
    pub fn pending_calls(&self) -> usize {
        self.registry().pending_for_channel(self.id)
    }

    pub fn stats(&self) -> ChannelStats {
        ChannelStats {
            frames_in: self.counters.frames_in.load(Ordering::Relaxed),
            frames_out: self.counters.frames_out.load(Ordering::Relaxed),
            heartbeats_sent: self.counters.heartbeats_sent.load(Ordering::Relaxed),
            heartbeats_received: self.counters.heartbeats_received.load(Ordering::Relaxed),
        }
    }

    /// Hand a message to the writer task.
    ///
    /// # Errors
    ///
    /// [`ExchangeError::ChannelInactive`] unless the channel is connected
    /// (responses may still go out while it is closing), encoding errors,
    /// and [`ExchangeError::BackpressureTimeout`].
    pub async fn send(&self, message: &Message) -> Result<()> {
        self.ensure_writable(message)?;
        let frame = self.codec.encode_frame(message)?;
        self.writer.send(frame).await?;
        self.on_sent(message);
        Ok(())
    }

    /// Non-waiting variant of [`send`](Self::send) used by the heartbeat timer.
    pub(crate) fn try_send(&self, message: &Message) -> Result<()> {
        self.ensure_writable(message)?;
        let frame = self.codec.encode_frame(message)?;
        self.writer.try_send(frame)?;
        self.on_sent(message);
        Ok(())
    }

    /// Issue a two-way request.
    ///
    /// The call is registered before the bytes reach the writer, so a fast
    /// response can never race its own registration. If sending fails the
    /// registration is dropped along with the returned error.
    pub async fn request(&self, payload: Bytes, timeout: Duration) -> Result<ResponseFuture> {
        self.ensure_connected()?;
        let registry = self.registry();
        let id = registry.next_id();
        let future = registry.register(id, self.id, timeout)?;

        self.send(&Message::Request(Request::new(id, payload)))
            .await?;
        registry.mark_sent(id);
        Ok(future)
    }

    /// Issue a one-way request. No pending call is created.
    pub async fn send_oneway(&self, payload: Bytes) -> Result<()> {
        let id = self.registry().next_id();
        self.send(&Message::Request(Request::oneway(id, payload)))
            .await
    }

    /// Request with serde types encoded by the channel serialization.
    pub async fn call_typed<Req, Resp>(&self, request: &Req, timeout: Duration) -> Result<Resp>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let serialization = self.serialization();
        let payload = Bytes::from(serialization.encode(request)?);
        let body = self.request(payload, timeout).await?.await?;
        serialization.decode(&body)
    }

    /// Stop accepting new calls while in-flight ones complete.
    pub fn begin_close(&self) {
        let _ = self.state.compare_exchange(
            ChannelState::Connected as u8,
            ChannelState::Closing as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Tear the connection down. Idempotent; await [`closed`](Self::closed)
    /// for completion.
    pub fn close(&self) {
        if self.state() != ChannelState::Closed {
            self.begin_close();
            self.shutdown.cancel();
        }
    }

    /// Resolves once the channel is closed and its pending calls failed.
    pub async fn closed(&self) {
        self.terminated.cancelled().await
    }

    pub fn is_closed(&self) -> bool {
        self.terminated.is_cancelled()
    }

    /// Token cancelled when the channel starts closing.
    pub(crate) fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Whether the peer sent anything besides heartbeat acknowledgements
    /// since the last call.
    pub(crate) fn take_read_activity(&self) -> bool {
        self.read_activity.swap(false, Ordering::AcqRel)
    }

    pub(crate) fn heartbeat_misses(&self) -> u32 {
        self.heartbeat_misses.load(Ordering::Acquire)
    }

    pub(crate) fn record_heartbeat_miss(&self) -> u32 {
        self.heartbeat_misses.fetch_add(1, Ordering::AcqRel) + 1
    }

    fn ensure_connected(&self) -> Result<()> {
        match self.state() {
            ChannelState::Connected => Ok(()),
            state => Err(self.inactive(state)),
        }
    }

    fn ensure_writable(&self, message: &Message) -> Result<()> {
        match (self.state(), message) {
            (ChannelState::Connected, _) => Ok(()),
            (ChannelState::Closing, Message::Response(_)) => Ok(()),
            (state, _) => Err(self.inactive(state)),
        }
    }

    fn inactive(&self, state: ChannelState) -> ExchangeError {
        ExchangeError::ChannelInactive(format!(
            "channel {} ({} -> {}) is {}",
            self.id, self.local_addr, self.remote_addr, state
        ))
    }

    fn set_state(&self, state: ChannelState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn on_sent(&self, message: &Message) {
        self.counters.frames_out.fetch_add(1, Ordering::Relaxed);
        if let Message::Request(req) = message {
            if req.is_heartbeat() {
                self.counters.heartbeats_sent.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.router.sent(self, message);
    }

    async fn on_frame(self: &Arc<Self>, frame: Frame) {
        self.counters.frames_in.fetch_add(1, Ordering::Relaxed);
        self.heartbeat_misses.store(0, Ordering::Release);

        let message = self.codec.decode(frame);
        match &message {
            Message::Response(res) if res.event => {}
            Message::Request(req) if req.is_heartbeat() => {
                self.counters
                    .heartbeats_received
                    .fetch_add(1, Ordering::Relaxed);
                self.read_activity.store(true, Ordering::Release);
            }
            _ => self.read_activity.store(true, Ordering::Release),
        }
        self.router.received(self, message).await;
    }

    /// Answer an oversized two-way request with `BAD_REQUEST` when its id
    /// could be recovered, then report the violation.
    async fn on_protocol_error(&self, err: &ExchangeError) {
        warn!(channel = self.id, remote = %self.remote_addr, error = %err, "protocol violation");
        if let ExchangeError::PayloadTooLarge {
            id,
            two_way_request: true,
            ..
        } = err
        {
            let response = Response::error(*id, Status::BadRequest, err.to_string());
            if let Err(e) = self.send(&Message::Response(response)).await {
                debug!(channel = self.id, error = %e, "could not answer oversized request");
            }
        }
        self.router.caught(self, err);
    }

    async fn teardown(self: &Arc<Self>, reason: &str) {
        self.set_state(ChannelState::Closed);
        self.shutdown.cancel();

        let writer_task = self.writer_task.lock().take();
        if let Some(task) = writer_task {
            let _ = task.await;
        }

        self.router.disconnected(self, reason);
        self.terminated.cancel();
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("local_addr", &self.local_addr)
            .field("remote_addr", &self.remote_addr)
            .field("state", &self.state())
            .finish()
    }
}

async fn read_loop<R>(channel: Arc<Channel>, mut reader: R)
where
    R: AsyncRead + Unpin,
{
    let mut buffer = FrameBuffer::with_max_payload(channel.codec.max_payload());
    let mut chunk = vec![0u8; READ_CHUNK_SIZE];

    let reason = 'read: loop {
        let read = tokio::select! {
            biased;
            _ = channel.shutdown.cancelled() => break 'read "closed locally".to_string(),
            read = reader.read(&mut chunk) => read,
        };

        let n = match read {
            Ok(0) => break 'read "connection closed by peer".to_string(),
            Ok(n) => n,
            Err(e) => break 'read format!("read failed: {}", e),
        };
        trace!(channel = channel.id, bytes = n, "read");
        buffer.extend(&chunk[..n]);

        loop {
            match buffer.next_frame() {
                Ok(Some(frame)) => channel.on_frame(frame).await,
                Ok(None) => break,
                Err(err) => {
                    channel.on_protocol_error(&err).await;
                    break 'read err.to_string();
                }
            }
        }
    };

    debug!(channel = channel.id, reason = %reason, "read loop finished");
    channel.teardown(&reason).await;
}
