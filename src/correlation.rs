//! Pending-call registry matching responses to waiting callers.
//!
//! Every two-way request is registered here before its bytes are handed to
//! the writer task. The entry is removed exactly once, by whichever happens
//! first:
//!
//! - the response arrives ([`CorrelationRegistry::complete`])
//! - the deadline passes ([`CorrelationRegistry::expire`], driven by one
//!   periodic sweep per exchange context)
//! - the owning channel closes ([`CorrelationRegistry::fail_channel`])
//! - the caller drops its [`ResponseFuture`] or the send fails
//!   ([`CorrelationRegistry::forget`])
//!
//! The table lock is held only to insert, remove or scan; waking the caller
//! happens after the lock is released.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::{ExchangeError, Result};
use crate::protocol::{Response, Status};
use crate::util::spawn_weak_loop;

/// Default period of the timeout sweep.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_millis(30);

struct PendingCall {
    channel_id: u64,
    started: Instant,
    timeout: Duration,
    /// `None` when the timeout is too large to express; such a call never
    /// expires.
    deadline: Option<Instant>,
    sent: Option<Instant>,
    tx: oneshot::Sender<Response>,
}

/// Table of in-flight two-way calls for one exchange context.
pub struct CorrelationRegistry {
    next_id: AtomicU64,
    next_channel_id: AtomicU64,
    pending: Mutex<HashMap<u64, PendingCall>>,
    changed: Notify,
}

impl CorrelationRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_id: AtomicU64::new(1),
            next_channel_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            changed: Notify::new(),
        })
    }

    /// Next correlation id. Monotonic, never 0.
    #[inline]
    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Id for a new channel whose calls go through this registry.
    #[inline]
    pub fn next_channel_id(&self) -> u64 {
        self.next_channel_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Register a pending call owned by `channel_id`.
    ///
    /// # Errors
    ///
    /// [`ExchangeError::DuplicateRequestId`] if `id` is still pending.
    pub fn register(
        self: &Arc<Self>,
        id: u64,
        channel_id: u64,
        timeout: Duration,
    ) -> Result<ResponseFuture> {
        let (tx, rx) = oneshot::channel();
        let started = Instant::now();

        {
            let mut pending = self.pending.lock();
            if pending.contains_key(&id) {
                return Err(ExchangeError::DuplicateRequestId(id));
            }
            pending.insert(
                id,
                PendingCall {
                    channel_id,
                    started,
                    timeout,
                    deadline: started.checked_add(timeout),
                    sent: None,
                    tx,
                },
            );
        }
        trace!(id, channel_id, timeout_ms = timeout.as_millis() as u64, "call registered");

        Ok(ResponseFuture {
            id,
            rx,
            registry: Arc::downgrade(self),
            done: false,
        })
    }

    /// Record that the request bytes reached the writer.
    pub fn mark_sent(&self, id: u64) {
        if let Some(call) = self.pending.lock().get_mut(&id) {
            call.sent = Some(Instant::now());
        }
    }

    /// Deliver a response to its caller.
    ///
    /// Returns `false` when no call is pending under the response id (late or
    /// duplicate response); the response is dropped.
    pub fn complete(&self, response: Response) -> bool {
        let Some(call) = self.take(response.id) else {
            debug!(
                id = response.id,
                status = %response.status,
                "discarding response with no pending call"
            );
            return false;
        };
        let _ = call.tx.send(response);
        true
    }

    /// Fail one call with `status`.
    pub fn fail(&self, id: u64, status: Status, message: impl Into<String>) -> bool {
        match self.take(id) {
            Some(call) => {
                let _ = call.tx.send(Response::error(id, status, message));
                true
            }
            None => false,
        }
    }

    /// Drop one call without waking anybody.
    pub fn forget(&self, id: u64) {
        if self.take(id).is_some() {
            trace!(id, "call abandoned");
        }
    }

    /// Fail every call owned by `channel_id` with `CHANNEL_INACTIVE`.
    pub fn fail_channel(&self, channel_id: u64, message: &str) -> usize {
        let calls: Vec<(u64, PendingCall)> = {
            let mut pending = self.pending.lock();
            let ids: Vec<u64> = pending
                .iter()
                .filter(|(_, call)| call.channel_id == channel_id)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| pending.remove(&id).map(|call| (id, call)))
                .collect()
        };
        self.changed.notify_waiters();

        let failed = calls.len();
        for (id, call) in calls {
            let _ = call
                .tx
                .send(Response::error(id, Status::ChannelInactive, message));
        }
        if failed > 0 {
            debug!(channel_id, failed, "failed pending calls of closed channel");
        }
        failed
    }

    /// Complete every call whose deadline is at or before `now` with
    /// `CLIENT_TIMEOUT`.
    pub fn expire(&self, now: Instant) -> usize {
        let calls: Vec<(u64, PendingCall)> = {
            let mut pending = self.pending.lock();
            let ids: Vec<u64> = pending
                .iter()
                .filter(|(_, call)| call.deadline.is_some_and(|deadline| deadline <= now))
                .map(|(id, _)| *id)
                .collect();
            if ids.is_empty() {
                return 0;
            }
            ids.into_iter()
                .filter_map(|id| pending.remove(&id).map(|call| (id, call)))
                .collect()
        };
        self.changed.notify_waiters();

        let expired = calls.len();
        for (id, call) in calls {
            let message = timeout_message(id, &call, now);
            debug!(id, channel_id = call.channel_id, "{}", message);
            let _ = call
                .tx
                .send(Response::error(id, Status::ClientTimeout, message));
        }
        expired
    }

    /// Wait until `channel_id` has no pending calls or `grace` elapses. A
    /// grace too large to add to the current instant waits without limit.
    ///
    /// Returns `true` when the channel drained in time.
    pub async fn wait_drained(&self, channel_id: u64, grace: Duration) -> bool {
        let deadline = tokio::time::Instant::now().checked_add(grace);
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.pending_for_channel(channel_id) == 0 {
                return true;
            }
            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return self.pending_for_channel(channel_id) == 0;
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Number of calls in flight across all channels.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn pending_for_channel(&self, channel_id: u64) -> usize {
        self.pending
            .lock()
            .values()
            .filter(|call| call.channel_id == channel_id)
            .count()
    }

    pub fn contains(&self, id: u64) -> bool {
        self.pending.lock().contains_key(&id)
    }

    /// Start the periodic timeout sweep. Stops on `cancel` or when the
    /// registry is dropped.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        period: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        spawn_weak_loop(Arc::downgrade(self), period, cancel, |registry| {
            registry.expire(Instant::now());
        })
    }

    fn take(&self, id: u64) -> Option<PendingCall> {
        let call = self.pending.lock().remove(&id);
        if call.is_some() {
            self.changed.notify_waiters();
        }
        call
    }
}

fn timeout_message(id: u64, call: &PendingCall, now: Instant) -> String {
    let elapsed = now.duration_since(call.started).as_millis();
    let timeout = call.timeout.as_millis();
    match call.sent {
        Some(_) => format!(
            "waiting for server-side response timed out, elapsed {}ms, timeout {}ms, request {}, channel {}",
            elapsed, timeout, id, call.channel_id
        ),
        None => format!(
            "sending request timed out on client side, elapsed {}ms, timeout {}ms, request {}, channel {}",
            elapsed, timeout, id, call.channel_id
        ),
    }
}

/// Resolves with the body of the matching response.
///
/// Dropping the future before it resolves abandons the call and removes it
/// from the registry.
pub struct ResponseFuture {
    id: u64,
    rx: oneshot::Receiver<Response>,
    registry: Weak<CorrelationRegistry>,
    done: bool,
}

impl ResponseFuture {
    /// Correlation id of the call.
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Future for ResponseFuture {
    type Output = Result<Bytes>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        match Pin::new(&mut this.rx).poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(result) => {
                this.done = true;
                Poll::Ready(match result {
                    Ok(response) => response.into_result(),
                    Err(_) => Err(ExchangeError::ChannelInactive(format!(
                        "call {} dropped without a response",
                        this.id
                    ))),
                })
            }
        }
    }
}

impl Drop for ResponseFuture {
    fn drop(&mut self) {
        if !self.done {
            if let Some(registry) = self.registry.upgrade() {
                registry.forget(self.id);
            }
        }
    }
}
