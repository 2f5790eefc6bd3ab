//! Idle detection and keep-alive probes.
//!
//! A heartbeat task ticks at the configured interval and checks each of its
//! channels:
//!
//! - the peer sent something since the last tick: nothing to do
//! - `max_misses` probes already unanswered: close the channel
//! - otherwise: send a two-way heartbeat request and count a miss
//!
//! Any inbound frame resets the miss count. Only reads keep a channel alive:
//! a side that keeps writing to a peer that never answers still probes and
//! eventually closes. Heartbeat acknowledgements do not count as reads, so
//! an idle channel puts one probe on the wire per interval.

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::channel::Channel;
use crate::protocol::{Message, Request};
use crate::util::spawn_weak_loop;

/// One tick of the heartbeat state machine for a single channel.
pub(crate) fn check(channel: &Channel, max_misses: u32) {
    if !channel.is_connected() {
        return;
    }
    if channel.take_read_activity() {
        return;
    }

    let misses = channel.heartbeat_misses();
    if misses >= max_misses {
        warn!(
            channel = channel.id(),
            remote = %channel.remote_addr(),
            misses,
            "no heartbeat response, closing channel"
        );
        channel.close();
        return;
    }

    let id = channel.registry().next_id();
    match channel.try_send(&Message::Request(Request::heartbeat(id))) {
        Ok(()) => {
            let misses = channel.record_heartbeat_miss();
            trace!(channel = channel.id(), id, misses, "heartbeat sent");
        }
        Err(e) => debug!(channel = channel.id(), error = %e, "heartbeat not sent"),
    }
}

/// A running heartbeat task. Dropping it stops the task.
pub(crate) struct Heartbeat {
    cancel: CancellationToken,
    _task: JoinHandle<()>,
}

impl Heartbeat {
    /// Probe every channel yielded by `channels(owner)` each `interval`.
    pub(crate) fn spawn<T, F>(
        owner: Weak<T>,
        interval: Duration,
        max_misses: u32,
        cancel: CancellationToken,
        channels: F,
    ) -> Self
    where
        T: Send + Sync + 'static,
        F: Fn(&Arc<T>) -> Vec<Arc<Channel>> + Send + 'static,
    {
        debug!(interval_ms = interval.as_millis() as u64, max_misses, "heartbeat started");
        let task = spawn_weak_loop(owner, interval, cancel.clone(), move |owner| {
            for channel in channels(owner) {
                check(&channel, max_misses);
            }
        });
        Self {
            cancel,
            _task: task,
        }
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
