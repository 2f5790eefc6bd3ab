//! Dedicated writer task for one channel's outbound frames.
//!
//! Callers never touch the socket. Each channel owns one writer task fed by
//! an mpsc queue, so many concurrent callers share the connection without a
//! lock and ready frames are batched into single vectored writes.
//!
//! ```text
//! caller 1 ─┐
//! caller 2 ─┼─► mpsc::Sender<OutboundFrame> ─► writer task ─► socket
//! router   ─┘
//! ```
//!
//! The task stops when every handle is dropped, when the channel's
//! cancellation token fires, or on the first write error (which also fires
//! the token so the channel tears down).

use std::io::IoSlice;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{ExchangeError, Result};
use crate::protocol::{Header, HEADER_SIZE};

/// Queued frames per channel before senders start waiting.
pub const DEFAULT_MAX_PENDING_FRAMES: usize = 1024;

pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// How long a sender waits for a full queue before giving up.
pub const DEFAULT_BACKPRESSURE_TIMEOUT: Duration = Duration::from_secs(5);

/// Frames coalesced into one vectored write.
const MAX_BATCH_SIZE: usize = 64;

/// Upper bound on flushing already-queued frames once the channel closes.
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// An encoded unit waiting in a channel's write queue.
#[derive(Debug)]
pub struct OutboundFrame {
    /// Pre-encoded header (16 bytes).
    pub header: [u8; HEADER_SIZE],
    /// Body bytes (empty for heartbeats).
    pub payload: Bytes,
}

impl OutboundFrame {
    #[inline]
    pub fn new(header: &Header, payload: Bytes) -> Self {
        Self {
            header: header.encode(),
            payload,
        }
    }

    /// Bytes this frame puts on the wire.
    #[inline]
    pub fn size(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }
}

/// Write queue limits of a channel.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Queued frames at which `send` starts waiting and `try_send` fails.
    pub max_pending_frames: usize,
    /// Capacity of the mpsc queue feeding the task.
    pub channel_capacity: usize,
    pub backpressure_timeout: Duration,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            max_pending_frames: DEFAULT_MAX_PENDING_FRAMES,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            backpressure_timeout: DEFAULT_BACKPRESSURE_TIMEOUT,
        }
    }
}

/// Sending side of a channel's write queue.
///
/// Cheaply cloneable; the writer task exits once all handles are dropped.
#[derive(Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<OutboundFrame>,
    /// Frames queued or being written, shared with the task.
    pending: Arc<AtomicUsize>,
    /// Notified by the task after every batch leaves the queue.
    drained: Arc<Notify>,
    max_pending: usize,
    timeout: Duration,
}

impl WriterHandle {
    fn new(
        tx: mpsc::Sender<OutboundFrame>,
        pending: Arc<AtomicUsize>,
        drained: Arc<Notify>,
        max_pending: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            tx,
            pending,
            drained,
            max_pending,
            timeout,
        }
    }

    /// Queue a frame, waiting up to the backpressure timeout while the
    /// queue is over its limit.
    pub async fn send(&self, frame: OutboundFrame) -> Result<()> {
        if self.is_backpressure_active() {
            self.wait_for_backpressure().await?;
        }

        self.pending.fetch_add(1, Ordering::AcqRel);
        self.tx.send(frame).await.map_err(|_| {
            self.pending.fetch_sub(1, Ordering::Release);
            ExchangeError::ChannelInactive("writer task stopped".into())
        })
    }

    async fn wait_for_backpressure(&self) -> Result<()> {
        let deadline = tokio::time::Instant::now().checked_add(self.timeout);
        loop {
            let drained = self.drained.notified();
            tokio::pin!(drained);
            drained.as_mut().enable();

            if !self.is_backpressure_active() {
                return Ok(());
            }
            if self.tx.is_closed() {
                return Err(ExchangeError::ChannelInactive("writer task stopped".into()));
            }
            let woken = match deadline {
                Some(deadline) => tokio::time::timeout_at(deadline, drained).await.is_ok(),
                None => {
                    drained.await;
                    true
                }
            };
            if !woken {
                if !self.is_backpressure_active() {
                    return Ok(());
                }
                warn!(pending = self.pending_count(), "write queue still full");
                return Err(ExchangeError::BackpressureTimeout);
            }
        }
    }

    /// The queue is at its limit.
    #[inline]
    pub fn is_backpressure_active(&self) -> bool {
        self.pending.load(Ordering::Acquire) >= self.max_pending
    }

    /// Frames queued or being written.
    #[inline]
    pub fn pending_count(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Queue a frame only if there is room right now. Used by timers that
    /// must never block.
    pub fn try_send(&self, frame: OutboundFrame) -> Result<()> {
        let current = self.pending.load(Ordering::Acquire);
        if current >= self.max_pending {
            return Err(ExchangeError::BackpressureTimeout);
        }

        self.pending.fetch_add(1, Ordering::AcqRel);

        self.tx.try_send(frame).map_err(|e| {
            self.pending.fetch_sub(1, Ordering::Release);
            match e {
                mpsc::error::TrySendError::Full(_) => ExchangeError::BackpressureTimeout,
                mpsc::error::TrySendError::Closed(_) => {
                    ExchangeError::ChannelInactive("writer task stopped".into())
                }
            }
        })
    }
}

/// Start the writer task over `writer`.
///
/// `cancel` stops the task and is fired by the task itself on a write error.
/// The returned `JoinHandle` resolves once the write half has been shut down.
pub fn spawn_writer_task<W>(
    writer: W,
    config: WriterConfig,
    cancel: CancellationToken,
) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(config.channel_capacity);
    let pending = Arc::new(AtomicUsize::new(0));
    let drained = Arc::new(Notify::new());

    let handle = WriterHandle::new(
        tx,
        pending.clone(),
        drained.clone(),
        config.max_pending_frames,
        config.backpressure_timeout,
    );

    let task = tokio::spawn(async move {
        let result = writer_loop(rx, writer, &pending, &drained, cancel.clone()).await;
        drained.notify_waiters();
        if let Err(e) = &result {
            warn!(error = %e, "writer task failed, closing channel");
            cancel.cancel();
        }
        result
    });

    (handle, task)
}

/// Drain the queue into the socket until cancelled or every handle is gone.
async fn writer_loop<W>(
    mut rx: mpsc::Receiver<OutboundFrame>,
    mut writer: W,
    pending: &AtomicUsize,
    drained: &Notify,
    cancel: CancellationToken,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    loop {
        let first = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            frame = rx.recv() => frame,
        };
        let Some(first) = first else {
            flush_queued(&mut rx, &mut writer, pending).await;
            debug!("writer task stopping");
            let _ = writer.shutdown().await;
            return Ok(());
        };

        let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);
        batch.push(first);

        while batch.len() < MAX_BATCH_SIZE {
            match rx.try_recv() {
                Ok(frame) => batch.push(frame),
                Err(_) => break,
            }
        }

        let batch_size = batch.len();
        let written = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            res = write_batch(&mut writer, &batch) => Some(res),
        };
        pending.fetch_sub(batch_size, Ordering::Release);
        drained.notify_waiters();

        match written {
            Some(res) => res?,
            None => {
                debug!(dropped = batch_size, "writer task cancelled mid-write");
                let _ = writer.shutdown().await;
                return Ok(());
            }
        }
    }
}

/// Write whatever is still queued, bounded by [`CLOSE_FLUSH_TIMEOUT`].
async fn flush_queued<W>(
    rx: &mut mpsc::Receiver<OutboundFrame>,
    writer: &mut W,
    pending: &AtomicUsize,
) where
    W: AsyncWrite + Unpin,
{
    let mut batch = Vec::new();
    while let Ok(frame) = rx.try_recv() {
        batch.push(frame);
    }
    if batch.is_empty() {
        return;
    }

    let count = batch.len();
    match tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, write_batch(writer, &batch)).await {
        Ok(Ok(())) => debug!(frames = count, "flushed queued frames on close"),
        Ok(Err(e)) => debug!(frames = count, error = %e, "failed to flush queued frames"),
        Err(_) => debug!(frames = count, "timed out flushing queued frames"),
    }
    pending.fetch_sub(count, Ordering::Release);
}

/// Write a batch with vectored writes, resuming after partial writes.
async fn write_batch<W>(writer: &mut W, batch: &[OutboundFrame]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let total: usize = batch.iter().map(OutboundFrame::size).sum();
    let mut written = 0;

    while written < total {
        let slices = slices_after(batch, written);
        let n = writer.write_vectored(&slices).await?;
        if n == 0 {
            return Err(ExchangeError::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "socket accepted no bytes",
            )));
        }
        written += n;
    }

    writer.flush().await?;
    Ok(())
}

/// Slices covering `batch` minus its first `skip` bytes.
fn slices_after(batch: &[OutboundFrame], mut skip: usize) -> Vec<IoSlice<'_>> {
    let mut slices = Vec::with_capacity(batch.len() * 2);
    for frame in batch {
        for part in [&frame.header[..], &frame.payload[..]] {
            if skip >= part.len() {
                skip -= part.len();
                continue;
            }
            slices.push(IoSlice::new(&part[skip..]));
            skip = 0;
        }
    }
    slices
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::flags;
    use std::io::Cursor;
    use tokio::io::{duplex, AsyncReadExt};

    fn frame(id: u64, body: &'static [u8]) -> OutboundFrame {
        let header = Header::new(flags::compose(true, true, false, 1), 0, id, body.len() as u32);
        OutboundFrame::new(&header, Bytes::from_static(body))
    }

    #[test]
    fn test_outbound_frame_size() {
        let f = frame(42, b"hello");
        assert_eq!(f.header.len(), HEADER_SIZE);
        assert_eq!(f.size(), HEADER_SIZE + 5);
        assert_eq!(frame(1, b"").size(), HEADER_SIZE);
    }

    #[test]
    fn test_writer_config_default() {
        let config = WriterConfig::default();
        assert_eq!(config.max_pending_frames, DEFAULT_MAX_PENDING_FRAMES);
        assert_eq!(config.channel_capacity, DEFAULT_CHANNEL_CAPACITY);
        assert_eq!(config.backpressure_timeout, DEFAULT_BACKPRESSURE_TIMEOUT);
    }

    #[tokio::test]
    async fn test_writer_handle_send() {
        let (client, mut server) = duplex(4096);
        let (handle, _task) =
            spawn_writer_task(client, WriterConfig::default(), CancellationToken::new());

        handle.send(frame(42, b"hello")).await.unwrap();

        let mut buf = vec![0u8; HEADER_SIZE + 5];
        server.read_exact(&mut buf).await.unwrap();
        let header = Header::decode(&buf).unwrap();
        assert_eq!(header.request_id, 42);
        assert_eq!(&buf[HEADER_SIZE..], b"hello");
    }

    #[tokio::test]
    async fn test_writer_batching_keeps_order() {
        let (client, mut server) = duplex(4096);
        let (handle, _task) =
            spawn_writer_task(client, WriterConfig::default(), CancellationToken::new());

        for i in 0..10u64 {
            handle.send(frame(i, b"abcd")).await.unwrap();
        }

        let mut buf = vec![0u8; 10 * (HEADER_SIZE + 4)];
        server.read_exact(&mut buf).await.unwrap();
        for (i, chunk) in buf.chunks(HEADER_SIZE + 4).enumerate() {
            assert_eq!(Header::decode(chunk).unwrap().request_id, i as u64);
        }
    }

    #[tokio::test]
    async fn test_try_send_at_capacity() {
        let (tx, _rx) = mpsc::channel::<OutboundFrame>(10);
        let pending = Arc::new(AtomicUsize::new(100));
        let handle = WriterHandle::new(
            tx,
            pending,
            Arc::new(Notify::new()),
            100,
            Duration::from_secs(1),
        );

        assert!(handle.is_backpressure_active());
        let result = handle.try_send(frame(1, b""));
        assert!(matches!(result, Err(ExchangeError::BackpressureTimeout)));
    }

    #[tokio::test]
    async fn test_full_queue_sender_woken_when_drained() {
        let (tx, mut rx) = mpsc::channel::<OutboundFrame>(10);
        let pending = Arc::new(AtomicUsize::new(2));
        let drained = Arc::new(Notify::new());
        let handle = WriterHandle::new(tx, pending.clone(), drained.clone(), 2, Duration::MAX);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            pending.fetch_sub(2, Ordering::Release);
            drained.notify_waiters();
        });

        handle.send(frame(7, b"late")).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().payload, Bytes::from_static(b"late"));
        assert_eq!(handle.pending_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_queue_times_out() {
        let (tx, _rx) = mpsc::channel::<OutboundFrame>(10);
        let pending = Arc::new(AtomicUsize::new(2));
        let handle = WriterHandle::new(
            tx,
            pending,
            Arc::new(Notify::new()),
            2,
            Duration::from_millis(50),
        );

        let err = handle.send(frame(1, b"x")).await.unwrap_err();
        assert!(matches!(err, ExchangeError::BackpressureTimeout));
    }

    #[tokio::test]
    async fn test_full_queue_fails_once_task_is_gone() {
        let (tx, rx) = mpsc::channel::<OutboundFrame>(10);
        let handle = WriterHandle::new(
            tx,
            Arc::new(AtomicUsize::new(2)),
            Arc::new(Notify::new()),
            2,
            Duration::MAX,
        );
        drop(rx);

        let err = handle.send(frame(1, b"x")).await.unwrap_err();
        assert!(matches!(err, ExchangeError::ChannelInactive(_)));
    }

    #[tokio::test]
    async fn test_send_after_task_stopped_is_channel_inactive() {
        let (client, _server) = duplex(4096);
        let cancel = CancellationToken::new();
        let (handle, task) = spawn_writer_task(client, WriterConfig::default(), cancel.clone());

        cancel.cancel();
        task.await.unwrap().unwrap();

        let err = handle.send(frame(1, b"x")).await.unwrap_err();
        assert!(matches!(err, ExchangeError::ChannelInactive(_)));
        assert_eq!(handle.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_write_error_fires_cancel() {
        let (client, server) = duplex(64);
        drop(server);
        let cancel = CancellationToken::new();
        let (handle, task) = spawn_writer_task(client, WriterConfig::default(), cancel.clone());

        handle.send(frame(1, b"x")).await.unwrap();
        assert!(task.await.unwrap().is_err());
        assert!(cancel.is_cancelled());
    }

    #[test]
    fn test_slices_after_partial_write() {
        let batch = vec![frame(42, b"hello"), frame(43, b"")];

        assert_eq!(slices_after(&batch, 0).len(), 3);

        let slices = slices_after(&batch, 5);
        assert_eq!(slices.len(), 3);
        assert_eq!(slices[0].len(), HEADER_SIZE - 5);
        assert_eq!(slices[1].len(), 5);

        let slices = slices_after(&batch, HEADER_SIZE + 2);
        assert_eq!(slices.len(), 2);
        assert_eq!(slices[0].len(), 3);
        assert_eq!(slices[1].len(), HEADER_SIZE);
    }

    #[tokio::test]
    async fn test_write_batch_multiple() {
        let mut buf = Cursor::new(Vec::new());
        let batch: Vec<_> = (0..5).map(|i| frame(i, b"abc")).collect();

        write_batch(&mut buf, &batch).await.unwrap();
        assert_eq!(buf.into_inner().len(), 5 * (HEADER_SIZE + 3));
    }

    #[tokio::test]
    async fn test_writer_shutdown_on_handle_drop() {
        let (client, _server) = duplex(4096);
        let (handle, task) =
            spawn_writer_task(client, WriterConfig::default(), CancellationToken::new());

        drop(handle);
        assert!(task.await.unwrap().is_ok());
    }
}
