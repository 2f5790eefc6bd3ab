//! Routing of decoded units between the correlation registry and the
//! application handler.
//!
//! Responses complete pending calls. Heartbeat and read-only events are
//! answered here and never reach the application. Normal requests run the
//! application's `reply` on a bounded worker pool.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info, trace, warn};

use super::ExchangeHandler;
use crate::channel::Channel;
use crate::correlation::CorrelationRegistry;
use crate::error::ExchangeError;
use crate::protocol::{Event, Message, Request, Response, Status};

/// The fixed exchange pipeline stage between the codec and the application.
pub struct HeaderExchangeHandler {
    app: Arc<dyn ExchangeHandler>,
    registry: Arc<CorrelationRegistry>,
    workers: Arc<Semaphore>,
    threads: usize,
    idle: Arc<Notify>,
}

impl HeaderExchangeHandler {
    pub fn new(
        app: Arc<dyn ExchangeHandler>,
        registry: Arc<CorrelationRegistry>,
        threads: usize,
    ) -> Self {
        Self {
            app,
            registry,
            workers: Arc::new(Semaphore::new(threads)),
            threads,
            idle: Arc::new(Notify::new()),
        }
    }

    pub fn registry(&self) -> &Arc<CorrelationRegistry> {
        &self.registry
    }

    /// Number of `reply` invocations currently running.
    pub fn in_flight(&self) -> usize {
        self.threads - self.workers.available_permits()
    }

    /// Wait until no `reply` is running or `grace` elapses. A grace too
    /// large to add to the current instant waits without limit.
    pub async fn wait_idle(&self, grace: Duration) -> bool {
        let deadline = tokio::time::Instant::now().checked_add(grace);
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.in_flight() == 0 {
                return true;
            }
            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return self.in_flight() == 0;
                    }
                }
                None => notified.await,
            }
        }
    }

    pub fn connected(&self, channel: &Channel) {
        info!(
            channel = channel.id(),
            local = %channel.local_addr(),
            remote = %channel.remote_addr(),
            "channel connected"
        );
        self.app.connected(channel);
    }

    /// Fails every pending call of the channel, then notifies the application.
    pub fn disconnected(&self, channel: &Channel, reason: &str) {
        let message = format!(
            "channel {} ({} -> {}) closed: {}",
            channel.id(),
            channel.local_addr(),
            channel.remote_addr(),
            reason
        );
        self.registry.fail_channel(channel.id(), &message);
        info!(channel = channel.id(), reason, "channel disconnected");
        self.app.disconnected(channel);
    }

    pub fn caught(&self, channel: &Channel, err: &ExchangeError) {
        warn!(channel = channel.id(), error = %err, "exchange failure");
        self.app.caught(channel, err);
    }

    pub fn sent(&self, channel: &Channel, message: &Message) {
        self.app.sent(channel, message);
    }

    /// Route one decoded unit. Called in arrival order by the read task.
    pub async fn received(&self, channel: &Arc<Channel>, message: Message) {
        match message {
            Message::Response(res) if res.event => {
                trace!(channel = channel.id(), id = res.id, "heartbeat acknowledged");
            }
            Message::Response(res) => {
                self.registry.complete(res);
            }
            Message::Request(req) => self.handle_request(channel, req).await,
        }
    }

    async fn handle_request(&self, channel: &Arc<Channel>, req: Request) {
        if let Some(reason) = req.broken {
            let err = ExchangeError::Protocol(format!("bad request {}: {}", req.id, reason));
            if req.two_way {
                let response = Response::error(req.id, Status::BadRequest, err.to_string());
                send_response(channel, response).await;
            } else {
                self.caught(channel, &err);
            }
            return;
        }

        match req.event {
            Some(Event::Heartbeat) => {
                trace!(channel = channel.id(), id = req.id, "heartbeat received");
                if req.two_way {
                    send_response(channel, Response::heartbeat(req.id)).await;
                }
            }
            Some(Event::ReadOnly) => {
                info!(channel = channel.id(), "peer is shutting down, channel is read-only");
                channel.set_readonly();
                if req.two_way {
                    send_response(channel, Response::heartbeat(req.id)).await;
                }
            }
            None => self.dispatch(channel, req).await,
        }
    }

    async fn dispatch(&self, channel: &Arc<Channel>, req: Request) {
        let slot = match self.workers.clone().try_acquire_owned() {
            Ok(permit) => WorkerSlot {
                permit: Some(permit),
                idle: self.idle.clone(),
            },
            Err(_) => {
                warn!(
                    channel = channel.id(),
                    id = req.id,
                    threads = self.threads,
                    "worker pool exhausted"
                );
                if req.two_way {
                    let response = Response::error(
                        req.id,
                        Status::ServerThreadpoolExhausted,
                        ExchangeError::ThreadPoolExhausted.to_string(),
                    );
                    send_response(channel, response).await;
                } else {
                    self.caught(channel, &ExchangeError::ThreadPoolExhausted);
                }
                return;
            }
        };

        tokio::spawn(run_reply(self.app.clone(), channel.clone(), req, slot));
    }
}

/// Worker pool permit held for the whole reply, including sending the
/// response. Releasing it wakes [`HeaderExchangeHandler::wait_idle`].
struct WorkerSlot {
    permit: Option<OwnedSemaphorePermit>,
    idle: Arc<Notify>,
}

impl Drop for WorkerSlot {
    fn drop(&mut self) {
        self.permit.take();
        self.idle.notify_waiters();
    }
}

async fn run_reply(
    app: Arc<dyn ExchangeHandler>,
    channel: Arc<Channel>,
    req: Request,
    slot: WorkerSlot,
) {
    let Request {
        id,
        two_way,
        payload,
        ..
    } = req;

    let reply_app = app.clone();
    let reply_channel = channel.clone();
    let outcome =
        tokio::spawn(async move { reply_app.reply(&reply_channel, payload).await }).await;

    let response = match outcome {
        Ok(Ok(body)) => Response::ok(id, body),
        Ok(Err(err)) => {
            if !two_way {
                error!(channel = channel.id(), id, error = %err, "one-way request failed");
                app.caught(&channel, &err);
                return;
            }
            debug!(channel = channel.id(), id, error = %err, "request failed");
            Response::error(id, fault_status(&err), fault_detail(&err))
        }
        Err(join) => {
            let detail = format!("reply task failed: {}", join);
            error!(channel = channel.id(), id, "{}", detail);
            if !two_way {
                app.caught(&channel, &ExchangeError::Application(detail));
                return;
            }
            Response::error(id, Status::ServerError, detail)
        }
    };

    if two_way {
        send_response(&channel, response).await;
    }
    drop(slot);
}

async fn send_response(channel: &Channel, response: Response) {
    let id = response.id;
    match channel.send(&Message::Response(response)).await {
        Ok(()) => {}
        Err(err @ ExchangeError::ChannelInactive(_)) => {
            warn!(channel = channel.id(), id, error = %err, "response dropped, channel closed");
        }
        Err(err) => {
            warn!(channel = channel.id(), id, error = %err, "failed to send response");
            let fallback = Response::error(id, Status::BadResponse, err.to_string());
            if let Err(e) = channel.send(&Message::Response(fallback)).await {
                warn!(channel = channel.id(), id, error = %e, "failed to send BAD_RESPONSE");
            }
        }
    }
}

fn fault_status(err: &ExchangeError) -> Status {
    match err.status() {
        status @ (Status::ServiceError | Status::ServiceNotFound | Status::ServerTimeout) => status,
        _ => Status::ServerError,
    }
}

fn fault_detail(err: &ExchangeError) -> String {
    match err {
        ExchangeError::Application(detail) | ExchangeError::ServiceNotFound(detail) => {
            detail.clone()
        }
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fault_classes() {
        assert_eq!(
            fault_status(&ExchangeError::Application("x".into())),
            Status::ServiceError
        );
        assert_eq!(
            fault_status(&ExchangeError::ServiceNotFound("svc".into())),
            Status::ServiceNotFound
        );
        assert_eq!(
            fault_status(&ExchangeError::Timeout {
                status: Status::ServerTimeout,
                message: "slow".into(),
            }),
            Status::ServerTimeout
        );
        assert_eq!(
            fault_status(&ExchangeError::Timeout {
                status: Status::ClientTimeout,
                message: "nested".into(),
            }),
            Status::ServerError
        );
        assert_eq!(
            fault_status(&ExchangeError::Protocol("bad".into())),
            Status::ServerError
        );
    }

    fn router(threads: usize) -> HeaderExchangeHandler {
        let echo = crate::handler::handler_fn(|_channel, payload| async move {
            Ok::<_, ExchangeError>(payload)
        });
        HeaderExchangeHandler::new(echo, CorrelationRegistry::new(), threads)
    }

    fn occupy(router: &HeaderExchangeHandler) -> WorkerSlot {
        WorkerSlot {
            permit: Some(router.workers.clone().try_acquire_owned().unwrap()),
            idle: router.idle.clone(),
        }
    }

    #[tokio::test]
    async fn test_wait_idle_with_unbounded_grace() {
        let router = router(2);
        assert!(router.wait_idle(Duration::MAX).await);

        let slot = occupy(&router);
        assert_eq!(router.in_flight(), 1);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            drop(slot);
        });

        assert!(router.wait_idle(Duration::MAX).await);
        assert_eq!(router.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_wait_idle_gives_up_after_grace() {
        let router = router(1);
        let _slot = occupy(&router);
        assert!(!router.wait_idle(Duration::from_millis(20)).await);
    }

    #[test]
    fn test_fault_detail_is_raw_for_business_faults() {
        assert_eq!(fault_detail(&ExchangeError::Application("no stock".into())), "no stock");
        assert!(fault_detail(&ExchangeError::ThreadPoolExhausted).contains("exhausted"));
    }
}
