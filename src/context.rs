//! Per-process exchange state shared by every client and server.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::correlation::{CorrelationRegistry, DEFAULT_SWEEP_INTERVAL};
use crate::error::{ExchangeError, Result};

/// Owns the correlation registry, its timeout sweep, the set of endpoints
/// bound through it and the shutdown token every background task derives
/// from.
///
/// Must be created inside a tokio runtime. Dropping the context, or calling
/// [`shutdown`](Self::shutdown), closes every client and server made from it.
pub struct ExchangeContext {
    registry: Arc<CorrelationRegistry>,
    bound: Arc<Mutex<HashSet<String>>>,
    shutdown: CancellationToken,
    _sweeper: JoinHandle<()>,
}

impl ExchangeContext {
    pub fn new() -> Self {
        Self::with_sweep_interval(DEFAULT_SWEEP_INTERVAL)
    }

    /// Context whose timeout sweep runs every `period`.
    pub fn with_sweep_interval(period: Duration) -> Self {
        let registry = CorrelationRegistry::new();
        let shutdown = CancellationToken::new();
        let sweeper = registry.spawn_sweeper(period, shutdown.child_token());
        debug!(sweep_ms = period.as_millis() as u64, "exchange context started");

        Self {
            registry,
            bound: Arc::new(Mutex::new(HashSet::new())),
            shutdown,
            _sweeper: sweeper,
        }
    }

    pub fn registry(&self) -> &Arc<CorrelationRegistry> {
        &self.registry
    }

    /// Close everything created from this context.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Addresses currently bound by servers of this context.
    pub fn bound_addresses(&self) -> Vec<String> {
        let mut addrs: Vec<String> = self.bound.lock().iter().cloned().collect();
        addrs.sort();
        addrs
    }

    pub(crate) fn child_token(&self) -> CancellationToken {
        self.shutdown.child_token()
    }

    pub(crate) fn ensure_unbound(&self, address: &str) -> Result<()> {
        if self.bound.lock().contains(address) {
            return Err(ExchangeError::AlreadyBound(address.to_string()));
        }
        Ok(())
    }

    /// Record a bound address. The returned guard releases it on drop.
    pub(crate) fn claim(&self, address: String) -> Result<BoundAddress> {
        let mut bound = self.bound.lock();
        if !bound.insert(address.clone()) {
            return Err(ExchangeError::AlreadyBound(address));
        }
        Ok(BoundAddress {
            address,
            bound: self.bound.clone(),
        })
    }
}

impl Default for ExchangeContext {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ExchangeContext {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// An address claimed in a context's bound set.
pub(crate) struct BoundAddress {
    address: String,
    bound: Arc<Mutex<HashSet<String>>>,
}

impl BoundAddress {
    pub(crate) fn address(&self) -> &str {
        &self.address
    }
}

impl Drop for BoundAddress {
    fn drop(&mut self) {
        self.bound.lock().remove(&self.address);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_claim_and_release() {
        let ctx = ExchangeContext::new();
        let claim = ctx.claim("127.0.0.1:9000".into()).unwrap();
        assert_eq!(claim.address(), "127.0.0.1:9000");
        assert!(matches!(
            ctx.ensure_unbound("127.0.0.1:9000"),
            Err(ExchangeError::AlreadyBound(_))
        ));
        assert!(ctx.claim("127.0.0.1:9000".into()).is_err());

        drop(claim);
        assert!(ctx.ensure_unbound("127.0.0.1:9000").is_ok());
        assert!(ctx.bound_addresses().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_cancels_children() {
        let ctx = ExchangeContext::new();
        let child = ctx.child_token();
        ctx.shutdown();
        assert!(child.is_cancelled());
        assert!(ctx.is_shutdown());
    }
}
