//! Entry points assembling the exchange pipeline over TCP.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::channel::{Channel, ChannelParts};
use crate::client::ExchangeClient;
use crate::config::{Endpoint, ExchangeConfig};
use crate::context::ExchangeContext;
use crate::error::{ExchangeError, Result};
use crate::handler::{ExchangeHandler, HeaderExchangeHandler};
use crate::protocol::ExchangeCodec;
use crate::server::ExchangeServer;
use crate::transport::{self, Acceptor};

/// Builds clients and servers for an endpoint.
#[async_trait]
pub trait Exchanger: Send + Sync {
    /// Name the exchanger is known by.
    fn name(&self) -> &'static str;

    /// Connect to `endpoint`; inbound requests from the server go to
    /// `handler`.
    async fn connect(
        &self,
        ctx: &ExchangeContext,
        endpoint: &Endpoint,
        handler: Arc<dyn ExchangeHandler>,
    ) -> Result<ExchangeClient>;

    /// Listen on `endpoint`; requests from every accepted channel go to
    /// `handler`.
    async fn bind(
        &self,
        ctx: &ExchangeContext,
        endpoint: &Endpoint,
        handler: Arc<dyn ExchangeHandler>,
    ) -> Result<ExchangeServer>;
}

/// The header exchanger: 16-byte header frames, correlation by request id,
/// heartbeats and a bounded reply pool.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeaderExchanger;

impl HeaderExchanger {
    pub const NAME: &'static str = "header";
}

#[async_trait]
impl Exchanger for HeaderExchanger {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn connect(
        &self,
        ctx: &ExchangeContext,
        endpoint: &Endpoint,
        handler: Arc<dyn ExchangeHandler>,
    ) -> Result<ExchangeClient> {
        let config = ExchangeConfig::from_endpoint(endpoint)?;
        let address = endpoint.address();
        debug!(addr = %address, serialization = %config.serialization, "connecting");

        let stream = transport::connect(&address, config.connect_timeout, config.nodelay).await?;
        let local_addr = stream
            .local_addr()
            .map_err(|e| ExchangeError::Transport(format!("failed to get local address: {}", e)))?;
        let remote_addr = stream
            .peer_addr()
            .map_err(|e| ExchangeError::Transport(format!("failed to get peer address: {}", e)))?;
        let (reader, writer) = stream.into_split();

        let router = Arc::new(HeaderExchangeHandler::new(
            handler,
            ctx.registry().clone(),
            config.threads,
        ));
        let codec = ExchangeCodec::new(config.serialization).with_max_payload(config.max_payload);
        let channel = Channel::spawn(
            reader,
            writer,
            ChannelParts {
                id: ctx.registry().next_channel_id(),
                local_addr,
                remote_addr,
                codec,
                writer: config.writer.clone(),
                router,
                shutdown: ctx.child_token(),
            },
        );
        info!(channel = channel.id(), local = %local_addr, remote = %remote_addr, "client connected");

        Ok(ExchangeClient::new(channel, config, true))
    }

    async fn bind(
        &self,
        ctx: &ExchangeContext,
        endpoint: &Endpoint,
        handler: Arc<dyn ExchangeHandler>,
    ) -> Result<ExchangeServer> {
        let config = ExchangeConfig::from_endpoint(endpoint)?;
        let address = endpoint.address();
        if endpoint.port != 0 {
            for resolved in transport::resolve(&address).await? {
                ctx.ensure_unbound(&resolved.to_string())?;
            }
        }

        let acceptor = Acceptor::bind(&address, config.nodelay).await?;
        let local_addr = acceptor.local_addr()?;
        let bound = ctx.claim(local_addr.to_string())?;

        let router = Arc::new(HeaderExchangeHandler::new(
            handler,
            ctx.registry().clone(),
            config.threads,
        ));
        ExchangeServer::start(acceptor, config, router, ctx.child_token(), bound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name() {
        assert_eq!(HeaderExchanger.name(), "header");
    }
}
