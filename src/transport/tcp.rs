//! TCP connect and accept.
//!
//! # Example
//!
//! ```ignore
//! use exchange_rpc::transport::{connect, Acceptor};
//! use std::time::Duration;
//!
//! let acceptor = Acceptor::bind("127.0.0.1:0", true).await?;
//! let addr = acceptor.local_addr()?;
//! let client = connect(&addr.to_string(), Duration::from_secs(3), true).await?;
//! let (server_side, peer) = acceptor.accept().await?;
//! ```

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};

use crate::error::{ExchangeError, Result};

/// Open a connection to `addr`, failing after `timeout`.
pub async fn connect(addr: &str, timeout: Duration, nodelay: bool) -> Result<TcpStream> {
    let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| {
            ExchangeError::Transport(format!(
                "connecting to {} timed out after {}ms",
                addr,
                timeout.as_millis()
            ))
        })?
        .map_err(|e| ExchangeError::Transport(format!("failed to connect to {}: {}", addr, e)))?;

    configure(&stream, nodelay)?;
    Ok(stream)
}

/// Every socket address `addr` names, literal or `host:port`.
pub async fn resolve(addr: &str) -> Result<Vec<SocketAddr>> {
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host(addr)
        .await
        .map_err(|e| ExchangeError::Transport(format!("failed to resolve {}: {}", addr, e)))?
        .collect();
    if addrs.is_empty() {
        return Err(ExchangeError::Transport(format!("{} resolved to no address", addr)));
    }
    Ok(addrs)
}

fn configure(stream: &TcpStream, nodelay: bool) -> Result<()> {
    if nodelay {
        stream
            .set_nodelay(true)
            .map_err(|e| ExchangeError::Transport(format!("failed to set TCP_NODELAY: {}", e)))?;
    }
    Ok(())
}

/// TCP listener handing out configured streams.
pub struct Acceptor {
    listener: TcpListener,
    nodelay: bool,
}

impl Acceptor {
    /// Bind to `addr` and listen for incoming connections.
    pub async fn bind(addr: &str, nodelay: bool) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ExchangeError::Transport(format!("failed to bind {}: {}", addr, e)))?;
        Ok(Self { listener, nodelay })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .map_err(|e| ExchangeError::Transport(format!("failed to get local address: {}", e)))
    }

    /// Accept an incoming connection.
    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr)> {
        let (stream, peer) = self
            .listener
            .accept()
            .await
            .map_err(|e| ExchangeError::Transport(format!("failed to accept connection: {}", e)))?;
        configure(&stream, self.nodelay)?;
        Ok((stream, peer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_and_accept() {
        let acceptor = Acceptor::bind("127.0.0.1:0", true).await.unwrap();
        let addr = acceptor.local_addr().unwrap();

        let client = tokio::spawn(async move {
            connect(&addr.to_string(), Duration::from_secs(1), true).await
        });
        let (server, peer) = acceptor.accept().await.unwrap();
        let client = client.await.unwrap().unwrap();

        assert_eq!(client.local_addr().unwrap(), peer);
        assert_eq!(server.local_addr().unwrap(), addr);
        assert!(client.nodelay().unwrap());
    }

    #[tokio::test]
    async fn test_connect_refused_is_transport_error() {
        let acceptor = Acceptor::bind("127.0.0.1:0", true).await.unwrap();
        let addr = acceptor.local_addr().unwrap();
        drop(acceptor);

        let err = connect(&addr.to_string(), Duration::from_secs(1), true)
            .await
            .unwrap_err();
        assert!(matches!(err, ExchangeError::Transport(_)));
    }

    #[tokio::test]
    async fn test_resolve_literal_and_name() {
        let literal = resolve("[0:0:0:0:0:0:0:1]:80").await.unwrap();
        assert_eq!(literal, vec!["[::1]:80".parse::<SocketAddr>().unwrap()]);

        let named = resolve("localhost:80").await.unwrap();
        assert!(named.iter().all(|a| a.ip().is_loopback() && a.port() == 80));
    }

    #[tokio::test]
    async fn test_bind_in_use_is_transport_error() {
        let acceptor = Acceptor::bind("127.0.0.1:0", true).await.unwrap();
        let addr = acceptor.local_addr().unwrap();

        let err = Acceptor::bind(&addr.to_string(), true).await.err().unwrap();
        assert!(matches!(err, ExchangeError::Transport(_)));
    }
}
