//! Endpoint descriptor and resolved exchange configuration.
//!
//! An [`Endpoint`] is the address plus string parameters handed to
//! [`Exchanger::connect`](crate::Exchanger::connect) and
//! [`Exchanger::bind`](crate::Exchanger::bind). It is resolved once into a
//! typed [`ExchangeConfig`] before any I/O happens.
//!
//! # Example
//!
//! ```
//! use exchange_rpc::config::{Endpoint, ExchangeConfig};
//! use std::time::Duration;
//!
//! let endpoint: Endpoint = "exchange://127.0.0.1:20880?heartbeat=200&timeout=300"
//!     .parse()
//!     .unwrap();
//! let config = ExchangeConfig::from_endpoint(&endpoint).unwrap();
//!
//! assert_eq!(config.heartbeat, Some(Duration::from_millis(200)));
//! assert_eq!(config.request_timeout, Duration::from_millis(300));
//! assert_eq!(config.threads, 200);
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::codec::Serialization;
use crate::error::{ExchangeError, Result};
use crate::protocol::DEFAULT_MAX_PAYLOAD_SIZE;
use crate::writer::WriterConfig;

/// Parameter keys understood by the exchange layer.
pub mod keys {
    /// Heartbeat interval in milliseconds, `0` disables heartbeats.
    pub const HEARTBEAT: &str = "heartbeat";
    /// Consecutive unanswered heartbeats before the channel is closed.
    pub const HEARTBEAT_MISSES: &str = "heartbeat.misses";
    /// Connect timeout in milliseconds.
    pub const CONNECT_TIMEOUT: &str = "connect.timeout";
    /// Default request timeout in milliseconds.
    pub const TIMEOUT: &str = "timeout";
    /// Graceful close timeout in milliseconds.
    pub const CLOSE_TIMEOUT: &str = "close.timeout";
    /// Body serialization name (`msgpack` or `json`).
    pub const SERIALIZATION: &str = "serialization";
    /// Worker pool size for application replies.
    pub const THREADS: &str = "threads";
    /// Maximum body size in bytes.
    pub const PAYLOAD: &str = "payload";
    /// `TCP_NODELAY` on accepted and connected sockets.
    pub const NODELAY: &str = "nodelay";
}

pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(60);
pub const DEFAULT_HEARTBEAT_MISSES: u32 = 3;
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(3000);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(1000);
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_millis(10_000);
pub const DEFAULT_THREADS: usize = 200;

const DEFAULT_SCHEME: &str = "exchange";

/// Address and parameters of a remote or local endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    #[serde(default = "default_scheme")]
    pub scheme: String,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

fn default_scheme() -> String {
    DEFAULT_SCHEME.to_string()
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            scheme: default_scheme(),
            host: host.into(),
            port,
            params: BTreeMap::new(),
        }
    }

    /// Set a parameter, replacing any previous value.
    pub fn with_param(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.params.insert(key.into(), value.to_string());
        self
    }

    /// Raw parameter value.
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    /// `host:port` form suitable for socket APIs.
    pub fn address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Same endpoint with a different port, keeping parameters.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Parse a parameter, falling back to `default` when absent.
    pub fn param_or<T: FromStr>(&self, key: &str, default: T) -> Result<T> {
        match self.param(key) {
            None => Ok(default),
            Some(raw) => raw.trim().parse().map_err(|_| {
                ExchangeError::InvalidEndpoint(format!("bad value '{}' for '{}'", raw, key))
            }),
        }
    }

    /// Millisecond parameter as a duration.
    pub fn millis_or(&self, key: &str, default: Duration) -> Result<Duration> {
        let ms = self.param_or(key, default.as_millis() as u64)?;
        Ok(Duration::from_millis(ms))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme, self.address())?;
        let mut sep = '?';
        for (key, value) in &self.params {
            write!(f, "{}{}={}", sep, key, value)?;
            sep = '&';
        }
        Ok(())
    }
}

impl FromStr for Endpoint {
    type Err = ExchangeError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = |why: &str| ExchangeError::InvalidEndpoint(format!("{}: '{}'", why, s));

        let (scheme, rest) = match s.split_once("://") {
            Some((scheme, rest)) if !scheme.is_empty() => (scheme.to_string(), rest),
            Some(_) => return Err(invalid("empty scheme")),
            None => (default_scheme(), s),
        };
        let (authority, query) = match rest.split_once('?') {
            Some((authority, query)) => (authority, Some(query)),
            None => (rest, None),
        };
        let authority = authority.trim_end_matches('/');

        let (host, port) = authority
            .rsplit_once(':')
            .ok_or_else(|| invalid("missing port"))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(invalid("missing host"));
        }
        let port: u16 = port.parse().map_err(|_| invalid("bad port"))?;

        let mut params = BTreeMap::new();
        for pair in query.unwrap_or_default().split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            params.insert(key.to_string(), value.to_string());
        }

        Ok(Self {
            scheme,
            host: host.to_string(),
            port,
            params,
        })
    }
}

/// Typed settings resolved from an [`Endpoint`].
#[derive(Debug, Clone)]
pub struct ExchangeConfig {
    /// Heartbeat interval, `None` when disabled.
    pub heartbeat: Option<Duration>,
    /// Consecutive misses tolerated before the channel is closed.
    pub heartbeat_misses: u32,
    pub connect_timeout: Duration,
    /// Timeout applied by `request` when the caller gives none.
    pub request_timeout: Duration,
    /// Grace period used by `close_default`.
    pub close_timeout: Duration,
    pub serialization: Serialization,
    /// Worker pool size for application replies.
    pub threads: usize,
    /// Maximum body size accepted and produced.
    pub max_payload: u32,
    pub nodelay: bool,
    /// Outbound writer task settings.
    pub writer: WriterConfig,
}

impl Default for ExchangeConfig {
    /// Defaults:
    ///
    /// - `heartbeat`: 60s, 3 misses
    /// - `connect_timeout`: 3s
    /// - `request_timeout`: 1s
    /// - `close_timeout`: 10s
    /// - `serialization`: msgpack
    /// - `threads`: 200
    /// - `max_payload`: 8 MiB
    fn default() -> Self {
        Self {
            heartbeat: Some(DEFAULT_HEARTBEAT),
            heartbeat_misses: DEFAULT_HEARTBEAT_MISSES,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
            serialization: Serialization::default(),
            threads: DEFAULT_THREADS,
            max_payload: DEFAULT_MAX_PAYLOAD_SIZE,
            nodelay: true,
            writer: WriterConfig::default(),
        }
    }
}

impl ExchangeConfig {
    /// Resolve every known parameter of `endpoint`.
    ///
    /// # Errors
    ///
    /// [`ExchangeError::InvalidEndpoint`] for unparsable values, a zero-sized
    /// worker pool, or a zero miss threshold.
    pub fn from_endpoint(endpoint: &Endpoint) -> Result<Self> {
        let defaults = Self::default();

        let heartbeat = endpoint.millis_or(keys::HEARTBEAT, DEFAULT_HEARTBEAT)?;
        let heartbeat_misses =
            endpoint.param_or(keys::HEARTBEAT_MISSES, defaults.heartbeat_misses)?;
        if heartbeat_misses == 0 {
            return Err(ExchangeError::InvalidEndpoint(format!(
                "'{}' must be at least 1",
                keys::HEARTBEAT_MISSES
            )));
        }
        let threads = endpoint.param_or(keys::THREADS, defaults.threads)?;
        if threads == 0 {
            return Err(ExchangeError::InvalidEndpoint(format!(
                "'{}' must be at least 1",
                keys::THREADS
            )));
        }

        Ok(Self {
            heartbeat: (!heartbeat.is_zero()).then_some(heartbeat),
            heartbeat_misses,
            connect_timeout: endpoint.millis_or(keys::CONNECT_TIMEOUT, defaults.connect_timeout)?,
            request_timeout: endpoint.millis_or(keys::TIMEOUT, defaults.request_timeout)?,
            close_timeout: endpoint.millis_or(keys::CLOSE_TIMEOUT, defaults.close_timeout)?,
            serialization: endpoint.param_or(keys::SERIALIZATION, defaults.serialization)?,
            threads,
            max_payload: endpoint.param_or(keys::PAYLOAD, defaults.max_payload)?,
            nodelay: endpoint.param_or(keys::NODELAY, defaults.nodelay)?,
            writer: defaults.writer,
        })
    }

    /// Set or disable the heartbeat interval.
    pub fn with_heartbeat(mut self, interval: Option<Duration>) -> Self {
        self.heartbeat = interval;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_serialization(mut self, serialization: Serialization) -> Self {
        self.serialization = serialization;
        self
    }

    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_endpoint() {
        let ep: Endpoint = "dubbo://10.0.0.1:20880?timeout=300&serialization=json"
            .parse()
            .unwrap();
        assert_eq!(ep.scheme, "dubbo");
        assert_eq!(ep.host, "10.0.0.1");
        assert_eq!(ep.port, 20880);
        assert_eq!(ep.param("timeout"), Some("300"));
        assert_eq!(ep.address(), "10.0.0.1:20880");
    }

    #[test]
    fn test_parse_without_scheme_and_ipv6() {
        let ep: Endpoint = "127.0.0.1:0".parse().unwrap();
        assert_eq!(ep.scheme, "exchange");
        assert_eq!(ep.port, 0);

        let ep: Endpoint = "exchange://[::1]:9000".parse().unwrap();
        assert_eq!(ep.host, "::1");
        assert_eq!(ep.address(), "[::1]:9000");
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            "exchange://localhost".parse::<Endpoint>(),
            Err(ExchangeError::InvalidEndpoint(_))
        ));
        assert!("exchange://:80".parse::<Endpoint>().is_err());
        assert!("exchange://host:99999".parse::<Endpoint>().is_err());
    }

    #[test]
    fn test_display_roundtrip() {
        let ep = Endpoint::new("localhost", 20880)
            .with_param(keys::TIMEOUT, 500)
            .with_param(keys::HEARTBEAT, 0);
        let text = ep.to_string();
        assert_eq!(text, "exchange://localhost:20880?heartbeat=0&timeout=500");
        assert_eq!(text.parse::<Endpoint>().unwrap(), ep);
    }

    #[test]
    fn test_config_defaults() {
        let config = ExchangeConfig::from_endpoint(&Endpoint::new("h", 1)).unwrap();
        assert_eq!(config.heartbeat, Some(Duration::from_secs(60)));
        assert_eq!(config.heartbeat_misses, 3);
        assert_eq!(config.connect_timeout, Duration::from_secs(3));
        assert_eq!(config.request_timeout, Duration::from_secs(1));
        assert_eq!(config.close_timeout, Duration::from_secs(10));
        assert_eq!(config.serialization, Serialization::MsgPack);
        assert_eq!(config.threads, 200);
        assert_eq!(config.max_payload, 8 * 1024 * 1024);
        assert!(config.nodelay);
    }

    #[test]
    fn test_config_overrides() {
        let ep = Endpoint::new("h", 1)
            .with_param(keys::HEARTBEAT, 0)
            .with_param(keys::SERIALIZATION, "json")
            .with_param(keys::THREADS, 4)
            .with_param(keys::NODELAY, false);
        let config = ExchangeConfig::from_endpoint(&ep).unwrap();
        assert_eq!(config.heartbeat, None);
        assert_eq!(config.serialization, Serialization::Json);
        assert_eq!(config.threads, 4);
        assert!(!config.nodelay);
    }

    #[test]
    fn test_config_rejects_bad_values() {
        let bad = Endpoint::new("h", 1).with_param(keys::TIMEOUT, "soon");
        assert!(matches!(
            ExchangeConfig::from_endpoint(&bad),
            Err(ExchangeError::InvalidEndpoint(_))
        ));

        let zero = Endpoint::new("h", 1).with_param(keys::THREADS, 0);
        assert!(ExchangeConfig::from_endpoint(&zero).is_err());
    }

    #[test]
    fn test_endpoint_serde() {
        let ep: Endpoint = serde_json::from_str(r#"{"host":"h","port":7}"#).unwrap();
        assert_eq!(ep.scheme, "exchange");
        assert!(ep.params.is_empty());
    }
}
