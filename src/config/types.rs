//! Configuration Types

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::dispatch::{PacketHandler, ServerCallbackHandler};

/// How received packets reach application code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase", try_from = "String")]
pub enum DispatchMode {
    /// Synchronous handler call on the connection's worker
    Handler,
    /// Unbounded queue drained by an external consumer
    Queue,
}

impl FromStr for DispatchMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "handler" => Ok(Self::Handler),
            "queue" => Ok(Self::Queue),
            other => Err(format!(
                "unknown dispatch mode '{}', expected 'handler' or 'queue'",
                other
            )),
        }
    }
}

impl TryFrom<String> for DispatchMode {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl fmt::Display for DispatchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Handler => f.write_str("handler"),
            Self::Queue => f.write_str("queue"),
        }
    }
}

/// Values supplied by an external configuration source.
///
/// Every field is optional; unset fields fall through to the next layer.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct SourceConfig {
    pub port: Option<u16>,
    pub worker_bound: Option<usize>,
    pub dispatch_mode: Option<DispatchMode>,
    pub bind_host: Option<IpAddr>,
    #[serde(with = "humantime_serde")]
    pub accept_timeout: Option<Duration>,
    #[serde(with = "humantime_serde")]
    pub callback_timeout: Option<Duration>,
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Option<Duration>,
    pub max_frame_size: Option<usize>,
}

impl SourceConfig {
    /// Combine two sources; values set in `self` win
    pub fn layered_over(self, lower: SourceConfig) -> SourceConfig {
        SourceConfig {
            port: self.port.or(lower.port),
            worker_bound: self.worker_bound.or(lower.worker_bound),
            dispatch_mode: self.dispatch_mode.or(lower.dispatch_mode),
            bind_host: self.bind_host.or(lower.bind_host),
            accept_timeout: self.accept_timeout.or(lower.accept_timeout),
            callback_timeout: self.callback_timeout.or(lower.callback_timeout),
            shutdown_timeout: self.shutdown_timeout.or(lower.shutdown_timeout),
            max_frame_size: self.max_frame_size.or(lower.max_frame_size),
        }
    }
}

/// Validated, immutable server configuration
#[derive(Clone)]
pub struct ServerConfiguration {
    pub(crate) port: u16,
    pub(crate) worker_bound: usize,
    pub(crate) dispatch_mode: DispatchMode,
    pub(crate) handler: Option<Arc<dyn PacketHandler>>,
    pub(crate) callbacks: Option<Arc<dyn ServerCallbackHandler>>,
    pub(crate) bind_host: IpAddr,
    pub(crate) accept_timeout: Option<Duration>,
    pub(crate) callback_timeout: Duration,
    pub(crate) shutdown_timeout: Duration,
    pub(crate) max_frame_size: usize,
}

impl ServerConfiguration {
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Maximum concurrently running connection workers; 0 is unbounded
    pub fn worker_bound(&self) -> usize {
        self.worker_bound
    }

    pub fn is_bounded(&self) -> bool {
        self.worker_bound > 0
    }

    pub fn dispatch_mode(&self) -> DispatchMode {
        self.dispatch_mode
    }

    pub fn handler(&self) -> Option<&Arc<dyn PacketHandler>> {
        self.handler.as_ref()
    }

    pub fn callbacks(&self) -> Option<&Arc<dyn ServerCallbackHandler>> {
        self.callbacks.as_ref()
    }

    pub fn bind_host(&self) -> IpAddr {
        self.bind_host
    }

    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_host, self.port)
    }

    pub fn accept_timeout(&self) -> Option<Duration> {
        self.accept_timeout
    }

    pub fn callback_timeout(&self) -> Duration {
        self.callback_timeout
    }

    pub fn shutdown_timeout(&self) -> Duration {
        self.shutdown_timeout
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }
}

impl fmt::Debug for ServerConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfiguration")
            .field("port", &self.port)
            .field("worker_bound", &self.worker_bound)
            .field("dispatch_mode", &self.dispatch_mode)
            .field("handler", &self.handler.is_some())
            .field("callbacks", &self.callbacks.is_some())
            .field("bind_host", &self.bind_host)
            .field("accept_timeout", &self.accept_timeout)
            .field("callback_timeout", &self.callback_timeout)
            .field("shutdown_timeout", &self.shutdown_timeout)
            .field("max_frame_size", &self.max_frame_size)
            .finish()
    }
}
