//! Built-in Configuration Defaults

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use super::types::DispatchMode;

pub const CONFIG_FILENAME: &str = "tcpgate.toml";

pub const PORT: u16 = 9191;
/// Zero means unbounded: no admission control
pub const WORKER_BOUND: usize = 0;
pub const DISPATCH_MODE: DispatchMode = DispatchMode::Handler;

pub const BIND_HOST: IpAddr = IpAddr::V4(Ipv4Addr::UNSPECIFIED);
pub const CALLBACK_TIMEOUT: Duration = Duration::from_secs(5);
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);
pub const MAX_FRAME_SIZE: usize = crate::protocol::DEFAULT_MAX_FRAME_SIZE;

// Environment variables read by the external configuration source
pub const ENV_PORT: &str = "TCPGATE_PORT";
pub const ENV_WORKER_BOUND: &str = "TCPGATE_WORKER_BOUND";
pub const ENV_DISPATCH_MODE: &str = "TCPGATE_DISPATCH_MODE";
pub const ENV_SHUTDOWN_TIMEOUT: &str = "TCPGATE_SHUTDOWN_TIMEOUT";
