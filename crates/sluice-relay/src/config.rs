//! Relay configuration
//!
//! Built once at startup and shared read-only (behind an `Arc`) by the
//! listener and every connection worker.

use crate::error::ConfigError;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Size of a single relay read
pub const CHUNK_SIZE: usize = 16 * 1024;

/// Listen backlog for the accepting socket
pub const LISTEN_BACKLOG: i32 = 20;

/// Pause after rejecting a connection we could not register
pub const REJECT_BACKOFF: Duration = Duration::from_micros(50);

/// Stack budget for each runtime worker thread
pub const WORKER_STACK_SIZE: usize = 256 * 1024;

pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(15 * 60);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_FILTER_DRAIN: Duration = Duration::from_secs(2);
pub const DEFAULT_REAP_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    /// Local interface to bind; `None` binds every interface
    pub bind_addr: Option<IpAddr>,
    pub local_port: u16,
    pub remote_host: String,
    pub remote_port: u16,
    /// Shell command applied to client -> remote bytes
    pub filter_out: Option<String>,
    /// Shell command applied to remote -> client bytes
    pub filter_in: Option<String>,
    pub idle_timeout: Duration,
    pub connect_timeout: Duration,
    /// How long filter output may keep flowing once a connection is closing
    pub filter_drain: Duration,
    /// How often the listener prunes finished workers while no client arrives
    pub reap_interval: Duration,
    /// Registration fails once this many connections are live
    pub max_connections: Option<usize>,
}

impl RelayConfig {
    pub fn new(local_port: u16, remote_host: impl Into<String>, remote_port: u16) -> Self {
        Self {
            bind_addr: None,
            local_port,
            remote_host: remote_host.into(),
            remote_port,
            filter_out: None,
            filter_in: None,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            filter_drain: DEFAULT_FILTER_DRAIN,
            reap_interval: DEFAULT_REAP_INTERVAL,
            max_connections: None,
        }
    }

    pub fn with_bind_addr(mut self, addr: IpAddr) -> Self {
        self.bind_addr = Some(addr);
        self
    }

    pub fn with_filter_out(mut self, command: impl Into<String>) -> Self {
        self.filter_out = Some(command.into());
        self
    }

    pub fn with_filter_in(mut self, command: impl Into<String>) -> Self {
        self.filter_in = Some(command.into());
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_reap_interval(mut self, interval: Duration) -> Self {
        self.reap_interval = interval;
        self
    }

    pub fn with_max_connections(mut self, limit: usize) -> Self {
        self.max_connections = Some(limit);
        self
    }

    /// Address the listening socket binds to
    pub fn listen_addr(&self) -> SocketAddr {
        let ip = self
            .bind_addr
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        SocketAddr::new(ip, self.local_port)
    }

    /// `host:port` of the upstream, for logging
    pub fn remote_target(&self) -> String {
        format!("{}:{}", self.remote_host, self.remote_port)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.remote_host.trim().is_empty() {
            return Err(ConfigError::EmptyRemoteHost);
        }
        if self.remote_port == 0 {
            return Err(ConfigError::ZeroRemotePort);
        }
        if self.idle_timeout.is_zero() {
            return Err(ConfigError::ZeroIdleTimeout);
        }
        if matches!(&self.filter_out, Some(cmd) if cmd.trim().is_empty()) {
            return Err(ConfigError::EmptyFilter("client -> remote"));
        }
        if matches!(&self.filter_in, Some(cmd) if cmd.trim().is_empty()) {
            return Err(ConfigError::EmptyFilter("remote -> client"));
        }
        if matches!(&self.filter_out, Some(cmd) if cmd.contains('\0')) {
            return Err(ConfigError::NulInFilter("client -> remote"));
        }
        if matches!(&self.filter_in, Some(cmd) if cmd.contains('\0')) {
            return Err(ConfigError::NulInFilter("remote -> client"));
        }
        Ok(())
    }
}
