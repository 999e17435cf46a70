//! Error types for the relay engine
//!
//! Startup errors are fatal to the process and carry a distinct exit code.
//! Everything else is scoped to a single connection.

use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

/// Process exit codes, one per failure category
pub mod exit_code {
    pub const SERVER_SOCKET_ERROR: i32 = -1;
    pub const SERVER_SETSOCKOPT_ERROR: i32 = -2;
    pub const SERVER_BIND_ERROR: i32 = -3;
    pub const SERVER_LISTEN_ERROR: i32 = -4;
    pub const CLIENT_SOCKET_ERROR: i32 = -5;
    pub const CLIENT_RESOLVE_ERROR: i32 = -6;
    pub const CLIENT_CONNECT_ERROR: i32 = -7;
    pub const CREATE_PIPE_ERROR: i32 = -8;
    pub const BROKEN_PIPE_ERROR: i32 = -9;
    pub const SYNTAX_ERROR: i32 = -10;
}

/// Errors that abort the whole process before serving starts
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("Cannot create listening socket: {0}")]
    Socket(#[source] std::io::Error),

    #[error("Cannot set socket option on listening socket: {0}")]
    SetSockOpt(#[source] std::io::Error),

    #[error("Failed to bind to {address}: {source}\n\nTroubleshooting:\n  • Check if another process is using this port: lsof -i :{}\n  • Try using a different address or port", .address.port())]
    Bind {
        address: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Cannot listen on {address}: {source}")]
    Listen {
        address: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Cannot daemonize: {0}")]
    Daemonize(#[source] std::io::Error),

    #[error("Invalid arguments: {0}")]
    Syntax(String),
}

impl StartupError {
    pub fn exit_code(&self) -> i32 {
        match self {
            StartupError::Socket(_) | StartupError::Daemonize(_) => exit_code::SERVER_SOCKET_ERROR,
            StartupError::SetSockOpt(_) => exit_code::SERVER_SETSOCKOPT_ERROR,
            StartupError::Bind { .. } => exit_code::SERVER_BIND_ERROR,
            StartupError::Listen { .. } => exit_code::SERVER_LISTEN_ERROR,
            StartupError::Syntax(_) => exit_code::SYNTAX_ERROR,
        }
    }
}

/// Failure to reach the upstream for one connection
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("Cannot resolve {host}: {source}")]
    Resolve {
        host: String,
        #[source]
        source: std::io::Error,
    },

    #[error("No addresses found for {host}")]
    NoAddress { host: String },

    #[error("Failed to connect to remote address {address}: {source}")]
    Connect {
        address: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Timed out after {0:?} connecting to remote")]
    Timeout(Duration),
}

impl ConnectError {
    /// Code reported alongside the log line; never used to exit.
    pub fn code(&self) -> i32 {
        match self {
            ConnectError::Resolve { .. } | ConnectError::NoAddress { .. } => {
                exit_code::CLIENT_RESOLVE_ERROR
            }
            ConnectError::Connect { .. } | ConnectError::Timeout(_) => {
                exit_code::CLIENT_CONNECT_ERROR
            }
        }
    }
}

/// Failure to set up a filter process for one connection
#[derive(Debug, Error)]
pub enum FilterError {
    #[error("Failed to spawn filter `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Filter `{command}` has no {pipe} pipe")]
    MissingPipe {
        command: String,
        pipe: &'static str,
    },
}

impl FilterError {
    pub fn code(&self) -> i32 {
        exit_code::CREATE_PIPE_ERROR
    }
}

/// Invalid relay configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Remote host must not be empty")]
    EmptyRemoteHost,

    #[error("Remote port must not be 0")]
    ZeroRemotePort,

    #[error("Idle timeout must be greater than zero")]
    ZeroIdleTimeout,

    #[error("Filter command for {0} must not be empty")]
    EmptyFilter(&'static str),

    #[error("Filter command for {0} must not contain a NUL byte")]
    NulInFilter(&'static str),
}

impl From<ConfigError> for StartupError {
    fn from(err: ConfigError) -> Self {
        StartupError::Syntax(err.to_string())
    }
}
