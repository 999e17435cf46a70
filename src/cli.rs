//! Command line and config file handling
//!
//! CLI values take precedence over the YAML config file; switches are
//! enabled if either source enables them.

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use serde::Deserialize;
use sluice_relay::{RelayConfig, StartupError};
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

const LONG_VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("GIT_HASH"),
    ", built ",
    env!("BUILD_TIME"),
    ")"
);

pub const USAGE: &str = "Syntax: sluice [-b bind_address] -l local_port -h remote_host -p remote_port [-i \"input filter\"] [-o \"output filter\"] [-f (stay in foreground)] [-s (use syslog)]";

/// Sluice - TCP relay with optional filter commands
#[derive(Parser, Debug)]
#[command(name = "sluice")]
#[command(about = "Sluice - relay TCP connections to a fixed upstream, optionally through filter commands")]
#[command(version, long_version = LONG_VERSION)]
#[command(disable_help_flag = true)]
#[command(long_about = r#"
Sluice accepts TCP connections on a local port and relays each one to a
fixed remote host and port. Either direction can be piped through a shell
command that transforms the bytes on the way.

EXAMPLES:
  # Forward local port 9000 to an upstream on 9001
  sluice -l 9000 -h 127.0.0.1 -p 9001 -f

  # Uppercase everything the client sends
  sluice -l 9000 -h 127.0.0.1 -p 9001 -o "tr a-z A-Z" -f

  # Run in the background, logging to syslog
  sluice -c /etc/sluice.yaml -s

ENVIRONMENT VARIABLES:
  SLUICE_BIND          Local address to bind
  SLUICE_LOCAL_PORT    Local port to listen on
  SLUICE_REMOTE_HOST   Upstream host
  SLUICE_REMOTE_PORT   Upstream port
  SLUICE_FILTER_IN     Filter for remote -> client bytes
  SLUICE_FILTER_OUT    Filter for client -> remote bytes
  SLUICE_IDLE_TIMEOUT  Idle timeout in seconds
  SLUICE_CONFIG        Configuration file (YAML)
"#)]
pub struct Args {
    /// Local address to bind (default: all interfaces)
    #[arg(short = 'b', long = "bind", env = "SLUICE_BIND")]
    pub bind: Option<String>,

    /// Local port to listen on
    #[arg(short = 'l', long, env = "SLUICE_LOCAL_PORT")]
    pub local_port: Option<u16>,

    /// Upstream host name or address
    #[arg(short = 'h', long, env = "SLUICE_REMOTE_HOST")]
    pub remote_host: Option<String>,

    /// Upstream port
    #[arg(short = 'p', long, env = "SLUICE_REMOTE_PORT")]
    pub remote_port: Option<u16>,

    /// Shell command filtering bytes from the remote to the client
    #[arg(short = 'i', long, env = "SLUICE_FILTER_IN")]
    pub filter_in: Option<String>,

    /// Shell command filtering bytes from the client to the remote
    #[arg(short = 'o', long, env = "SLUICE_FILTER_OUT")]
    pub filter_out: Option<String>,

    /// Stay in the foreground instead of detaching
    #[arg(short = 'f', long)]
    pub foreground: bool,

    /// Log to syslog instead of stderr
    #[arg(short = 's', long)]
    pub syslog: bool,

    /// Close connections idle for this many seconds (default 900)
    #[arg(short = 't', long, env = "SLUICE_IDLE_TIMEOUT")]
    pub idle_timeout: Option<u64>,

    /// Give up connecting to the upstream after this many seconds (default 30)
    #[arg(long)]
    pub connect_timeout: Option<u64>,

    /// Reject new clients while this many connections are active
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Configuration file (YAML)
    #[arg(short = 'c', long, env = "SLUICE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Print help
    #[arg(long, action = ArgAction::Help)]
    help: Option<bool>,
}

/// Configuration file format
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    bind: Option<String>,
    local_port: Option<u16>,
    remote_host: Option<String>,
    remote_port: Option<u16>,
    filter_in: Option<String>,
    filter_out: Option<String>,
    #[serde(default)]
    foreground: bool,
    #[serde(default)]
    syslog: bool,
    idle_timeout_secs: Option<u64>,
    connect_timeout_secs: Option<u64>,
    max_connections: Option<usize>,
    log_level: Option<String>,
}

/// Everything the process needs to start
#[derive(Debug)]
pub struct Settings {
    pub relay: RelayConfig,
    pub foreground: bool,
    pub use_syslog: bool,
    pub log_level: String,
}

/// Load configuration from YAML file
pub fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: ConfigFile = serde_yaml::from_str(&contents)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    Ok(config)
}

/// Merge CLI args with the config file, giving precedence to CLI args
pub fn build_settings(args: Args) -> Result<Settings> {
    let file = match &args.config {
        Some(path) => load_config_file(path)?,
        None => ConfigFile::default(),
    };

    let local_port = args.local_port.or(file.local_port).filter(|port| *port != 0);
    let remote_host = args.remote_host.or(file.remote_host);
    let remote_port = args.remote_port.or(file.remote_port);

    let (Some(local_port), Some(remote_host), Some(remote_port)) =
        (local_port, remote_host, remote_port)
    else {
        return Err(StartupError::Syntax(
            "local port, remote host and remote port are required".to_string(),
        )
        .into());
    };

    let mut relay = RelayConfig::new(local_port, remote_host, remote_port);

    if let Some(bind) = args.bind.or(file.bind) {
        let addr: IpAddr = bind
            .parse()
            .map_err(|_| StartupError::Syntax(format!("invalid bind address: {}", bind)))?;
        relay = relay.with_bind_addr(addr);
    }

    relay.filter_in = args.filter_in.or(file.filter_in);
    relay.filter_out = args.filter_out.or(file.filter_out);

    if let Some(secs) = args.idle_timeout.or(file.idle_timeout_secs) {
        relay = relay.with_idle_timeout(Duration::from_secs(secs));
    }
    if let Some(secs) = args.connect_timeout.or(file.connect_timeout_secs) {
        relay = relay.with_connect_timeout(Duration::from_secs(secs));
    }
    if let Some(limit) = args.max_connections.or(file.max_connections) {
        relay = relay.with_max_connections(limit);
    }

    relay.validate().map_err(StartupError::from)?;

    Ok(Settings {
        relay,
        foreground: args.foreground || file.foreground,
        use_syslog: args.syslog || file.syslog,
        log_level: args
            .log_level
            .or(file.log_level)
            .unwrap_or_else(|| "info".to_string()),
    })
}
