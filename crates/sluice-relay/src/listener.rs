//! Accept loop
//!
//! The listener is the only writer of the registry. Each pass through the
//! loop first reaps finished workers, then waits for a client (or the reap
//! tick), registers it and starts its worker without waiting for it.

use crate::config::{RelayConfig, LISTEN_BACKLOG, REJECT_BACKOFF};
use crate::connection::{Connection, ConnectionIdGenerator};
use crate::error::StartupError;
use crate::registry::Registry;
use crate::worker;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Create, configure, bind and listen on the relay's socket.
///
/// Returns a std listener so it can be created before the async runtime
/// exists (for example before daemonizing).
pub fn bind_std(addr: SocketAddr) -> Result<std::net::TcpListener, StartupError> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(StartupError::Socket)?;
    socket
        .set_reuse_address(true)
        .map_err(StartupError::SetSockOpt)?;
    socket
        .bind(&addr.into())
        .map_err(|source| StartupError::Bind {
            address: addr,
            source,
        })?;
    socket
        .listen(LISTEN_BACKLOG)
        .map_err(|source| StartupError::Listen {
            address: addr,
            source,
        })?;
    Ok(socket.into())
}

/// Counters published by the listener
#[derive(Debug, Default)]
pub struct ListenerStats {
    accepted: AtomicU64,
    rejected: AtomicU64,
    processed: AtomicU64,
    active: AtomicUsize,
}

impl ListenerStats {
    /// Connections returned by `accept`
    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    /// Connections closed immediately because they could not be registered
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    /// Connections handed to a worker
    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    /// Registry size after the listener's last change to it
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }
}

pub struct Listener {
    listener: TcpListener,
    config: Arc<RelayConfig>,
    registry: Registry,
    ids: ConnectionIdGenerator,
    stats: Arc<ListenerStats>,
}

impl Listener {
    /// Bind the configured address. Must be called inside a tokio runtime.
    pub fn bind(config: RelayConfig) -> Result<Self, StartupError> {
        config.validate()?;
        let listener = bind_std(config.listen_addr())?;
        Self::from_std(listener, config)
    }

    /// Adopt an already listening socket. Must be called inside a tokio runtime.
    pub fn from_std(
        listener: std::net::TcpListener,
        config: RelayConfig,
    ) -> Result<Self, StartupError> {
        config.validate()?;
        listener
            .set_nonblocking(true)
            .map_err(StartupError::SetSockOpt)?;
        let listener = TcpListener::from_std(listener).map_err(StartupError::Socket)?;

        let registry = match config.max_connections {
            Some(limit) => Registry::with_limit(limit),
            None => Registry::new(),
        };

        Ok(Self {
            listener,
            config: Arc::new(config),
            registry,
            ids: ConnectionIdGenerator::new(),
            stats: Arc::new(ListenerStats::default()),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn stats(&self) -> Arc<ListenerStats> {
        self.stats.clone()
    }

    /// Serve until the future is dropped.
    pub async fn run(&mut self) {
        if let Ok(addr) = self.listener.local_addr() {
            info!(
                "Relay listening on {}, forwarding to {}",
                addr,
                self.config.remote_target()
            );
        }

        let mut reap_tick = tokio::time::interval(self.config.reap_interval);
        reap_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            self.prune().await;

            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => self.admit(stream, peer_addr).await,
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                        // Usually descriptor exhaustion; don't spin on it.
                        tokio::time::sleep(REJECT_BACKOFF).await;
                    }
                },
                _ = reap_tick.tick() => {}
            }
        }
    }

    /// Abort all workers. Their sockets and filters are released as the
    /// tasks are dropped.
    pub fn shutdown(&mut self) {
        let active = self.registry.len();
        if active > 0 {
            info!("Aborting {} active connection(s)", active);
        }
        self.registry.abort_all();
        self.stats.active.store(0, Ordering::Relaxed);
    }

    async fn prune(&mut self) {
        let removed = self.registry.prune_completed().await;
        if removed > 0 {
            debug!(
                "Pruned {} finished connection(s), {} active",
                removed,
                self.registry.len()
            );
            self.stats
                .active
                .store(self.registry.len(), Ordering::Relaxed);
        }
    }

    async fn admit(&mut self, stream: TcpStream, peer_addr: SocketAddr) {
        self.stats.accepted.fetch_add(1, Ordering::Relaxed);

        let conn = Connection::new(self.ids.generate(), stream, peer_addr);
        let config = self.config.clone();

        match self
            .registry
            .register(conn, |conn| worker::spawn(conn, config))
        {
            Ok(id) => {
                let processed = self.stats.processed.fetch_add(1, Ordering::Relaxed) + 1;
                debug!(
                    "Accepted {} from {} ({} processed, {} active)",
                    id,
                    peer_addr,
                    processed,
                    self.registry.len()
                );
            }
            Err(conn) => {
                drop(conn);
                self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "Rejected connection from {}: out of resources ({} active)",
                    peer_addr,
                    self.registry.len()
                );
                tokio::time::sleep(REJECT_BACKOFF).await;
            }
        }

        self.stats
            .active
            .store(self.registry.len(), Ordering::Relaxed);
    }
}
