//! Connection worker
//!
//! One worker task owns one client <-> remote session from the moment it is
//! accepted until both sockets are closed:
//!
//! ```text
//! Connecting -> Relaying -> Closing -> Done
//!      \_______________________________/
//!           (connect or filter failure)
//! ```
//!
//! The relay loop waits for either socket to become readable (bounded by the
//! idle timeout), reads one chunk from whichever side is ready and writes it
//! in full to the other side, or into that direction's filter. Filter output
//! is forwarded by a separate pump task per filter.

use crate::config::{RelayConfig, CHUNK_SIZE};
use crate::connection::{Connection, MarkDoneOnDrop};
use crate::error::{ConnectError, FilterError};
use crate::filter::{self, FilterChild, FilterProcess};
use std::fmt;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{lookup_host, TcpStream};
use tokio::process::{ChildStdin, ChildStdout};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Connecting,
    Relaying,
    Closing,
    Done,
}

/// One half of the relay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToRemote,
    RemoteToClient,
}

impl Direction {
    pub fn reverse(self) -> Self {
        match self {
            Direction::ClientToRemote => Direction::RemoteToClient,
            Direction::RemoteToClient => Direction::ClientToRemote,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::ClientToRemote => write!(f, "client->remote"),
            Direction::RemoteToClient => write!(f, "remote->client"),
        }
    }
}

/// Why a relay loop stopped
#[derive(Debug)]
pub enum CloseReason {
    IdleTimeout(Duration),
    /// The read side of this direction reached EOF
    PeerClosed(Direction),
    ReadFailed(Direction, std::io::Error),
    WriteFailed(Direction, std::io::Error),
    WaitFailed(std::io::Error),
    /// A filter's output ended or could not be delivered
    FilterExited,
}

impl CloseReason {
    fn is_error(&self) -> bool {
        matches!(
            self,
            CloseReason::ReadFailed(..) | CloseReason::WriteFailed(..) | CloseReason::WaitFailed(_)
        )
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::IdleTimeout(after) => write!(f, "idle for {:?}", after),
            CloseReason::PeerClosed(Direction::ClientToRemote) => write!(f, "client closed"),
            CloseReason::PeerClosed(Direction::RemoteToClient) => write!(f, "remote closed"),
            CloseReason::ReadFailed(direction, e) => write!(f, "read failed ({}): {}", direction, e),
            CloseReason::WriteFailed(direction, e) => {
                write!(f, "write failed ({}): {}", direction, e)
            }
            CloseReason::WaitFailed(e) => write!(f, "readiness wait failed: {}", e),
            CloseReason::FilterExited => write!(f, "filter exited"),
        }
    }
}

/// Bytes read from each side during a session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub bytes_to_remote: u64,
    pub bytes_to_client: u64,
}

impl RelayStats {
    fn record(&mut self, direction: Direction, n: usize) {
        match direction {
            Direction::ClientToRemote => self.bytes_to_remote += n as u64,
            Direction::RemoteToClient => self.bytes_to_client += n as u64,
        }
    }
}

/// How a worker ended
#[derive(Debug)]
pub enum WorkerOutcome {
    ConnectFailed(ConnectError),
    FilterFailed(FilterError),
    Closed {
        reason: CloseReason,
        stats: RelayStats,
    },
}

/// Start a worker task for `conn`.
pub fn spawn(conn: Connection, config: Arc<RelayConfig>) -> JoinHandle<()> {
    let span = info_span!("conn", id = %conn.id(), peer = %conn.peer_addr());
    // Held by the task itself so an abort before the first poll still counts.
    let done = MarkDoneOnDrop::new(conn.completion());
    tokio::spawn(
        async move {
            let _done = done;
            run(conn, config).await;
        }
        .instrument(span),
    )
}

/// Drive one connection through its whole lifecycle.
///
/// The connection's completion flag is set when this future finishes or is
/// dropped.
pub async fn run(conn: Connection, config: Arc<RelayConfig>) -> WorkerOutcome {
    let (_id, _peer, client, done) = conn.into_parts();
    let _done = MarkDoneOnDrop::new(done);
    let mut lifecycle = Lifecycle::new();

    let remote = match connect_remote(&config).await {
        Ok(remote) => remote,
        Err(e) => {
            warn!(code = e.code(), "Cannot connect to {}: {}", config.remote_target(), e);
            drop(client);
            lifecycle.enter(WorkerState::Done);
            return WorkerOutcome::ConnectFailed(e);
        }
    };

    debug!("Connected to remote {}", config.remote_target());

    let mut session = match Session::establish(client, remote, &config) {
        Ok(session) => session,
        Err(e) => {
            error!(code = e.code(), "Filter setup failed: {}", e);
            lifecycle.enter(WorkerState::Done);
            return WorkerOutcome::FilterFailed(e);
        }
    };

    lifecycle.enter(WorkerState::Relaying);
    let reason = session.relay(config.idle_timeout).await;

    lifecycle.enter(WorkerState::Closing);
    let stats = session.stats;
    session.close(config.filter_drain).await;

    if reason.is_error() {
        warn!(
            bytes_to_remote = stats.bytes_to_remote,
            bytes_to_client = stats.bytes_to_client,
            "Connection closed: {}",
            reason
        );
    } else {
        info!(
            bytes_to_remote = stats.bytes_to_remote,
            bytes_to_client = stats.bytes_to_client,
            "Connection closed: {}",
            reason
        );
    }

    lifecycle.enter(WorkerState::Done);
    WorkerOutcome::Closed { reason, stats }
}

/// Resolve the configured upstream and connect to the first address that
/// accepts, all within the connect timeout.
pub async fn connect_remote(config: &RelayConfig) -> Result<TcpStream, ConnectError> {
    let host = config.remote_host.as_str();
    let attempt = async {
        let addrs: Vec<SocketAddr> = lookup_host((host, config.remote_port))
            .await
            .map_err(|source| ConnectError::Resolve {
                host: host.to_string(),
                source,
            })?
            .collect();

        let mut last_error = None;
        for address in addrs {
            match TcpStream::connect(address).await {
                Ok(stream) => return Ok(stream),
                Err(source) => {
                    debug!("Connect to {} failed: {}", address, source);
                    last_error = Some(ConnectError::Connect { address, source });
                }
            }
        }

        Err(last_error.unwrap_or_else(|| ConnectError::NoAddress {
            host: host.to_string(),
        }))
    };

    tokio::time::timeout(config.connect_timeout, attempt)
        .await
        .map_err(|_| ConnectError::Timeout(config.connect_timeout))?
}

struct Lifecycle {
    state: WorkerState,
}

impl Lifecycle {
    fn new() -> Self {
        Self {
            state: WorkerState::Connecting,
        }
    }

    fn enter(&mut self, next: WorkerState) {
        debug!(from = ?self.state, to = ?next, "Worker state change");
        self.state = next;
    }
}

/// Where one direction's bytes go after being read
enum Outbound {
    Socket(OwnedWriteHalf),
    Filter(ChildStdin),
}

impl Outbound {
    async fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        match self {
            Outbound::Socket(socket) => socket.write_all(buf).await,
            Outbound::Filter(stdin) => stdin.write_all(buf).await,
        }
    }
}

enum Readiness {
    Readable(Direction),
    FilterExited,
}

/// Everything a worker owns while relaying
struct Session {
    client_rx: OwnedReadHalf,
    remote_rx: OwnedReadHalf,
    to_remote: Outbound,
    to_client: Outbound,
    pumps: Vec<JoinHandle<()>>,
    children: Vec<FilterChild>,
    filter_done: CancellationToken,
    stats: RelayStats,
}

impl Session {
    /// Split both sockets and start any configured filters.
    fn establish(
        client: TcpStream,
        remote: TcpStream,
        config: &RelayConfig,
    ) -> Result<Self, FilterError> {
        let (client_rx, client_tx) = client.into_split();
        let (remote_rx, remote_tx) = remote.into_split();
        let filter_done = CancellationToken::new();
        let mut pumps = Vec::new();
        let mut children = Vec::new();

        let to_remote = match config.filter_out.as_deref() {
            Some(command) => {
                let (stdin, stdout, child) = FilterProcess::start(command)?.into_parts();
                pumps.push(spawn_pump(
                    Direction::ClientToRemote,
                    stdout,
                    remote_tx,
                    filter_done.clone(),
                ));
                children.push(child);
                Outbound::Filter(stdin)
            }
            None => Outbound::Socket(remote_tx),
        };

        let to_client = match config.filter_in.as_deref() {
            Some(command) => match FilterProcess::start(command) {
                Ok(filter) => {
                    let (stdin, stdout, child) = filter.into_parts();
                    pumps.push(spawn_pump(
                        Direction::RemoteToClient,
                        stdout,
                        client_tx,
                        filter_done.clone(),
                    ));
                    children.push(child);
                    Outbound::Filter(stdin)
                }
                Err(e) => {
                    // The outbound filter may already be running.
                    drop(to_remote);
                    for pump in &pumps {
                        pump.abort();
                    }
                    for child in children {
                        child.reap(Duration::ZERO);
                    }
                    return Err(e);
                }
            },
            None => Outbound::Socket(client_tx),
        };

        Ok(Self {
            client_rx,
            remote_rx,
            to_remote,
            to_client,
            pumps,
            children,
            filter_done,
            stats: RelayStats::default(),
        })
    }

    async fn relay(&mut self, idle_timeout: Duration) -> CloseReason {
        let mut buffer = vec![0u8; CHUNK_SIZE];

        loop {
            let ready = wait_ready(&self.client_rx, &self.remote_rx, &self.filter_done);
            let direction = match tokio::time::timeout(idle_timeout, ready).await {
                Err(_) => return CloseReason::IdleTimeout(idle_timeout),
                Ok(Err(e)) if e.kind() == ErrorKind::Interrupted => continue,
                Ok(Err(e)) => return CloseReason::WaitFailed(e),
                Ok(Ok(Readiness::FilterExited)) => return CloseReason::FilterExited,
                Ok(Ok(Readiness::Readable(direction))) => direction,
            };

            let source = match direction {
                Direction::ClientToRemote => &self.client_rx,
                Direction::RemoteToClient => &self.remote_rx,
            };
            let n = match source.try_read(&mut buffer) {
                Ok(0) => return CloseReason::PeerClosed(direction),
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::WouldBlock => continue,
                Err(e) => return CloseReason::ReadFailed(direction, e),
            };

            let sink = match direction {
                Direction::ClientToRemote => &mut self.to_remote,
                Direction::RemoteToClient => &mut self.to_client,
            };
            if let Err(e) = sink.write_all(&buffer[..n]).await {
                return CloseReason::WriteFailed(direction, e);
            }

            self.stats.record(direction, n);
        }
    }

    /// Release everything the session owns.
    ///
    /// Filter inputs are closed first so pending filter output can drain to
    /// its destination, then both sockets are closed and the filter children
    /// are handed to their reapers.
    async fn close(self, drain: Duration) {
        let Session {
            client_rx,
            remote_rx,
            to_remote,
            to_client,
            mut pumps,
            children,
            ..
        } = self;

        let remote_tx = into_socket(to_remote);
        let client_tx = into_socket(to_client);

        if !pumps.is_empty() {
            let drained =
                tokio::time::timeout(drain, futures::future::join_all(pumps.iter_mut())).await;
            if drained.is_err() {
                debug!("Filter output did not drain within {:?}", drain);
                for pump in pumps.into_iter().filter(|pump| !pump.is_finished()) {
                    pump.abort();
                    let _ = pump.await;
                }
            }
        }

        drop(remote_tx);
        drop(remote_rx);
        drop(client_tx);
        drop(client_rx);

        for child in children {
            child.reap(drain);
        }
    }
}

/// Wait until either read half is readable or a filter pump has stopped.
///
/// Priority is fixed: a stopped filter, then the client, then the remote.
async fn wait_ready(
    client_rx: &OwnedReadHalf,
    remote_rx: &OwnedReadHalf,
    filter_done: &CancellationToken,
) -> std::io::Result<Readiness> {
    tokio::select! {
        biased;
        _ = filter_done.cancelled() => Ok(Readiness::FilterExited),
        r = client_rx.readable() => r.map(|()| Readiness::Readable(Direction::ClientToRemote)),
        r = remote_rx.readable() => r.map(|()| Readiness::Readable(Direction::RemoteToClient)),
    }
}

/// Drop a filter's stdin (signalling EOF) or hand back the socket half.
fn into_socket(outbound: Outbound) -> Option<OwnedWriteHalf> {
    match outbound {
        Outbound::Socket(socket) => Some(socket),
        Outbound::Filter(_stdin) => None,
    }
}

fn spawn_pump(
    direction: Direction,
    output: ChildStdout,
    destination: OwnedWriteHalf,
    done: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(
        async move {
            match filter::pump(output, destination).await {
                Ok(bytes) => debug!(%direction, bytes, "Filter output ended"),
                Err(e) => debug!(%direction, "Filter pump stopped: {}", e),
            }
            done.cancel();
        }
        .in_current_span(),
    )
}
