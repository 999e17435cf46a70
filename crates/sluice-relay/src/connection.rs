//! Accepted connection records

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpStream;

/// Opaque handle identifying one accepted connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Simple connection ID generator for logging and registry bookkeeping
#[derive(Clone)]
pub struct ConnectionIdGenerator {
    next_id: Arc<AtomicU64>,
}

impl ConnectionIdGenerator {
    pub fn new() -> Self {
        Self {
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn generate(&self) -> ConnectionId {
        ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for ConnectionIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Set once by a worker when it is finished, observed by the registry.
#[derive(Debug, Clone, Default)]
pub struct CompletionFlag(Arc<AtomicBool>);

impl CompletionFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Sets the completion flag when dropped, so every exit path of a worker
/// (including panics and aborts) publishes completion.
pub(crate) struct MarkDoneOnDrop(CompletionFlag);

impl MarkDoneOnDrop {
    pub(crate) fn new(flag: CompletionFlag) -> Self {
        Self(flag)
    }
}

impl Drop for MarkDoneOnDrop {
    fn drop(&mut self) {
        self.0.set();
    }
}

/// A client connection handed from the listener to its worker
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    peer_addr: SocketAddr,
    client: TcpStream,
    done: CompletionFlag,
}

impl Connection {
    pub fn new(id: ConnectionId, client: TcpStream, peer_addr: SocketAddr) -> Self {
        Self {
            id,
            peer_addr,
            client,
            done: CompletionFlag::new(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// A handle to this connection's completion flag
    pub fn completion(&self) -> CompletionFlag {
        self.done.clone()
    }

    pub(crate) fn into_parts(self) -> (ConnectionId, SocketAddr, TcpStream, CompletionFlag) {
        (self.id, self.peer_addr, self.client, self.done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_id_generator() {
        let gen = ConnectionIdGenerator::new();
        let first = gen.generate();
        assert_eq!(first.as_u64(), 1);
        assert_eq!(first.to_string(), "conn-1");

        let cloned = gen.clone();
        assert_eq!(cloned.generate().as_u64(), 2);
        assert_eq!(gen.generate().as_u64(), 3);
    }

    #[test]
    fn test_completion_flag_shared_between_clones() {
        let flag = CompletionFlag::new();
        let observer = flag.clone();
        assert!(!observer.is_set());
        flag.set();
        assert!(observer.is_set());
    }

    #[test]
    fn test_mark_done_on_drop() {
        let flag = CompletionFlag::new();
        {
            let _guard = MarkDoneOnDrop::new(flag.clone());
            assert!(!flag.is_set());
        }
        assert!(flag.is_set());
    }

    #[test]
    fn test_mark_done_on_panic() {
        let flag = CompletionFlag::new();
        let inner = flag.clone();
        let result = std::panic::catch_unwind(move || {
            let _guard = MarkDoneOnDrop::new(inner);
            panic!("worker blew up");
        });
        assert!(result.is_err());
        assert!(flag.is_set());
    }
}
