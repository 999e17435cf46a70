//! Registry of in-flight connection workers
//!
//! Owned and mutated by the listener alone, so it needs no locking. Workers
//! only ever touch their own completion flag.

use crate::connection::{CompletionFlag, Connection, ConnectionId};
use std::net::SocketAddr;
use tokio::task::JoinHandle;
use tracing::{debug, error};

struct Entry {
    id: ConnectionId,
    peer_addr: SocketAddr,
    done: CompletionFlag,
    worker: JoinHandle<()>,
}

/// Tracks active workers
pub struct Registry {
    entries: Vec<Entry>,
    limit: Option<usize>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            limit: None,
        }
    }

    /// A registry that refuses registration once `limit` workers are live,
    /// the same way it does when memory runs out.
    pub fn with_limit(limit: usize) -> Self {
        Self {
            entries: Vec::new(),
            limit: Some(limit),
        }
    }

    /// Record `conn` and start its worker with `start`.
    ///
    /// If there is no room for another entry the connection is handed back
    /// untouched and no worker is started.
    pub fn register<F>(&mut self, conn: Connection, start: F) -> Result<ConnectionId, Connection>
    where
        F: FnOnce(Connection) -> JoinHandle<()>,
    {
        if self.limit.is_some_and(|limit| self.entries.len() >= limit) {
            return Err(conn);
        }
        if self.entries.try_reserve(1).is_err() {
            return Err(conn);
        }

        let id = conn.id();
        let peer_addr = conn.peer_addr();
        let done = conn.completion();
        let worker = start(conn);

        self.entries.push(Entry {
            id,
            peer_addr,
            done,
            worker,
        });
        Ok(id)
    }

    /// Join and drop every worker that has marked itself done.
    ///
    /// Returns how many entries were removed.
    pub async fn prune_completed(&mut self) -> usize {
        let mut finished = Vec::new();
        let mut i = 0;
        while i < self.entries.len() {
            if self.entries[i].done.is_set() {
                finished.push(self.entries.swap_remove(i));
            } else {
                i += 1;
            }
        }

        let removed = finished.len();
        for entry in finished {
            match entry.worker.await {
                Ok(()) => debug!("Reaped {} ({})", entry.id, entry.peer_addr),
                Err(e) if e.is_panic() => {
                    error!("Worker for {} ({}) panicked", entry.id, entry.peer_addr)
                }
                Err(e) => debug!("Worker for {} ended: {}", entry.id, e),
            }
        }
        removed
    }

    /// Abort every worker. Used when the process is shutting down.
    pub fn abort_all(&mut self) {
        for entry in self.entries.drain(..) {
            entry.worker.abort();
        }
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.entries.iter().any(|entry| entry.id == id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
