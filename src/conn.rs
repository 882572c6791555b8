//! Per-connection state and the fd-keyed connection table.
//!
//! A `Connection` is shared between the reactor and at most one in-flight
//! worker via `Arc`. The table holds one handle; removal from the table is
//! the single destruction point, and the descriptor itself is closed when
//! the last handle drops, so a worker still finishing a response can never
//! write into a recycled fd.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::error::{ServerError, ServerResult};

/// Mutable per-connection fields, all guarded by one lock.
pub struct ConnState {
    /// Accumulated request bytes, bounded by the request size cap.
    pub read_buf: Vec<u8>,
    /// Staged response bytes.
    pub write_buf: Vec<u8>,
    /// How much of `write_buf` the kernel has accepted so far.
    pub write_offset: usize,
    /// True while a staged response has not fully drained.
    pub has_pending_write: bool,
    /// Interlock: true while a worker owns the logical request.
    pub processing: bool,
    /// Derived from the last parsed request.
    pub keep_alive: bool,
    /// Refreshed on every successful read or send.
    pub last_activity: Instant,
}

pub struct Connection {
    fd: RawFd,
    peer: SocketAddr,
    state: Mutex<ConnState>,
}

impl Connection {
    pub fn new(fd: RawFd, peer: SocketAddr) -> Self {
        Self {
            fd,
            peer,
            state: Mutex::new(ConnState {
                read_buf: Vec::new(),
                write_buf: Vec::new(),
                write_offset: 0,
                has_pending_write: false,
                processing: false,
                keep_alive: false,
                last_activity: Instant::now(),
            }),
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn lock(&self) -> MutexGuard<'_, ConnState> {
        self.state.lock().unwrap()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        crate::sock::close(self.fd);
    }
}

/// Shared `fd -> Connection` map with a hard capacity.
pub struct ConnectionTable {
    max_connections: usize,
    inner: Mutex<HashMap<RawFd, Arc<Connection>>>,
}

impl ConnectionTable {
    pub fn new(max_connections: usize) -> Self {
        Self {
            max_connections,
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Insert a fresh connection; refused at capacity.
    pub fn insert(&self, conn: Arc<Connection>) -> ServerResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.len() >= self.max_connections {
            return Err(ServerError::TableFull);
        }
        inner.insert(conn.fd(), conn);
        Ok(())
    }

    pub fn get(&self, fd: RawFd) -> Option<Arc<Connection>> {
        self.inner.lock().unwrap().get(&fd).cloned()
    }

    /// Remove and return the table's handle. Removing an absent fd is a
    /// no-op, which makes the close path idempotent.
    pub fn remove(&self, fd: RawFd) -> Option<Arc<Connection>> {
        self.inner.lock().unwrap().remove(&fd)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    /// Descriptors idle longer than `timeout` with no response in flight.
    /// Lock order here is table -> connection, never the reverse.
    pub fn collect_idle(&self, timeout: Duration) -> Vec<RawFd> {
        let now = Instant::now();
        let inner = self.inner.lock().unwrap();
        inner
            .values()
            .filter(|conn| {
                let state = conn.lock();
                !state.has_pending_write && now.duration_since(state.last_activity) > timeout
            })
            .map(|conn| conn.fd())
            .collect()
    }

    /// Empty the table, returning every handle for the caller to drop.
    pub fn drain(&self) -> Vec<Arc<Connection>> {
        let mut inner = self.inner.lock().unwrap();
        inner.drain().map(|(_, conn)| conn).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn dummy_peer() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 40000)
    }

    /// A connection over a throwaway pipe fd so Drop has something real
    /// to close.
    fn dummy_conn() -> (Arc<Connection>, RawFd) {
        let mut fds = [0 as RawFd; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        crate::sock::close(fds[1]);
        (Arc::new(Connection::new(fds[0], dummy_peer())), fds[0])
    }

    #[test]
    fn insert_get_remove_round_trip() {
        let table = ConnectionTable::new(10);
        let (conn, fd) = dummy_conn();

        table.insert(conn).unwrap();
        assert_eq!(table.len(), 1);
        assert!(table.get(fd).is_some());

        assert!(table.remove(fd).is_some());
        assert!(table.get(fd).is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn remove_is_idempotent() {
        let table = ConnectionTable::new(10);
        let (conn, fd) = dummy_conn();
        table.insert(conn).unwrap();

        assert!(table.remove(fd).is_some());
        assert!(table.remove(fd).is_none());
        assert!(table.remove(fd).is_none());
    }

    #[test]
    fn capacity_is_enforced() {
        let table = ConnectionTable::new(2);
        let (a, _) = dummy_conn();
        let (b, _) = dummy_conn();
        let (c, _) = dummy_conn();

        table.insert(a).unwrap();
        table.insert(b).unwrap();
        assert!(matches!(table.insert(c), Err(ServerError::TableFull)));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn idle_collection_skips_pending_writes() {
        let table = ConnectionTable::new(10);
        let (idle, idle_fd) = dummy_conn();
        let (writing, writing_fd) = dummy_conn();

        {
            let mut state = idle.lock();
            state.last_activity = Instant::now() - Duration::from_secs(60);
        }
        {
            let mut state = writing.lock();
            state.last_activity = Instant::now() - Duration::from_secs(60);
            state.has_pending_write = true;
        }

        table.insert(idle).unwrap();
        table.insert(writing).unwrap();

        let stale = table.collect_idle(Duration::from_secs(30));
        assert_eq!(stale, vec![idle_fd]);
        assert!(!stale.contains(&writing_fd));
    }

    #[test]
    fn drain_empties_the_table() {
        let table = ConnectionTable::new(10);
        let (a, _) = dummy_conn();
        let (b, _) = dummy_conn();
        table.insert(a).unwrap();
        table.insert(b).unwrap();

        let drained = table.drain();
        assert_eq!(drained.len(), 2);
        assert!(table.is_empty());
    }
}
