//! One reusable connection per remote endpoint.

use crate::error::{ConnectionError, Result};
use crate::protocol::CodecKind;
use crate::transport::connection::{Connection, PoolConfig};
use crate::transport::pending::PendingCalls;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info};

/// Type alias for the live connections map.
type ConnectionsMap = Arc<DashMap<SocketAddr, Arc<Connection>>>;

/// Per-address connect locks.
type ConnectLocks = DashMap<SocketAddr, Arc<Mutex<()>>>;

/// A caller's stake in an address's connect lock. On drop, the lock entry
/// is removed once no other caller holds or awaits it.
struct Connecting<'a> {
    locks: &'a ConnectLocks,
    addr: SocketAddr,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for Connecting<'_> {
    fn drop(&mut self) {
        self.guard.take();
        self.locks
            .remove_if(&self.addr, |_, lock| Arc::strong_count(lock) == 1);
    }
}

/// Caches one connection per address.
///
/// Lookups of a healthy connection only take a shard read lock. Creating a
/// connection is serialized per address, so concurrent callers for the same
/// endpoint share one connect attempt while other endpoints connect in
/// parallel. Dead connections evict themselves.
pub struct ConnectionPool {
    config: PoolConfig,
    codec: CodecKind,
    connections: ConnectionsMap,
    connecting: ConnectLocks,
    pending: PendingCalls,
    next_id: AtomicU64,
    shutdown: AtomicBool,
}

impl ConnectionPool {
    /// Create a new connection pool whose connections route responses into
    /// `pending`.
    #[must_use]
    pub fn new(config: PoolConfig, codec: CodecKind, pending: PendingCalls) -> Self {
        Self {
            config,
            codec,
            connections: Arc::new(DashMap::new()),
            connecting: DashMap::new(),
            pending,
            next_id: AtomicU64::new(0),
            shutdown: AtomicBool::new(false),
        }
    }

    /// Get the connection for `addr`, connecting if there is none.
    ///
    /// # Errors
    ///
    /// Returns a [`ConnectionError`] if connecting fails; nothing is cached
    /// in that case.
    pub async fn acquire(&self, addr: SocketAddr) -> Result<Arc<Connection>> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(ConnectionError::ShuttingDown.into());
        }

        if let Some(conn) = self.get(addr) {
            return Ok(conn);
        }

        let lock = Arc::clone(self.connecting.entry(addr).or_default().value());
        let mut connecting = Connecting {
            locks: &self.connecting,
            addr,
            guard: None,
        };
        connecting.guard = Some(lock.lock_owned().await);

        // Whoever held the lock before us may have connected already
        if let Some(conn) = self.get(addr) {
            return Ok(conn);
        }
        if self.shutdown.load(Ordering::Acquire) {
            return Err(ConnectionError::ShuttingDown.into());
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let connections = Arc::clone(&self.connections);
        let conn = Connection::open(
            id,
            addr,
            &self.config,
            self.codec,
            self.pending.clone(),
            Box::new(move |id| {
                if connections
                    .remove_if(&addr, |_, conn| conn.id() == id)
                    .is_some()
                {
                    debug!("evicted connection {} to {}", id, addr);
                }
            }),
        )
        .await?;

        self.connections.insert(addr, Arc::clone(&conn));
        info!("connected to {} (connection {})", addr, id);

        Ok(conn)
    }

    /// The cached, still-open connection for `addr`, if any.
    #[must_use]
    pub fn get(&self, addr: SocketAddr) -> Option<Arc<Connection>> {
        let conn = self.connections.get(&addr).map(|c| Arc::clone(c.value()))?;
        if conn.is_open() {
            return Some(conn);
        }

        // Closed before its read task could evict it
        self.connections
            .remove_if(&addr, |_, c| c.id() == conn.id());
        None
    }

    /// Number of cached connections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Whether no connection is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Close every connection and refuse new ones.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);

        let addrs: Vec<SocketAddr> = self.connections.iter().map(|e| *e.key()).collect();
        for addr in addrs {
            if let Some((_, conn)) = self.connections.remove(&addr) {
                conn.close();
            }
        }
        debug!("connection pool shut down");
    }
}
