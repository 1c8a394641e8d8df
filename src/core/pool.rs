//! Idle connection cache keyed by route.
//!
//! Every live connection is registered here together with the number of
//! exchanges currently holding it. A connection is handed out as a [`Lease`];
//! dropping or releasing the lease is the only way its count goes down, and a
//! connection with a non-zero count is never evicted. Idle connections expire
//! after the keep-alive duration, and when more than `max_idle` are idle the
//! oldest ones go first.
use std::{
    fmt,
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use tokio::task::JoinHandle;
use tracing::debug;

use crate::core::{
    connection::{ConnectionId, RealConnection},
    route::Route,
};

struct PoolEntry {
    connection: Arc<RealConnection>,
    allocations: usize,
    /// Only meaningful while `allocations == 0`
    idle_since: Instant,
    /// Set when the connection must not carry another exchange
    no_new_exchanges: bool,
}

impl PoolEntry {
    fn is_idle(&self) -> bool {
        self.allocations == 0
    }
}

#[derive(Default)]
struct PoolInner {
    entries: Vec<PoolEntry>,
}

/// Snapshot of pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    pub total_connections: usize,
    pub idle_connections: usize,
    pub in_use_connections: usize,
    pub oldest_idle: Option<Duration>,
}

pub struct ConnectionPool {
    max_idle: usize,
    keep_alive: Duration,
    inner: Mutex<PoolInner>,
    next_id: AtomicU64,
}

impl ConnectionPool {
    pub fn new(max_idle: usize, keep_alive: Duration) -> Self {
        Self {
            max_idle,
            keep_alive,
            inner: Mutex::new(PoolInner::default()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn max_idle(&self) -> usize {
        self.max_idle
    }

    pub fn keep_alive(&self) -> Duration {
        self.keep_alive
    }

    fn lock(&self) -> MutexGuard<'_, PoolInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Allocate the id for a connection about to be established
    pub fn next_connection_id(&self) -> ConnectionId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Lease an idle, healthy connection for `route`, preferring the most recently idled one.
    ///
    /// Connections that fail the health check are evicted and the search continues.
    pub fn acquire(self: &Arc<Self>, route: &Route) -> Option<Lease> {
        self.cleanup(Instant::now());
        loop {
            let candidate = {
                let mut inner = self.lock();
                let index = inner
                    .entries
                    .iter()
                    .enumerate()
                    .filter(|(_, e)| {
                        e.connection.route() == route
                            && !e.no_new_exchanges
                            && e.allocations < e.connection.allocation_limit()
                    })
                    .max_by_key(|(_, e)| e.idle_since)
                    .map(|(index, _)| index)?;
                let entry = &mut inner.entries[index];
                entry.allocations += 1;
                entry.connection.clone()
            };

            if candidate.is_healthy() {
                debug!(
                    connection.id = candidate.id(),
                    route = %route,
                    "Reusing pooled connection"
                );
                return Some(Lease::new(self.clone(), candidate, true));
            }

            debug!(
                connection.id = candidate.id(),
                route = %route,
                "Evicting pooled connection that failed the health check"
            );
            self.release(candidate.id(), true);
        }
    }

    /// Register a freshly established connection, already leased to the caller
    pub fn insert_leased(self: &Arc<Self>, connection: RealConnection) -> Lease {
        let connection = Arc::new(connection);
        self.lock().entries.push(PoolEntry {
            connection: connection.clone(),
            allocations: 1,
            idle_since: Instant::now(),
            no_new_exchanges: false,
        });
        Lease::new(self.clone(), connection, false)
    }

    /// Give back one allocation of connection `id`.
    ///
    /// With `evict` set, or once the connection was marked unusable, it is
    /// removed when its last allocation is released. Returns whether the
    /// connection is now idle in the pool. Releasing a connection that is
    /// already idle (or unknown) does nothing.
    pub fn release(&self, id: ConnectionId, evict: bool) -> bool {
        let mut inner = self.lock();
        let Some(index) = inner.entries.iter().position(|e| e.connection.id() == id) else {
            return false;
        };
        let entry = &mut inner.entries[index];
        if entry.allocations == 0 {
            return false;
        }
        entry.allocations -= 1;
        if evict {
            entry.no_new_exchanges = true;
        }
        if entry.allocations > 0 {
            return false;
        }
        if entry.no_new_exchanges || self.max_idle == 0 {
            inner.entries.swap_remove(index);
            debug!(connection.id = id, "Evicted connection on release");
            return false;
        }
        entry.idle_since = Instant::now();
        self.trim_idle(&mut inner);
        let pooled = inner.entries.iter().any(|e| e.connection.id() == id);
        if pooled {
            debug!(connection.id = id, "Connection returned to pool");
        }
        pooled
    }

    fn trim_idle(&self, inner: &mut PoolInner) {
        loop {
            let idle = inner.entries.iter().filter(|e| e.is_idle()).count();
            if idle <= self.max_idle {
                return;
            }
            let oldest = inner
                .entries
                .iter()
                .enumerate()
                .filter(|(_, e)| e.is_idle())
                .min_by_key(|(_, e)| e.idle_since)
                .map(|(index, _)| index);
            let Some(index) = oldest else {
                return;
            };
            let evicted = inner.entries.swap_remove(index);
            debug!(
                connection.id = evicted.connection.id(),
                max_idle = self.max_idle,
                "Evicted oldest idle connection over capacity"
            );
        }
    }

    /// Evict idle connections past the keep-alive limit and trim to `max_idle`.
    ///
    /// Returns how long until the next idle connection could expire, or `None`
    /// when nothing is idle.
    pub fn cleanup(&self, now: Instant) -> Option<Duration> {
        let mut inner = self.lock();
        let keep_alive = self.keep_alive;
        let before = inner.entries.len();
        inner.entries.retain(|e| {
            !(e.is_idle() && now.saturating_duration_since(e.idle_since) >= keep_alive)
        });
        let expired = before - inner.entries.len();
        if expired > 0 {
            debug!(expired, "Evicted idle connections past keep-alive");
        }
        self.trim_idle(&mut inner);

        inner
            .entries
            .iter()
            .filter(|e| e.is_idle())
            .map(|e| keep_alive.saturating_sub(now.saturating_duration_since(e.idle_since)))
            .min()
    }

    /// Close every idle connection; connections in use are closed once released.
    pub fn evict_all(&self) -> usize {
        let mut inner = self.lock();
        for entry in inner.entries.iter_mut() {
            entry.no_new_exchanges = true;
        }
        let before = inner.entries.len();
        inner.entries.retain(|e| !e.is_idle());
        before - inner.entries.len()
    }

    /// Run [`ConnectionPool::cleanup`] in the background until the pool is dropped
    pub fn spawn_cleanup(self: &Arc<Self>) -> JoinHandle<()> {
        let pool = Arc::downgrade(self);
        let keep_alive = self.keep_alive;
        tokio::spawn(async move {
            loop {
                let wait = match pool.upgrade() {
                    Some(pool) => pool.cleanup(Instant::now()).unwrap_or(keep_alive),
                    None => break,
                };
                tokio::time::sleep(wait.max(Duration::from_millis(1))).await;
            }
            debug!("Connection pool dropped; cleanup task exiting");
        })
    }

    pub fn connection_count(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn idle_count(&self) -> usize {
        self.lock().entries.iter().filter(|e| e.is_idle()).count()
    }

    pub fn stats(&self) -> PoolStats {
        let inner = self.lock();
        let now = Instant::now();
        let idle = inner.entries.iter().filter(|e| e.is_idle());
        PoolStats {
            total_connections: inner.entries.len(),
            idle_connections: idle.clone().count(),
            in_use_connections: inner.entries.iter().filter(|e| !e.is_idle()).count(),
            oldest_idle: idle.map(|e| now.saturating_duration_since(e.idle_since)).max(),
        }
    }
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("max_idle", &self.max_idle)
            .field("keep_alive", &self.keep_alive)
            .field("stats", &self.stats())
            .finish()
    }
}

/// Claim on one allocation of a pooled connection.
///
/// Dropping a lease without calling [`Lease::release`] evicts the connection:
/// an exchange abandoned midway leaves the stream in an unknown state.
pub struct Lease {
    pool: Arc<ConnectionPool>,
    connection: Arc<RealConnection>,
    reused: bool,
    released: bool,
}

impl Lease {
    fn new(pool: Arc<ConnectionPool>, connection: Arc<RealConnection>, reused: bool) -> Self {
        Self {
            pool,
            connection,
            reused,
            released: false,
        }
    }

    pub fn connection(&self) -> &Arc<RealConnection> {
        &self.connection
    }

    pub fn id(&self) -> ConnectionId {
        self.connection.id()
    }

    pub fn route(&self) -> &Route {
        self.connection.route()
    }

    /// Whether the connection came out of the pool rather than being freshly connected
    pub fn is_reused(&self) -> bool {
        self.reused
    }

    /// Return the connection for reuse. Returns whether it is now pooled.
    pub fn release(mut self) -> bool {
        self.released = true;
        self.pool.release(self.connection.id(), false)
    }

    /// Give up the allocation and close the connection once nothing else holds it.
    pub fn evict(mut self) {
        self.released = true;
        self.pool.release(self.connection.id(), true);
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if !self.released {
            self.pool.release(self.connection.id(), true);
        }
    }
}

impl fmt::Debug for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("connection", &self.connection.id())
            .field("reused", &self.reused)
            .finish()
    }
}
