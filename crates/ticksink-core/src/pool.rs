//! Bounded pool of store connections.
//!
//! A thin adapter over [`r2d2`]: connections are opened through a
//! [`ConnectionFactory`] and handed out as [`PooledConnection`] guards that
//! return themselves to the pool on drop. r2d2 owns checkout, liveness
//! probing, idle reaping and refilling to `min_idle`; this module maps
//! [`PoolConfig`] onto it and keeps the counters the engine reports.

use crate::config::PoolConfig;
use crate::error::{PoolError, StoreError};
use crate::store::{ConnectionFactory, StoreConnection};
use parking_lot::RwLock;
use r2d2::event::{AcquireEvent, ReleaseEvent, TimeoutEvent};
use r2d2::{HandleError, HandleEvent, ManageConnection};
use serde::Serialize;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Point-in-time pool occupancy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    pub open: usize,
    pub idle: usize,
    pub active: usize,
    pub max: usize,
}

#[derive(Debug, Default)]
struct PoolStats {
    created: AtomicU64,
    discarded: AtomicU64,
    acquire_timeouts: AtomicU64,
    /// Set while the most recent connect attempt failed
    connect_failing: AtomicBool,
}

/// Lifetime pool counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolCounters {
    pub created: u64,
    pub discarded: u64,
    pub acquire_timeouts: u64,
}

/// What r2d2 holds for each open connection.
pub struct ManagedConnection {
    conn: Box<dyn StoreConnection>,
    broken: bool,
}

/// r2d2 connection manager over a [`ConnectionFactory`].
pub struct StoreManager {
    factory: Arc<dyn ConnectionFactory>,
    stats: Arc<PoolStats>,
}

impl ManageConnection for StoreManager {
    type Connection = ManagedConnection;
    type Error = StoreError;

    fn connect(&self) -> Result<Self::Connection, Self::Error> {
        match self.factory.connect() {
            Ok(conn) => {
                self.stats.connect_failing.store(false, Ordering::Relaxed);
                Ok(ManagedConnection {
                    conn,
                    broken: false,
                })
            }
            Err(e) => {
                self.stats.connect_failing.store(true, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    fn is_valid(&self, conn: &mut Self::Connection) -> Result<(), Self::Error> {
        conn.conn.ping()
    }

    fn has_broken(&self, conn: &mut Self::Connection) -> bool {
        conn.broken
    }
}

/// Logs connect and probe failures r2d2 would otherwise swallow.
#[derive(Debug)]
struct LogErrors;

impl HandleError<StoreError> for LogErrors {
    fn handle_error(&self, error: StoreError) {
        warn!(error = %error, "Store connection error");
    }
}

/// Feeds r2d2 lifecycle events into [`PoolStats`].
#[derive(Debug)]
struct CountEvents(Arc<PoolStats>);

impl HandleEvent for CountEvents {
    fn handle_acquire(&self, event: AcquireEvent) {
        self.0.created.fetch_add(1, Ordering::Relaxed);
        debug!(id = event.connection_id(), "Opened pooled connection");
    }

    fn handle_release(&self, event: ReleaseEvent) {
        self.0.discarded.fetch_add(1, Ordering::Relaxed);
        debug!(
            id = event.connection_id(),
            age_ms = event.age().as_millis() as u64,
            "Closed pooled connection"
        );
    }

    fn handle_timeout(&self, event: TimeoutEvent) {
        self.0.acquire_timeouts.fetch_add(1, Ordering::Relaxed);
        warn!(
            waited_ms = event.timeout().as_millis() as u64,
            "Timed out waiting for a pooled connection"
        );
    }
}

/// r2d2 rejects zero durations; zero here means "never".
fn non_zero(duration: Duration) -> Option<Duration> {
    (!duration.is_zero()).then_some(duration)
}

/// Bounded set of reusable store connections.
pub struct ConnectionPool {
    inner: RwLock<Option<r2d2::Pool<StoreManager>>>,
    stats: Arc<PoolStats>,
    target: String,
    max: usize,
}

impl ConnectionPool {
    /// Open the pool and pre-create `min_idle` connections.
    ///
    /// One connection is opened and probed up front, so an unreachable
    /// store fails here rather than on the first flush.
    pub fn open(factory: Arc<dyn ConnectionFactory>, config: PoolConfig) -> Result<Self, PoolError> {
        let mut probe = factory
            .connect()
            .map_err(|e| PoolError::Unavailable(e.to_string()))?;
        probe
            .ping()
            .map_err(|e| PoolError::Unavailable(e.to_string()))?;
        drop(probe);

        let stats = Arc::new(PoolStats::default());
        let target = factory.describe();
        let manager = StoreManager {
            factory,
            stats: Arc::clone(&stats),
        };

        let pool = r2d2::Pool::builder()
            .max_size(config.max_pool_connections as u32)
            .min_idle(Some(config.min_idle as u32))
            .connection_timeout(config.acquire_timeout())
            .idle_timeout(non_zero(config.idle_timeout()))
            .max_lifetime(non_zero(config.max_lifetime()))
            .test_on_check_out(config.test_on_acquire)
            .error_handler(Box::new(LogErrors))
            .event_handler(Box::new(CountEvents(Arc::clone(&stats))))
            .build(manager)
            .map_err(|e| PoolError::Unavailable(e.to_string()))?;

        info!(
            target = %target,
            idle = pool.state().idle_connections,
            max = config.max_pool_connections,
            "Connection pool opened"
        );
        Ok(Self {
            inner: RwLock::new(Some(pool)),
            stats,
            target,
            max: config.max_pool_connections,
        })
    }

    /// Check out a connection, waiting up to the acquire timeout.
    pub fn acquire(&self) -> Result<PooledConnection, PoolError> {
        let pool = self.inner.read().clone().ok_or(PoolError::Closed)?;
        let started = Instant::now();

        match pool.get() {
            Ok(inner) => Ok(PooledConnection { inner }),
            Err(e) if self.stats.connect_failing.load(Ordering::Relaxed) => {
                Err(PoolError::Unavailable(e.to_string()))
            }
            Err(_) => Err(PoolError::AcquireTimeout {
                waited_ms: started.elapsed().as_millis() as u64,
            }),
        }
    }

    /// Current occupancy.
    pub fn status(&self) -> PoolStatus {
        let Some(pool) = self.inner.read().clone() else {
            return PoolStatus {
                max: self.max,
                ..PoolStatus::default()
            };
        };
        let state = pool.state();
        let open = state.connections as usize;
        let idle = state.idle_connections as usize;
        PoolStatus {
            open,
            idle,
            active: open.saturating_sub(idle),
            max: self.max,
        }
    }

    /// Lifetime counters.
    pub fn counters(&self) -> PoolCounters {
        PoolCounters {
            created: self.stats.created.load(Ordering::Relaxed),
            discarded: self.stats.discarded.load(Ordering::Relaxed),
            acquire_timeouts: self.stats.acquire_timeouts.load(Ordering::Relaxed),
        }
    }

    /// Whether `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.read().is_none()
    }

    /// Close the pool. Idle connections are dropped now, checked-out ones
    /// when they are returned.
    pub fn close(&self) {
        if let Some(pool) = self.inner.write().take() {
            let idle = pool.state().idle_connections;
            drop(pool);
            info!(closed_idle = idle, "Connection pool closed");
        }
    }

    /// Store target, for logs.
    pub fn describe(&self) -> String {
        self.target.clone()
    }
}

/// A checked-out connection. Returns to the pool on drop.
pub struct PooledConnection {
    inner: r2d2::PooledConnection<StoreManager>,
}

impl PooledConnection {
    /// Discard this connection instead of returning it to the pool.
    pub fn mark_broken(&mut self) {
        self.inner.broken = true;
    }
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("broken", &self.inner.broken)
            .finish_non_exhaustive()
    }
}

impl Deref for PooledConnection {
    type Target = dyn StoreConnection;

    fn deref(&self) -> &Self::Target {
        &*self.inner.conn
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut *self.inner.conn
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::thread;

    fn config(max: usize, min_idle: usize, timeout_ms: u64) -> PoolConfig {
        PoolConfig {
            max_pool_connections: max,
            min_idle,
            connection_acquire_timeout_ms: timeout_ms,
            ..PoolConfig::default()
        }
    }

    #[test]
    fn test_open_prewarms_min_idle() {
        let pool =
            ConnectionPool::open(Arc::new(MemoryStore::new()), config(5, 2, 500)).unwrap();
        let status = pool.status();
        assert!(status.idle >= 2);
        assert_eq!(status.active, 0);
        assert_eq!(status.max, 5);
        assert!(pool.counters().created >= 2);
    }

    #[test]
    fn test_open_fails_when_store_unreachable() {
        let store = MemoryStore::new();
        store.refuse_next_connects(1);
        let result = ConnectionPool::open(Arc::new(store), config(5, 2, 100));
        assert!(matches!(result, Err(PoolError::Unavailable(_))));
    }

    #[test]
    fn test_connections_are_reused() {
        let store = MemoryStore::new();
        let pool = ConnectionPool::open(Arc::new(store.clone()), config(1, 1, 500)).unwrap();
        let opened = store.connects();
        for _ in 0..5 {
            let mut conn = pool.acquire().unwrap();
            conn.ping().unwrap();
            assert_eq!(pool.status().active, 1);
        }
        assert_eq!(store.connects(), opened);
        assert_eq!(pool.status().idle, 1);
    }

    #[test]
    fn test_acquire_times_out_when_exhausted() {
        let pool =
            ConnectionPool::open(Arc::new(MemoryStore::new()), config(1, 1, 50)).unwrap();
        let _held = pool.acquire().unwrap();
        match pool.acquire() {
            Err(PoolError::AcquireTimeout { waited_ms }) => assert!(waited_ms >= 50),
            other => panic!("expected acquire timeout, got {other:?}"),
        }
        assert_eq!(pool.counters().acquire_timeouts, 1);
    }

    #[test]
    fn test_acquire_reports_unreachable_store() {
        let store = MemoryStore::new();
        let pool = ConnectionPool::open(Arc::new(store.clone()), config(1, 1, 100)).unwrap();
        store.fail_next_pings(u32::MAX);
        store.refuse_next_connects(u32::MAX);
        assert!(matches!(pool.acquire(), Err(PoolError::Unavailable(_))));
    }

    #[test]
    fn test_broken_connection_is_replaced() {
        let store = MemoryStore::new();
        let pool = ConnectionPool::open(Arc::new(store.clone()), config(1, 1, 500)).unwrap();
        let opened = store.connects();
        {
            let mut conn = pool.acquire().unwrap();
            conn.mark_broken();
            assert!(format!("{conn:?}").contains("broken: true"));
        }
        let _conn = pool.acquire().unwrap();
        assert!(store.connects() > opened);
        assert_eq!(pool.counters().discarded, 1);
    }

    #[test]
    fn test_failed_probe_discards_idle_connection() {
        let store = MemoryStore::new();
        let pool = ConnectionPool::open(Arc::new(store.clone()), config(1, 1, 500)).unwrap();
        store.fail_next_pings(1);
        let _conn = pool.acquire().unwrap();
        assert_eq!(pool.counters().discarded, 1);
    }

    #[test]
    fn test_waiter_wakes_on_release() {
        let pool = Arc::new(
            ConnectionPool::open(Arc::new(MemoryStore::new()), config(1, 1, 2_000)).unwrap(),
        );
        let held = pool.acquire().unwrap();

        let waiter = {
            let pool = Arc::clone(&pool);
            thread::spawn(move || pool.acquire().map(|_| ()).is_ok())
        };
        thread::sleep(Duration::from_millis(50));
        drop(held);
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn test_close_rejects_acquire() {
        let pool =
            ConnectionPool::open(Arc::new(MemoryStore::new()), config(2, 1, 100)).unwrap();
        let held = pool.acquire().unwrap();
        pool.close();
        assert!(pool.is_closed());
        assert!(matches!(pool.acquire(), Err(PoolError::Closed)));
        drop(held);
        assert_eq!(pool.status().open, 0);
    }
}
