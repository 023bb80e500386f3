//! Fixed-size pool of device connections.
//!
//! Every operation that talks to the device borrows exactly one connection.
//! Point operations hold it for one call; transactions and iterators hold it
//! for their whole life. The borrow is a [`PooledConnection`] guard that
//! returns the connection on drop, so release happens on every exit path
//! (early return, `?`, panic unwinding).
//!
//! The pool never fails under exhaustion: [`ConnectionPool::acquire`] blocks
//! until another borrower releases.

use std::collections::VecDeque;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::device::{Connection, ConnectionOptions, Connector};
use crate::error::{KvError, KvResult};

/// A fixed set of device connections shared by every store component.
///
/// The pool is an explicit object passed by `Arc`; idle + borrowed always
/// equals [`size`](Self::size).
pub struct ConnectionPool {
    idle: Mutex<VecDeque<Box<dyn Connection>>>,
    available: Condvar,
    size: usize,
}

impl ConnectionPool {
    /// Opens `size` connections with `options`.
    ///
    /// Fails with [`KvError::Connect`] on the first connection that cannot be
    /// established; connections opened so far are dropped.
    pub fn connect(
        connector: &dyn Connector,
        options: &ConnectionOptions,
        size: usize,
    ) -> KvResult<Arc<Self>> {
        if size == 0 {
            return Err(KvError::InvalidSettings(
                "connection pool size must be positive".to_string(),
            ));
        }
        let mut conns = Vec::with_capacity(size);
        for _ in 0..size {
            let conn = connector
                .connect(options)
                .map_err(|source| KvError::Connect {
                    host: options.host.clone(),
                    port: options.port,
                    source,
                })?;
            conns.push(conn);
        }
        tracing::info!(
            host = %options.host,
            port = options.port,
            connections = size,
            "device connection pool opened"
        );
        Ok(Self::from_connections(conns))
    }

    /// Builds a pool from already-open connections.
    ///
    /// # Panics
    ///
    /// Panics if `conns` is empty.
    pub fn from_connections(conns: Vec<Box<dyn Connection>>) -> Arc<Self> {
        assert!(!conns.is_empty(), "connection pool must not be empty");
        let size = conns.len();
        Arc::new(Self {
            idle: Mutex::new(conns.into()),
            available: Condvar::new(),
            size,
        })
    }

    /// Borrows a connection, blocking until one is idle.
    pub fn acquire(self: &Arc<Self>) -> PooledConnection {
        let mut idle = self.lock_idle();
        loop {
            if let Some(conn) = idle.pop_front() {
                return PooledConnection::new(conn, Arc::clone(self));
            }
            idle = self
                .available
                .wait(idle)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Borrows a connection, giving up after `timeout`.
    pub fn acquire_timeout(self: &Arc<Self>, timeout: Duration) -> Option<PooledConnection> {
        let deadline = Instant::now() + timeout;
        let mut idle = self.lock_idle();
        loop {
            if let Some(conn) = idle.pop_front() {
                return Some(PooledConnection::new(conn, Arc::clone(self)));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            idle = self
                .available
                .wait_timeout(idle, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Number of connections currently idle.
    pub fn idle(&self) -> usize {
        self.lock_idle().len()
    }

    /// Total number of connections owned by the pool.
    pub fn size(&self) -> usize {
        self.size
    }

    fn release(&self, conn: Box<dyn Connection>) {
        let mut idle = self.lock_idle();
        idle.push_back(conn);
        debug_assert!(idle.len() <= self.size, "more connections returned than lent");
        drop(idle);
        self.available.notify_one();
    }

    // A panic while holding the lock cannot leave the deque half-updated, and
    // release must keep working during unwinding.
    fn lock_idle(&self) -> MutexGuard<'_, VecDeque<Box<dyn Connection>>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("size", &self.size)
            .field("idle", &self.idle())
            .finish()
    }
}

/// A connection exclusively borrowed from a [`ConnectionPool`].
pub struct PooledConnection {
    conn: Option<Box<dyn Connection>>,
    pool: Arc<ConnectionPool>,
}

impl PooledConnection {
    fn new(conn: Box<dyn Connection>, pool: Arc<ConnectionPool>) -> Self {
        Self {
            conn: Some(conn),
            pool,
        }
    }
}

impl Deref for PooledConnection {
    type Target = dyn Connection;

    fn deref(&self) -> &Self::Target {
        self.conn
            .as_deref()
            .expect("pooled connection is present until drop")
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn
            .as_deref_mut()
            .expect("pooled connection is present until drop")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn);
        }
    }
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection").finish_non_exhaustive()
    }
}
