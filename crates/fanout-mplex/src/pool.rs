//! Idle connection pool for one backend.
//!
//! Connections are checked out by caller threads for the duration of a
//! single send and handed back afterwards. The pool only keeps connections
//! that still report themselves valid; invalid ones are dropped on release
//! and evicted by a periodic sweep.
//!
//! The `active` and `passive` counters are best-effort statistics. They are
//! updated independently of the queue and are never used for correctness
//! decisions.

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use crossbeam_queue::SegQueue;
use tokio::runtime::Handle;
use tracing::{debug, warn};

/// What the pool needs from a connection.
///
/// Implemented by [`Connection`](crate::connection::Connection); tests use
/// lightweight mocks.
pub trait PooledConnection: Send + Sync + 'static {
    /// Diagnostic id.
    fn id(&self) -> u64;

    fn is_valid(&self) -> bool;

    /// Invalidate and close the underlying transport.
    fn close(&self) -> io::Result<()>;
}

/// Lock-free queue of idle connections plus usage counters.
pub struct ConnectionPool<T> {
    idle: SegQueue<Arc<T>>,
    active: AtomicUsize,
    passive: AtomicUsize,
}

impl<T: PooledConnection> ConnectionPool<T> {
    pub fn new() -> Self {
        Self {
            idle: SegQueue::new(),
            active: AtomicUsize::new(0),
            passive: AtomicUsize::new(0),
        }
    }

    /// Take an idle connection, if any.
    pub fn get_connection(&self) -> Option<Arc<T>> {
        let connection = self.idle.pop()?;
        self.active.fetch_add(1, Ordering::Relaxed);
        decrement(&self.passive);
        Some(connection)
    }

    /// Hand a checked-out connection back.
    ///
    /// Invalid connections are dropped instead of being queued.
    pub fn release_connection(&self, connection: Arc<T>) {
        decrement(&self.active);
        if connection.is_valid() {
            self.passive.fetch_add(1, Ordering::Relaxed);
            self.idle.push(connection);
        } else {
            debug!(connection = connection.id(), "dropping invalid connection on release");
        }
    }

    /// Account for a connection created outside the pool and checked out
    /// straight away.
    pub fn created_connection(&self) {
        self.active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    pub fn passive_connections(&self) -> usize {
        self.passive.load(Ordering::Relaxed)
    }

    /// Walk the idle queue once and drop every invalid connection.
    ///
    /// Returns the number of connections removed.
    pub fn sweep(&self) -> usize {
        let mut removed = 0;
        for _ in 0..self.idle.len() {
            let Some(connection) = self.idle.pop() else {
                break;
            };
            if connection.is_valid() {
                self.idle.push(connection);
            } else {
                decrement(&self.passive);
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(
                removed,
                remaining_idle = self.idle.len(),
                "swept invalid idle connections"
            );
        }
        removed
    }

    /// Close and remove every idle connection.
    ///
    /// A failure closing one connection is logged and does not stop the
    /// drain. Returns the number of connections drained.
    pub fn drain(&self) -> usize {
        let mut drained = 0;
        while let Some(connection) = self.idle.pop() {
            decrement(&self.passive);
            drained += 1;
            if let Err(e) = connection.close() {
                warn!(
                    connection = connection.id(),
                    error = %e,
                    "failed to close pooled connection"
                );
            }
        }
        drained
    }

    /// Run [`sweep`](Self::sweep) every `interval` on `handle`.
    ///
    /// The task holds a weak reference and ends once the pool is dropped.
    pub fn start_sweeper(self: &Arc<Self>, handle: &Handle, interval: Duration) {
        let pool: Weak<Self> = Arc::downgrade(self);
        handle.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(pool) = pool.upgrade() else {
                    debug!("connection pool dropped, sweeper exiting");
                    break;
                };
                pool.sweep();
            }
        });
    }
}

impl<T: PooledConnection> Default for ConnectionPool<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for ConnectionPool<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("active", &self.active.load(Ordering::Relaxed))
            .field("passive", &self.passive.load(Ordering::Relaxed))
            .finish()
    }
}

/// Saturating decrement; counters never go below zero.
fn decrement(counter: &AtomicUsize) {
    let _ = counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
        Some(n.saturating_sub(1))
    });
}
