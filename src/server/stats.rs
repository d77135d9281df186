//! Server Statistics
//!
//! Counters owned by one [`Server`](super::Server) instance and shared with
//! its connection tasks.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Connection counters for one server.
#[derive(Debug, Default)]
pub struct ServerStats {
    /// Total number of connections accepted
    pub connections_accepted: AtomicU64,
    /// Connections whose handler has not returned yet
    pub active_connections: AtomicU64,
    /// Accept errors that were retried
    pub transient_accept_errors: AtomicU64,
}

impl ServerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection_opened(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    /// Counts a connection as opened until the returned guard drops.
    ///
    /// The guard lives in the connection task, so the count also goes down
    /// when the handler panics.
    pub fn track(self: &Arc<Self>) -> ActiveConnection {
        self.connection_opened();
        ActiveConnection {
            stats: Arc::clone(self),
        }
    }

    pub fn accept_retried(&self) {
        self.transient_accept_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn accepted(&self) -> u64 {
        self.connections_accepted.load(Ordering::Relaxed)
    }

    pub fn active(&self) -> u64 {
        self.active_connections.load(Ordering::Relaxed)
    }

    pub fn retried(&self) -> u64 {
        self.transient_accept_errors.load(Ordering::Relaxed)
    }
}

/// Guard returned by [`ServerStats::track`].
#[derive(Debug)]
pub struct ActiveConnection {
    stats: Arc<ServerStats>,
}

impl Drop for ActiveConnection {
    fn drop(&mut self) {
        self.stats.connection_closed();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_close() {
        let stats = ServerStats::new();
        stats.connection_opened();
        stats.connection_opened();
        stats.connection_closed();

        assert_eq!(stats.accepted(), 2);
        assert_eq!(stats.active(), 1);
        assert_eq!(stats.retried(), 0);
    }

    #[test]
    fn test_track_guard() {
        let stats = Arc::new(ServerStats::new());
        let first = stats.track();
        let second = stats.track();
        assert_eq!(stats.active(), 2);

        drop(first);
        assert_eq!(stats.active(), 1);
        drop(second);
        assert_eq!(stats.active(), 0);
        assert_eq!(stats.accepted(), 2);
    }
}
