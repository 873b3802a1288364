//! Narrow metrics surface.
//!
//! The Prometheus HTTP exporter is an external collaborator (see
//! `spec.md` §1) and is not implemented here. What the core needs is a
//! seam it can call into on every accept/close/byte/error event; this
//! module defines that seam as a trait plus one trivial
//! atomic-counter implementation, so tests and a future exporter can
//! both consume [`PoolStats`]-shaped snapshots without the core caring
//! which process actually serves `/metrics`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::pool::PoolStats;

/// Direction label for `bytes_transferred_total`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToServer,
    ServerToClient,
}

/// Type label for `errors_total`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Connection,
    Auth,
    Proxy,
    ConnectionRelease,
}

/// Everything the core reports; an implementation maps these to
/// whatever wire format it likes (Prometheus, StatsD, a test spy).
pub trait ProxyMetrics: Send + Sync {
    fn connection_accepted(&self);
    fn connection_rejected(&self);
    fn connection_closed(&self, duration: Duration);
    fn bytes_transferred(&self, direction: Direction, count: u64);
    fn pool_snapshot(&self, stats: PoolStats);
    fn error(&self, kind: ErrorKind);
}

/// Default in-process implementation backed by atomics. Good enough for
/// tests and for a future exporter to read via [`AtomicMetrics::snapshot`].
#[derive(Default)]
pub struct AtomicMetrics {
    connections_accepted: AtomicU64,
    connections_rejected: AtomicU64,
    active_connections: AtomicU64,
    connections_closed: AtomicU64,
    connection_duration_millis_total: AtomicU64,
    client_to_server_bytes: AtomicU64,
    server_to_client_bytes: AtomicU64,
    connection_errors: AtomicU64,
    auth_errors: AtomicU64,
    proxy_errors: AtomicU64,
    connection_release_errors: AtomicU64,
    last_pool_stats: std::sync::Mutex<Option<PoolStats>>,
}

impl AtomicMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active_connections(&self) -> u64 {
        self.active_connections.load(Ordering::Relaxed)
    }

    pub fn connections_accepted(&self) -> u64 {
        self.connections_accepted.load(Ordering::Relaxed)
    }

    pub fn connections_rejected(&self) -> u64 {
        self.connections_rejected.load(Ordering::Relaxed)
    }

    pub fn connections_closed(&self) -> u64 {
        self.connections_closed.load(Ordering::Relaxed)
    }

    /// Mean `connection_duration_seconds` across every closed session so far.
    pub fn average_connection_duration(&self) -> Duration {
        let closed = self.connections_closed.load(Ordering::Relaxed);
        if closed == 0 {
            return Duration::ZERO;
        }
        let total_millis = self.connection_duration_millis_total.load(Ordering::Relaxed);
        Duration::from_millis(total_millis / closed)
    }

    pub fn bytes_transferred(&self, direction: Direction) -> u64 {
        match direction {
            Direction::ClientToServer => self.client_to_server_bytes.load(Ordering::Relaxed),
            Direction::ServerToClient => self.server_to_client_bytes.load(Ordering::Relaxed),
        }
    }

    pub fn errors(&self, kind: ErrorKind) -> u64 {
        match kind {
            ErrorKind::Connection => self.connection_errors.load(Ordering::Relaxed),
            ErrorKind::Auth => self.auth_errors.load(Ordering::Relaxed),
            ErrorKind::Proxy => self.proxy_errors.load(Ordering::Relaxed),
            ErrorKind::ConnectionRelease => self.connection_release_errors.load(Ordering::Relaxed),
        }
    }

    pub fn last_pool_snapshot(&self) -> Option<PoolStats> {
        self.last_pool_stats.lock().unwrap().clone()
    }
}

impl ProxyMetrics for AtomicMetrics {
    fn connection_accepted(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    fn connection_rejected(&self) {
        self.connections_rejected.fetch_add(1, Ordering::Relaxed);
    }

    fn connection_closed(&self, duration: Duration) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
        self.connection_duration_millis_total
            .fetch_add(duration.as_millis() as u64, Ordering::Relaxed);
    }

    fn bytes_transferred(&self, direction: Direction, count: u64) {
        match direction {
            Direction::ClientToServer => self.client_to_server_bytes.fetch_add(count, Ordering::Relaxed),
            Direction::ServerToClient => self.server_to_client_bytes.fetch_add(count, Ordering::Relaxed),
        };
    }

    fn pool_snapshot(&self, stats: PoolStats) {
        *self.last_pool_stats.lock().unwrap() = Some(stats);
    }

    fn error(&self, kind: ErrorKind) {
        match kind {
            ErrorKind::Connection => &self.connection_errors,
            ErrorKind::Auth => &self.auth_errors,
            ErrorKind::Proxy => &self.proxy_errors,
            ErrorKind::ConnectionRelease => &self.connection_release_errors,
        }
        .fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_connections_returns_to_pre_session_value() {
        let metrics = AtomicMetrics::new();
        let before = metrics.active_connections();
        metrics.connection_accepted();
        assert_eq!(metrics.active_connections(), before + 1);
        metrics.connection_closed(Duration::from_millis(5));
        assert_eq!(metrics.active_connections(), before);
    }

    #[test]
    fn connection_closed_records_duration() {
        let metrics = AtomicMetrics::new();
        metrics.connection_accepted();
        metrics.connection_closed(Duration::from_millis(100));
        metrics.connection_accepted();
        metrics.connection_closed(Duration::from_millis(300));
        assert_eq!(metrics.connections_closed(), 2);
        assert_eq!(metrics.average_connection_duration(), Duration::from_millis(200));
    }

    #[test]
    fn byte_counters_are_monotonic_per_direction() {
        let metrics = AtomicMetrics::new();
        metrics.bytes_transferred(Direction::ClientToServer, 10);
        metrics.bytes_transferred(Direction::ClientToServer, 5);
        assert_eq!(metrics.bytes_transferred(Direction::ClientToServer), 15);
        assert_eq!(metrics.bytes_transferred(Direction::ServerToClient), 0);
    }
}
