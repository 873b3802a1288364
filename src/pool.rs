//! Upstream connection pool.
//!
//! Maintains a bounded idle queue of health-checked TCP connections to
//! a single upstream `host:port`. Connections are whole `TcpStream`s —
//! the pool never splits a stream into read/write halves; that is the
//! session handler's job once it has borrowed a connection and wants
//! its two forwarders to run independently.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::Config;

const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(1);
const PING_FRAME: &[u8] = b"*1\r\n$4\r\nPING\r\n";
const PONG_REPLY: &[u8] = b"+PONG\r\n";
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("connect to upstream timed out")]
    Timeout,
    #[error("failed to connect to upstream: {source}")]
    ConnectFailed {
        #[source]
        source: std::io::Error,
    },
}

/// Cumulative, internally-consistent snapshot of pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub created: u64,
    pub reused: u64,
    pub failed_health_checks: u64,
    pub pool_hits: u64,
    pub pool_misses: u64,
    pub connections_closed: u64,
    pub current_idle: u64,
    pub pool_max: u64,
}

#[derive(Default)]
struct Counters {
    created: AtomicU64,
    reused: AtomicU64,
    failed_health_checks: AtomicU64,
    pool_hits: AtomicU64,
    pool_misses: AtomicU64,
    connections_closed: AtomicU64,
}

/// Bounded pool of idle upstream connections plus lifetime counters.
pub struct Pool {
    config: Arc<Config>,
    idle: Mutex<VecDeque<TcpStream>>,
    counters: Counters,
    shutdown: CancellationToken,
    maintenance: Mutex<Option<JoinHandle<()>>>,
}

impl Pool {
    pub fn new(config: Arc<Config>) -> Arc<Pool> {
        Arc::new(Pool {
            config,
            idle: Mutex::new(VecDeque::new()),
            counters: Counters::default(),
            shutdown: CancellationToken::new(),
            maintenance: Mutex::new(None),
        })
    }

    /// Start the maintenance worker and prewarm the idle queue. Prewarm
    /// failures are logged and counted but never fatal.
    pub async fn initialize(self: &Arc<Self>) {
        let handle = tokio::spawn(self.clone().maintenance_worker());
        *self.maintenance.lock().await = Some(handle);
        self.prewarm().await;
    }

    async fn prewarm(self: &Arc<Self>) {
        let n = self.config.pool_prewarm.min(self.config.pool_max);
        if n == 0 {
            return;
        }
        info!(count = n, "prewarming upstream connection pool");
        let mut set = tokio::task::JoinSet::new();
        for _ in 0..n {
            let pool = self.clone();
            set.spawn(async move { pool.create_connection().await });
        }
        let mut succeeded = 0usize;
        while let Some(result) = set.join_next().await {
            match result {
                Ok(Ok(conn)) => {
                    self.idle.lock().await.push_back(conn);
                    succeeded += 1;
                }
                Ok(Err(e)) => warn!(error = %e, "failed to prewarm upstream connection"),
                Err(e) => warn!(error = %e, "prewarm task panicked"),
            }
        }
        info!(succeeded, requested = n, "pool prewarm complete");
    }

    #[instrument(skip(self))]
    async fn create_connection(&self) -> Result<TcpStream, PoolError> {
        let addr = (self.config.upstream_host.as_str(), self.config.upstream_port);
        let connect = tokio::time::timeout(
            Duration::from_secs(self.config.pool_connect_timeout_seconds),
            TcpStream::connect(addr),
        );
        let stream = connect
            .await
            .map_err(|_| PoolError::Timeout)?
            .map_err(|source| PoolError::ConnectFailed { source })?;

        let sock_ref = SockRef::from(&stream);
        if let Err(e) = sock_ref.set_reuse_address(true) {
            debug!(error = %e, "SO_REUSEADDR not supported on this platform");
        }
        if let Err(e) = stream.set_nodelay(true) {
            warn!(error = %e, "failed to set TCP_NODELAY on upstream connection");
        }
        if self.config.pool_keepalive_enabled {
            let keepalive = TcpKeepalive::new()
                .with_time(Duration::from_secs(self.config.pool_keepalive_idle_seconds))
                .with_interval(Duration::from_secs(self.config.pool_keepalive_interval_seconds));
            #[cfg(any(
                target_os = "linux",
                target_os = "android",
                target_os = "macos",
                target_os = "ios",
                target_os = "freebsd",
                target_os = "netbsd"
            ))]
            let keepalive = keepalive.with_retries(self.config.pool_keepalive_probes);
            if let Err(e) = sock_ref.set_tcp_keepalive(&keepalive) {
                debug!(error = %e, "SO_KEEPALIVE tuning not supported on this platform");
            }
        }

        self.counters.created.fetch_add(1, Ordering::Relaxed);
        debug!(host = %self.config.upstream_host, port = self.config.upstream_port, "created upstream connection");
        Ok(stream)
    }

    /// RESP-level PING/PONG probe. Deliberately not a bare TCP check —
    /// this catches upstream-side logical closure and half-open
    /// terminator states that a socket write alone would miss.
    async fn is_healthy(stream: &mut TcpStream) -> bool {
        match stream.take_error() {
            Ok(Some(_)) | Err(_) => return false,
            Ok(None) => {}
        }

        let write = async {
            stream.write_all(PING_FRAME).await?;
            stream.flush().await
        };
        if tokio::time::timeout(HEALTH_CHECK_TIMEOUT, write).await.is_err() {
            return false;
        }

        let mut buf = [0u8; 1024];
        match tokio::time::timeout(HEALTH_CHECK_TIMEOUT, stream.read(&mut buf)).await {
            Ok(Ok(n)) => &buf[..n] == PONG_REPLY,
            _ => false,
        }
    }

    /// Borrow a connection, creating one if the idle queue is empty.
    pub async fn borrow(&self) -> Result<TcpStream, PoolError> {
        loop {
            let popped = self.idle.lock().await.pop_front();
            match popped {
                None => {
                    self.counters.pool_misses.fetch_add(1, Ordering::Relaxed);
                    return self.create_connection().await;
                }
                Some(mut conn) => {
                    self.counters.pool_hits.fetch_add(1, Ordering::Relaxed);
                    if Self::is_healthy(&mut conn).await {
                        self.counters.reused.fetch_add(1, Ordering::Relaxed);
                        return Ok(conn);
                    }
                    self.counters.failed_health_checks.fetch_add(1, Ordering::Relaxed);
                    self.counters.connections_closed.fetch_add(1, Ordering::Relaxed);
                    drop(conn);
                }
            }
        }
    }

    /// Return a healthy connection to the idle queue, or close it if the
    /// queue is full or the connection no longer passes the health check.
    pub async fn release(&self, mut conn: TcpStream) {
        if !Self::is_healthy(&mut conn).await {
            self.counters.failed_health_checks.fetch_add(1, Ordering::Relaxed);
            self.counters.connections_closed.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let mut idle = self.idle.lock().await;
        if idle.len() < self.config.pool_max {
            idle.push_back(conn);
        } else {
            drop(idle);
            self.counters.connections_closed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Discard a connection known to be broken without health-checking
    /// it again — used when a session observes the upstream side drop
    /// mid-session.
    pub fn discard(&self, conn: TcpStream) {
        drop(conn);
        self.counters.connections_closed.fetch_add(1, Ordering::Relaxed);
    }

    async fn maintenance_worker(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(MAINTENANCE_INTERVAL);
        ticker.tick().await; // first tick fires immediately; consume it
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => self.sweep_idle_queue().await,
            }
        }
        debug!("pool maintenance worker stopped");
    }

    async fn sweep_idle_queue(&self) {
        let drained: Vec<TcpStream> = {
            let mut idle = self.idle.lock().await;
            idle.drain(..).collect()
        };
        if drained.is_empty() {
            return;
        }

        let mut healthy = Vec::with_capacity(drained.len());
        let mut cleaned = 0u64;
        for mut conn in drained {
            if Self::is_healthy(&mut conn).await {
                healthy.push(conn);
            } else {
                cleaned += 1;
            }
        }

        let mut idle = self.idle.lock().await;
        let mut surplus = 0u64;
        for conn in healthy {
            if idle.len() < self.config.pool_max {
                idle.push_back(conn);
            } else {
                drop(conn);
                surplus += 1;
            }
        }
        drop(idle);

        if cleaned > 0 {
            self.counters.failed_health_checks.fetch_add(cleaned, Ordering::Relaxed);
            self.counters.connections_closed.fetch_add(cleaned, Ordering::Relaxed);
        }
        if surplus > 0 {
            self.counters.connections_closed.fetch_add(surplus, Ordering::Relaxed);
        }
        if cleaned > 0 || surplus > 0 {
            info!(cleaned, surplus, "pool maintenance swept idle queue");
        }
    }

    /// Cancel maintenance, drain and close every idle connection. Idempotent.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        if let Some(handle) = self.maintenance.lock().await.take() {
            let _ = handle.await;
        }
        let mut idle = self.idle.lock().await;
        let closed = idle.len() as u64;
        idle.clear();
        drop(idle);
        self.counters.connections_closed.fetch_add(closed, Ordering::Relaxed);
    }

    pub async fn stats(&self) -> PoolStats {
        let current_idle = self.idle.lock().await.len() as u64;
        PoolStats {
            created: self.counters.created.load(Ordering::Relaxed),
            reused: self.counters.reused.load(Ordering::Relaxed),
            failed_health_checks: self.counters.failed_health_checks.load(Ordering::Relaxed),
            pool_hits: self.counters.pool_hits.load(Ordering::Relaxed),
            pool_misses: self.counters.pool_misses.load(Ordering::Relaxed),
            connections_closed: self.counters.connections_closed.load(Ordering::Relaxed),
            current_idle,
            pool_max: self.config.pool_max as u64,
        }
    }
}
