//! Per-client session handling.
//!
//! Each accepted connection is handed a pooled upstream connection and
//! two forwarder tasks: client-to-server (which runs through the
//! [`AuthInterceptor`]) and server-to-client (a byte-for-byte copy). The
//! session ends when either side closes or errors; whichever forwarder
//! finishes first cancels the other so it unwinds promptly, and both
//! halves of the upstream connection are reunited and handed back to
//! the pool — released if still healthy, discarded otherwise.
//!
//! The one awkward corner is delivering the "invalid password" sentinel:
//! it must reach the *client*, but only the server-to-client task owns
//! the client write half. The client-to-server task hands it over a
//! one-shot channel instead of fighting over ownership of the socket.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::auth::{AuthInterceptor, InterceptOutcome};
use crate::config::Config;
use crate::metrics::{Direction, ErrorKind, ProxyMetrics};
use crate::pool::Pool;

const COPY_BUF_SIZE: usize = 16 * 1024;
const IDLE_READ_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

static NEXT_SESSION_ID: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(1);

fn next_session_id() -> u64 {
    NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed)
}

/// Drive one client connection end to end. Never propagates an error to
/// the caller — failures are logged and reflected in metrics, and the
/// function simply returns once the session is over.
#[instrument(skip(client, config, pool, metrics), fields(session_id = next_session_id()))]
pub async fn handle_client(
    client: TcpStream,
    config: Arc<Config>,
    pool: Arc<Pool>,
    metrics: Arc<dyn ProxyMetrics>,
) {
    let started = Instant::now();
    metrics.connection_accepted();

    let upstream = match pool.borrow().await {
        Ok(conn) => conn,
        Err(e) => {
            warn!(error = %e, "failed to borrow upstream connection");
            metrics.connection_rejected();
            metrics.error(ErrorKind::Connection);
            drop(client);
            metrics.connection_closed(started.elapsed());
            return;
        }
    };

    let (client_read, client_write) = client.into_split();
    let (upstream_read, upstream_write) = upstream.into_split();

    let interceptor = AuthInterceptor::new(config.clone());
    let upstream_broke = Arc::new(AtomicBool::new(false));
    let cancel = CancellationToken::new();
    let (reject_tx, reject_rx) = oneshot::channel::<&'static [u8]>();

    let mut client_to_server = tokio::spawn(forward_client_to_server(
        client_read,
        upstream_write,
        interceptor,
        metrics.clone(),
        upstream_broke.clone(),
        cancel.clone(),
        reject_tx,
    ));
    let mut server_to_client = tokio::spawn(forward_server_to_client(
        upstream_read,
        client_write,
        metrics.clone(),
        upstream_broke.clone(),
        cancel.clone(),
        reject_rx,
    ));

    let (c2s_result, s2c_result) = tokio::select! {
        result = &mut client_to_server => {
            cancel.cancel();
            (result, server_to_client.await)
        }
        result = &mut server_to_client => {
            cancel.cancel();
            (client_to_server.await, result)
        }
    };

    let client_halves = join_result("client->upstream", c2s_result);
    let server_halves = join_result("upstream->client", s2c_result);

    if let (Some((client_read, upstream_write)), Some((upstream_read, client_write))) =
        (client_halves, server_halves)
    {
        match client_read.reunite(client_write) {
            Ok(client) => drop(client),
            Err(_) => debug!("client halves did not reunite, dropping separately"),
        }

        match upstream_read.reunite(upstream_write) {
            Ok(upstream) => {
                if upstream_broke.load(Ordering::Relaxed) {
                    pool.discard(upstream);
                } else {
                    pool.release(upstream).await;
                }
            }
            Err(_) => {
                warn!("upstream halves did not reunite, connection leaked from pool accounting");
                metrics.error(ErrorKind::ConnectionRelease);
            }
        }
    } else {
        metrics.error(ErrorKind::ConnectionRelease);
    }

    if upstream_broke.load(Ordering::Relaxed) {
        metrics.error(ErrorKind::Proxy);
    }
    metrics.connection_closed(started.elapsed());
    debug!(elapsed_ms = started.elapsed().as_millis(), "session ended");
}

type ForwardResult<R, W> = Result<(R, W), tokio::task::JoinError>;

fn join_result<R, W>(direction: &'static str, result: ForwardResult<R, W>) -> Option<(R, W)> {
    match result {
        Ok(halves) => Some(halves),
        Err(e) => {
            warn!(direction, error = %e, "forwarder task panicked");
            None
        }
    }
}

async fn forward_client_to_server(
    mut client_read: OwnedReadHalf,
    mut upstream_write: OwnedWriteHalf,
    mut interceptor: AuthInterceptor,
    metrics: Arc<dyn ProxyMetrics>,
    upstream_broke: Arc<AtomicBool>,
    cancel: CancellationToken,
    reject_tx: oneshot::Sender<&'static [u8]>,
) -> (OwnedReadHalf, OwnedWriteHalf) {
    let mut reject_tx = Some(reject_tx);
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return (client_read, upstream_write),
            result = tokio::time::timeout(IDLE_READ_TIMEOUT, client_read.read(&mut buf)) => {
                let n = match result {
                    Err(_) => continue, // idle timeout, not a hard deadline; keep polling
                    Ok(Ok(0)) => return (client_read, upstream_write),
                    Ok(Ok(n)) => n,
                    Ok(Err(_)) => return (client_read, upstream_write),
                };

                let outcome = if interceptor.is_active() {
                    interceptor.intercept(&buf[..n])
                } else {
                    InterceptOutcome::Forward(buf[..n].to_vec())
                };

                match outcome {
                    InterceptOutcome::Forward(bytes) => {
                        if upstream_write.write_all(&bytes).await.is_err() {
                            upstream_broke.store(true, Ordering::Relaxed);
                            metrics.error(ErrorKind::Proxy);
                            return (client_read, upstream_write);
                        }
                        metrics.bytes_transferred(Direction::ClientToServer, bytes.len() as u64);
                    }
                    InterceptOutcome::AuthFailed(reply) => {
                        metrics.error(ErrorKind::Auth);
                        if let Some(tx) = reject_tx.take() {
                            let _ = tx.send(reply);
                        }
                        return (client_read, upstream_write);
                    }
                }
            }
        }
    }
}

async fn forward_server_to_client(
    mut upstream_read: OwnedReadHalf,
    mut client_write: OwnedWriteHalf,
    metrics: Arc<dyn ProxyMetrics>,
    upstream_broke: Arc<AtomicBool>,
    cancel: CancellationToken,
    mut reject_rx: oneshot::Receiver<&'static [u8]>,
) -> (OwnedReadHalf, OwnedWriteHalf) {
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    loop {
        tokio::select! {
            biased;
            reply = &mut reject_rx => {
                if let Ok(reply) = reply {
                    let _ = client_write.write_all(reply).await;
                    let _ = client_write.shutdown().await;
                }
                return (upstream_read, client_write);
            }
            _ = cancel.cancelled() => return (upstream_read, client_write),
            result = tokio::time::timeout(IDLE_READ_TIMEOUT, upstream_read.read(&mut buf)) => {
                match result {
                    Err(_) => continue, // idle timeout, not a hard deadline; keep polling
                    Ok(Ok(0)) => return (upstream_read, client_write),
                    Ok(Ok(n)) => {
                        if client_write.write_all(&buf[..n]).await.is_err() {
                            return (upstream_read, client_write);
                        }
                        metrics.bytes_transferred(Direction::ServerToClient, n as u64);
                    }
                    Ok(Err(_)) => {
                        upstream_broke.store(true, Ordering::Relaxed);
                        metrics.error(ErrorKind::Proxy);
                        return (upstream_read, client_write);
                    }
                }
            }
        }
    }
}
