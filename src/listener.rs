//! Accept loop and dual-stack binding.
//!
//! Mirrors the teacher's `run_server` shape: bind once, loop on
//! `accept()`, spawn a task per connection, and back off briefly on
//! accept errors rather than spinning a hot loop.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::config::Config;
use crate::metrics::ProxyMetrics;
use crate::pool::Pool;
use crate::session::handle_client;

const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Bind the listening socket per `config`, preferring a dual-stack IPv6
/// socket with `IPV6_V6ONLY` disabled when `proxy_host` is the IPv6
/// wildcard and `proxy_ipv6` is set. Falls back to the IPv4 wildcard on
/// the same port if the dual-stack IPv6 bind fails on a host OS that
/// doesn't support it.
pub fn bind(config: &Config) -> std::io::Result<TcpListener> {
    let ip = IpAddr::from_str(&config.proxy_host)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, format!("{}: {e}", config.proxy_host)))?;
    let addr = SocketAddr::new(ip, config.proxy_port);

    match bind_addr(addr, config.wants_dual_stack()) {
        Ok(listener) => Ok(listener),
        Err(e) if ip.is_ipv6() && ip.is_unspecified() => {
            warn!(error = %e, "dual-stack IPv6 bind failed, falling back to IPv4 wildcard");
            let fallback = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), config.proxy_port);
            bind_addr(fallback, false)
        }
        Err(e) => Err(e),
    }
}

fn bind_addr(addr: SocketAddr, dual_stack: bool) -> std::io::Result<TcpListener> {
    let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    if dual_stack {
        socket.set_only_v6(false)?;
    }
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;

    TcpListener::from_std(socket.into())
}

/// Accept connections until the process is shut down, spawning
/// [`handle_client`] for each one. Never returns under normal operation.
pub async fn serve(
    listener: TcpListener,
    config: Arc<Config>,
    pool: Arc<Pool>,
    metrics: Arc<dyn ProxyMetrics>,
) {
    info!(
        addr = %listener.local_addr().map(|a| a.to_string()).unwrap_or_default(),
        "accepting connections"
    );
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                tracing::debug!(%peer, "accepted connection");
                let config = config.clone();
                let pool = pool.clone();
                let metrics = metrics.clone();
                tokio::spawn(async move {
                    handle_client(stream, config, pool, metrics).await;
                });
            }
            Err(e) => {
                warn!(error = %e, "accept failed, backing off");
                metrics.error(crate::metrics::ErrorKind::Connection);
                tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
            }
        }
    }
}
