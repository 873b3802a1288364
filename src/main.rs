//! # Redis AUTH-Rewriting Proxy
//!
//! Transparent TCP proxy that sits in front of Redis. Clients
//! authenticate against a single proxy password; the proxy rewrites the
//! AUTH/HELLO handshake to the real upstream credentials and otherwise
//! forwards bytes unmodified.
//!
//! ## Architecture
//! - Accept loop spawns one task pair per connection
//! - Upstream connections are health-checked and pooled
//! - Credential rewriting happens only on the first AUTH/HELLO frame
//!
//! ## Observability
//! - Structured logging (JSON)
//! - Atomic counters behind a narrow [`ProxyMetrics`] seam; no exporter
//!   is started here, see `metrics.rs`

use std::sync::Arc;

use anyhow::Context;
use redis_auth_proxy::config::Config;
use redis_auth_proxy::listener;
use redis_auth_proxy::metrics::{AtomicMetrics, ProxyMetrics};
use redis_auth_proxy::pool::Pool;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .json()
        .with_env_filter(tracing_subscriber::EnvFilter::new(log_level))
        .init();

    info!("starting redis-auth-proxy");

    let config = Arc::new(Config::from_env().context("failed to load configuration")?);
    info!(
        proxy_host = %config.proxy_host,
        proxy_port = config.proxy_port,
        upstream_host = %config.upstream_host,
        upstream_port = config.upstream_port,
        pool_max = config.pool_max,
        "configuration loaded"
    );

    let pool = Pool::new(config.clone());
    pool.initialize().await;

    let metrics: Arc<dyn ProxyMetrics> = Arc::new(AtomicMetrics::new());

    let tcp_listener = listener::bind(&config).context("failed to bind listener")?;

    let sampler_pool = pool.clone();
    let sampler_metrics = metrics.clone();
    let metrics_sampler = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(10));
        loop {
            ticker.tick().await;
            sampler_metrics.pool_snapshot(sampler_pool.stats().await);
        }
    });

    tokio::select! {
        _ = listener::serve(tcp_listener, config.clone(), pool.clone(), metrics.clone()) => {}
        _ = shutdown_signal() => {
            info!("shutdown signal received, draining connection pool");
        }
    }
    metrics_sampler.abort();

    pool.shutdown().await;
    info!("redis-auth-proxy stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to install SIGINT handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => warn!(error = %e, "failed to install SIGTERM handler"),
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
