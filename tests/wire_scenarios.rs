//! End-to-end scenarios against a fake upstream, driving the real
//! accept/session/pool path over loopback sockets.

use std::sync::Arc;

use redis_auth_proxy::config::Config;
use redis_auth_proxy::metrics::{AtomicMetrics, ProxyMetrics};
use redis_auth_proxy::pool::Pool;
use redis_auth_proxy::session::handle_client;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

fn test_config(upstream_port: u16) -> Arc<Config> {
    Arc::new(Config {
        proxy_password: b"secret".to_vec(),
        proxy_host: "127.0.0.1".to_string(),
        proxy_port: 0,
        proxy_ipv6: false,
        upstream_host: "127.0.0.1".to_string(),
        upstream_port,
        upstream_username: b"default".to_vec(),
        upstream_password: b"up".to_vec(),
        pool_max: 10,
        pool_connect_timeout_seconds: 5,
        pool_prewarm: 0,
        pool_keepalive_enabled: false,
        pool_keepalive_idle_seconds: 1,
        pool_keepalive_interval_seconds: 1,
        pool_keepalive_probes: 1,
        metrics_port: 0,
    })
}

/// A fake upstream that echoes everything it reads back to the caller
/// through a channel so the test can assert on exactly what the proxy
/// forwarded, and replies `+PONG\r\n` to pool health checks.
async fn spawn_recording_upstream() -> (u16, tokio::sync::mpsc::UnboundedReceiver<Vec<u8>>) {
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            let (mut sock, _) = match listener.accept().await {
                Ok(pair) => pair,
                Err(_) => return,
            };
            let tx = tx.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                loop {
                    match sock.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => {
                            let data = buf[..n].to_vec();
                            if data == b"*1\r\n$4\r\nPING\r\n" {
                                let _ = sock.write_all(b"+PONG\r\n").await;
                                continue;
                            }
                            let _ = tx.send(data);
                            if sock.write_all(b"+OK\r\n").await.is_err() {
                                return;
                            }
                        }
                    }
                }
            });
        }
    });
    (port, rx)
}

async fn spawn_proxy(config: Arc<Config>) -> std::net::SocketAddr {
    spawn_proxy_with_pool(config).await.0
}

async fn spawn_proxy_with_pool(config: Arc<Config>) -> (std::net::SocketAddr, Arc<Pool>) {
    let pool = Pool::new(config.clone());
    let metrics: Arc<dyn ProxyMetrics> = Arc::new(AtomicMetrics::new());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let returned_pool = pool.clone();
    tokio::spawn(async move {
        loop {
            let (client, _) = match listener.accept().await {
                Ok(pair) => pair,
                Err(_) => return,
            };
            let config = config.clone();
            let pool = pool.clone();
            let metrics = metrics.clone();
            tokio::spawn(handle_client(client, config, pool, metrics));
        }
    });
    (addr, returned_pool)
}

#[tokio::test]
async fn single_arg_auth_success_reaches_upstream_rewritten() {
    let (upstream_port, mut recorded) = spawn_recording_upstream().await;
    let proxy_addr = spawn_proxy(test_config(upstream_port)).await;

    let mut client = TcpStream::connect(proxy_addr).await.unwrap();
    client.write_all(b"*2\r\n$4\r\nAUTH\r\n$6\r\nsecret\r\n").await.unwrap();

    let mut buf = [0u8; 64];
    let n = client.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"+OK\r\n");

    let forwarded = recorded.recv().await.unwrap();
    assert_eq!(forwarded, b"*3\r\n$4\r\nAUTH\r\n$7\r\ndefault\r\n$2\r\nup\r\n".to_vec());
}

#[tokio::test]
async fn two_arg_auth_overrides_client_username() {
    let (upstream_port, mut recorded) = spawn_recording_upstream().await;
    let proxy_addr = spawn_proxy(test_config(upstream_port)).await;

    let mut client = TcpStream::connect(proxy_addr).await.unwrap();
    client
        .write_all(b"*3\r\n$4\r\nAUTH\r\n$5\r\nalice\r\n$6\r\nsecret\r\n")
        .await
        .unwrap();

    let mut buf = [0u8; 64];
    let n = client.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"+OK\r\n");

    let forwarded = recorded.recv().await.unwrap();
    assert_eq!(forwarded, b"*3\r\n$4\r\nAUTH\r\n$7\r\ndefault\r\n$2\r\nup\r\n".to_vec());
}

#[tokio::test]
async fn auth_failure_never_reaches_upstream() {
    let (upstream_port, mut recorded) = spawn_recording_upstream().await;
    let proxy_addr = spawn_proxy(test_config(upstream_port)).await;

    let mut client = TcpStream::connect(proxy_addr).await.unwrap();
    client.write_all(b"*2\r\n$4\r\nAUTH\r\n$5\r\nwrong\r\n").await.unwrap();

    let mut buf = [0u8; 64];
    let n = client.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"-ERR invalid password\r\n");

    // Give the recording upstream a moment; it must never have seen a frame.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert!(recorded.try_recv().is_err());
}

#[tokio::test]
async fn hello_auth_success_splices_password_only() {
    let (upstream_port, mut recorded) = spawn_recording_upstream().await;
    let proxy_addr = spawn_proxy(test_config(upstream_port)).await;

    let mut client = TcpStream::connect(proxy_addr).await.unwrap();
    client
        .write_all(b"*5\r\n$5\r\nhello\r\n$1\r\n3\r\n$4\r\nAUTH\r\n$7\r\ndefault\r\n$6\r\nsecret\r\n")
        .await
        .unwrap();

    let mut buf = [0u8; 64];
    let n = client.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"+OK\r\n");

    let forwarded = recorded.recv().await.unwrap();
    assert_eq!(
        forwarded,
        b"*5\r\n$5\r\nhello\r\n$1\r\n3\r\n$4\r\nAUTH\r\n$7\r\ndefault\r\n$2\r\nup\r\n".to_vec()
    );
}

#[tokio::test]
async fn second_auth_after_success_passes_through_verbatim() {
    let (upstream_port, mut recorded) = spawn_recording_upstream().await;
    let proxy_addr = spawn_proxy(test_config(upstream_port)).await;

    let mut client = TcpStream::connect(proxy_addr).await.unwrap();
    client.write_all(b"*2\r\n$4\r\nAUTH\r\n$6\r\nsecret\r\n").await.unwrap();
    let mut buf = [0u8; 64];
    let n = client.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"+OK\r\n");
    let _ = recorded.recv().await.unwrap();

    let second = b"*2\r\n$4\r\nAUTH\r\n$6\r\nsecret\r\n";
    client.write_all(second).await.unwrap();
    let n = client.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"+OK\r\n");

    let forwarded = recorded.recv().await.unwrap();
    assert_eq!(forwarded, second.to_vec());
}

#[tokio::test]
async fn sequential_sessions_reuse_pooled_upstream_connection() {
    let (upstream_port, mut recorded) = spawn_recording_upstream().await;
    let (proxy_addr, pool) = spawn_proxy_with_pool(test_config(upstream_port)).await;

    for _ in 0..2 {
        let mut client = TcpStream::connect(proxy_addr).await.unwrap();
        client.write_all(b"*2\r\n$4\r\nAUTH\r\n$6\r\nsecret\r\n").await.unwrap();
        let mut buf = [0u8; 64];
        let n = client.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"+OK\r\n");
        let _ = recorded.recv().await.unwrap();
        drop(client);
        // Give the session task a moment to reunite and release the
        // upstream connection before the next one borrows it.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }

    let stats = pool.stats().await;
    assert!(stats.reused >= 1, "second session should have reused the first session's upstream connection");
}
