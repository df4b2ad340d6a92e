//! L7 listener: binds the port (optionally `SO_REUSEPORT`), gates
//! accepts (global cap, accept-rate buckets, per-IP caps), pins each
//! connection to a pool shard, and drives the per-connection loop.
//! A periodic sweep force-closes connections idle past the timeout.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use infermesh_config::ListenerConfig;

use crate::error::ProxyError;
use crate::http::request::RequestParser;
use crate::pipeline::{self, simple_response};
use crate::proxy::{ConnTracker, ProxyServer};
use crate::session::SessionContext;
use crate::stats::ProxyStats;
use crate::stream;

/// Bind the L7 listener socket.
pub fn bind_listener(cfg: &ListenerConfig) -> std::io::Result<TcpListener> {
    let addr: SocketAddr = format!("{}:{}", cfg.host, cfg.port)
        .parse()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, format!("{}", e)))?;
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    if cfg.reuse_port {
        socket.set_reuse_port(true)?;
    }
    socket.bind(&addr.into())?;
    socket.listen(1024)?;
    socket.set_nonblocking(true)?;
    TcpListener::from_std(socket.into())
}

/// Accept loop. Runs until `cancel` fires.
pub async fn serve(
    proxy: Arc<ProxyServer>,
    listener: TcpListener,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    tracing::info!(addr = %listener.local_addr()?, "proxy listening");

    let sweeper = spawn_idle_sweeper(&proxy);
    let key_sweeper = spawn_key_sweeper(&proxy);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => {
                let (tcp, peer) = match accepted {
                    Ok(v) => v,
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                        continue;
                    }
                };
                ProxyStats::bump(&proxy.stats.total_connections);
                if !proxy.admit_connection(peer.ip()) {
                    drop(tcp);
                    continue;
                }
                let shard = proxy.next_shard();
                let proxy = proxy.clone();
                tokio::spawn(async move {
                    handle_connection(proxy, tcp, peer, shard).await;
                });
            }
        }
    }

    if let Some(sweeper) = sweeper {
        sweeper.abort();
    }
    key_sweeper.abort();
    Ok(())
}

/// Periodically drop idle entries from the per-key limiter tables so
/// their bounded key sets recycle.
fn spawn_key_sweeper(proxy: &Arc<ProxyServer>) -> tokio::task::JoinHandle<()> {
    let proxy = proxy.clone();
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_secs(60)).await;
            proxy.sweep_limiter_keys();
        }
    })
}

fn spawn_idle_sweeper(proxy: &Arc<ProxyServer>) -> Option<tokio::task::JoinHandle<()>> {
    let idle_timeout = proxy.cfg.listener.idle_timeout_secs;
    if idle_timeout == 0 {
        return None;
    }
    let idle_ms = idle_timeout * 1000;
    let interval = Duration::from_secs(proxy.cfg.listener.cleanup_interval_secs.max(1));
    let proxy = proxy.clone();
    Some(tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            let now = proxy.now_ms();
            for entry in proxy.trackers.iter() {
                let last = entry.value().last_active_ms.load(Ordering::Relaxed);
                if now.saturating_sub(last) >= idle_ms {
                    tracing::debug!(conn = *entry.key(), "closing idle connection");
                    entry.value().cancel.cancel();
                }
            }
        }
    }))
}

async fn handle_connection(proxy: Arc<ProxyServer>, tcp: TcpStream, peer: SocketAddr, shard: usize) {
    proxy.stats.active_connections.fetch_add(1, Ordering::Relaxed);
    tcp.set_nodelay(true).ok();

    if let Err(e) = drive_connection(&proxy, tcp, peer, shard).await {
        tracing::debug!(peer = %peer, error = %e, category = e.category(), "connection closed");
    }

    proxy.release_ip_slot(peer.ip());
    proxy.stats.active_connections.fetch_sub(1, Ordering::Relaxed);
}

async fn drive_connection(
    proxy: &Arc<ProxyServer>,
    tcp: TcpStream,
    peer: SocketAddr,
    shard: usize,
) -> Result<(), ProxyError> {
    let mut client = stream::sniff(tcp, proxy.tls.as_ref())
        .await
        .map_err(|source| ProxyError::ClientIo { source })?;

    let conn_id = proxy.next_conn_id.fetch_add(1, Ordering::Relaxed);
    let tracker = Arc::new(ConnTracker {
        last_active_ms: AtomicU64::new(proxy.now_ms()),
        cancel: CancellationToken::new(),
    });
    proxy.trackers.insert(conn_id, tracker.clone());

    let mut session = SessionContext::new(shard, peer);
    let mut parser = RequestParser::new(
        proxy.cfg.http.max_header_bytes,
        proxy.cfg.http.max_request_body_bytes,
    );
    let mut inbuf = BytesMut::with_capacity(16 * 1024);
    let request_timeout = Duration::from_secs(proxy.cfg.http.request_timeout_secs.max(1));

    let outcome: Result<(), ProxyError> = async {
        loop {
            // Drain buffered bytes first so pipelined requests are
            // served before re-arming the read.
            let maybe_req = match parser.parse(&mut inbuf) {
                Ok(v) => v,
                Err(e) => {
                    let resp =
                        simple_response(e.status_code(), "text/plain", e.to_string().as_bytes(), false);
                    let _ = client.write_all(&resp).await;
                    return Err(e);
                }
            };

            if let Some(req) = maybe_req {
                tracker.last_active_ms.store(proxy.now_ms(), Ordering::Relaxed);
                let handled = tokio::time::timeout(
                    request_timeout,
                    pipeline::handle_request(proxy, &mut session, &req, &mut client),
                )
                .await;
                let keep = match handled {
                    Ok(result) => result?,
                    Err(_) => {
                        ProxyStats::bump(&proxy.stats.timeouts);
                        return Err(ProxyError::Timeout("request"));
                    }
                };
                tracker.last_active_ms.store(proxy.now_ms(), Ordering::Relaxed);
                if !keep {
                    return Ok(());
                }
                continue;
            }

            tokio::select! {
                _ = tracker.cancel.cancelled() => {
                    tracing::trace!(peer = %peer, "idle timeout");
                    return Ok(());
                }
                read = client.read_buf(&mut inbuf) => {
                    let n = read.map_err(|source| ProxyError::ClientIo { source })?;
                    if n == 0 {
                        return Ok(());
                    }
                    tracker.last_active_ms.store(proxy.now_ms(), Ordering::Relaxed);
                }
            }
        }
    }
    .await;

    proxy.trackers.remove(&conn_id);
    if session.conn_limit_applied {
        if let (Some(limiter), Some(key)) = (&proxy.user_conns, &session.user_key) {
            limiter.release(key);
        }
        if let (Some(limiter), Some(key)) = (&proxy.service_conns, &session.service_key) {
            limiter.release(key);
        }
    }

    outcome
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binds_ephemeral_port() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let _guard = rt.enter();
        let cfg = ListenerConfig {
            host: "127.0.0.1".into(),
            port: 0,
            ..ListenerConfig::default()
        };
        let listener = bind_listener(&cfg).unwrap();
        assert_ne!(listener.local_addr().unwrap().port(), 0);
    }

    #[test]
    fn reuse_port_listeners_share_a_port() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let _guard = rt.enter();
        let cfg = ListenerConfig {
            host: "127.0.0.1".into(),
            port: 0,
            reuse_port: true,
            ..ListenerConfig::default()
        };
        let first = bind_listener(&cfg).unwrap();
        let port = first.local_addr().unwrap().port();

        let second_cfg = ListenerConfig {
            host: "127.0.0.1".into(),
            port,
            reuse_port: true,
            ..ListenerConfig::default()
        };
        let second = bind_listener(&second_cfg).unwrap();
        assert_eq!(second.local_addr().unwrap().port(), port);
    }
}
