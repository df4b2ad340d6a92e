//! L4 tunnel listener: raw bidirectional byte forwarding to a backend
//! selected at accept time. No protocol parsing.

use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};

use infermesh_balance::BackendRegistry;
use infermesh_config::TunnelConfig;

use crate::stats::ProxyStats;

pub async fn run_tunnel(
    cfg: TunnelConfig,
    registry: Arc<BackendRegistry>,
    stats: Arc<ProxyStats>,
) -> std::io::Result<()> {
    let listener = TcpListener::bind((cfg.host.as_str(), cfg.port)).await?;
    tracing::info!(addr = %listener.local_addr()?, "l4 tunnel listening");
    serve_tunnel(listener, registry, stats).await
}

pub async fn serve_tunnel(
    listener: TcpListener,
    registry: Arc<BackendRegistry>,
    stats: Arc<ProxyStats>,
) -> std::io::Result<()> {
    loop {
        let (client, peer) = listener.accept().await?;
        ProxyStats::bump(&stats.tunnel_connections);

        let registry = registry.clone();
        tokio::spawn(async move {
            let key = peer.ip().to_string();
            let Some((id, addr)) = registry.select(&key) else {
                tracing::debug!(peer = %peer, "tunnel: no eligible backend");
                return;
            };
            let backend = match TcpStream::connect(addr).await {
                Ok(s) => s,
                Err(e) => {
                    tracing::debug!(backend = %id, error = %e, "tunnel connect failed");
                    registry.report_failure(&id);
                    return;
                }
            };
            registry.on_conn_start(&id);
            let mut client = client;
            let mut backend = backend;
            let result = tokio::io::copy_bidirectional(&mut client, &mut backend).await;
            registry.on_conn_end(&id);
            if let Err(e) = result {
                tracing::trace!(backend = %id, error = %e, "tunnel closed with error");
            }
        });
    }
}
