//! InferMesh server entry point.
//!
//! Loads configuration (file path from `INFERMESH_CONFIG` or the first
//! CLI argument, defaults otherwise), builds the proxy, starts the L7
//! listener, the optional L4 tunnel, the probe loops, and the admin
//! console, then runs until ctrl-c.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use infermesh_config::ProxyConfig;
use proxy_core::{listener, tunnel, ProxyServer};

fn load_config() -> anyhow::Result<ProxyConfig> {
    let path = std::env::var("INFERMESH_CONFIG")
        .ok()
        .or_else(|| std::env::args().nth(1));
    match path {
        Some(path) => {
            tracing::info!(%path, "loading configuration file");
            Ok(infermesh_config::load_file(&path)?)
        }
        None => {
            tracing::info!("no config file given; using defaults with env overrides");
            let mut cfg = ProxyConfig::default();
            infermesh_config::loader::apply_env_overrides(&mut cfg);
            Ok(cfg)
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("infermesh=info".parse()?)
                .add_directive("proxy_core=info".parse()?)
                .add_directive("infermesh_balance=info".parse()?),
        )
        .with_target(true)
        .init();

    let cfg = load_config()?;
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        listen = %format!("{}:{}", cfg.listener.host, cfg.listener.port),
        strategy = ?cfg.strategy,
        backends = cfg.backends.len(),
        "starting infermesh"
    );

    let proxy = ProxyServer::build(cfg).await?;
    let cancel = CancellationToken::new();

    let probe_handles = proxy.spawn_probes();
    tracing::info!(probes = probe_handles.len(), "probe loops started");

    // Optional L4 tunnel listener.
    if let Some(tunnel_cfg) = proxy.cfg.tunnel.clone() {
        let registry = proxy.registry.clone();
        let stats = proxy.stats.clone();
        tokio::spawn(async move {
            if let Err(e) = tunnel::run_tunnel(tunnel_cfg, registry, stats).await {
                tracing::error!(error = %e, "l4 tunnel failed");
            }
        });
    }

    // Admin console.
    if proxy.cfg.admin.enabled {
        let admin_addr = format!("{}:{}", proxy.cfg.admin.host, proxy.cfg.admin.port);
        let console_listener = tokio::net::TcpListener::bind(&admin_addr).await?;
        let console_proxy: Arc<ProxyServer> = proxy.clone();
        tokio::spawn(async move {
            if let Err(e) = infermesh_console::serve(console_proxy, console_listener).await {
                tracing::error!(error = %e, "console failed");
            }
        });
    }

    // L7 listener.
    let l7 = listener::bind_listener(&proxy.cfg.listener)?;
    let serve_cancel = cancel.clone();
    let serve_proxy = proxy.clone();
    let serve_task = tokio::spawn(async move {
        if let Err(e) = listener::serve(serve_proxy, l7, serve_cancel).await {
            tracing::error!(error = %e, "listener failed");
        }
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown requested");
    cancel.cancel();
    for handle in probe_handles {
        handle.abort();
    }
    serve_task.await.ok();
    Ok(())
}
