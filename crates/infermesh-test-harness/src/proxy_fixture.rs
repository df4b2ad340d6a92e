//! A complete proxy (plus console) on ephemeral ports.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use infermesh_config::ProxyConfig;
use proxy_core::{listener, ProxyServer};

pub struct ProxyFixture {
    pub proxy: Arc<ProxyServer>,
    pub addr: SocketAddr,
    pub admin_addr: Option<SocketAddr>,
    cancel: CancellationToken,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl ProxyFixture {
    /// Build and start the proxy. The listener host/port in `cfg` are
    /// overridden to loopback/ephemeral.
    pub async fn start(mut cfg: ProxyConfig) -> Self {
        cfg.listener.host = "127.0.0.1".to_string();
        cfg.listener.port = 0;
        let admin_enabled = cfg.admin.enabled;

        let proxy = ProxyServer::build(cfg).await.expect("build proxy");
        let cancel = CancellationToken::new();
        let mut tasks = Vec::new();

        let l7 = listener::bind_listener(&proxy.cfg.listener).expect("bind proxy listener");
        let addr = l7.local_addr().expect("proxy addr");
        {
            let proxy = proxy.clone();
            let cancel = cancel.clone();
            tasks.push(tokio::spawn(async move {
                listener::serve(proxy, l7, cancel).await.ok();
            }));
        }

        let admin_addr = if admin_enabled {
            let console = tokio::net::TcpListener::bind("127.0.0.1:0")
                .await
                .expect("bind console");
            let admin_addr = console.local_addr().expect("console addr");
            let proxy = proxy.clone();
            tasks.push(tokio::spawn(async move {
                infermesh_console::serve(proxy, console).await.ok();
            }));
            Some(admin_addr)
        } else {
            None
        };

        Self {
            proxy,
            addr,
            admin_addr,
            cancel,
            tasks,
        }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn admin_url(&self) -> String {
        format!(
            "http://{}",
            self.admin_addr.expect("console not enabled in fixture")
        )
    }

    pub async fn stop(self) {
        self.cancel.cancel();
        for task in self.tasks {
            task.abort();
        }
    }
}
