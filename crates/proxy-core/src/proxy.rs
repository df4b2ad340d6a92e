//! ProxyServer: binds configuration, registry, pool, admission,
//! scheduling, batching and the hook engines together. The listener
//! and pipeline modules drive it; the console crate reads from it.

use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

use infermesh_admission::{
    AccessControl, AuditLogger, CongestionWindow, PerKeyConnectionLimiter, PerKeyRateLimiter,
    Scheduler, TokenBucket,
};
use infermesh_balance::{probe, BackendRegistry, ConnectionPool};
use infermesh_config::{ConfigHandle, ProxyConfig};

use crate::batch::Batcher;
use crate::cache::CacheClient;
use crate::error::ProxyError;
use crate::mirror::TrafficMirror;
use crate::rewrite::RewriteEngine;
use crate::stats::ProxyStats;
use crate::stream::load_tls_acceptor;

/// Per-connection bookkeeping for the idle sweeper.
pub(crate) struct ConnTracker {
    pub last_active_ms: AtomicU64,
    pub cancel: CancellationToken,
}

pub struct ProxyServer {
    /// Startup snapshot driving the data path.
    pub cfg: Arc<ProxyConfig>,
    /// Hot-swappable configuration for the admin surface.
    pub config: ConfigHandle,

    pub registry: Arc<BackendRegistry>,
    pub pool: Arc<ConnectionPool>,
    pub stats: Arc<ProxyStats>,

    pub rewrite: RewriteEngine,
    pub cache: Option<CacheClient>,
    pub mirror: Option<TrafficMirror>,
    pub batcher: Option<Arc<Batcher>>,
    pub scheduler: Option<Arc<Scheduler>>,

    pub access: Option<AccessControl>,
    pub global_bucket: Option<TokenBucket>,
    pub per_ip_rate: Option<PerKeyRateLimiter>,
    pub per_path_rate: Option<PerKeyRateLimiter>,
    pub congestion: Option<CongestionWindow>,
    pub user_conns: Option<PerKeyConnectionLimiter>,
    pub service_conns: Option<PerKeyConnectionLimiter>,
    pub audit: AuditLogger,

    pub(crate) accept_bucket: Option<TokenBucket>,
    pub(crate) per_ip_accept: Option<PerKeyRateLimiter>,
    pub(crate) per_ip_conns: DashMap<IpAddr, usize>,
    pub(crate) trackers: DashMap<u64, Arc<ConnTracker>>,
    pub(crate) next_conn_id: AtomicU64,
    pub(crate) next_shard: AtomicUsize,
    pub(crate) tls: Option<TlsAcceptor>,
    pub(crate) epoch: Instant,
}

impl ProxyServer {
    /// Build the full proxy from a configuration. Static backends are
    /// registered (and warmed up when configured); probe loops are the
    /// caller's responsibility via [`ProxyServer::spawn_probes`].
    pub async fn build(cfg: ProxyConfig) -> Result<Arc<Self>, ProxyError> {
        let cfg = Arc::new(cfg);
        let stats = Arc::new(ProxyStats::new());

        let registry = Arc::new(BackendRegistry::new(cfg.strategy, cfg.auto_weight_adjust));
        registry.configure_warmup(cfg.warmup.as_ref().map(|w| w.model.clone()));

        let pool = ConnectionPool::new(cfg.pool.clone());

        let cache = cfg.cache.clone().map(CacheClient::new);
        let mirror = match cfg.mirror.clone() {
            Some(mc) => Some(TrafficMirror::new(mc).await.map_err(|e| {
                ProxyError::Protocol(format!("mirror setup failed: {}", e))
            })?),
            None => None,
        };

        let request_timeout = Duration::from_secs(cfg.http.request_timeout_secs.max(1));
        let batcher = cfg.batch.clone().filter(|b| b.enabled).map(|bc| {
            Batcher::new(
                bc,
                cfg.headers.batch.clone(),
                cfg.pool.shards,
                request_timeout,
                registry.clone(),
                pool.clone(),
                stats.clone(),
            )
        });

        let scheduler = cfg
            .scheduler
            .clone()
            .filter(|s| s.max_inflight > 0)
            .map(Scheduler::new);

        let adm = &cfg.admission;
        let audit = match &adm.audit_log {
            Some(path) => AuditLogger::with_file(path).map_err(|e| {
                ProxyError::Protocol(format!("audit log {}: {}", path, e))
            })?,
            None => AuditLogger::disabled(),
        };

        let tls = match &cfg.tls {
            Some(tls_cfg) => Some(load_tls_acceptor(&tls_cfg.cert_path, &tls_cfg.key_path)?),
            None => None,
        };

        let proxy = Arc::new(Self {
            registry: registry.clone(),
            pool,
            stats,
            rewrite: RewriteEngine::new(cfg.rewrite.clone()),
            cache,
            mirror,
            batcher,
            scheduler,
            access: adm.access.as_ref().map(AccessControl::new),
            global_bucket: adm.global_rate.map(TokenBucket::new),
            per_ip_rate: adm.per_ip_rate.map(PerKeyRateLimiter::new),
            per_path_rate: adm.per_path_rate.map(PerKeyRateLimiter::new),
            congestion: adm.congestion.clone().map(CongestionWindow::new),
            user_conns: (adm.max_connections_per_user > 0).then(|| {
                PerKeyConnectionLimiter::new(adm.max_connections_per_user, adm.max_key_entries)
            }),
            service_conns: (adm.max_connections_per_service > 0).then(|| {
                PerKeyConnectionLimiter::new(
                    adm.max_connections_per_service,
                    adm.max_key_entries,
                )
            }),
            audit,
            accept_bucket: cfg.listener.accept_rate.map(TokenBucket::new),
            per_ip_accept: cfg.listener.per_ip_accept_rate.map(PerKeyRateLimiter::new),
            per_ip_conns: DashMap::new(),
            trackers: DashMap::new(),
            next_conn_id: AtomicU64::new(1),
            next_shard: AtomicUsize::new(0),
            tls,
            epoch: Instant::now(),
            config: ConfigHandle::new((*cfg).clone()),
            cfg,
        });

        // Static backends, with warmup gating where configured.
        for backend in &proxy.cfg.backends {
            let addr = format!("{}:{}", backend.host, backend.port)
                .parse()
                .map_err(|e| {
                    ProxyError::Protocol(format!(
                        "bad backend address {}:{}: {}",
                        backend.host, backend.port, e
                    ))
                })?;
            let (id, needs_warmup) = proxy.registry.add_backend(addr, backend.weight);
            if needs_warmup {
                if let Some(warmup) = proxy.cfg.warmup.clone() {
                    probe::spawn_warmup(proxy.registry.clone(), id, addr, warmup);
                }
            }
        }

        Ok(proxy)
    }

    /// Start health and AI-status probe loops. Handles are returned so
    /// shutdown (and tests) can abort them.
    pub fn spawn_probes(&self) -> Vec<tokio::task::JoinHandle<()>> {
        let mut handles = Vec::new();
        if let Some(h) = probe::spawn_health_loop(self.registry.clone(), self.cfg.health.clone()) {
            handles.push(h);
        }
        if let Some(ai_cfg) = self.cfg.ai_check.clone() {
            if let Some(h) = probe::spawn_ai_status_loop(self.registry.clone(), ai_cfg) {
                handles.push(h);
            }
        }
        handles
    }

    /// Register a backend at runtime (admin surface), kicking off
    /// warmup when configured.
    pub fn register_backend(&self, addr: std::net::SocketAddr, weight: u32) -> String {
        let (id, needs_warmup) = self.registry.add_backend(addr, weight);
        if needs_warmup {
            if let Some(warmup) = self.cfg.warmup.clone() {
                probe::spawn_warmup(self.registry.clone(), id.clone(), addr, warmup);
            }
        }
        id
    }

    /// Flip a backend online/offline (admin surface), kicking off
    /// warmup on the online transition when configured.
    pub fn set_backend_online(&self, id: &str, online: bool) -> bool {
        match self.registry.set_online(id, online) {
            Some(needs_warmup) => {
                if needs_warmup {
                    if let Some(warmup) = self.cfg.warmup.clone() {
                        let addr = self
                            .registry
                            .targets()
                            .into_iter()
                            .find(|(tid, _)| tid == id)
                            .map(|(_, addr)| addr);
                        if let Some(addr) = addr {
                            probe::spawn_warmup(
                                self.registry.clone(),
                                id.to_string(),
                                addr,
                                warmup,
                            );
                        }
                    }
                }
                true
            }
            None => false,
        }
    }

    pub(crate) fn next_shard(&self) -> usize {
        let shards = self.cfg.pool.shards.max(1);
        self.next_shard.fetch_add(1, Ordering::Relaxed) % shards
    }

    pub(crate) fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// Connection-level gate run at accept time, before any read.
    /// `false` means drop the socket immediately.
    pub(crate) fn admit_connection(&self, peer_ip: IpAddr) -> bool {
        let listener = &self.cfg.listener;

        if listener.max_connections > 0 {
            let active = self.stats.active_connections.load(Ordering::Relaxed);
            if active as usize >= listener.max_connections {
                ProxyStats::bump(&self.stats.conn_limit_drops);
                return false;
            }
        }

        if let Some(bucket) = &self.accept_bucket {
            if !bucket.try_acquire(1.0) {
                ProxyStats::bump(&self.stats.ddos_drops);
                return false;
            }
        }
        if let Some(per_ip) = &self.per_ip_accept {
            if !per_ip.try_acquire(&peer_ip.to_string()) {
                ProxyStats::bump(&self.stats.ddos_drops);
                return false;
            }
        }

        if listener.max_connections_per_ip > 0 {
            let mut entry = self.per_ip_conns.entry(peer_ip).or_insert(0);
            if *entry >= listener.max_connections_per_ip {
                ProxyStats::bump(&self.stats.conn_limit_drops);
                return false;
            }
            *entry += 1;
        }

        true
    }

    /// Drop idle per-key buckets so the bounded key tables recycle.
    pub(crate) fn sweep_limiter_keys(&self) {
        for limiter in [&self.per_ip_rate, &self.per_path_rate, &self.per_ip_accept]
            .into_iter()
            .flatten()
        {
            limiter.sweep_idle();
        }
    }

    pub(crate) fn release_ip_slot(&self, peer_ip: IpAddr) {
        if self.cfg.listener.max_connections_per_ip == 0 {
            return;
        }
        let drained = if let Some(mut entry) = self.per_ip_conns.get_mut(&peer_ip) {
            if *entry > 0 {
                *entry -= 1;
            }
            *entry == 0
        } else {
            false
        };
        if drained {
            self.per_ip_conns.remove_if(&peer_ip, |_, v| *v == 0);
        }
    }
}
