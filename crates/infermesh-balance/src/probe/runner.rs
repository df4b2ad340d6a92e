//! Periodic probe loops.
//!
//! Each loop snapshots the registry's targets, fans the probe out to
//! every backend concurrently, and folds the verdicts back in. A small
//! random jitter on the first round keeps a fleet of proxies from
//! probing in lockstep.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use infermesh_config::{AiCheckConfig, HealthCheckConfig, WarmupConfig};

use crate::registry::BackendRegistry;

use super::{build_health_probe, AiStatusProbe, WarmupProbe};

/// Run active health checks forever. Returns the task handle so tests
/// and shutdown paths can abort the loop.
pub fn spawn_health_loop(
    registry: Arc<BackendRegistry>,
    cfg: HealthCheckConfig,
) -> Option<tokio::task::JoinHandle<()>> {
    let probe = build_health_probe(&cfg)?;
    if cfg.interval_secs <= 0.0 {
        return None;
    }
    let interval = Duration::from_secs_f64(cfg.interval_secs);
    let handle = tokio::spawn(async move {
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..250));
        tokio::time::sleep(jitter).await;
        loop {
            let targets = registry.targets();
            let checks = targets.into_iter().map(|(id, addr)| {
                let probe = &probe;
                let registry = &registry;
                async move {
                    let healthy = probe.check(addr).await;
                    registry.apply_health(&id, healthy);
                }
            });
            futures::future::join_all(checks).await;
            tokio::time::sleep(interval).await;
        }
    });
    Some(handle)
}

/// Poll `/ai/status` on every backend forever.
pub fn spawn_ai_status_loop(
    registry: Arc<BackendRegistry>,
    cfg: AiCheckConfig,
) -> Option<tokio::task::JoinHandle<()>> {
    if cfg.interval_secs <= 0.0 {
        return None;
    }
    let probe = AiStatusProbe::new(cfg.timeout_secs, cfg.http_host.clone(), cfg.http_path.clone());
    let interval = Duration::from_secs_f64(cfg.interval_secs);
    let handle = tokio::spawn(async move {
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..250));
        tokio::time::sleep(jitter).await;
        loop {
            let targets = registry.targets();
            let checks = targets.into_iter().map(|(id, addr)| {
                let probe = &probe;
                let registry = &registry;
                async move {
                    if let Some(status) = probe.check(addr).await {
                        registry.apply_ai_status(&id, &status);
                    }
                }
            });
            futures::future::join_all(checks).await;
            tokio::time::sleep(interval).await;
        }
    });
    Some(handle)
}

/// One-shot warmup for a newly added or re-onlined backend.
pub fn spawn_warmup(
    registry: Arc<BackendRegistry>,
    id: String,
    addr: std::net::SocketAddr,
    cfg: WarmupConfig,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let probe = WarmupProbe::new(cfg.timeout_secs, cfg.http_host.clone(), cfg.http_path.clone());
        if probe.warmup(addr, &cfg.model).await {
            if registry.set_model_loaded(&id, &cfg.model, None, true) {
                tracing::info!(backend = %id, model = %cfg.model, "warmup ok");
            }
        } else {
            tracing::warn!(backend = %id, model = %cfg.model, "warmup failed");
        }
    })
}
