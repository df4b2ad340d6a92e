//! Config file loading, env overrides, and the hot-swap handle.

use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::error::ConfigError;
use crate::schema::ProxyConfig;

/// Load a JSON config file and apply environment overrides.
pub fn load_file(path: &str) -> Result<ProxyConfig, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_string(),
        source,
    })?;
    let mut cfg: ProxyConfig =
        serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_string(),
            source,
        })?;
    apply_env_overrides(&mut cfg);
    validate(&cfg)?;
    Ok(cfg)
}

/// Apply `PORT` / `HOST` / `ADMIN_PORT` overrides from the environment.
pub fn apply_env_overrides(cfg: &mut ProxyConfig) {
    if let Some(port) = std::env::var("PORT").ok().and_then(|p| p.parse().ok()) {
        cfg.listener.port = port;
    }
    if let Ok(host) = std::env::var("HOST") {
        if !host.is_empty() {
            cfg.listener.host = host;
        }
    }
    if let Some(port) = std::env::var("ADMIN_PORT").ok().and_then(|p| p.parse().ok()) {
        cfg.admin.port = port;
    }
}

fn validate(cfg: &ProxyConfig) -> Result<(), ConfigError> {
    if cfg.pool.shards == 0 {
        return Err(ConfigError::Invalid("pool.shards must be at least 1".into()));
    }
    if let Some(batch) = &cfg.batch {
        if batch.max_items == 0 {
            return Err(ConfigError::Invalid("batch.max_items must be at least 1".into()));
        }
    }
    if let Some(mirror) = &cfg.mirror {
        if !(0.0..=1.0).contains(&mirror.sample_rate) {
            return Err(ConfigError::Invalid(
                "mirror.sample_rate must be within [0, 1]".into(),
            ));
        }
    }
    Ok(())
}

/// Shared, hot-swappable configuration snapshot.
///
/// Readers call [`ConfigHandle::load`] for a wait-free snapshot; the
/// admin surface swaps in a full replacement on apply.
#[derive(Clone)]
pub struct ConfigHandle {
    inner: Arc<ArcSwap<ProxyConfig>>,
}

impl ConfigHandle {
    pub fn new(cfg: ProxyConfig) -> Self {
        Self {
            inner: Arc::new(ArcSwap::from_pointee(cfg)),
        }
    }

    pub fn load(&self) -> Arc<ProxyConfig> {
        self.inner.load_full()
    }

    pub fn store(&self, cfg: ProxyConfig) {
        self.inner.store(Arc::new(cfg));
        tracing::info!("configuration snapshot replaced");
    }

    /// Persist the current snapshot back to a file as pretty JSON.
    pub fn persist(&self, path: &str) -> Result<(), ConfigError> {
        let cfg = self.load();
        let text = serde_json::to_string_pretty(cfg.as_ref()).map_err(|source| {
            ConfigError::Parse {
                path: path.to_string(),
                source,
            }
        })?;
        std::fs::write(path, text).map_err(|source| ConfigError::Io {
            path: path.to_string(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_zero_shards() {
        let mut cfg = ProxyConfig::default();
        cfg.pool.shards = 0;
        assert!(validate(&cfg).is_err());
    }

    #[test]
    fn handle_swaps_snapshots() {
        let handle = ConfigHandle::new(ProxyConfig::default());
        assert_eq!(handle.load().listener.port, 8080);

        let mut next = ProxyConfig::default();
        next.listener.port = 9001;
        handle.store(next);
        assert_eq!(handle.load().listener.port, 9001);
    }

    #[test]
    fn rejects_bad_sample_rate() {
        let mut cfg = ProxyConfig::default();
        cfg.mirror = Some(crate::schema::MirrorConfig {
            addr: "127.0.0.1:9999".into(),
            sample_rate: 1.5,
            max_packet_bytes: 1024,
            max_body_bytes: 512,
        });
        assert!(validate(&cfg).is_err());
    }
}
