//! Active backend observation.
//!
//! Four probe families share one shape: a bounded, single-completion
//! check against a backend address. Health probes (TCP / HTTP /
//! script) yield a boolean; the AI-status probe yields a parsed
//! [`AiStatus`]; the warmup probe is a one-shot POST that flips
//! `ai_ready` on first success.

mod ai_status;
mod http;
mod runner;
mod script;
mod tcp;
mod warmup;

pub use ai_status::{parse_ai_status, AiStatus, AiStatusProbe};
pub use http::HttpProbe;
pub use runner::{spawn_ai_status_loop, spawn_health_loop, spawn_warmup};
pub use script::ScriptProbe;
pub use tcp::TcpProbe;
pub use warmup::WarmupProbe;

use std::net::SocketAddr;

use async_trait::async_trait;

use infermesh_config::{HealthCheckConfig, HealthCheckMode};

/// A health probe: `true` means the backend looks alive.
#[async_trait]
pub trait Probe: Send + Sync {
    async fn check(&self, addr: SocketAddr) -> bool;
}

/// Build the probe named by the health-check configuration, or `None`
/// when checking is off.
pub fn build_health_probe(cfg: &HealthCheckConfig) -> Option<Box<dyn Probe>> {
    match cfg.mode {
        HealthCheckMode::Off => None,
        HealthCheckMode::Tcp => Some(Box::new(TcpProbe::new(cfg.timeout_secs))),
        HealthCheckMode::Http => Some(Box::new(HttpProbe::new(
            cfg.timeout_secs,
            cfg.http_host.clone(),
            cfg.http_path.clone(),
            cfg.ok_status_min,
            cfg.ok_status_max,
        ))),
        HealthCheckMode::Script => Some(Box::new(ScriptProbe::new(
            cfg.timeout_secs,
            cfg.script_cmd.clone(),
        ))),
    }
}
