//! AI-status probe: fetch `/ai/status` and extract queue depth, GPU
//! metrics and loaded-model state. Field names are permissive; the
//! well-known aliases inference servers use are all accepted, and
//! booleans may arrive as integers.

use std::net::SocketAddr;
use std::time::Duration;

use serde_json::Value;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AiStatus {
    pub queue_len: Option<u32>,
    pub gpu_util01: Option<f64>,
    pub vram_used_mb: Option<u32>,
    pub vram_total_mb: Option<u32>,
    pub model_loaded: Option<bool>,
    pub model_name: Option<String>,
    pub model_version: Option<String>,
}

impl AiStatus {
    fn is_empty(&self) -> bool {
        self.queue_len.is_none()
            && self.gpu_util01.is_none()
            && self.vram_used_mb.is_none()
            && self.vram_total_mb.is_none()
            && self.model_loaded.is_none()
            && self.model_name.is_none()
            && self.model_version.is_none()
    }
}

fn first_u32(value: &Value, keys: &[&str]) -> Option<u32> {
    keys.iter().find_map(|k| {
        let v = value.get(k)?;
        v.as_u64()
            .or_else(|| v.as_f64().map(|f| f.max(0.0) as u64))
            .map(|n| n.min(u32::MAX as u64) as u32)
    })
}

fn first_f64(value: &Value, keys: &[&str]) -> Option<f64> {
    keys.iter().find_map(|k| value.get(k)?.as_f64())
}

fn first_bool(value: &Value, keys: &[&str]) -> Option<bool> {
    keys.iter().find_map(|k| {
        let v = value.get(k)?;
        v.as_bool().or_else(|| v.as_i64().map(|n| n != 0))
    })
}

fn first_string(value: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|k| value.get(k)?.as_str().map(str::to_string))
}

/// Extract an [`AiStatus`] from a status document. Returns `None`
/// when no recognized field is present.
pub fn parse_ai_status(value: &Value) -> Option<AiStatus> {
    let mut status = AiStatus {
        queue_len: first_u32(value, &["queue_len"]),
        gpu_util01: first_f64(value, &["gpu_util", "gpu_util01"]).map(|u| u.clamp(0.0, 1.0)),
        vram_used_mb: first_u32(value, &["vram_used_mb"]),
        vram_total_mb: first_u32(value, &["vram_total_mb"]),
        model_loaded: first_bool(value, &["model_loaded", "modelLoaded"]),
        model_name: first_string(value, &["model", "model_name", "loaded_model"]),
        model_version: first_string(value, &["model_version", "version", "modelVersion"]),
    };

    // VRAM metrics without a utilization figure still count as GPU
    // telemetry being present.
    if status.gpu_util01.is_none()
        && (status.vram_used_mb.unwrap_or(0) > 0 || status.vram_total_mb.unwrap_or(0) > 0)
    {
        status.gpu_util01 = Some(0.0);
    }

    if status.is_empty() {
        None
    } else {
        Some(status)
    }
}

pub struct AiStatusProbe {
    client: reqwest::Client,
    host: String,
    path: String,
}

impl AiStatusProbe {
    pub fn new(timeout_secs: f64, host: String, path: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs_f64(timeout_secs.max(0.05)))
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap_or_default();
        Self { client, host, path }
    }

    /// Fetch and parse; `None` on any transport, status, or shape
    /// failure.
    pub async fn check(&self, addr: SocketAddr) -> Option<AiStatus> {
        let url = format!("http://{}{}", addr, self.path);
        let resp = self
            .client
            .get(&url)
            .header(reqwest::header::HOST, &self.host)
            .send()
            .await
            .ok()?;
        if !resp.status().is_success() {
            return None;
        }
        let value: Value = resp.json().await.ok()?;
        parse_ai_status(&value)
    }
}
