//! Backend registry.
//!
//! Owns every backend record, derives eligibility, auto-adjusts
//! effective weights from reported metrics, and memoizes model and
//! model@version affinity. Eligibility transitions are the only events
//! that add or remove a backend from the strategy's live set;
//! metric-only updates merely re-weight it.

use std::collections::HashMap;
use std::net::SocketAddr;

use parking_lot::Mutex;
use serde::Serialize;

use infermesh_config::StrategyKind;

use crate::hash::fnv1a64;
use crate::probe::AiStatus;
use crate::strategy::{self, Strategy};

#[derive(Debug, Clone)]
pub struct BackendInfo {
    pub addr: SocketAddr,
    pub base_weight: u32,
    pub weight: u32,
    pub online: bool,
    pub healthy: bool,
    pub ai_ready_present: bool,
    pub ai_ready: bool,
    pub model_loaded: Option<bool>,
    pub model_name: Option<String>,
    pub model_version: Option<String>,
    pub active_connections: u32,
    pub ewma_response_ms: f64,
    pub successes: u64,
    pub failures: u64,
    pub queue_len: Option<u32>,
    pub gpu_util01: Option<f64>,
    pub vram_used_mb: u32,
    pub vram_total_mb: u32,
}

impl BackendInfo {
    fn new(addr: SocketAddr, weight: u32) -> Self {
        let base = weight.max(1);
        Self {
            addr,
            base_weight: base,
            weight: base,
            // Assume healthy until the first probe says otherwise so
            // a fresh backend can take traffic immediately.
            online: true,
            healthy: true,
            ai_ready_present: false,
            ai_ready: false,
            model_loaded: None,
            model_name: None,
            model_version: None,
            active_connections: 0,
            ewma_response_ms: 0.0,
            successes: 0,
            failures: 0,
            queue_len: None,
            gpu_util01: None,
            vram_used_mb: 0,
            vram_total_mb: 0,
        }
    }

    fn eligible(&self) -> bool {
        self.online && self.healthy && (!self.ai_ready_present || self.ai_ready)
    }

    fn model_ready(&self) -> bool {
        self.model_loaded.unwrap_or(true)
    }
}

/// Read-only view of one backend for `/stats`.
#[derive(Debug, Clone, Serialize)]
pub struct BackendSnapshot {
    pub id: String,
    pub online: bool,
    pub healthy: bool,
    pub ai_ready_present: bool,
    pub ai_ready: bool,
    pub weight: u32,
    pub base_weight: u32,
    pub active_connections: u32,
    pub ewma_response_ms: f64,
    pub successes: u64,
    pub failures: u64,
    pub error_rate: f64,
    pub queue_len: Option<u32>,
    pub gpu_util01: Option<f64>,
    pub vram_used_mb: u32,
    pub vram_total_mb: u32,
    pub model_loaded: Option<bool>,
    pub model_name: Option<String>,
    pub model_version: Option<String>,
}

struct Inner {
    backends: HashMap<String, BackendInfo>,
    strategy: Box<dyn Strategy>,
    model_affinity: HashMap<String, String>,
    version_affinity: HashMap<String, String>,
    auto_weight_adjust: bool,
    warmup_model: Option<String>,
}

pub struct BackendRegistry {
    inner: Mutex<Inner>,
}

fn backend_id(addr: &SocketAddr) -> String {
    addr.to_string()
}

fn version_key(model: &str, version: &str) -> String {
    if model.is_empty() {
        format!("@{}", version)
    } else {
        format!("{}@{}", model, version)
    }
}

impl Inner {
    fn recompute_weight(&mut self, id: &str) {
        let auto = self.auto_weight_adjust;
        let Some(b) = self.backends.get_mut(id) else { return };
        if !auto {
            b.weight = b.base_weight.max(1);
            return;
        }
        let mut factor = 1.0f64;
        if let Some(q) = b.queue_len {
            factor *= 10.0 / (10.0 + q as f64);
        }
        if let Some(u) = b.gpu_util01 {
            factor *= (1.0 - 0.8 * u.clamp(0.0, 1.0)).max(0.2);
        }
        if b.ewma_response_ms > 0.0 {
            factor *= 50.0 / (50.0 + b.ewma_response_ms);
        }
        let base = b.base_weight.max(1);
        let w = (base as f64 * factor).round() as u32;
        b.weight = w.clamp(1, base);
    }

    /// Recompute the weight and push it to the strategy if it changed
    /// while the backend is live.
    fn refresh_weight(&mut self, id: &str) {
        let old = match self.backends.get(id) {
            Some(b) => b.weight,
            None => return,
        };
        self.recompute_weight(id);
        let (weight, live) = match self.backends.get(id) {
            Some(b) => (b.weight, b.eligible()),
            None => return,
        };
        if weight != old && live {
            self.strategy.add_node(id, weight);
        }
    }

    fn sync_eligibility(&mut self, id: &str, was_eligible: bool) {
        let state = self.backends.get(id).map(|b| (b.eligible(), b.weight));
        match state {
            None => self.strategy.remove_node(id),
            Some((now_eligible, weight)) => {
                if was_eligible != now_eligible {
                    if now_eligible {
                        self.strategy.add_node(id, weight);
                    } else {
                        self.strategy.remove_node(id);
                    }
                }
            }
        }
    }

    fn gate_for_warmup(&mut self, id: &str) -> bool {
        let Some(model) = self.warmup_model.clone() else { return false };
        let Some(b) = self.backends.get_mut(id) else { return false };
        b.ai_ready_present = true;
        b.ai_ready = false;
        b.model_loaded = Some(false);
        b.model_name = Some(model);
        true
    }

    /// Deterministic weighted pick: FNV-1a of the request key modulo
    /// the weight sum, over id-ordered candidates.
    fn weighted_pick(mut candidates: Vec<(String, u32)>, key: &str) -> Option<String> {
        if candidates.is_empty() {
            return None;
        }
        candidates.sort_by(|a, b| a.0.cmp(&b.0));
        let sum: u64 = candidates.iter().map(|c| c.1.max(1) as u64).sum();
        let mut pick = (fnv1a64(key.as_bytes()) % sum) as i64;
        for (id, w) in candidates {
            pick -= w.max(1) as i64;
            if pick < 0 {
                return Some(id);
            }
        }
        None
    }
}

impl BackendRegistry {
    pub fn new(kind: StrategyKind, auto_weight_adjust: bool) -> Self {
        Self {
            inner: Mutex::new(Inner {
                backends: HashMap::new(),
                strategy: strategy::build(kind),
                model_affinity: HashMap::new(),
                version_affinity: HashMap::new(),
                auto_weight_adjust,
                warmup_model: None,
            }),
        }
    }

    /// Enable warmup gating: new and re-onlined backends stay out of
    /// the live set until a warmup probe confirms the model.
    pub fn configure_warmup(&self, model: Option<String>) {
        self.inner.lock().warmup_model = model.filter(|m| !m.is_empty());
    }

    /// Register a backend. Returns `(id, needs_warmup)`.
    pub fn add_backend(&self, addr: SocketAddr, weight: u32) -> (String, bool) {
        let id = backend_id(&addr);
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        inner.backends.insert(id.clone(), BackendInfo::new(addr, weight));
        let needs_warmup = inner.gate_for_warmup(&id);
        let (eligible, weight) = {
            let b = &inner.backends[&id];
            (b.eligible(), b.weight)
        };
        if eligible {
            inner.strategy.add_node(&id, weight);
        } else {
            inner.strategy.remove_node(&id);
        }
        tracing::info!(backend = %id, weight, needs_warmup, "backend registered");
        (id, needs_warmup)
    }

    pub fn remove_backend(&self, id: &str) -> bool {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if inner.backends.remove(id).is_none() {
            return false;
        }
        inner.strategy.remove_node(id);
        inner.model_affinity.retain(|_, v| v != id);
        inner.version_affinity.retain(|_, v| v != id);
        tracing::info!(backend = %id, "backend removed");
        true
    }

    /// Flip the operator-controlled online bit. Returns
    /// `Some(needs_warmup)` when the backend exists.
    pub fn set_online(&self, id: &str, online: bool) -> Option<bool> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let was_eligible = {
            let b = inner.backends.get_mut(id)?;
            if b.online == online {
                return Some(false);
            }
            let was = b.eligible();
            b.online = online;
            was
        };
        let needs_warmup = if online { inner.gate_for_warmup(id) } else { false };
        inner.sync_eligibility(id, was_eligible);
        tracing::info!(backend = %id, online, "backend online state changed");
        Some(needs_warmup)
    }

    pub fn set_base_weight(&self, id: &str, base_weight: u32) -> bool {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        match inner.backends.get_mut(id) {
            Some(b) => b.base_weight = base_weight.max(1),
            None => return false,
        }
        inner.refresh_weight(id);
        true
    }

    /// Record a model load/unload report, updating affinity maps.
    pub fn set_model_loaded(
        &self,
        id: &str,
        model: &str,
        version: Option<&str>,
        loaded: bool,
    ) -> bool {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let version = version.filter(|v| !v.is_empty());

        let was_eligible = match inner.backends.get_mut(id) {
            Some(b) => {
                let was = b.eligible();
                b.ai_ready_present = true;
                b.ai_ready = loaded;
                b.model_loaded = Some(loaded);
                if !model.is_empty() {
                    b.model_name = Some(model.to_string());
                }
                if let Some(v) = version {
                    b.model_version = Some(v.to_string());
                }
                was
            }
            None => return false,
        };

        if !model.is_empty() {
            if loaded {
                inner
                    .model_affinity
                    .entry(model.to_string())
                    .or_insert_with(|| id.to_string());
            } else if inner.model_affinity.get(model).map(String::as_str) == Some(id) {
                inner.model_affinity.remove(model);
            }
        }
        if let Some(v) = version {
            let mv = version_key(model, v);
            if loaded {
                inner
                    .version_affinity
                    .entry(mv)
                    .or_insert_with(|| id.to_string());
            } else if inner.version_affinity.get(&mv).map(String::as_str) == Some(id) {
                inner.version_affinity.remove(&mv);
            }
        }

        inner.sync_eligibility(id, was_eligible);
        true
    }

    /// Operator-pushed metrics (admin surface).
    pub fn update_metrics(
        &self,
        id: &str,
        queue_len: Option<u32>,
        gpu_util01: Option<f64>,
        vram_used_mb: u32,
        vram_total_mb: u32,
    ) -> bool {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if !inner.backends.contains_key(id) {
            return false;
        }
        if let Some(q) = queue_len {
            if let Some(b) = inner.backends.get_mut(id) {
                b.queue_len = Some(q);
            }
            inner.strategy.record_queue(id, q);
        }
        if let Some(u) = gpu_util01 {
            let u = u.clamp(0.0, 1.0);
            if let Some(b) = inner.backends.get_mut(id) {
                b.gpu_util01 = Some(u);
                b.vram_used_mb = vram_used_mb;
                b.vram_total_mb = vram_total_mb;
            }
            inner.strategy.record_gpu(id, u, vram_used_mb, vram_total_mb);
        }
        inner.refresh_weight(id);
        true
    }

    pub fn on_conn_start(&self, id: &str) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let proxy_queue = match inner.backends.get_mut(id) {
            Some(b) => {
                b.active_connections += 1;
                b.queue_len.is_none().then_some(b.active_connections)
            }
            None => None,
        };
        if let Some(active) = proxy_queue {
            inner.strategy.record_queue(id, active);
        }
        if inner.backends.contains_key(id) {
            inner.refresh_weight(id);
        }
        inner.strategy.on_conn_start(id);
    }

    pub fn on_conn_end(&self, id: &str) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let proxy_queue = match inner.backends.get_mut(id) {
            Some(b) => {
                b.active_connections = b.active_connections.saturating_sub(1);
                b.queue_len.is_none().then_some(b.active_connections)
            }
            None => None,
        };
        if let Some(active) = proxy_queue {
            inner.strategy.record_queue(id, active);
        }
        if inner.backends.contains_key(id) {
            inner.refresh_weight(id);
        }
        inner.strategy.on_conn_end(id);
    }

    /// Record a completed response time. Alpha fixed at 0.2; the first
    /// sample seeds the average.
    pub fn record_latency(&self, id: &str, ms: f64) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if let Some(b) = inner.backends.get_mut(id) {
            b.successes += 1;
            const ALPHA: f64 = 0.2;
            if b.ewma_response_ms <= 0.0 {
                b.ewma_response_ms = ms;
            } else {
                b.ewma_response_ms = b.ewma_response_ms * (1.0 - ALPHA) + ms * ALPHA;
            }
            inner.refresh_weight(id);
        }
        inner.strategy.record_latency(id, ms);
    }

    /// Passive failure signal from the forward path. Marks the backend
    /// unhealthy until the next successful active probe.
    pub fn report_failure(&self, id: &str) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let newly_down = match inner.backends.get_mut(id) {
            Some(b) => {
                b.failures += 1;
                if b.healthy {
                    b.healthy = false;
                    true
                } else {
                    false
                }
            }
            None => return,
        };
        if newly_down {
            inner.strategy.remove_node(id);
            tracing::info!(backend = %id, "backend marked down by passive failure signal");
        }
    }

    /// Active probe verdict.
    pub fn apply_health(&self, id: &str, healthy: bool) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let (was_eligible, changed) = match inner.backends.get_mut(id) {
            Some(b) => {
                let was = b.eligible();
                let changed = b.healthy != healthy;
                b.healthy = healthy;
                (was, changed)
            }
            None => return,
        };
        inner.sync_eligibility(id, was_eligible);
        if changed {
            tracing::info!(backend = %id, healthy, "backend health changed");
        }
    }

    /// Fold an AI-status probe result back into the record.
    pub fn apply_ai_status(&self, id: &str, status: &AiStatus) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let was_eligible = match inner.backends.get(id) {
            Some(b) => b.eligible(),
            None => return,
        };

        if let Some(q) = status.queue_len {
            if let Some(b) = inner.backends.get_mut(id) {
                b.queue_len = Some(q);
            }
            inner.strategy.record_queue(id, q);
        }
        if let Some(u) = status.gpu_util01 {
            let (used, total) = match inner.backends.get_mut(id) {
                Some(b) => {
                    b.gpu_util01 = Some(u);
                    if let Some(v) = status.vram_used_mb {
                        b.vram_used_mb = v;
                    }
                    if let Some(v) = status.vram_total_mb {
                        b.vram_total_mb = v;
                    }
                    (b.vram_used_mb, b.vram_total_mb)
                }
                None => return,
            };
            inner.strategy.record_gpu(id, u, used, total);
        }

        let learned = match inner.backends.get_mut(id) {
            Some(b) => {
                if let Some(loaded) = status.model_loaded {
                    b.ai_ready_present = true;
                    b.ai_ready = loaded;
                    b.model_loaded = Some(loaded);
                }
                if let Some(model) = &status.model_name {
                    b.model_name = Some(model.clone());
                }
                if let Some(version) = &status.model_version {
                    b.model_version = Some(version.clone());
                }
                if b.model_ready() {
                    Some((b.model_name.clone(), b.model_version.clone()))
                } else {
                    None
                }
            }
            None => return,
        };

        // Affinity learns from confirmed loads.
        if let Some((model, version)) = learned {
            if let Some(model) = model.filter(|m| !m.is_empty()) {
                if let Some(version) = version.filter(|v| !v.is_empty()) {
                    inner
                        .version_affinity
                        .entry(version_key(&model, &version))
                        .or_insert_with(|| id.to_string());
                }
                inner
                    .model_affinity
                    .entry(model)
                    .or_insert_with(|| id.to_string());
            }
        }

        inner.refresh_weight(id);
        inner.sync_eligibility(id, was_eligible);
    }

    /// Generic strategy-driven selection.
    pub fn select(&self, key: &str) -> Option<(String, SocketAddr)> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let id = inner.strategy.get_node(key)?;
        let addr = inner.backends.get(&id)?.addr;
        Some((id, addr))
    }

    /// Model-affine selection; falls back to [`BackendRegistry::select`]
    /// when nothing advertises the model.
    pub fn select_for_model(&self, key: &str, model: &str) -> Option<(String, SocketAddr)> {
        if model.is_empty() {
            return self.select(key);
        }
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        if let Some(bound) = inner.model_affinity.get(model).cloned() {
            let still_good = inner.backends.get(&bound).map(|b| {
                let model_match = b.model_name.as_deref().map(|m| m == model).unwrap_or(true);
                (b.eligible() && b.model_ready() && model_match, b.addr)
            });
            match still_good {
                Some((true, addr)) => return Some((bound, addr)),
                _ => {
                    inner.model_affinity.remove(model);
                }
            }
        }

        // Prefer backends that explicitly report the target model.
        let candidates: Vec<(String, u32)> = inner
            .backends
            .iter()
            .filter(|(_, b)| b.eligible() && b.model_ready())
            .filter(|(_, b)| b.model_name.as_deref() == Some(model))
            .map(|(id, b)| (id.clone(), b.weight))
            .collect();
        if let Some(chosen) = Inner::weighted_pick(candidates, key) {
            let addr = inner.backends[&chosen].addr;
            inner.model_affinity.insert(model.to_string(), chosen.clone());
            return Some((chosen, addr));
        }

        // Then anything not advertising a conflicting model.
        let fallback: Vec<(String, u32)> = inner
            .backends
            .iter()
            .filter(|(_, b)| b.eligible() && b.model_ready())
            .filter(|(_, b)| b.model_name.as_deref().map(|m| m == model).unwrap_or(true))
            .map(|(id, b)| (id.clone(), b.weight))
            .collect();
        if let Some(chosen) = Inner::weighted_pick(fallback, key) {
            let addr = inner.backends[&chosen].addr;
            inner.model_affinity.insert(model.to_string(), chosen.clone());
            return Some((chosen, addr));
        }

        // Last resort: strategy pick, remembered for next time.
        let id = inner.strategy.get_node(key)?;
        let addr = inner.backends.get(&id)?.addr;
        inner.model_affinity.insert(model.to_string(), id.clone());
        Some((id, addr))
    }

    /// Version-pinned selection. Returns `None` when the requested
    /// version is unavailable; never routes to a wrong version.
    pub fn select_for_model_version(
        &self,
        key: &str,
        model: &str,
        version: &str,
    ) -> Option<(String, SocketAddr)> {
        if version.is_empty() {
            return self.select_for_model(key, model);
        }
        let mv = version_key(model, version);
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        if let Some(bound) = inner.version_affinity.get(&mv).cloned() {
            let still_good = inner.backends.get(&bound).map(|b| {
                let model_match = model.is_empty()
                    || b.model_name.as_deref().map(|m| m == model).unwrap_or(true);
                let version_match = b
                    .model_version
                    .as_deref()
                    .map(|v| v == version)
                    .unwrap_or(true);
                (
                    b.eligible() && b.model_ready() && model_match && version_match,
                    b.addr,
                )
            });
            match still_good {
                Some((true, addr)) => return Some((bound, addr)),
                _ => {
                    inner.version_affinity.remove(&mv);
                }
            }
        }

        // Prefer backends that explicitly report the target version.
        let candidates: Vec<(String, u32)> = inner
            .backends
            .iter()
            .filter(|(_, b)| b.eligible() && b.model_ready())
            .filter(|(_, b)| b.model_version.as_deref() == Some(version))
            .filter(|(_, b)| model.is_empty() || b.model_name.as_deref() == Some(model))
            .map(|(id, b)| (id.clone(), b.weight))
            .collect();
        if let Some(chosen) = Inner::weighted_pick(candidates, key) {
            let addr = inner.backends[&chosen].addr;
            inner.version_affinity.insert(mv, chosen.clone());
            return Some((chosen, addr));
        }

        // Then anything not reporting a conflicting model or version.
        let fallback: Vec<(String, u32)> = inner
            .backends
            .iter()
            .filter(|(_, b)| b.eligible() && b.model_ready())
            .filter(|(_, b)| b.model_version.as_deref().map(|v| v == version).unwrap_or(true))
            .filter(|(_, b)| {
                model.is_empty() || b.model_name.as_deref().map(|m| m == model).unwrap_or(true)
            })
            .map(|(id, b)| (id.clone(), b.weight))
            .collect();
        if let Some(chosen) = Inner::weighted_pick(fallback, key) {
            let addr = inner.backends[&chosen].addr;
            inner.version_affinity.insert(mv, chosen.clone());
            return Some((chosen, addr));
        }

        None
    }

    /// All registered backends, for probe fan-out.
    pub fn targets(&self) -> Vec<(String, SocketAddr)> {
        self.inner
            .lock()
            .backends
            .iter()
            .map(|(id, b)| (id.clone(), b.addr))
            .collect()
    }

    pub fn snapshot(&self) -> Vec<BackendSnapshot> {
        let guard = self.inner.lock();
        let mut out: Vec<BackendSnapshot> = guard
            .backends
            .iter()
            .map(|(id, b)| {
                let total = (b.successes + b.failures) as f64;
                BackendSnapshot {
                    id: id.clone(),
                    online: b.online,
                    healthy: b.healthy,
                    ai_ready_present: b.ai_ready_present,
                    ai_ready: b.ai_ready,
                    weight: b.weight,
                    base_weight: b.base_weight,
                    active_connections: b.active_connections,
                    ewma_response_ms: b.ewma_response_ms,
                    successes: b.successes,
                    failures: b.failures,
                    error_rate: if total > 0.0 { b.failures as f64 / total } else { 0.0 },
                    queue_len: b.queue_len,
                    gpu_util01: b.gpu_util01,
                    vram_used_mb: b.vram_used_mb,
                    vram_total_mb: b.vram_total_mb,
                    model_loaded: b.model_loaded,
                    model_name: b.model_name.clone(),
                    model_version: b.model_version.clone(),
                }
            })
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    pub fn len(&self) -> usize {
        self.inner.lock().backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().backends.is_empty()
    }
}
