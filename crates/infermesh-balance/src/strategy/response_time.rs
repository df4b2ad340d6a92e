//! Response-time weighted selection.
//!
//! Score is `ewma_ms * (1 + active) / max(1, weight)`; the first
//! latency sample seeds the EWMA.

use std::collections::HashMap;

use super::Strategy;

#[derive(Default)]
struct NodeState {
    weight: u32,
    active: u32,
    ewma_ms: f64,
    has_sample: bool,
    present: bool,
}

pub struct ResponseTimeWeighted {
    alpha: f64,
    state: HashMap<String, NodeState>,
    nodes: Vec<String>,
    rr: usize,
}

impl ResponseTimeWeighted {
    pub fn new(alpha: f64) -> Self {
        Self {
            alpha: if alpha > 0.0 && alpha <= 1.0 { alpha } else { 0.2 },
            state: HashMap::new(),
            nodes: Vec::new(),
            rr: 0,
        }
    }
}

impl Strategy for ResponseTimeWeighted {
    fn add_node(&mut self, id: &str, weight: u32) {
        let st = self.state.entry(id.to_string()).or_default();
        st.weight = weight.max(1);
        if !st.present {
            st.present = true;
            self.nodes.push(id.to_string());
        }
    }

    fn remove_node(&mut self, id: &str) {
        if let Some(st) = self.state.get_mut(id) {
            st.present = false;
            st.active = 0;
        }
        self.nodes.retain(|n| n != id);
    }

    fn get_node(&mut self, _key: &str) -> Option<String> {
        let mut best_score = f64::INFINITY;
        let mut best: Vec<&String> = Vec::new();

        for node in &self.nodes {
            let Some(st) = self.state.get(node) else { continue };
            if !st.present {
                continue;
            }
            let score =
                st.ewma_ms * (1.0 + st.active as f64) / st.weight.max(1) as f64;
            if score < best_score {
                best_score = score;
                best.clear();
                best.push(node);
            } else if score == best_score {
                best.push(node);
            }
        }

        if best.is_empty() {
            return None;
        }
        let picked = best[self.rr % best.len()].clone();
        self.rr = self.rr.wrapping_add(1);
        Some(picked)
    }

    fn on_conn_start(&mut self, id: &str) {
        if let Some(st) = self.state.get_mut(id) {
            if st.present {
                st.active += 1;
            }
        }
    }

    fn on_conn_end(&mut self, id: &str) {
        if let Some(st) = self.state.get_mut(id) {
            if st.present {
                st.active = st.active.saturating_sub(1);
            }
        }
    }

    fn record_latency(&mut self, id: &str, ms: f64) {
        if ms <= 0.0 {
            return;
        }
        let Some(st) = self.state.get_mut(id) else { return };
        if !st.present {
            return;
        }
        if !st.has_sample {
            st.ewma_ms = ms;
            st.has_sample = true;
        } else {
            st.ewma_ms = self.alpha * ms + (1.0 - self.alpha) * st.ewma_ms;
        }
    }
}
