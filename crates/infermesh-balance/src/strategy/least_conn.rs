//! Least connections, scored as active / max(1, weight).

use std::collections::HashMap;

use super::Strategy;

#[derive(Default)]
struct NodeState {
    weight: u32,
    active: u32,
    present: bool,
}

pub struct LeastConnections {
    state: HashMap<String, NodeState>,
    nodes: Vec<String>,
    rr: usize,
}

impl LeastConnections {
    pub fn new() -> Self {
        Self {
            state: HashMap::new(),
            nodes: Vec::new(),
            rr: 0,
        }
    }
}

impl Strategy for LeastConnections {
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
            let score = st.active as f64 / st.weight.max(1) as f64;
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
}
