//! Weighted round-robin over a weight-flattened node list.

use super::Strategy;

pub struct RoundRobin {
    // Each node appears `weight` times; the cursor walks the list.
    nodes: Vec<String>,
    cursor: usize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            cursor: 0,
        }
    }
}

impl Default for RoundRobin {
    fn default() -> Self {
        Self::new()
    }
}

impl Strategy for RoundRobin {
    fn add_node(&mut self, id: &str, weight: u32) {
        self.nodes.retain(|n| n != id);
        for _ in 0..weight.max(1) {
            self.nodes.push(id.to_string());
        }
    }

    fn remove_node(&mut self, id: &str) {
        self.nodes.retain(|n| n != id);
    }

    fn get_node(&mut self, _key: &str) -> Option<String> {
        if self.nodes.is_empty() {
            return None;
        }
        let picked = self.nodes[self.cursor % self.nodes.len()].clone();
        self.cursor = self.cursor.wrapping_add(1);
        Some(picked)
    }
}
