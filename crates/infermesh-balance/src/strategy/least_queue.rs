//! Least reported queue length, falling back to round-robin for
//! fleets that have not reported any queue metric yet.

use std::collections::HashMap;

use crate::hash::fnv1a64;

use super::{RoundRobin, Strategy};

pub struct LeastQueue {
    nodes: Vec<String>,
    weights: HashMap<String, u32>,
    queue_len: HashMap<String, u32>,
    fallback: RoundRobin,
}

impl LeastQueue {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            weights: HashMap::new(),
            queue_len: HashMap::new(),
            fallback: RoundRobin::new(),
        }
    }
}

impl Strategy for LeastQueue {
    fn add_node(&mut self, id: &str, weight: u32) {
        if !self.weights.contains_key(id) {
            self.nodes.push(id.to_string());
        }
        self.weights.insert(id.to_string(), weight.max(1));
        self.fallback.add_node(id, weight);
    }

    fn remove_node(&mut self, id: &str) {
        self.nodes.retain(|n| n != id);
        self.weights.remove(id);
        self.queue_len.remove(id);
        self.fallback.remove_node(id);
    }

    fn get_node(&mut self, key: &str) -> Option<String> {
        if self.nodes.is_empty() {
            return None;
        }

        let mut best_q = u32::MAX;
        let mut best: Vec<&String> = Vec::new();
        for node in &self.nodes {
            let Some(&q) = self.queue_len.get(node) else { continue };
            if q < best_q {
                best_q = q;
                best.clear();
                best.push(node);
            } else if q == best_q {
                best.push(node);
            }
        }

        match best.len() {
            0 => self.fallback.get_node(key),
            1 => Some(best[0].clone()),
            n => {
                let idx = (fnv1a64(key.as_bytes()) % n as u64) as usize;
                Some(best[idx].clone())
            }
        }
    }

    fn record_queue(&mut self, id: &str, queue_len: u32) {
        if self.weights.contains_key(id) {
            self.queue_len.insert(id.to_string(), queue_len);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shortest_queue_wins() {
        let mut lq = LeastQueue::new();
        lq.add_node("a", 1);
        lq.add_node("b", 1);
        lq.record_queue("a", 10);
        lq.record_queue("b", 2);

        assert_eq!(lq.get_node("k").unwrap(), "b");
    }

    #[test]
    fn no_metrics_falls_back_to_round_robin() {
        let mut lq = LeastQueue::new();
        lq.add_node("a", 1);
        lq.add_node("b", 1);

        let picks: Vec<_> = (0..2).map(|_| lq.get_node("k").unwrap()).collect();
        assert_ne!(picks[0], picks[1]);
    }

    #[test]
    fn node_without_metric_is_skipped_when_others_report() {
        let mut lq = LeastQueue::new();
        lq.add_node("silent", 1);
        lq.add_node("reporting", 1);
        lq.record_queue("reporting", 100);

        assert_eq!(lq.get_node("k").unwrap(), "reporting");
    }

    #[test]
    fn ties_are_key_deterministic() {
        let mut lq = LeastQueue::new();
        lq.add_node("a", 1);
        lq.add_node("b", 1);
        lq.record_queue("a", 1);
        lq.record_queue("b", 1);

        let first = lq.get_node("stable-key").unwrap();
        for _ in 0..5 {
            assert_eq!(lq.get_node("stable-key").unwrap(), first);
        }
    }
}
