//! Consistent hashing with virtual nodes on a 32-bit FNV-1a ring.

use std::collections::{BTreeMap, HashMap};

use crate::hash::fnv1a32;

use super::Strategy;

pub struct ConsistentHash {
    virtual_per_weight: u32,
    ring: BTreeMap<u32, String>,
    nodes: HashMap<String, u32>,
}

impl ConsistentHash {
    pub fn new(virtual_per_weight: u32) -> Self {
        Self {
            virtual_per_weight: virtual_per_weight.max(1),
            ring: BTreeMap::new(),
            nodes: HashMap::new(),
        }
    }
}

impl Strategy for ConsistentHash {
    fn add_node(&mut self, id: &str, weight: u32) {
        if self.nodes.contains_key(id) {
            self.remove_node(id);
        }
        self.nodes.insert(id.to_string(), weight);

        let virtual_nodes = weight.max(1) * self.virtual_per_weight;
        for i in 0..virtual_nodes {
            let vnode = format!("{}#{}", id, i);
            // Smaller ring position wins on collision; first writer
            // keeps the slot.
            self.ring.entry(fnv1a32(vnode.as_bytes())).or_insert_with(|| id.to_string());
        }
    }

    fn remove_node(&mut self, id: &str) {
        self.ring.retain(|_, node| node != id);
        self.nodes.remove(id);
    }

    fn get_node(&mut self, key: &str) -> Option<String> {
        if self.ring.is_empty() {
            return None;
        }
        let h = fnv1a32(key.as_bytes());
        self.ring
            .range(h..)
            .next()
            .or_else(|| self.ring.iter().next())
            .map(|(_, node)| node.clone())
    }
}
