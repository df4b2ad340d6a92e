//! Selection strategies.
//!
//! Every strategy keeps only eligible nodes; the registry adds and
//! removes nodes on eligibility transitions and re-adds on weight
//! changes. All methods run under the registry lock, so strategies
//! carry no locking of their own.

mod consistent_hash;
mod gpu;
mod least_conn;
mod least_queue;
mod response_time;
mod round_robin;

pub use consistent_hash::ConsistentHash;
pub use gpu::GpuAware;
pub use least_conn::LeastConnections;
pub use least_queue::LeastQueue;
pub use response_time::ResponseTimeWeighted;
pub use round_robin::RoundRobin;

use infermesh_config::StrategyKind;

pub trait Strategy: Send {
    /// Insert a node or update its weight.
    fn add_node(&mut self, id: &str, weight: u32);

    fn remove_node(&mut self, id: &str);

    /// Pick a node for the given selection key.
    fn get_node(&mut self, key: &str) -> Option<String>;

    fn on_conn_start(&mut self, _id: &str) {}
    fn on_conn_end(&mut self, _id: &str) {}
    fn record_latency(&mut self, _id: &str, _ms: f64) {}
    fn record_queue(&mut self, _id: &str, _queue_len: u32) {}
    fn record_gpu(&mut self, _id: &str, _util01: f64, _used_mb: u32, _total_mb: u32) {}
}

/// Construct the strategy named by the configuration.
pub fn build(kind: StrategyKind) -> Box<dyn Strategy> {
    match kind {
        StrategyKind::RoundRobin => Box::new(RoundRobin::new()),
        StrategyKind::Hash => Box::new(ConsistentHash::new(16)),
        StrategyKind::LeastConn => Box::new(LeastConnections::new()),
        StrategyKind::LeastQueue => Box::new(LeastQueue::new()),
        StrategyKind::ResponseTime => Box::new(ResponseTimeWeighted::new(0.2)),
        StrategyKind::Gpu => Box::new(GpuAware::new()),
    }
}
