//! # InferMesh Balance
//!
//! Backend fleet management: the registry with health, weight
//! auto-adjust and model affinity, the pluggable selection strategies,
//! the per-shard keep-alive connection pool, and the probe subsystem
//! that keeps selection honest under failure.

pub mod hash;
pub mod pool;
pub mod probe;
pub mod registry;
pub mod strategy;

pub use pool::{ConnectionPool, Lease};
pub use registry::{BackendRegistry, BackendSnapshot};
pub use strategy::Strategy;
