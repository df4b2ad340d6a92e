//! # InferMesh Proxy Core
//!
//! The data path: listener and accept gating, TLS first-byte sniff,
//! incremental HTTP/1.x parsing, the forwarding pipeline with
//! streaming/buffered response modes, JSON micro-batching, rewrite /
//! mirror / cache hooks, the L4 tunnel, and the stats registry the
//! admin surface reads.

pub mod acme;
pub mod batch;
pub mod cache;
pub mod error;
pub mod http;
pub mod listener;
pub mod mirror;
pub mod pipeline;
pub mod proxy;
pub mod rewrite;
pub mod session;
pub mod stats;
pub mod stream;
pub mod tunnel;

pub use error::ProxyError;
pub use proxy::ProxyServer;
pub use stats::ProxyStats;
