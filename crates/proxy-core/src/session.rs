//! Per-connection session state.
//!
//! In the async rewrite most of the per-request state (current lease,
//! response accumulator, timing) lives as locals in the pipeline
//! future, which the connection task owns exclusively. What remains
//! here is the state that spans requests on one connection: shard
//! pinning, accounting keys, and the connection-limit pairing bit.

use std::net::SocketAddr;

#[derive(Debug)]
pub struct SessionContext {
    /// Pool shard this connection is pinned to for its lifetime.
    pub shard: usize,
    pub peer: SocketAddr,

    /// Per-user connection accounting key (API token header value).
    pub user_key: Option<String>,
    /// Per-service connection accounting key (first path segment).
    pub service_key: Option<String>,
    /// Set when the user/service counters were incremented; guarantees
    /// exactly one matching release on connection close.
    pub conn_limit_applied: bool,

    pub requests_served: u64,
}

impl SessionContext {
    pub fn new(shard: usize, peer: SocketAddr) -> Self {
        Self {
            shard,
            peer,
            user_key: None,
            service_key: None,
            conn_limit_applied: false,
            requests_served: 0,
        }
    }

    /// First path segment, used as the service accounting key.
    pub fn service_key_for(path: &str) -> String {
        path.trim_start_matches('/')
            .split('/')
            .next()
            .unwrap_or("")
            .to_string()
    }
}
