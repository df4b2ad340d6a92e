//! Per-shard keep-alive connection pool.
//!
//! Buckets are keyed by `(shard, backend_id)`; every client connection
//! is pinned to one shard for its lifetime, so a pooled backend
//! connection never migrates shards. Each pooled connection carries at
//! most one request-response transaction at a time, which is enforced
//! by the exclusive [`Lease`].

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::TcpStream;

use infermesh_config::PoolConfig;

pub struct ConnectionPool {
    cfg: PoolConfig,
    idle: Mutex<HashMap<(usize, String), Vec<TcpStream>>>,
}

/// Exclusive hold of one backend connection for one transaction.
///
/// Dropping a lease without calling [`Lease::release`] destroys the
/// connection, which keeps the pool single-occupancy even on panic or
/// early return.
pub struct Lease {
    shard: usize,
    backend_id: String,
    addr: SocketAddr,
    stream: Option<TcpStream>,
    reused: bool,
    pool: Arc<ConnectionPool>,
}

impl ConnectionPool {
    pub fn new(cfg: PoolConfig) -> Arc<Self> {
        Arc::new(Self {
            cfg,
            idle: Mutex::new(HashMap::new()),
        })
    }

    /// Lease a connection to `addr` on `shard`, reusing an idle one
    /// when a live candidate exists.
    pub async fn acquire(
        self: &Arc<Self>,
        shard: usize,
        addr: SocketAddr,
    ) -> std::io::Result<Lease> {
        let backend_id = addr.to_string();

        loop {
            let candidate = {
                let mut idle = self.idle.lock();
                idle.get_mut(&(shard, backend_id.clone()))
                    .and_then(|list| list.pop())
            };
            match candidate {
                Some(stream) => {
                    if stream_is_live(&stream) {
                        tracing::trace!(backend = %backend_id, shard, "pool hit");
                        return Ok(Lease {
                            shard,
                            backend_id,
                            addr,
                            stream: Some(stream),
                            reused: true,
                            pool: self.clone(),
                        });
                    }
                    // Stale connection; fall through and retry.
                }
                None => break,
            }
        }

        let connect = TcpStream::connect(addr);
        let stream = tokio::time::timeout(
            Duration::from_millis(self.cfg.connect_timeout_ms.max(1)),
            connect,
        )
        .await
        .map_err(|_| {
            std::io::Error::new(std::io::ErrorKind::TimedOut, "backend connect timeout")
        })??;
        stream.set_nodelay(true).ok();
        tracing::trace!(backend = %backend_id, shard, "pool dial");
        Ok(Lease {
            shard,
            backend_id,
            addr,
            stream: Some(stream),
            reused: false,
            pool: self.clone(),
        })
    }

    fn give_back(&self, shard: usize, backend_id: &str, stream: TcpStream) {
        let mut idle = self.idle.lock();
        let list = idle.entry((shard, backend_id.to_string())).or_default();
        if list.len() >= self.cfg.max_idle_per_backend {
            // Overflow: destroy instead of queueing.
            return;
        }
        list.push(stream);
    }

    /// Total idle connections, for stats.
    pub fn idle_count(&self) -> usize {
        self.idle.lock().values().map(|v| v.len()).sum()
    }
}

/// A connection popped from the idle list may have been closed by the
/// backend. A zero-byte or errored `try_read` exposes that without
/// consuming request data; pending bytes on an idle connection mean a
/// stray response, which also disqualifies it.
fn stream_is_live(stream: &TcpStream) -> bool {
    let mut probe = [0u8; 1];
    match stream.try_read(&mut probe) {
        Ok(0) => false,
        Ok(_) => false,
        Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => true,
        Err(_) => false,
    }
}

impl Lease {
    pub fn backend_id(&self) -> &str {
        &self.backend_id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Whether the lease reused a pooled connection.
    pub fn reused(&self) -> bool {
        self.reused
    }

    pub fn stream_mut(&mut self) -> &mut TcpStream {
        self.stream
            .as_mut()
            .expect("lease stream taken after release")
    }

    /// Return the connection to the pool (`keep_alive`) or destroy it.
    pub fn release(mut self, keep_alive: bool) {
        if let Some(stream) = self.stream.take() {
            if keep_alive {
                self.pool.give_back(self.shard, &self.backend_id, stream);
            }
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        // Not released explicitly: destroy rather than risk handing a
        // mid-transaction connection to the next caller.
        self.stream.take();
    }
}
