//! TCP connect probe.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;

use super::Probe;

pub struct TcpProbe {
    timeout: Duration,
}

impl TcpProbe {
    pub fn new(timeout_secs: f64) -> Self {
        Self {
            timeout: Duration::from_secs_f64(timeout_secs.max(0.05)),
        }
    }
}

#[async_trait]
impl Probe for TcpProbe {
    async fn check(&self, addr: SocketAddr) -> bool {
        matches!(
            tokio::time::timeout(self.timeout, TcpStream::connect(addr)).await,
            Ok(Ok(_))
        )
    }
}
