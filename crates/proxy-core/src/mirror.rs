//! Best-effort UDP traffic mirroring.
//!
//! One JSON envelope per sampled request, sent with a non-blocking
//! `try_send_to`. Failures are counted and otherwise ignored; the
//! mirror never delays or fails the request path.

use std::net::SocketAddr;
use std::sync::Arc;

use rand::Rng;
use tokio::net::UdpSocket;

use infermesh_config::MirrorConfig;

use crate::stats::ProxyStats;

pub struct TrafficMirror {
    socket: UdpSocket,
    target: SocketAddr,
    cfg: MirrorConfig,
}

impl TrafficMirror {
    pub async fn new(cfg: MirrorConfig) -> std::io::Result<Self> {
        let target: SocketAddr = cfg
            .addr
            .parse()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, format!("{}", e)))?;
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        Ok(Self {
            socket,
            target,
            cfg,
        })
    }

    /// Envelope for one request, with the body truncated to the
    /// configured cap.
    fn envelope(&self, method: &str, path: &str, client: &str, body: &[u8]) -> Vec<u8> {
        let body_cap = self.cfg.max_body_bytes.min(body.len());
        let body_text = String::from_utf8_lossy(&body[..body_cap]);
        let value = serde_json::json!({
            "event": "request",
            "path": path,
            "method": method,
            "client": client,
            "req_body": body_text,
        });
        let mut packet = serde_json::to_vec(&value).unwrap_or_default();
        packet.truncate(self.cfg.max_packet_bytes);
        packet
    }

    /// Sample and send. Never blocks.
    pub fn mirror(
        &self,
        stats: &Arc<ProxyStats>,
        method: &str,
        path: &str,
        client: &str,
        body: &[u8],
    ) {
        if self.cfg.sample_rate < 1.0 && rand::thread_rng().gen::<f64>() >= self.cfg.sample_rate {
            return;
        }
        let packet = self.envelope(method, path, client, body);
        if let Err(e) = self.socket.try_send_to(&packet, self.target) {
            ProxyStats::bump(&stats.mirror_errors);
            tracing::trace!(error = %e, "mirror send failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(addr: &str) -> MirrorConfig {
        MirrorConfig {
            addr: addr.to_string(),
            sample_rate: 1.0,
            max_packet_bytes: 8 * 1024,
            max_body_bytes: 16,
        }
    }

    #[tokio::test]
    async fn sends_envelope_to_collector() {
        let collector = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = collector.local_addr().unwrap();

        let mirror = TrafficMirror::new(cfg(&addr.to_string())).await.unwrap();
        let stats = Arc::new(ProxyStats::new());
        mirror.mirror(&stats, "POST", "/infer", "10.0.0.9", b"{\"x\":1}");

        let mut buf = [0u8; 2048];
        let (n, _) = tokio::time::timeout(
            std::time::Duration::from_secs(1),
            collector.recv_from(&mut buf),
        )
        .await
        .unwrap()
        .unwrap();

        let value: serde_json::Value = serde_json::from_slice(&buf[..n]).unwrap();
        assert_eq!(value["event"], "request");
        assert_eq!(value["path"], "/infer");
        assert_eq!(value["method"], "POST");
        assert_eq!(value["client"], "10.0.0.9");
        assert_eq!(value["req_body"], "{\"x\":1}");
    }

    #[tokio::test]
    async fn body_is_truncated_to_cap() {
        let collector = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = collector.local_addr().unwrap();

        let mirror = TrafficMirror::new(cfg(&addr.to_string())).await.unwrap();
        let stats = Arc::new(ProxyStats::new());
        let long_body = vec![b'a'; 1024];
        mirror.mirror(&stats, "POST", "/x", "c", &long_body);

        let mut buf = [0u8; 2048];
        let (n, _) = collector.recv_from(&mut buf).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&buf[..n]).unwrap();
        assert_eq!(value["req_body"].as_str().unwrap().len(), 16);
    }

    #[tokio::test]
    async fn bad_target_is_a_constructor_error() {
        assert!(TrafficMirror::new(cfg("not-an-addr")).await.is_err());
    }
}
