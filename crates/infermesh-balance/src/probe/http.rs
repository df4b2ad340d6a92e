//! HTTP GET probe with a configurable ok-status range.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;

use super::Probe;

pub struct HttpProbe {
    client: reqwest::Client,
    host: String,
    path: String,
    ok_min: u16,
    ok_max: u16,
}

impl HttpProbe {
    pub fn new(timeout_secs: f64, host: String, path: String, ok_min: u16, ok_max: u16) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs_f64(timeout_secs.max(0.05)))
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap_or_default();
        Self {
            client,
            host,
            path,
            ok_min,
            ok_max,
        }
    }
}

#[async_trait]
impl Probe for HttpProbe {
    async fn check(&self, addr: SocketAddr) -> bool {
        let url = format!("http://{}{}", addr, self.path);
        let resp = self
            .client
            .get(&url)
            .header(reqwest::header::HOST, &self.host)
            .send()
            .await;
        match resp {
            Ok(resp) => {
                let code = resp.status().as_u16();
                code >= self.ok_min && code <= self.ok_max
            }
            Err(e) => {
                tracing::debug!(backend = %addr, error = %e, "http probe failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn probe_against(status: u16, ok_min: u16, ok_max: u16) -> bool {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(status))
            .mount(&server)
            .await;

        let probe = HttpProbe::new(1.0, "127.0.0.1".into(), "/health".into(), ok_min, ok_max);
        probe.check(*server.address()).await
    }

    #[tokio::test]
    async fn status_inside_range_is_healthy() {
        assert!(probe_against(200, 200, 399).await);
        assert!(probe_against(301, 200, 399).await);
    }

    #[tokio::test]
    async fn status_outside_range_is_unhealthy() {
        assert!(!probe_against(500, 200, 399).await);
        assert!(!probe_against(200, 204, 399).await);
    }

    #[tokio::test]
    async fn unreachable_backend_is_unhealthy() {
        let probe = HttpProbe::new(0.2, "h".into(), "/health".into(), 200, 399);
        assert!(!probe.check("127.0.0.1:1".parse().unwrap()).await);
    }
}
