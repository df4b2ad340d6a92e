//! Model warmup probe: one POST to `/ai/warmup?model=…`; the first
//! success flips the backend's `ai_ready` gate.

use std::net::SocketAddr;
use std::time::Duration;

pub struct WarmupProbe {
    client: reqwest::Client,
    host: String,
    path: String,
}

impl WarmupProbe {
    pub fn new(timeout_secs: f64, host: String, path: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs_f64(timeout_secs.max(0.05)))
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap_or_default();
        Self { client, host, path }
    }

    pub async fn warmup(&self, addr: SocketAddr, model: &str) -> bool {
        let url = format!("http://{}{}?model={}", addr, self.path, model);
        match self
            .client
            .post(&url)
            .header(reqwest::header::HOST, &self.host)
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                tracing::debug!(backend = %addr, model, error = %e, "warmup request failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn success_status_warms() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/ai/warmup"))
            .and(query_param("model", "llama"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let probe = WarmupProbe::new(1.0, "127.0.0.1".into(), "/ai/warmup".into());
        assert!(probe.warmup(*server.address(), "llama").await);
    }

    #[tokio::test]
    async fn error_status_does_not_warm() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/ai/warmup"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let probe = WarmupProbe::new(1.0, "127.0.0.1".into(), "/ai/warmup".into());
        assert!(!probe.warmup(*server.address(), "llama").await);
    }
}
