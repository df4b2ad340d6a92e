//! Console request handlers.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use tracing::error;

use infermesh_config::ProxyConfig;

use crate::state::ConsoleState;

type HandlerResult<T> = Result<Json<T>, (StatusCode, String)>;

fn not_found(id: &str) -> (StatusCode, String) {
    (StatusCode::NOT_FOUND, format!("unknown backend: {}", id))
}

/// `GET /stats`: totals, latency percentiles, scheduler and pool
/// occupancy, and a per-backend snapshot.
pub async fn stats(State(state): State<Arc<ConsoleState>>) -> Json<serde_json::Value> {
    let proxy = &state.proxy;
    let mut snapshot = proxy.stats.snapshot();

    snapshot["backends"] = serde_json::to_value(proxy.registry.snapshot()).unwrap_or_default();
    snapshot["pool"] = serde_json::json!({ "idle_connections": proxy.pool.idle_count() });
    if let Some(sched) = &proxy.scheduler {
        snapshot["scheduler"] = serde_json::json!({
            "inflight": sched.inflight(),
            "queued": sched.queued(),
        });
    }
    Json(snapshot)
}

/// `GET /admin/config`: the active configuration snapshot.
pub async fn get_config(State(state): State<Arc<ConsoleState>>) -> Json<ProxyConfig> {
    Json((*state.proxy.config.load()).clone())
}

#[derive(Debug, Deserialize)]
pub struct ApplyConfigQuery {
    /// Persist the applied config back to this path.
    #[serde(default)]
    pub persist: Option<String>,
}

/// `POST /admin/config`: replace the configuration snapshot.
///
/// Rate-limit parameters take effect immediately; listener and pool
/// topology changes apply on restart.
pub async fn apply_config(
    State(state): State<Arc<ConsoleState>>,
    Query(query): Query<ApplyConfigQuery>,
    Json(cfg): Json<ProxyConfig>,
) -> HandlerResult<serde_json::Value> {
    let proxy = &state.proxy;

    if let (Some(bucket), Some(rate)) = (&proxy.global_bucket, cfg.admission.global_rate) {
        bucket.reconfigure(rate);
    }
    proxy.config.store(cfg);

    let mut persisted = false;
    if let Some(path) = query.persist {
        proxy.config.persist(&path).map_err(|e| {
            error!(error = %e, "config persist failed");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        })?;
        persisted = true;
    }

    Ok(Json(serde_json::json!({ "applied": true, "persisted": persisted })))
}

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    1
}

pub async fn backend_register(
    State(state): State<Arc<ConsoleState>>,
    Json(req): Json<RegisterRequest>,
) -> HandlerResult<serde_json::Value> {
    let addr = format!("{}:{}", req.host, req.port)
        .parse()
        .map_err(|e| (StatusCode::BAD_REQUEST, format!("bad address: {}", e)))?;
    let id = state.proxy.register_backend(addr, req.weight);
    Ok(Json(serde_json::json!({ "id": id })))
}

#[derive(Debug, Deserialize)]
pub struct RemoveRequest {
    pub id: String,
}

pub async fn backend_remove(
    State(state): State<Arc<ConsoleState>>,
    Json(req): Json<RemoveRequest>,
) -> HandlerResult<serde_json::Value> {
    if !state.proxy.registry.remove_backend(&req.id) {
        return Err(not_found(&req.id));
    }
    Ok(Json(serde_json::json!({ "removed": req.id })))
}

#[derive(Debug, Deserialize)]
pub struct OnlineRequest {
    pub id: String,
    pub online: bool,
}

pub async fn backend_online(
    State(state): State<Arc<ConsoleState>>,
    Json(req): Json<OnlineRequest>,
) -> HandlerResult<serde_json::Value> {
    if !state.proxy.set_backend_online(&req.id, req.online) {
        return Err(not_found(&req.id));
    }
    Ok(Json(serde_json::json!({ "id": req.id, "online": req.online })))
}

#[derive(Debug, Deserialize)]
pub struct MetricsRequest {
    pub id: String,
    #[serde(default)]
    pub queue_len: Option<u32>,
    #[serde(default)]
    pub gpu_util: Option<f64>,
    #[serde(default)]
    pub vram_used_mb: Option<u32>,
    #[serde(default)]
    pub vram_total_mb: Option<u32>,
    /// Operator-supplied base weight; effective weight derives from it.
    #[serde(default)]
    pub base_weight: Option<u32>,
}

pub async fn backend_metrics(
    State(state): State<Arc<ConsoleState>>,
    Json(req): Json<MetricsRequest>,
) -> HandlerResult<serde_json::Value> {
    let applied = state.proxy.registry.update_metrics(
        &req.id,
        req.queue_len,
        req.gpu_util,
        req.vram_used_mb.unwrap_or(0),
        req.vram_total_mb.unwrap_or(0),
    );
    if !applied {
        return Err(not_found(&req.id));
    }
    if let Some(base_weight) = req.base_weight {
        state.proxy.registry.set_base_weight(&req.id, base_weight);
    }
    Ok(Json(serde_json::json!({ "id": req.id, "updated": true })))
}

#[derive(Debug, Deserialize)]
pub struct ModelRequest {
    pub id: String,
    pub model: String,
    #[serde(default)]
    pub version: Option<String>,
    pub loaded: bool,
}

pub async fn backend_model(
    State(state): State<Arc<ConsoleState>>,
    Json(req): Json<ModelRequest>,
) -> HandlerResult<serde_json::Value> {
    let applied = state.proxy.registry.set_model_loaded(
        &req.id,
        &req.model,
        req.version.as_deref(),
        req.loaded,
    );
    if !applied {
        return Err(not_found(&req.id));
    }
    Ok(Json(serde_json::json!({ "id": req.id, "model": req.model, "loaded": req.loaded })))
}

/// `GET /admin/diagnose`: a quick operational health summary.
pub async fn diagnose(State(state): State<Arc<ConsoleState>>) -> Json<serde_json::Value> {
    let proxy = &state.proxy;
    let backends = proxy.registry.snapshot();
    let healthy = backends.iter().filter(|b| b.healthy && b.online).count();

    Json(serde_json::json!({
        "uptime_secs": proxy.stats.uptime_secs(),
        "listener": {
            "host": proxy.cfg.listener.host,
            "port": proxy.cfg.listener.port,
            "tls": proxy.cfg.tls.is_some(),
        },
        "strategy": proxy.cfg.strategy,
        "backends_total": backends.len(),
        "backends_healthy": healthy,
        "pool_idle": proxy.pool.idle_count(),
        "batching_enabled": proxy.batcher.is_some(),
        "scheduler_enabled": proxy.scheduler.is_some(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    /// Log stream to tail; only `audit` exists today.
    #[serde(rename = "type", default = "default_log_type")]
    pub log_type: String,

    #[serde(default = "default_lines")]
    pub lines: usize,
}

fn default_log_type() -> String {
    "audit".to_string()
}

fn default_lines() -> usize {
    100
}

/// `GET /admin/logs?type=audit&lines=N`: tail of a log file.
pub async fn logs(
    State(state): State<Arc<ConsoleState>>,
    Query(query): Query<LogsQuery>,
) -> HandlerResult<serde_json::Value> {
    if query.log_type != "audit" {
        return Err((
            StatusCode::NOT_FOUND,
            format!("unknown log type: {}", query.log_type),
        ));
    }
    let Some(path) = state.proxy.cfg.admission.audit_log.clone() else {
        return Err((StatusCode::NOT_FOUND, "audit log not configured".into()));
    };
    let contents = tokio::fs::read_to_string(&path)
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    let lines: Vec<&str> = contents.lines().collect();
    let start = lines.len().saturating_sub(query.lines.max(1));
    Ok(Json(serde_json::json!({ "lines": lines[start..].to_vec() })))
}

#[cfg(test)]
mod tests {
    use crate::router;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use proxy_core::ProxyServer;
    use tower::util::ServiceExt;

    async fn test_router() -> axum::Router {
        let proxy = ProxyServer::build(infermesh_config::ProxyConfig::default())
            .await
            .unwrap();
        router(proxy)
    }

    async fn body_json(resp: axum::response::Response) -> serde_json::Value {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn stats_exposes_counters_and_backends() {
        let app = test_router().await;
        let resp = app
            .oneshot(Request::get("/stats").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert!(json["totals"]["ddos_drops"].is_number());
        assert!(json["backends"].is_array());
        assert!(json["latency_ms"]["p99"].is_number());
    }

    #[tokio::test]
    async fn register_then_remove_backend() {
        let app = test_router().await;

        let resp = app
            .clone()
            .oneshot(
                Request::post("/admin/backend_register")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        r#"{"host":"127.0.0.1","port":9555,"weight":2}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["id"], "127.0.0.1:9555");

        let resp = app
            .clone()
            .oneshot(
                Request::post("/admin/backend_remove")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"id":"127.0.0.1:9555"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        // Removing again is a 404.
        let resp = app
            .oneshot(
                Request::post("/admin/backend_remove")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"id":"127.0.0.1:9555"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn online_toggle_and_model_report() {
        let app = test_router().await;

        let resp = app
            .clone()
            .oneshot(
                Request::post("/admin/backend_register")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"host":"127.0.0.1","port":9556}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = app
            .clone()
            .oneshot(
                Request::post("/admin/backend_online")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"id":"127.0.0.1:9556","online":false}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = app
            .clone()
            .oneshot(
                Request::post("/admin/backend_model")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        r#"{"id":"127.0.0.1:9556","model":"llama","version":"v1","loaded":true}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = app
            .oneshot(Request::get("/stats").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let json = body_json(resp).await;
        assert_eq!(json["backends"][0]["model_name"], "llama");
        assert_eq!(json["backends"][0]["online"], false);
    }

    #[tokio::test]
    async fn config_round_trip() {
        let app = test_router().await;

        let resp = app
            .clone()
            .oneshot(Request::get("/admin/config").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let mut cfg = body_json(resp).await;
        cfg["listener"]["port"] = serde_json::json!(9777);

        let resp = app
            .clone()
            .oneshot(
                Request::post("/admin/config")
                    .header("content-type", "application/json")
                    .body(Body::from(serde_json::to_vec(&cfg).unwrap()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = app
            .oneshot(Request::get("/admin/config").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let json = body_json(resp).await;
        assert_eq!(json["listener"]["port"], 9777);
    }

    #[tokio::test]
    async fn diagnose_summarizes() {
        let app = test_router().await;
        let resp = app
            .oneshot(Request::get("/admin/diagnose").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["backends_total"], 0);
        assert_eq!(json["batching_enabled"], false);
    }

    #[tokio::test]
    async fn logs_without_audit_file_is_404() {
        let app = test_router().await;
        let resp = app
            .oneshot(Request::get("/admin/logs?lines=10").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn logs_tail_audit_file() {
        let dir = std::env::temp_dir().join(format!("console-logs-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("audit.log");
        std::fs::write(&path, "line1\nline2\nline3\n").unwrap();

        let mut cfg = infermesh_config::ProxyConfig::default();
        cfg.admission.audit_log = Some(path.to_str().unwrap().to_string());
        let proxy = ProxyServer::build(cfg).await.unwrap();
        let app = router(proxy);

        let resp = app
            .clone()
            .oneshot(
                Request::get("/admin/logs?type=audit&lines=2")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["lines"], serde_json::json!(["line2", "line3"]));

        let resp = app
            .oneshot(
                Request::get("/admin/logs?type=access")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        std::fs::remove_dir_all(&dir).ok();
    }
}
