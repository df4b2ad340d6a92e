//! End-to-end scenarios driven over real sockets on ephemeral ports.
//!
//! Run with: cargo test --test integration_tests

use std::sync::Arc;
use std::time::{Duration, Instant};

use infermesh_config::{
    BatchConfig, PerKeyRateConfig, ProxyConfig, RateConfig, SchedulerConfig, SchedulerMode,
};
use infermesh_test_harness::http_client::{get_request, post_request};
use infermesh_test_harness::mock_backend::BackendReply;
use infermesh_test_harness::{ProxyFixture, RawBackend, TestClient};

fn base_cfg() -> ProxyConfig {
    let mut cfg = ProxyConfig::default();
    // Single shard so every client connection shares one pool bucket.
    cfg.pool.shards = 1;
    cfg.admin.enabled = false;
    cfg
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(80)).await;
}

/// Keep-alive pool reuse: two client connections, one backend
/// connection, two backend requests.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn keep_alive_pool_reuse() {
    let backend = RawBackend::fixed("hello").await;
    let fixture = ProxyFixture::start(base_cfg()).await;
    fixture.proxy.registry.add_backend(backend.addr, 1);

    let mut first = TestClient::connect(fixture.addr).await;
    let resp = first.request(&get_request("/a", &[])).await;
    assert_eq!(resp.status, 200);
    assert_eq!(resp.body_text(), "hello");
    drop(first);
    settle().await;

    let mut second = TestClient::connect(fixture.addr).await;
    let resp = second.request(&get_request("/b", &[])).await;
    assert_eq!(resp.status, 200);
    assert_eq!(resp.body_text(), "hello");
    settle().await;

    assert_eq!(backend.connection_count(), 1, "pool must reuse the backend connection");
    assert_eq!(backend.request_count(), 2);
    fixture.stop().await;
}

/// Pipelined requests on one client connection are answered in order.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pipelined_requests_serve_in_order() {
    let backend = RawBackend::start(Arc::new(|req| {
        BackendReply::ok_text(&format!("echo:{}", req.path))
    }))
    .await;
    let fixture = ProxyFixture::start(base_cfg()).await;
    fixture.proxy.registry.add_backend(backend.addr, 1);

    let mut client = TestClient::connect(fixture.addr).await;
    let two = format!("{}{}", get_request("/one", &[]), get_request("/two", &[]));
    client.send(&two).await;

    let first = client.read_response().await;
    let second = client.read_response().await;
    assert_eq!(first.body_text(), "echo:/one");
    assert_eq!(second.body_text(), "echo:/two");

    settle().await;
    assert_eq!(backend.connection_count(), 1);
    assert_eq!(backend.request_count(), 2);
    fixture.stop().await;
}

/// Model-version routing: v1 and v2 land on their backends, v3 is 503.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn model_version_routing() {
    let v1 = RawBackend::fixed("V1").await;
    let v2 = RawBackend::fixed("V2").await;
    let fixture = ProxyFixture::start(base_cfg()).await;

    let (id1, _) = fixture.proxy.registry.add_backend(v1.addr, 1);
    let (id2, _) = fixture.proxy.registry.add_backend(v2.addr, 1);
    fixture
        .proxy
        .registry
        .set_model_loaded(&id1, "llama", Some("v1"), true);
    fixture
        .proxy
        .registry
        .set_model_loaded(&id2, "llama", Some("v2"), true);

    for (version, expected) in [("v1", "V1"), ("v2", "V2")] {
        let mut client = TestClient::connect(fixture.addr).await;
        let resp = client
            .request(&get_request(
                "/infer",
                &[("X-Model", "llama"), ("X-Model-Version", version)],
            ))
            .await;
        assert_eq!(resp.status, 200, "version {}", version);
        assert_eq!(resp.body_text(), expected);
    }

    let mut client = TestClient::connect(fixture.addr).await;
    let resp = client
        .request(&get_request(
            "/infer",
            &[("X-Model", "llama"), ("X-Model-Version", "v3")],
        ))
        .await;
    assert_eq!(resp.status, 503, "unknown version must be unavailable");
    fixture.stop().await;
}

/// Model affinity: once bound, every request for a model lands on the
/// same backend.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn model_affinity_sticks() {
    let a = RawBackend::fixed("A").await;
    let b = RawBackend::fixed("B").await;
    let fixture = ProxyFixture::start(base_cfg()).await;

    let (ida, _) = fixture.proxy.registry.add_backend(a.addr, 1);
    let (idb, _) = fixture.proxy.registry.add_backend(b.addr, 1);
    fixture.proxy.registry.set_model_loaded(&ida, "gemma", None, true);
    fixture.proxy.registry.set_model_loaded(&idb, "gemma", None, true);

    let mut bodies = std::collections::HashSet::new();
    for _ in 0..5 {
        let mut client = TestClient::connect(fixture.addr).await;
        let resp = client
            .request(&get_request("/infer", &[("X-Model", "gemma")]))
            .await;
        assert_eq!(resp.status, 200);
        bodies.insert(resp.body_text());
    }
    assert_eq!(bodies.len(), 1, "affinity must pin one backend");
    fixture.stop().await;
}

/// EDF ordering: with max_inflight=1 and one request in service,
/// queued requests drain in deadline order regardless of wire order.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn edf_orders_by_deadline() {
    let backend = RawBackend::start(Arc::new(|req| {
        if req.path == "/hold" {
            BackendReply::delayed_ok_text(Duration::from_millis(250), "held")
        } else {
            BackendReply::ok_text("done")
        }
    }))
    .await;

    let mut cfg = base_cfg();
    cfg.scheduler = Some(SchedulerConfig {
        mode: SchedulerMode::Edf,
        max_inflight: 1,
        ..SchedulerConfig::default()
    });
    let fixture = ProxyFixture::start(cfg).await;
    fixture.proxy.registry.add_backend(backend.addr, 1);

    let addr = fixture.addr;
    let hold = tokio::spawn(async move {
        let mut client = TestClient::connect(addr).await;
        client.request(&get_request("/hold", &[])).await
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Wire order d3, d1, d2; deadlines demand d1, d2, d3.
    let mut waiters = Vec::new();
    for (path, deadline) in [("/d3", "3000"), ("/d1", "1000"), ("/d2", "2000")] {
        let addr = fixture.addr;
        let path = path.to_string();
        let deadline = deadline.to_string();
        waiters.push(tokio::spawn(async move {
            let mut client = TestClient::connect(addr).await;
            client
                .request(&get_request(&path, &[("X-Deadline-Ms", &deadline)]))
                .await
        }));
        tokio::time::sleep(Duration::from_millis(30)).await;
    }

    assert_eq!(hold.await.unwrap().status, 200);
    for waiter in waiters {
        assert_eq!(waiter.await.unwrap().status, 200);
    }
    settle().await;

    assert_eq!(
        backend.recorded_paths(),
        vec!["/hold", "/d1", "/d2", "/d3"],
        "completion order must follow deadlines"
    );
    fixture.stop().await;
}

/// Strict priority: a high request enqueued after low ones beats them.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn strict_priority_high_first() {
    let backend = RawBackend::start(Arc::new(|req| {
        if req.path == "/hold" {
            BackendReply::delayed_ok_text(Duration::from_millis(250), "held")
        } else {
            BackendReply::ok_text("done")
        }
    }))
    .await;

    let mut cfg = base_cfg();
    cfg.scheduler = Some(SchedulerConfig {
        mode: SchedulerMode::Priority,
        max_inflight: 1,
        ..SchedulerConfig::default()
    });
    let fixture = ProxyFixture::start(cfg).await;
    fixture.proxy.registry.add_backend(backend.addr, 1);

    let addr = fixture.addr;
    let hold = tokio::spawn(async move {
        let mut client = TestClient::connect(addr).await;
        client.request(&get_request("/hold", &[])).await
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut waiters = Vec::new();
    for (path, priority) in [("/low1", "0"), ("/high", "9"), ("/low2", "0")] {
        let addr = fixture.addr;
        let path = path.to_string();
        let priority = priority.to_string();
        waiters.push(tokio::spawn(async move {
            let mut client = TestClient::connect(addr).await;
            client
                .request(&get_request(&path, &[("X-Priority", &priority)]))
                .await
        }));
        tokio::time::sleep(Duration::from_millis(30)).await;
    }

    hold.await.unwrap();
    for waiter in waiters {
        waiter.await.unwrap();
    }
    settle().await;

    assert_eq!(
        backend.recorded_paths(),
        vec!["/hold", "/high", "/low1", "/low2"]
    );
    fixture.stop().await;
}

/// Batch merge: two concurrent JSON POSTs become one backend request;
/// each client gets its own element back.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn batch_merge_two_posts() {
    let backend = RawBackend::start(Arc::new(|req| {
        // Echo the merged array verbatim.
        BackendReply::ok_json(&String::from_utf8_lossy(&req.body))
    }))
    .await;

    let mut cfg = base_cfg();
    cfg.batch = Some(BatchConfig {
        window_ms: 200,
        max_items: 8,
        ..BatchConfig::default()
    });
    let fixture = ProxyFixture::start(cfg).await;
    fixture.proxy.registry.add_backend(backend.addr, 1);

    let addr = fixture.addr;
    let one = tokio::spawn(async move {
        let mut client = TestClient::connect(addr).await;
        client
            .request(&post_request(
                "/infer",
                &[("X-Model", "m1"), ("Content-Type", "application/json")],
                r#"{"req":1}"#,
            ))
            .await
    });
    let addr = fixture.addr;
    let two = tokio::spawn(async move {
        let mut client = TestClient::connect(addr).await;
        client
            .request(&post_request(
                "/infer",
                &[("X-Model", "m1"), ("Content-Type", "application/json")],
                r#"{"req":2}"#,
            ))
            .await
    });

    let first = one.await.unwrap();
    let second = two.await.unwrap();
    assert_eq!(first.status, 200);
    assert_eq!(second.status, 200);
    let mut bodies = vec![first.body_text(), second.body_text()];
    bodies.sort();
    assert_eq!(bodies, vec![r#"{"req":1}"#, r#"{"req":2}"#]);

    settle().await;
    assert_eq!(backend.connection_count(), 1, "one pooled connection");
    assert_eq!(backend.request_count(), 1, "one merged request");
    let merged = backend.recorded();
    assert_eq!(
        merged[0]
            .headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("x-batch-size"))
            .map(|(_, v)| v.as_str()),
        Some("2")
    );
    fixture.stop().await;
}

/// Client-side array splitting: one POSTed array fans out into one
/// backend request per element, composed back with statuses.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn batch_split_fans_out() {
    let backend = RawBackend::start(Arc::new(|req| {
        BackendReply::ok_json(&String::from_utf8_lossy(&req.body))
    }))
    .await;
    let fixture = ProxyFixture::start(base_cfg()).await;
    fixture.proxy.registry.add_backend(backend.addr, 1);

    let mut client = TestClient::connect(fixture.addr).await;
    let resp = client
        .request(&post_request(
            "/infer",
            &[("X-Batch-Split", "1"), ("Content-Type", "application/json")],
            r#"[{"a":1},{"b":2},{"c":3}]"#,
        ))
        .await;
    assert_eq!(resp.status, 200);

    let parsed: serde_json::Value = serde_json::from_slice(&resp.body).unwrap();
    let items = parsed.as_array().unwrap();
    assert_eq!(items.len(), 3);
    assert_eq!(items[0]["status"], 200);
    assert_eq!(items[0]["body"], r#"{"a":1}"#);
    assert_eq!(items[2]["body"], r#"{"c":3}"#);

    settle().await;
    assert_eq!(backend.request_count(), 3);
    fixture.stop().await;
}

/// Streaming passthrough: the first chunk reaches the client while the
/// backend is still holding the rest.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn streaming_first_byte_arrives_early() {
    let head = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\nConnection: close\r\n\r\n1\r\nA\r\n".to_vec();
    let tail = b"1\r\nB\r\n0\r\n\r\n".to_vec();
    let backend = RawBackend::start(Arc::new(move |_req| BackendReply::Staged {
        stages: vec![
            (Duration::ZERO, head.clone()),
            (Duration::from_millis(250), tail.clone()),
        ],
        close_after: true,
    }))
    .await;

    let fixture = ProxyFixture::start(base_cfg()).await;
    fixture.proxy.registry.add_backend(backend.addr, 1);

    let mut client = TestClient::connect(fixture.addr).await;
    let started = Instant::now();
    client
        .send(&get_request("/stream", &[("Connection", "close")]))
        .await;

    // First burst must carry `A` well before the backend sends `B`.
    let mut early = Vec::new();
    while started.elapsed() < Duration::from_millis(500) {
        early.extend(client.read_available(Duration::from_millis(50)).await);
        if early.windows(4).any(|w| w == b"1\r\nA") {
            break;
        }
    }
    assert!(
        early.windows(4).any(|w| w == b"1\r\nA"),
        "first chunk not streamed within 500ms"
    );
    assert!(started.elapsed() < Duration::from_millis(500));

    // The rest arrives, then EOF.
    let rest = client.read_until_close().await;
    let all = [early, rest].concat();
    let text = String::from_utf8_lossy(&all);
    assert!(text.contains("1\r\nB"), "second chunk missing: {}", text);
    assert!(text.contains("0\r\n\r\n"), "terminal chunk missing");
    fixture.stop().await;
}

/// Accept-rate DDoS protection: a burst of connects from one IP pushes
/// `ddos_drops` above zero on /stats.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn ddos_accept_limit_counts_drops() {
    let backend = RawBackend::fixed("ok").await;

    let mut cfg = base_cfg();
    cfg.admin.enabled = true;
    cfg.listener.accept_rate = Some(RateConfig {
        qps: 20.0,
        burst: 20.0,
    });
    cfg.listener.per_ip_accept_rate = Some(PerKeyRateConfig {
        qps: 10.0,
        burst: 10.0,
        idle_secs: 60,
        max_entries: 10_000,
    });
    let fixture = ProxyFixture::start(cfg).await;
    fixture.proxy.registry.add_backend(backend.addr, 1);

    let mut sockets = Vec::new();
    for _ in 0..200 {
        if let Ok(stream) = tokio::net::TcpStream::connect(fixture.addr).await {
            sockets.push(stream);
        }
    }
    settle().await;

    let stats: serde_json::Value = reqwest::get(format!("{}/stats", fixture.admin_url()))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let drops = stats["totals"]["ddos_drops"].as_u64().unwrap();
    assert!(drops > 0, "expected accept drops, got {}", drops);
    fixture.stop().await;
}

/// Per-IP request rate limiting returns 429 and keeps the connection.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn per_ip_rate_limit_rejects_with_429() {
    let backend = RawBackend::fixed("ok").await;

    let mut cfg = base_cfg();
    cfg.admission.per_ip_rate = Some(PerKeyRateConfig {
        qps: 0.001,
        burst: 2.0,
        idle_secs: 60,
        max_entries: 100,
    });
    let fixture = ProxyFixture::start(cfg).await;
    fixture.proxy.registry.add_backend(backend.addr, 1);

    let mut client = TestClient::connect(fixture.addr).await;
    for _ in 0..2 {
        let resp = client.request(&get_request("/x", &[])).await;
        assert_eq!(resp.status, 200);
    }
    let resp = client.request(&get_request("/x", &[])).await;
    assert_eq!(resp.status, 429);
    // Connection survives the rejection.
    let resp = client.request(&get_request("/x", &[])).await;
    assert_eq!(resp.status, 429);
    fixture.stop().await;
}

/// Rewrite rules mutate request and response headers.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn rewrite_rules_apply() {
    let backend = RawBackend::fixed("rewritten").await;

    let mut cfg = base_cfg();
    cfg.rewrite = vec![infermesh_config::RewriteRule {
        path_prefix: "/api".into(),
        set_request_headers: vec![infermesh_config::HeaderPair {
            name: "X-Gateway".into(),
            value: "infermesh".into(),
        }],
        set_response_headers: vec![infermesh_config::HeaderPair {
            name: "X-Served-By".into(),
            value: "infermesh".into(),
        }],
        ..infermesh_config::RewriteRule::default()
    }];
    let fixture = ProxyFixture::start(cfg).await;
    fixture.proxy.registry.add_backend(backend.addr, 1);

    let mut client = TestClient::connect(fixture.addr).await;
    let resp = client.request(&get_request("/api/things", &[])).await;
    assert_eq!(resp.status, 200);
    assert_eq!(resp.header("X-Served-By"), Some("infermesh"));

    settle().await;
    let recorded = backend.recorded();
    assert!(recorded[0]
        .headers
        .iter()
        .any(|(k, v)| k == "X-Gateway" && v == "infermesh"));
    fixture.stop().await;
}

/// A dead backend trips the passive failure signal: first request gets
/// 502, the next gets 503 because the backend left the live set.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn passive_failure_removes_backend() {
    let fixture = ProxyFixture::start(base_cfg()).await;
    // Nothing listens on this port.
    fixture
        .proxy
        .registry
        .add_backend("127.0.0.1:9".parse().unwrap(), 1);

    let mut client = TestClient::connect(fixture.addr).await;
    let resp = client.request(&get_request("/x", &[])).await;
    assert_eq!(resp.status, 502);

    let resp = client.request(&get_request("/x", &[])).await;
    assert_eq!(resp.status, 503, "failed backend must leave the live set");
    fixture.stop().await;
}

/// /stats carries the totals and per-backend snapshot shape.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stats_shape_after_traffic() {
    use assert_json_diff::assert_json_include;

    let backend = RawBackend::fixed("ok").await;
    let mut cfg = base_cfg();
    cfg.admin.enabled = true;
    let fixture = ProxyFixture::start(cfg).await;
    fixture.proxy.registry.add_backend(backend.addr, 1);

    let mut client = TestClient::connect(fixture.addr).await;
    for _ in 0..3 {
        let resp = client.request(&get_request("/x", &[])).await;
        assert_eq!(resp.status, 200);
    }
    settle().await;

    let stats: serde_json::Value = reqwest::get(format!("{}/stats", fixture.admin_url()))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_json_include!(
        actual: stats.clone(),
        expected: serde_json::json!({
            "totals": { "total_requests": 3, "total_responses": 3 },
        })
    );
    assert_eq!(stats["backends"][0]["successes"], 3);
    assert!(stats["latency_ms"]["count"].as_u64().unwrap() >= 3);
    fixture.stop().await;
}

/// ACME challenge files are served from the configured directory.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn acme_challenge_served() {
    let dir = std::env::temp_dir().join(format!("infermesh-acme-{}", std::process::id()));
    tokio::fs::create_dir_all(&dir).await.unwrap();
    tokio::fs::write(dir.join("tokenA"), b"proof").await.unwrap();

    let mut cfg = base_cfg();
    cfg.acme_challenge_dir = Some(dir.to_str().unwrap().to_string());
    let fixture = ProxyFixture::start(cfg).await;

    let mut client = TestClient::connect(fixture.addr).await;
    let resp = client
        .request(&get_request("/.well-known/acme-challenge/tokenA", &[]))
        .await;
    assert_eq!(resp.status, 200);
    assert_eq!(resp.body_text(), "proof");

    let resp = client
        .request(&get_request("/.well-known/acme-challenge/nope", &[]))
        .await;
    assert_eq!(resp.status, 404);

    tokio::fs::remove_dir_all(&dir).await.ok();
    fixture.stop().await;
}

/// Fair queuing alternates between two flows sharing one slot.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn fair_queue_round_robins_flows() {
    let backend = RawBackend::start(Arc::new(|req| {
        if req.path == "/hold" {
            BackendReply::delayed_ok_text(Duration::from_millis(250), "held")
        } else {
            BackendReply::ok_text("done")
        }
    }))
    .await;

    let mut cfg = base_cfg();
    cfg.scheduler = Some(SchedulerConfig {
        mode: SchedulerMode::Fair,
        max_inflight: 1,
        ..SchedulerConfig::default()
    });
    let fixture = ProxyFixture::start(cfg).await;
    fixture.proxy.registry.add_backend(backend.addr, 1);

    let addr = fixture.addr;
    let hold = tokio::spawn(async move {
        let mut client = TestClient::connect(addr).await;
        client
            .request(&get_request("/hold", &[("X-Flow", "seed")]))
            .await
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Enqueue a1, a2, b1, b2; fair service order is a1, b1, a2, b2.
    let mut waiters = Vec::new();
    for (path, flow) in [("/a1", "a"), ("/a2", "a"), ("/b1", "b"), ("/b2", "b")] {
        let addr = fixture.addr;
        let path = path.to_string();
        let flow = flow.to_string();
        waiters.push(tokio::spawn(async move {
            let mut client = TestClient::connect(addr).await;
            client
                .request(&get_request(&path, &[("X-Flow", &flow)]))
                .await
        }));
        tokio::time::sleep(Duration::from_millis(30)).await;
    }

    hold.await.unwrap();
    for waiter in waiters {
        waiter.await.unwrap();
    }
    settle().await;

    assert_eq!(
        backend.recorded_paths(),
        vec!["/hold", "/a1", "/b1", "/a2", "/b2"]
    );
    fixture.stop().await;
}

/// AI-status polling feeds queue/model telemetry into the registry,
/// and warmup gating holds a new backend out of rotation until the
/// warmup POST lands.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn ai_status_and_warmup_probes() {
    use infermesh_test_harness::MockInferenceService;

    let sidecar = MockInferenceService::start(serde_json::json!({
        "queue_len": 4,
        "gpu_util": 0.25,
        "model": "llama",
        "model_loaded": true,
        "model_version": "v1",
    }))
    .await;

    let mut cfg = base_cfg();
    cfg.ai_check = Some(infermesh_config::AiCheckConfig {
        interval_secs: 0.2,
        timeout_secs: 1.0,
        http_host: "127.0.0.1".into(),
        http_path: "/ai/status".into(),
    });
    cfg.warmup = Some(infermesh_config::WarmupConfig {
        model: "llama".into(),
        timeout_secs: 1.0,
        http_host: "127.0.0.1".into(),
        http_path: "/ai/warmup".into(),
    });
    let fixture = ProxyFixture::start(cfg).await;
    let probes = fixture.proxy.spawn_probes();

    // Runtime registration goes through the warmup gate.
    let id = fixture.proxy.register_backend(sidecar.addr, 1);
    tokio::time::sleep(Duration::from_millis(600)).await;

    assert!(sidecar.warmup_count() > 0, "warmup POST must fire");
    let snap = fixture.proxy.registry.snapshot();
    let backend = snap.iter().find(|b| b.id == id).unwrap();
    assert!(backend.ai_ready, "warmup must lift the gate");
    assert_eq!(backend.queue_len, Some(4));
    assert_eq!(backend.model_name.as_deref(), Some("llama"));
    assert_eq!(backend.model_version.as_deref(), Some("v1"));
    assert!(fixture.proxy.registry.select("k").is_some());

    // A degraded status report pulls the backend back out.
    sidecar.set_status(serde_json::json!({
        "queue_len": 9,
        "model": "llama",
        "model_loaded": false,
    }));
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert!(
        fixture.proxy.registry.select("k").is_none(),
        "unloaded model must make the backend ineligible"
    );

    for p in probes {
        p.abort();
    }
    fixture.stop().await;
}
