//! Mock backends.
//!
//! [`RawBackend`] is a scriptable raw-TCP HTTP/1.1 server that records
//! every request and counts accepted connections, which is what the
//! keep-alive and batching scenarios assert on. [`MockInferenceService`]
//! is an axum app that speaks the AI-status and warmup endpoints.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use std::sync::Mutex;

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use proxy_core::http::request::RequestParser;

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    pub path: String,
    pub query: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

/// How the scripted backend answers one request.
pub enum BackendReply {
    /// Write the bytes, optionally after a delay.
    Full {
        delay: Option<Duration>,
        bytes: Vec<u8>,
        close_after: bool,
    },
    /// Write each stage after its delay (streaming responses).
    Staged {
        stages: Vec<(Duration, Vec<u8>)>,
        close_after: bool,
    },
}

impl BackendReply {
    pub fn ok_text(body: &str) -> Self {
        BackendReply::Full {
            delay: None,
            bytes: http_text_response(200, body),
            close_after: false,
        }
    }

    pub fn ok_json(body: &str) -> Self {
        BackendReply::Full {
            delay: None,
            bytes: http_response(200, "application/json", body.as_bytes()),
            close_after: false,
        }
    }

    pub fn delayed_ok_text(delay: Duration, body: &str) -> Self {
        BackendReply::Full {
            delay: Some(delay),
            bytes: http_text_response(200, body),
            close_after: false,
        }
    }
}

/// A complete response with Content-Length framing.
pub fn http_response(status: u16, content_type: &str, body: &[u8]) -> Vec<u8> {
    let mut out = format!(
        "HTTP/1.1 {} X\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: keep-alive\r\n\r\n",
        status,
        content_type,
        body.len()
    )
    .into_bytes();
    out.extend_from_slice(body);
    out
}

pub fn http_text_response(status: u16, body: &str) -> Vec<u8> {
    http_response(status, "text/plain", body.as_bytes())
}

type Handler = Arc<dyn Fn(&RecordedRequest) -> BackendReply + Send + Sync>;

pub struct RawBackend {
    pub addr: SocketAddr,
    connections: Arc<AtomicUsize>,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
    handle: tokio::task::JoinHandle<()>,
}

impl RawBackend {
    /// Start a backend that answers every request with `handler`.
    pub async fn start(handler: Handler) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind backend");
        let addr = listener.local_addr().expect("backend addr");
        let connections = Arc::new(AtomicUsize::new(0));
        let requests = Arc::new(Mutex::new(Vec::new()));

        let conns = connections.clone();
        let reqs = requests.clone();
        let handle = tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else { break };
                conns.fetch_add(1, Ordering::SeqCst);
                let handler = handler.clone();
                let reqs = reqs.clone();
                tokio::spawn(async move {
                    let mut parser = RequestParser::new(64 * 1024, 16 * 1024 * 1024);
                    let mut buf = BytesMut::with_capacity(16 * 1024);
                    'conn: loop {
                        let req = loop {
                            match parser.parse(&mut buf) {
                                Ok(Some(req)) => break req,
                                Ok(None) => {
                                    let Ok(n) = stream.read_buf(&mut buf).await else {
                                        break 'conn;
                                    };
                                    if n == 0 {
                                        break 'conn;
                                    }
                                }
                                Err(_) => break 'conn,
                            }
                        };
                        let recorded = RecordedRequest {
                            method: req.method.clone(),
                            path: req.path.clone(),
                            query: req.query.clone(),
                            headers: req.headers.clone(),
                            body: req.body.to_vec(),
                        };
                        let reply = handler(&recorded);
                        reqs.lock().expect("requests lock").push(recorded);

                        match reply {
                            BackendReply::Full {
                                delay,
                                bytes,
                                close_after,
                            } => {
                                if let Some(delay) = delay {
                                    tokio::time::sleep(delay).await;
                                }
                                if stream.write_all(&bytes).await.is_err() {
                                    break 'conn;
                                }
                                if close_after {
                                    break 'conn;
                                }
                            }
                            BackendReply::Staged {
                                stages,
                                close_after,
                            } => {
                                for (delay, bytes) in stages {
                                    if !delay.is_zero() {
                                        tokio::time::sleep(delay).await;
                                    }
                                    if stream.write_all(&bytes).await.is_err() {
                                        break 'conn;
                                    }
                                    let _ = stream.flush().await;
                                }
                                if close_after {
                                    break 'conn;
                                }
                            }
                        }
                    }
                });
            }
        });

        Self {
            addr,
            connections,
            requests,
            handle,
        }
    }

    /// Backend that answers every request identically.
    pub async fn fixed(body: &str) -> Self {
        let body = body.to_string();
        Self::start(Arc::new(move |_req| BackendReply::ok_text(&body))).await
    }

    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().expect("requests lock").len()
    }

    pub fn recorded(&self) -> Vec<RecordedRequest> {
        self.requests.lock().expect("requests lock").clone()
    }

    pub fn recorded_paths(&self) -> Vec<String> {
        self.recorded().into_iter().map(|r| r.path).collect()
    }
}

impl Drop for RawBackend {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Axum mock speaking the AI sidecar endpoints used by probes.
pub struct MockInferenceService {
    pub addr: SocketAddr,
    state: Arc<InferenceState>,
    handle: tokio::task::JoinHandle<()>,
}

#[derive(Default)]
struct InferenceState {
    status_body: Mutex<serde_json::Value>,
    warmups: AtomicUsize,
}

impl MockInferenceService {
    pub async fn start(status_body: serde_json::Value) -> Self {
        let state = Arc::new(InferenceState {
            status_body: Mutex::new(status_body),
            warmups: AtomicUsize::new(0),
        });

        let app = Router::new()
            .route("/health", get(|| async { Json(serde_json::json!({"healthy": true})) }))
            .route("/ai/status", get(ai_status_handler))
            .route("/ai/warmup", post(warmup_handler))
            .with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mock");
        let addr = listener.local_addr().expect("mock addr");
        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });

        Self {
            addr,
            state,
            handle,
        }
    }

    pub fn set_status(&self, body: serde_json::Value) {
        *self.state.status_body.lock().expect("status lock") = body;
    }

    pub fn warmup_count(&self) -> usize {
        self.state.warmups.load(Ordering::SeqCst)
    }
}

impl Drop for MockInferenceService {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn ai_status_handler(State(state): State<Arc<InferenceState>>) -> Json<serde_json::Value> {
    Json(state.status_body.lock().expect("status lock").clone())
}

async fn warmup_handler(State(state): State<Arc<InferenceState>>) -> Json<serde_json::Value> {
    state.warmups.fetch_add(1, Ordering::SeqCst);
    Json(serde_json::json!({"warmed": true}))
}
