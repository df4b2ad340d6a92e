//! The request pipeline.
//!
//! Order on the full path: admission → cache lookup → scheduler admit
//! → selection → batch try → lease → request rewrite → forward →
//! response (streaming or buffered) → response rewrite → cache store →
//! deliver → mirror → lease release. Backend selection runs before the
//! batch attempt because merge groups are keyed by backend.

use std::sync::Arc;
use std::time::Instant;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use infermesh_admission::audit::AuditDecision;
use infermesh_admission::CongestionWindow;
use infermesh_config::AffinityMode;

use crate::acme;
use crate::batch::{split_json_array, BatchOutcome};
use crate::error::ProxyError;
use crate::http::request::ParsedRequest;
use crate::http::response::{write_head, BodyFramer, Framing, ResponseHead};
use crate::http::decode_chunked;
use crate::proxy::ProxyServer;
use crate::session::SessionContext;
use crate::stats::ProxyStats;

pub fn status_text(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        413 => "Payload Too Large",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "",
    }
}

/// A complete small response with explicit framing.
pub fn simple_response(
    status: u16,
    content_type: &str,
    body: &[u8],
    keep_alive: bool,
) -> Vec<u8> {
    let mut out = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: {}\r\n\r\n",
        status,
        status_text(status),
        content_type,
        body.len(),
        if keep_alive { "keep-alive" } else { "close" },
    )
    .into_bytes();
    out.extend_from_slice(body);
    out
}

fn truthy(value: &str) -> bool {
    matches!(value, "1" | "true" | "TRUE" | "yes" | "YES")
}

fn upsert_header(headers: &mut Vec<(String, String)>, name: &str, value: &str) {
    if let Some(slot) = headers.iter_mut().find(|(k, _)| k.eq_ignore_ascii_case(name)) {
        slot.1 = value.to_string();
    } else {
        headers.push((name.to_string(), value.to_string()));
    }
}

fn cookie_value(header: Option<&str>, name: &str) -> Option<String> {
    header?.split(';').find_map(|kv| {
        let (k, v) = kv.trim().split_once('=')?;
        (k == name).then(|| v.to_string())
    })
}

/// Sticky-session key per the configured affinity mode; the client IP
/// is both the default and the fallback.
fn selection_key(proxy: &ProxyServer, session: &SessionContext, req: &ParsedRequest) -> String {
    let ip = session.peer.ip().to_string();
    let affinity = &proxy.cfg.affinity;
    match affinity.mode {
        AffinityMode::None | AffinityMode::Ip => ip,
        AffinityMode::Header => req
            .header(&affinity.header_name)
            .map(str::to_string)
            .unwrap_or(ip),
        AffinityMode::Cookie => {
            cookie_value(req.header("cookie"), &affinity.cookie_name).unwrap_or(ip)
        }
    }
}

/// Exactly-once completion for the congestion window. Explicit
/// `finish` carries the success signal; a drop without finish counts
/// as success so admission-path rejections do not shrink the window.
struct CongestionPermit<'a> {
    window: Option<&'a CongestionWindow>,
}

impl<'a> CongestionPermit<'a> {
    fn finish(mut self, ok: bool) {
        if let Some(w) = self.window.take() {
            w.end(ok);
        }
    }
}

impl Drop for CongestionPermit<'_> {
    fn drop(&mut self) {
        if let Some(w) = self.window.take() {
            w.end(true);
        }
    }
}

/// Run the admission chain. On success the returned permit holds the
/// congestion-window slot for the rest of the request.
fn admission<'a>(
    proxy: &'a ProxyServer,
    session: &mut SessionContext,
    req: &ParsedRequest,
) -> Result<CongestionPermit<'a>, ProxyError> {
    let ip = session.peer.ip();

    if let Some(access) = &proxy.access {
        let token = access.token_header().and_then(|h| req.header(h));
        if !access.check(ip, token) {
            return Err(ProxyError::AdmissionRejected {
                status: 403,
                reason: "access denied",
            });
        }
    }

    if let Some(bucket) = &proxy.global_bucket {
        if !bucket.try_acquire(1.0) {
            return Err(ProxyError::AdmissionRejected {
                status: 429,
                reason: "global rate limit",
            });
        }
    }
    if let Some(per_ip) = &proxy.per_ip_rate {
        if !per_ip.try_acquire(&ip.to_string()) {
            return Err(ProxyError::AdmissionRejected {
                status: 429,
                reason: "per-ip rate limit",
            });
        }
    }
    if let Some(per_path) = &proxy.per_path_rate {
        if !per_path.try_acquire(&req.path) {
            return Err(ProxyError::AdmissionRejected {
                status: 429,
                reason: "per-path rate limit",
            });
        }
    }

    let permit = match &proxy.congestion {
        Some(window) => {
            if !window.try_start() {
                return Err(ProxyError::AdmissionRejected {
                    status: 503,
                    reason: "congestion window full",
                });
            }
            CongestionPermit {
                window: Some(window),
            }
        }
        None => CongestionPermit { window: None },
    };

    // Per-user / per-service connection caps, paired exactly once per
    // connection via the session bit.
    if !session.conn_limit_applied {
        let user_key = req
            .header(&proxy.cfg.headers.api_token)
            .map(str::to_string);
        let service_key = SessionContext::service_key_for(&req.path);

        let mut applied_user = false;
        if let (Some(limiter), Some(key)) = (&proxy.user_conns, &user_key) {
            if !limiter.try_acquire(key) {
                return Err(ProxyError::AdmissionRejected {
                    status: 429,
                    reason: "per-user connection cap",
                });
            }
            applied_user = true;
        }

        let mut applied_service = false;
        if let Some(limiter) = &proxy.service_conns {
            if !limiter.try_acquire(&service_key) {
                if applied_user {
                    if let (Some(limiter), Some(key)) = (&proxy.user_conns, &user_key) {
                        limiter.release(key);
                    }
                }
                return Err(ProxyError::AdmissionRejected {
                    status: 429,
                    reason: "per-service connection cap",
                });
            }
            applied_service = true;
        }

        if applied_user || applied_service {
            session.conn_limit_applied = true;
            session.user_key = applied_user.then(|| user_key.unwrap_or_default());
            session.service_key = applied_service.then_some(service_key);
        }
    }

    Ok(permit)
}

struct ForwardOutcome {
    client_keep: bool,
    backend_keep: bool,
}

struct ForwardFailure {
    error: ProxyError,
    /// Response bytes already reached the client; no error response
    /// can be sent and the connection must close.
    response_started: bool,
}

/// Serve one parsed request. Writes the response (or error response)
/// to `client` and returns whether the connection may continue. `Err`
/// means the connection must close immediately.
pub async fn handle_request<S>(
    proxy: &Arc<ProxyServer>,
    session: &mut SessionContext,
    req: &ParsedRequest,
    client: &mut S,
) -> Result<bool, ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let stats = &proxy.stats;
    ProxyStats::bump(&stats.total_requests);
    session.requests_served += 1;
    let client_keep = req.keep_alive();

    let client_io = |source: std::io::Error| ProxyError::ClientIo { source };

    // ACME challenge files bypass the whole pipeline.
    if let Some(dir) = &proxy.cfg.acme_challenge_dir {
        if let Some(found) = acme::try_serve(&req.path, dir).await {
            let resp = match found {
                Some(body) => simple_response(200, "text/plain", &body, client_keep),
                None => simple_response(404, "text/plain", b"not found", client_keep),
            };
            client.write_all(&resp).await.map_err(client_io)?;
            ProxyStats::bump(&stats.total_responses);
            return Ok(client_keep);
        }
    }

    let congestion = match admission(proxy, session, req) {
        Ok(permit) => permit,
        Err(e) => {
            ProxyStats::bump(&stats.admission_rejects);
            proxy.audit.log(
                &session.peer.to_string(),
                &req.method,
                &req.path,
                AuditDecision::Rejected,
                e.category(),
            );
            let resp =
                simple_response(e.status_code(), "text/plain", e.to_string().as_bytes(), client_keep);
            client.write_all(&resp).await.map_err(client_io)?;
            return Ok(client_keep);
        }
    };

    // Cache lookup for GETs; a hit short-circuits everything below.
    let mut cache_fp: Option<String> = None;
    if let Some(cache) = &proxy.cache {
        if req.method.eq_ignore_ascii_case("GET") {
            let fp = cache.fingerprint(&req.method, &req.path, &req.query, &req.headers);
            if let Some(value) = cache.get(&fp).await {
                ProxyStats::bump(&stats.cache_hits);
                client.write_all(&value).await.map_err(client_io)?;
                ProxyStats::bump(&stats.total_responses);
                congestion.finish(true);
                return Ok(client_keep);
            }
            ProxyStats::bump(&stats.cache_misses);
            cache_fp = Some(fp);
        }
    }

    // Scheduler admission; the permit rides along until the response
    // (or error) completes.
    let _sched_permit = match &proxy.scheduler {
        Some(sched) => {
            let scfg = proxy.cfg.scheduler.as_ref();
            let priority = scfg
                .and_then(|c| req.header_or_query(&c.priority_header, &c.priority_query))
                .and_then(|v| v.parse::<i64>().ok());
            let flow = scfg.and_then(|c| req.header_or_query(&c.flow_header, &c.flow_query));
            let deadline = scfg
                .and_then(|c| req.header_or_query(&c.deadline_header, &c.deadline_query))
                .and_then(|v| v.parse::<u64>().ok());
            let key = sched.classify(priority, flow, deadline, &session.peer.ip().to_string());
            Some(sched.admit(key).await)
        }
        None => None,
    };

    // Selection, model- and version-aware.
    let model = req
        .header(&proxy.cfg.headers.model)
        .unwrap_or("")
        .to_string();
    let version = req
        .header(&proxy.cfg.headers.model_version)
        .unwrap_or("")
        .to_string();
    let select_key = selection_key(proxy, session, req);

    let selected = if !version.is_empty() {
        proxy
            .registry
            .select_for_model_version(&select_key, &model, &version)
    } else if !model.is_empty() {
        proxy.registry.select_for_model(&select_key, &model)
    } else {
        proxy.registry.select(&select_key)
    };
    let Some((backend_id, backend_addr)) = selected else {
        ProxyStats::bump(&stats.no_backend_errors);
        let resp = simple_response(503, "text/plain", b"no eligible backend", client_keep);
        client.write_all(&resp).await.map_err(client_io)?;
        congestion.finish(true);
        return Ok(client_keep);
    };

    // Client-supplied JSON array splitting.
    let split_requested = req
        .header(&proxy.cfg.headers.batch_split)
        .map(truthy)
        .unwrap_or(false);
    if split_requested && req.method.eq_ignore_ascii_case("POST") {
        if let Some(items) = split_json_array(&req.body) {
            let result =
                batch_split(proxy, session, req, &backend_id, backend_addr, items, client).await;
            congestion.finish(result.is_ok());
            result?;
            ProxyStats::bump(&stats.total_responses);
            return Ok(client_keep);
        }
    }

    // Merge batching parks the request and replies from the group.
    if let Some(batcher) = &proxy.batcher {
        if let Some(rx) = batcher.try_enqueue(req, &backend_id, backend_addr, &model) {
            let resp = match rx.await {
                Ok(BatchOutcome::Item(body)) => {
                    ProxyStats::bump(&stats.total_responses);
                    simple_response(200, "application/json", &body, client_keep)
                }
                Ok(BatchOutcome::Failed(detail)) => {
                    ProxyStats::bump(&stats.backend_errors);
                    simple_response(502, "text/plain", detail.as_bytes(), client_keep)
                }
                Err(_) => {
                    ProxyStats::bump(&stats.backend_errors);
                    simple_response(502, "text/plain", b"batch aborted", client_keep)
                }
            };
            client.write_all(&resp).await.map_err(client_io)?;
            congestion.finish(true);
            if let Some(mirror) = &proxy.mirror {
                mirror.mirror(
                    stats,
                    &req.method,
                    &req.path,
                    &session.peer.ip().to_string(),
                    &req.body,
                );
            }
            return Ok(client_keep);
        }
    }

    // Plain forward through a pool lease.
    let rule_idx = proxy.rewrite.match_rule(&req.method, &req.path);
    let mut lease = match proxy.pool.acquire(session.shard, backend_addr).await {
        Ok(lease) => lease,
        Err(source) => {
            proxy.registry.report_failure(&backend_id);
            ProxyStats::bump(&stats.backend_errors);
            congestion.finish(false);
            let e = ProxyError::BackendConnectFail {
                backend: backend_id,
                source,
            };
            tracing::debug!(error = %e, "backend connect failed");
            let resp = simple_response(502, "text/plain", e.to_string().as_bytes(), client_keep);
            client.write_all(&resp).await.map_err(client_io)?;
            return Ok(client_keep);
        }
    };

    proxy.registry.on_conn_start(&backend_id);
    let started = Instant::now();
    let forwarded =
        forward_and_respond(proxy, req, rule_idx, cache_fp.as_deref(), &mut lease, client).await;
    proxy.registry.on_conn_end(&backend_id);

    match forwarded {
        Ok(outcome) => {
            let ms = started.elapsed().as_secs_f64() * 1000.0;
            proxy.registry.record_latency(&backend_id, ms);
            stats.record_latency(ms);
            ProxyStats::bump(&stats.total_responses);
            lease.release(outcome.backend_keep);
            congestion.finish(true);
            if let Some(mirror) = &proxy.mirror {
                mirror.mirror(
                    stats,
                    &req.method,
                    &req.path,
                    &session.peer.ip().to_string(),
                    &req.body,
                );
            }
            Ok(outcome.client_keep && client_keep)
        }
        Err(failure) => {
            lease.release(false);
            congestion.finish(false);
            match &failure.error {
                ProxyError::BackendIo { .. } | ProxyError::BadGateway(_) => {
                    proxy.registry.report_failure(&backend_id);
                    ProxyStats::bump(&stats.backend_errors);
                }
                ProxyError::Timeout(_) => {
                    ProxyStats::bump(&stats.timeouts);
                }
                ProxyError::ClientIo { .. } => {}
                _ => {
                    ProxyStats::bump(&stats.backend_errors);
                }
            }

            if !failure.response_started
                && !matches!(failure.error, ProxyError::ClientIo { .. })
            {
                let e = &failure.error;
                let resp =
                    simple_response(e.status_code(), "text/plain", e.to_string().as_bytes(), client_keep);
                client.write_all(&resp).await.map_err(client_io)?;
                if !e.closes_connection() {
                    return Ok(client_keep);
                }
            }
            Err(failure.error)
        }
    }
}

/// Build the forward request head + body for the backend.
fn build_forward_request(
    proxy: &ProxyServer,
    req: &ParsedRequest,
    rule_idx: Option<usize>,
    buffer_planned: bool,
) -> Vec<u8> {
    let mut body = req.body.to_vec();
    if let Some(i) = rule_idx {
        if proxy.rewrite.request_needs_body(i) {
            body = proxy.rewrite.apply_request_body(i, body);
        }
    }

    let mut headers: Vec<(String, String)> = req
        .headers
        .iter()
        .filter(|(k, _)| {
            !(k.eq_ignore_ascii_case("connection")
                || k.eq_ignore_ascii_case("content-length")
                || k.eq_ignore_ascii_case("transfer-encoding")
                || (buffer_planned && k.eq_ignore_ascii_case("accept-encoding")))
        })
        .cloned()
        .collect();
    if let Some(i) = rule_idx {
        proxy.rewrite.apply_request_headers(i, &mut headers);
    }
    upsert_header(&mut headers, "Connection", "keep-alive");
    if buffer_planned {
        // The body will be mutated or stored; a compressed response
        // cannot be edited in place.
        upsert_header(&mut headers, "Accept-Encoding", "identity");
    }
    if !body.is_empty()
        || matches!(req.method.as_str(), "POST" | "PUT" | "PATCH")
    {
        upsert_header(&mut headers, "Content-Length", &body.len().to_string());
    }

    let mut out = format!("{} {} HTTP/1.1\r\n", req.method, req.target()).into_bytes();
    for (name, value) in &headers {
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(&body);
    out
}

async fn forward_and_respond<S>(
    proxy: &Arc<ProxyServer>,
    req: &ParsedRequest,
    rule_idx: Option<usize>,
    cache_fp: Option<&str>,
    lease: &mut infermesh_balance::Lease,
    client: &mut S,
) -> Result<ForwardOutcome, ForwardFailure>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let backend_id = lease.backend_id().to_string();

    let wants_stream = req
        .header(&proxy.cfg.headers.stream)
        .map(truthy)
        .unwrap_or(false);
    let rewrite_body = rule_idx
        .map(|i| proxy.rewrite.response_needs_body(i))
        .unwrap_or(false);
    let buffer_planned = !wants_stream && (rewrite_body || cache_fp.is_some());

    let out = build_forward_request(proxy, req, rule_idx, buffer_planned);

    let backend_io = |backend: &str, source: std::io::Error, started: bool| ForwardFailure {
        error: ProxyError::BackendIo {
            backend: backend.to_string(),
            source,
        },
        response_started: started,
    };
    let bad_gateway = |detail: String, started: bool| ForwardFailure {
        error: ProxyError::BadGateway(detail),
        response_started: started,
    };
    let client_io = |source: std::io::Error| ForwardFailure {
        error: ProxyError::ClientIo { source },
        response_started: true,
    };

    let stream = lease.stream_mut();
    stream
        .write_all(&out)
        .await
        .map_err(|e| backend_io(&backend_id, e, false))?;

    // Response head.
    let mut raw = BytesMut::with_capacity(16 * 1024);
    let mut closed = false;
    let (head, head_len) = loop {
        match ResponseHead::parse(&raw).map_err(|error| ForwardFailure {
            error,
            response_started: false,
        })? {
            Some(parsed) => break parsed,
            None => {
                if closed {
                    return Err(bad_gateway("backend closed before response head".into(), false));
                }
                if raw.len() > proxy.cfg.http.max_header_bytes {
                    return Err(bad_gateway("response head too large".into(), false));
                }
                let n = stream
                    .read_buf(&mut raw)
                    .await
                    .map_err(|e| backend_io(&backend_id, e, false))?;
                if n == 0 {
                    closed = true;
                }
            }
        }
    };

    let mut framer = BodyFramer::for_message(&head, &req.method);
    let until_close = matches!(head.framing(), Framing::UntilClose);

    let mut resp_headers = head.headers.clone();
    if let Some(i) = rule_idx {
        proxy.rewrite.apply_response_headers(i, &mut resp_headers);
    }

    // Body bytes that arrived together with the head go through the
    // framer once, up front; both modes then only see fresh reads.
    let first_body = raw[head_len..].to_vec();
    let progress = framer
        .feed(&first_body)
        .map_err(|error| ForwardFailure {
            error,
            response_started: false,
        })?;
    let first_consumed = &first_body[..progress.consumed];

    if !buffer_planned {
        let client_keep = req.keep_alive() && !until_close;
        return stream_response(
            StreamArgs {
                head: &head,
                resp_headers,
                framer: &mut framer,
                already: first_consumed,
                client_keep,
                backend_id: &backend_id,
                backend_eof: closed,
            },
            lease,
            client,
        )
        .await;
    }

    // Buffered mode: collect the framed body, mutate, re-emit.
    let limit = proxy.cfg.http.response_buffer_limit;
    let mut body_raw: Vec<u8> = Vec::with_capacity(first_body.len().min(64 * 1024));
    body_raw.extend_from_slice(first_consumed);
    let mut done = progress.done;
    let mut eof = closed;

    let mut chunk = [0u8; 16 * 1024];
    while !done {
        if body_raw.len() > limit {
            // Soft cap breached: degrade to streaming.
            tracing::debug!(limit, "response buffer limit hit; degrading to streaming");
            let client_keep = req.keep_alive() && !until_close;
            return stream_response(
                StreamArgs {
                    head: &head,
                    resp_headers,
                    framer: &mut framer,
                    already: &body_raw,
                    client_keep,
                    backend_id: &backend_id,
                    backend_eof: eof,
                },
                lease,
                client,
            )
            .await;
        }
        if eof {
            if framer.on_eof() {
                done = true;
                break;
            }
            return Err(bad_gateway("backend closed mid-response".into(), false));
        }
        let n = lease
            .stream_mut()
            .read(&mut chunk)
            .await
            .map_err(|e| backend_io(&backend_id, e, false))?;
        if n == 0 {
            eof = true;
            continue;
        }
        let progress = framer.feed(&chunk[..n]).map_err(|error| ForwardFailure {
            error,
            response_started: false,
        })?;
        body_raw.extend_from_slice(&chunk[..progress.consumed]);
        done = progress.done;
    }

    let payload = match head.framing() {
        Framing::Chunked => decode_chunked(&body_raw)
            .map_err(|e| bad_gateway(format!("bad chunked body: {}", e), false))?,
        _ => body_raw,
    };
    let payload = match rule_idx {
        Some(i) if proxy.rewrite.response_needs_body(i) => {
            proxy.rewrite.apply_response_body(i, payload)
        }
        _ => payload,
    };

    // Recompute framing for the re-emitted response.
    let mut final_headers: Vec<(String, String)> = resp_headers
        .into_iter()
        .filter(|(k, _)| {
            !(k.eq_ignore_ascii_case("content-length")
                || k.eq_ignore_ascii_case("transfer-encoding")
                || k.eq_ignore_ascii_case("connection"))
        })
        .collect();
    final_headers.push(("Content-Length".to_string(), payload.len().to_string()));

    // Cache copy carries no Connection header.
    if let (Some(fp), Some(cache)) = (cache_fp, &proxy.cache) {
        if head.status == 200 {
            let mut cached = write_head(head.status, &head.reason, &final_headers);
            cached.extend_from_slice(&payload);
            cache.set(fp, &cached).await;
        }
    }

    let client_keep = req.keep_alive();
    let mut client_headers = final_headers;
    client_headers.push((
        "Connection".to_string(),
        if client_keep { "keep-alive" } else { "close" }.to_string(),
    ));
    let mut out = write_head(head.status, &head.reason, &client_headers);
    out.extend_from_slice(&payload);
    client.write_all(&out).await.map_err(client_io)?;
    client.flush().await.map_err(client_io)?;

    Ok(ForwardOutcome {
        client_keep,
        backend_keep: framer.is_done() && head.keep_alive() && !eof,
    })
}

struct StreamArgs<'a> {
    head: &'a ResponseHead,
    resp_headers: Vec<(String, String)>,
    framer: &'a mut BodyFramer,
    /// Body bytes already pulled off the backend socket.
    already: &'a [u8],
    client_keep: bool,
    backend_id: &'a str,
    backend_eof: bool,
}

/// Streaming passthrough: emit the (rewritten) head, then relay body
/// bytes as they arrive while the framer watches for the end.
async fn stream_response<S>(
    args: StreamArgs<'_>,
    lease: &mut infermesh_balance::Lease,
    client: &mut S,
) -> Result<ForwardOutcome, ForwardFailure>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let StreamArgs {
        head,
        mut resp_headers,
        framer,
        already,
        client_keep,
        backend_id,
        mut backend_eof,
    } = args;

    let client_io = |source: std::io::Error| ForwardFailure {
        error: ProxyError::ClientIo { source },
        response_started: true,
    };
    let backend_io = |source: std::io::Error| ForwardFailure {
        error: ProxyError::BackendIo {
            backend: backend_id.to_string(),
            source,
        },
        response_started: true,
    };
    let bad_gateway = |detail: String| ForwardFailure {
        error: ProxyError::BadGateway(detail),
        response_started: true,
    };

    upsert_header(
        &mut resp_headers,
        "Connection",
        if client_keep { "keep-alive" } else { "close" },
    );
    let head_out = write_head(head.status, &head.reason, &resp_headers);
    client.write_all(&head_out).await.map_err(client_io)?;

    // Body bytes the caller already pulled off the socket and fed to
    // the framer; relay them verbatim.
    if !already.is_empty() {
        client.write_all(already).await.map_err(client_io)?;
    }
    client.flush().await.map_err(client_io)?;
    let mut done = framer.is_done();

    let mut chunk = [0u8; 16 * 1024];
    while !done {
        if backend_eof {
            if framer.on_eof() {
                break;
            }
            return Err(bad_gateway("backend closed mid-response".into()));
        }
        let n = lease
            .stream_mut()
            .read(&mut chunk)
            .await
            .map_err(backend_io)?;
        if n == 0 {
            backend_eof = true;
            continue;
        }
        let progress = framer
            .feed(&chunk[..n])
            .map_err(|e| bad_gateway(e.to_string()))?;
        client
            .write_all(&chunk[..progress.consumed])
            .await
            .map_err(client_io)?;
        client.flush().await.map_err(client_io)?;
        done = progress.done;
    }

    Ok(ForwardOutcome {
        client_keep,
        backend_keep: framer.is_done() && head.keep_alive() && !backend_eof,
    })
}

/// Split a client-supplied JSON array into per-item backend requests,
/// forwarded serially in order, and compose the
/// `[{"status":…,"body":…},…]` response.
async fn batch_split<S>(
    proxy: &Arc<ProxyServer>,
    session: &SessionContext,
    req: &ParsedRequest,
    backend_id: &str,
    backend_addr: std::net::SocketAddr,
    items: Vec<Vec<u8>>,
    client: &mut S,
) -> Result<(), ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut results = Vec::with_capacity(items.len());
    for item in &items {
        match single_item_exchange(proxy, session.shard, backend_id, backend_addr, req, item).await
        {
            Ok((status, body)) => {
                results.push(serde_json::json!({
                    "status": status,
                    "body": String::from_utf8_lossy(&body),
                }));
            }
            Err(e) => {
                proxy.registry.report_failure(backend_id);
                results.push(serde_json::json!({
                    "status": 502,
                    "body": e.to_string(),
                }));
            }
        }
    }

    let body = serde_json::to_vec(&serde_json::Value::Array(results))
        .map_err(|e| ProxyError::Protocol(format!("split response encode: {}", e)))?;
    let resp = simple_response(200, "application/json", &body, req.keep_alive());
    client
        .write_all(&resp)
        .await
        .map_err(|source| ProxyError::ClientIo { source })?;
    Ok(())
}

/// One synthetic POST carrying a single array element; the response is
/// fully buffered. No body mutation is applied here.
async fn single_item_exchange(
    proxy: &Arc<ProxyServer>,
    shard: usize,
    backend_id: &str,
    backend_addr: std::net::SocketAddr,
    req: &ParsedRequest,
    item: &[u8],
) -> Result<(u16, Vec<u8>), ProxyError> {
    let mut lease = proxy
        .pool
        .acquire(shard, backend_addr)
        .await
        .map_err(|source| ProxyError::BackendConnectFail {
            backend: backend_id.to_string(),
            source,
        })?;

    let mut head = format!(
        "{} {} HTTP/1.1\r\nHost: {}\r\nConnection: keep-alive\r\nContent-Type: application/json\r\n",
        req.method,
        req.target(),
        backend_addr
    );
    if let Some(model) = req.header(&proxy.cfg.headers.model) {
        head.push_str(&format!("{}: {}\r\n", proxy.cfg.headers.model, model));
    }
    head.push_str(&format!("Content-Length: {}\r\n\r\n", item.len()));

    proxy.registry.on_conn_start(backend_id);
    let result = async {
        let io_err = |source: std::io::Error| ProxyError::BackendIo {
            backend: backend_id.to_string(),
            source,
        };
        let stream = lease.stream_mut();
        stream.write_all(head.as_bytes()).await.map_err(io_err)?;
        stream.write_all(item).await.map_err(io_err)?;

        let mut raw: Vec<u8> = Vec::with_capacity(4096);
        let mut parsed: Option<(ResponseHead, usize)> = None;
        let mut framer: Option<BodyFramer> = None;
        let mut eof = false;
        let mut chunk = [0u8; 16 * 1024];
        loop {
            if raw.len() > proxy.cfg.http.response_buffer_limit {
                return Err(ProxyError::BodyTooLarge {
                    limit: proxy.cfg.http.response_buffer_limit,
                });
            }
            if parsed.is_none() {
                if let Some((h, len)) = ResponseHead::parse(&raw)? {
                    let mut f = BodyFramer::for_message(&h, &req.method);
                    f.feed(&raw[len..])?;
                    framer = Some(f);
                    parsed = Some((h, len));
                }
            }
            if let Some(f) = framer.as_mut() {
                if f.is_done() {
                    break;
                }
                if eof {
                    if f.on_eof() {
                        break;
                    }
                    return Err(ProxyError::BadGateway("backend closed mid-response".into()));
                }
            } else if eof {
                return Err(ProxyError::BadGateway("backend closed before head".into()));
            }

            let n = stream.read(&mut chunk).await.map_err(io_err)?;
            if n == 0 {
                eof = true;
                continue;
            }
            raw.extend_from_slice(&chunk[..n]);
            if let Some(f) = framer.as_mut() {
                f.feed(&chunk[..n])?;
            }
        }

        let (h, len) = parsed.ok_or_else(|| ProxyError::BadGateway("no response head".into()))?;
        let body = match h.framing() {
            Framing::Chunked => decode_chunked(&raw[len..]).map_err(ProxyError::BadGateway)?,
            _ => raw[len..].to_vec(),
        };
        let keep = !eof
            && framer.as_ref().map(|f| f.is_done()).unwrap_or(false)
            && h.keep_alive();
        Ok((h.status, body, keep))
    }
    .await;
    proxy.registry.on_conn_end(backend_id);

    match result {
        Ok((status, body, keep)) => {
            lease.release(keep);
            Ok((status, body))
        }
        Err(e) => {
            lease.release(false);
            Err(e)
        }
    }
}
