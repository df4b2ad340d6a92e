//! JSON POST micro-batching.
//!
//! Eligible requests park in a group keyed by
//! `backend|route|model` until the window timer, the item cap, or the
//! byte cap fires. One merged `[item1,item2,…]` POST goes to the
//! backend; the JSON-array response is split by top-level commas and
//! each waiter receives its own element. A mismatched response fails
//! the whole group with 502.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::oneshot;

use infermesh_balance::hash::fnv1a64;
use infermesh_balance::{BackendRegistry, ConnectionPool};
use infermesh_config::BatchConfig;

use crate::error::ProxyError;
use crate::http::request::ParsedRequest;
use crate::http::response::{BodyFramer, Framing, ResponseHead};
use crate::http::{decode_chunked, looks_like_json};
use crate::stats::ProxyStats;

/// What a parked client eventually receives.
#[derive(Debug)]
pub enum BatchOutcome {
    /// The group succeeded; this is the caller's response element.
    Item(Bytes),
    /// The group failed; reply 502 with this detail.
    Failed(String),
}

struct PendingItem {
    body: Bytes,
    tx: oneshot::Sender<BatchOutcome>,
}

struct Group {
    epoch: u64,
    backend_id: String,
    addr: SocketAddr,
    route: String,
    model: String,
    items: Vec<PendingItem>,
    bytes: usize,
}

struct TakenGroup {
    backend_id: String,
    addr: SocketAddr,
    route: String,
    model: String,
    items: Vec<PendingItem>,
    bytes: usize,
}

pub struct Batcher {
    cfg: BatchConfig,
    batch_header: String,
    shards: usize,
    request_timeout: Duration,
    registry: Arc<BackendRegistry>,
    pool: Arc<ConnectionPool>,
    stats: Arc<ProxyStats>,
    groups: Mutex<HashMap<String, Group>>,
    epochs: AtomicU64,
}

/// Split a JSON array into its top-level elements by scanning string,
/// escape, and bracket state. Returns `None` when the input is not an
/// array.
pub fn split_json_array(body: &[u8]) -> Option<Vec<Vec<u8>>> {
    let trimmed: &[u8] = {
        let start = body.iter().position(|b| !b.is_ascii_whitespace())?;
        let end = body.iter().rposition(|b| !b.is_ascii_whitespace())?;
        &body[start..=end]
    };
    if trimmed.len() < 2 || trimmed[0] != b'[' || trimmed[trimmed.len() - 1] != b']' {
        return None;
    }

    let inner = &trimmed[1..trimmed.len() - 1];
    let mut items = Vec::new();
    let mut in_string = false;
    let mut escape = false;
    let mut depth = 1;
    let mut start = 0usize;

    let mut push = |slice: &[u8], items: &mut Vec<Vec<u8>>| {
        let s = slice
            .iter()
            .position(|b| !b.is_ascii_whitespace())
            .map(|a| {
                let z = slice.iter().rposition(|b| !b.is_ascii_whitespace()).unwrap_or(a);
                &slice[a..=z]
            });
        if let Some(part) = s {
            items.push(part.to_vec());
        }
    };

    for (i, &c) in inner.iter().enumerate() {
        if in_string {
            if escape {
                escape = false;
            } else if c == b'\\' {
                escape = true;
            } else if c == b'"' {
                in_string = false;
            }
            continue;
        }
        match c {
            b'"' => in_string = true,
            b'[' | b'{' => depth += 1,
            b']' | b'}' => depth -= 1,
            b',' if depth == 1 => {
                push(&inner[start..i], &mut items);
                start = i + 1;
            }
            _ => {}
        }
    }
    push(&inner[start..], &mut items);
    Some(items)
}

impl Batcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: BatchConfig,
        batch_header: String,
        shards: usize,
        request_timeout: Duration,
        registry: Arc<BackendRegistry>,
        pool: Arc<ConnectionPool>,
        stats: Arc<ProxyStats>,
    ) -> Arc<Self> {
        Arc::new(Self {
            cfg,
            batch_header,
            shards: shards.max(1),
            request_timeout,
            registry,
            pool,
            stats,
            groups: Mutex::new(HashMap::new()),
            epochs: AtomicU64::new(0),
        })
    }

    fn header_opts_in(&self, req: &ParsedRequest) -> bool {
        match req.header(&self.batch_header) {
            Some(v) => matches!(v, "1" | "true" | "TRUE" | "yes" | "YES"),
            None => false,
        }
    }

    fn eligible(&self, req: &ParsedRequest) -> bool {
        if !self.cfg.enabled {
            return false;
        }
        if !req.method.eq_ignore_ascii_case("POST") {
            return false;
        }
        if !self.cfg.paths.is_empty() && !self.cfg.paths.iter().any(|p| p == &req.path) {
            return false;
        }
        if req.body.is_empty() || req.body.len() > self.cfg.max_bytes {
            return false;
        }
        if self.cfg.require_header && !self.header_opts_in(req) {
            return false;
        }
        looks_like_json(&req.body)
    }

    fn next_epoch(&self) -> u64 {
        self.epochs.fetch_add(1, Ordering::Relaxed)
    }

    fn take(&self, group: &mut Group) -> TakenGroup {
        let fresh = Group {
            epoch: self.next_epoch(),
            backend_id: group.backend_id.clone(),
            addr: group.addr,
            route: group.route.clone(),
            model: group.model.clone(),
            items: Vec::new(),
            bytes: 0,
        };
        let old = std::mem::replace(group, fresh);
        TakenGroup {
            backend_id: old.backend_id,
            addr: old.addr,
            route: old.route,
            model: old.model,
            items: old.items,
            bytes: old.bytes,
        }
    }

    /// Park this request into a batch group. `None` means the request
    /// is not batch-eligible and should be forwarded normally.
    pub fn try_enqueue(
        self: &Arc<Self>,
        req: &ParsedRequest,
        backend_id: &str,
        addr: SocketAddr,
        model: &str,
    ) -> Option<oneshot::Receiver<BatchOutcome>> {
        if !self.eligible(req) {
            return None;
        }

        let route = req.target();
        let key = format!("{}|{}|model:{}", backend_id, route, model);
        let (tx, rx) = oneshot::channel();

        let mut to_flush: Vec<TakenGroup> = Vec::new();
        let mut arm_timer = None;
        {
            let mut groups = self.groups.lock();
            let group = groups.entry(key.clone()).or_insert_with(|| Group {
                epoch: self.next_epoch(),
                backend_id: backend_id.to_string(),
                addr,
                route: route.clone(),
                model: model.to_string(),
                items: Vec::new(),
                bytes: 0,
            });

            // Adding this item would breach a cap: flush what is
            // queued first, then start a fresh group with this item.
            if !group.items.is_empty()
                && (group.items.len() + 1 > self.cfg.max_items
                    || group.bytes + req.body.len() > self.cfg.max_bytes)
            {
                to_flush.push(self.take(group));
            }

            group.items.push(PendingItem {
                body: req.body.clone(),
                tx,
            });
            group.bytes += req.body.len();

            if group.items.len() == 1 {
                arm_timer = Some((key.clone(), group.epoch));
            }
            if group.items.len() >= self.cfg.max_items {
                to_flush.push(self.take(group));
            }
        }

        ProxyStats::bump(&self.stats.batch_merged_requests);

        for taken in to_flush {
            self.spawn_flush(taken);
        }
        if let Some((key, epoch)) = arm_timer {
            let batcher = self.clone();
            let window = Duration::from_millis(self.cfg.window_ms);
            tokio::spawn(async move {
                tokio::time::sleep(window).await;
                batcher.flush_expired(&key, epoch);
            });
        }

        Some(rx)
    }

    /// Window timer fired: flush the group if it is still the same
    /// generation and non-empty.
    fn flush_expired(self: &Arc<Self>, key: &str, epoch: u64) {
        let taken = {
            let mut groups = self.groups.lock();
            match groups.get_mut(key) {
                Some(group) if group.epoch == epoch && !group.items.is_empty() => {
                    let taken = self.take(group);
                    groups.remove(key);
                    Some(taken)
                }
                _ => None,
            }
        };
        if let Some(taken) = taken {
            self.spawn_flush(taken);
        }
    }

    fn spawn_flush(self: &Arc<Self>, taken: TakenGroup) {
        let batcher = self.clone();
        tokio::spawn(async move {
            batcher.flush(taken).await;
        });
    }

    async fn flush(self: Arc<Self>, taken: TakenGroup) {
        ProxyStats::bump(&self.stats.batch_flushes);

        let mut merged = Vec::with_capacity(taken.bytes + taken.items.len() + 2);
        merged.push(b'[');
        for (i, item) in taken.items.iter().enumerate() {
            if i > 0 {
                merged.push(b',');
            }
            merged.extend_from_slice(&item.body);
        }
        merged.push(b']');

        let result = tokio::time::timeout(
            self.request_timeout,
            self.forward_merged(&taken, &merged),
        )
        .await
        .unwrap_or(Err(ProxyError::Timeout("batch forward")));

        match result {
            Ok(parts) if parts.len() == taken.items.len() => {
                for (item, part) in taken.items.into_iter().zip(parts) {
                    let _ = item.tx.send(BatchOutcome::Item(Bytes::from(part)));
                }
            }
            Ok(parts) => {
                ProxyStats::bump(&self.stats.batch_failures);
                let detail = ProxyError::BatchMismatch {
                    expected: taken.items.len(),
                    got: parts.len(),
                }
                .to_string();
                for item in taken.items {
                    let _ = item.tx.send(BatchOutcome::Failed(detail.clone()));
                }
            }
            Err(e) => {
                ProxyStats::bump(&self.stats.batch_failures);
                let detail = e.to_string();
                tracing::debug!(backend = %taken.backend_id, error = %detail, "batch flush failed");
                for item in taken.items {
                    let _ = item.tx.send(BatchOutcome::Failed(detail.clone()));
                }
            }
        }
    }

    async fn forward_merged(
        &self,
        taken: &TakenGroup,
        merged: &[u8],
    ) -> Result<Vec<Vec<u8>>, ProxyError> {
        let shard =
            (fnv1a64(taken.backend_id.as_bytes()) % self.shards as u64) as usize;
        let mut lease = self
            .pool
            .acquire(shard, taken.addr)
            .await
            .map_err(|source| {
                self.registry.report_failure(&taken.backend_id);
                ProxyError::BackendConnectFail {
                    backend: taken.backend_id.clone(),
                    source,
                }
            })?;

        self.registry.on_conn_start(&taken.backend_id);
        let started = Instant::now();
        let result = self
            .transact(&mut lease, taken, merged)
            .await;
        self.registry.on_conn_end(&taken.backend_id);

        match result {
            Ok((parts, keep)) => {
                self.registry.record_latency(
                    &taken.backend_id,
                    started.elapsed().as_secs_f64() * 1000.0,
                );
                lease.release(keep);
                Ok(parts)
            }
            Err(e) => {
                if matches!(e, ProxyError::BackendIo { .. } | ProxyError::BadGateway(_)) {
                    self.registry.report_failure(&taken.backend_id);
                }
                lease.release(false);
                Err(e)
            }
        }
    }

    async fn transact(
        &self,
        lease: &mut infermesh_balance::Lease,
        taken: &TakenGroup,
        merged: &[u8],
    ) -> Result<(Vec<Vec<u8>>, bool), ProxyError> {
        let mut head = format!(
            "POST {} HTTP/1.1\r\nHost: {}\r\nConnection: Keep-Alive\r\nContent-Type: application/json\r\n",
            taken.route, taken.addr
        );
        if !taken.model.is_empty() {
            head.push_str(&format!("X-Model: {}\r\n", taken.model));
        }
        head.push_str(&format!("X-Batch-Size: {}\r\n", taken.items.len()));
        head.push_str(&format!("Content-Length: {}\r\n\r\n", merged.len()));

        let io_err = |backend: &str, source: std::io::Error| ProxyError::BackendIo {
            backend: backend.to_string(),
            source,
        };

        let stream = lease.stream_mut();
        stream
            .write_all(head.as_bytes())
            .await
            .map_err(|e| io_err(&taken.backend_id, e))?;
        stream
            .write_all(merged)
            .await
            .map_err(|e| io_err(&taken.backend_id, e))?;

        // Read and frame the whole response.
        let mut raw: Vec<u8> = Vec::with_capacity(4096);
        let mut head_parsed: Option<(ResponseHead, usize)> = None;
        let mut framer: Option<BodyFramer> = None;
        let mut closed = false;
        let mut chunk = [0u8; 16 * 1024];
        loop {
            if raw.len() > self.cfg.max_response_bytes {
                return Err(ProxyError::BodyTooLarge {
                    limit: self.cfg.max_response_bytes,
                });
            }
            let n = stream
                .read(&mut chunk)
                .await
                .map_err(|e| io_err(&taken.backend_id, e))?;
            if n == 0 {
                closed = true;
            } else {
                raw.extend_from_slice(&chunk[..n]);
            }

            if head_parsed.is_none() {
                if let Some((h, len)) = ResponseHead::parse(&raw)? {
                    let mut f = BodyFramer::for_message(&h, "POST");
                    f.feed(&raw[len..])?;
                    framer = Some(f);
                    head_parsed = Some((h, len));
                } else if closed {
                    return Err(ProxyError::BadGateway("backend closed before head".into()));
                } else {
                    continue;
                }
            } else if n > 0 {
                if let Some(f) = framer.as_mut() {
                    f.feed(&chunk[..n])?;
                }
            }

            let done = framer.as_ref().map(|f| f.is_done()).unwrap_or(false);
            if done {
                break;
            }
            if closed {
                let finished = framer.as_mut().map(|f| f.on_eof()).unwrap_or(false);
                if finished {
                    break;
                }
                return Err(ProxyError::BadGateway("backend closed mid-response".into()));
            }
        }

        let (head, head_len) = match head_parsed {
            Some(v) => v,
            None => return Err(ProxyError::BadGateway("no response head".into())),
        };
        if head.status < 200 || head.status >= 400 {
            return Err(ProxyError::BadGateway(format!(
                "batch backend status={}",
                head.status
            )));
        }

        let body = match head.framing() {
            Framing::Chunked => decode_chunked(&raw[head_len..])
                .map_err(ProxyError::BadGateway)?,
            _ => raw[head_len..].to_vec(),
        };
        let parts = split_json_array(&body)
            .ok_or_else(|| ProxyError::BadGateway("batch response is not a json array".into()))?;

        let keep = !closed && head.keep_alive();
        Ok((parts, keep))
    }
}
