//! Proxy-wide statistics.
//!
//! Counters are atomics updated on the data path; the latency
//! histogram sits behind a small mutex and is only touched once per
//! completed request. `snapshot` renders the JSON served by `/stats`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::Mutex;

const BUCKET_BOUNDS_MS: [u64; 12] = [1, 2, 5, 10, 20, 50, 100, 200, 500, 1000, 2000, 5000];

#[derive(Default)]
struct LatencyHistogram {
    // One count per bound, plus overflow.
    buckets: [u64; BUCKET_BOUNDS_MS.len() + 1],
    count: u64,
    sum_ms: f64,
}

impl LatencyHistogram {
    fn record(&mut self, ms: f64) {
        let idx = BUCKET_BOUNDS_MS
            .iter()
            .position(|&b| ms <= b as f64)
            .unwrap_or(BUCKET_BOUNDS_MS.len());
        self.buckets[idx] += 1;
        self.count += 1;
        self.sum_ms += ms;
    }

    /// Upper bound of the bucket holding the percentile, in ms.
    fn percentile(&self, p: f64) -> u64 {
        if self.count == 0 {
            return 0;
        }
        let target = (self.count as f64 * p).ceil() as u64;
        let mut seen = 0;
        for (i, &count) in self.buckets.iter().enumerate() {
            seen += count;
            if seen >= target {
                return BUCKET_BOUNDS_MS
                    .get(i)
                    .copied()
                    .unwrap_or(*BUCKET_BOUNDS_MS.last().unwrap_or(&0) * 2);
            }
        }
        *BUCKET_BOUNDS_MS.last().unwrap_or(&0)
    }
}

#[derive(Default)]
pub struct ProxyStats {
    pub total_connections: AtomicU64,
    pub active_connections: AtomicU64,
    pub total_requests: AtomicU64,
    pub total_responses: AtomicU64,
    pub admission_rejects: AtomicU64,
    pub ddos_drops: AtomicU64,
    pub conn_limit_drops: AtomicU64,
    pub no_backend_errors: AtomicU64,
    pub backend_errors: AtomicU64,
    pub timeouts: AtomicU64,
    pub cache_hits: AtomicU64,
    pub cache_misses: AtomicU64,
    pub cache_errors: AtomicU64,
    pub mirror_errors: AtomicU64,
    pub batch_merged_requests: AtomicU64,
    pub batch_flushes: AtomicU64,
    pub batch_failures: AtomicU64,
    pub tunnel_connections: AtomicU64,
    latency: Mutex<LatencyHistogram>,
    started_at: Option<Instant>,
}

impl ProxyStats {
    pub fn new() -> Self {
        Self {
            started_at: Some(Instant::now()),
            ..Self::default()
        }
    }

    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_latency(&self, ms: f64) {
        self.latency.lock().record(ms);
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.map(|t| t.elapsed().as_secs()).unwrap_or(0)
    }

    pub fn snapshot(&self) -> serde_json::Value {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        let (p50, p90, p99, count, avg) = {
            let hist = self.latency.lock();
            let avg = if hist.count > 0 {
                hist.sum_ms / hist.count as f64
            } else {
                0.0
            };
            (
                hist.percentile(0.50),
                hist.percentile(0.90),
                hist.percentile(0.99),
                hist.count,
                avg,
            )
        };

        serde_json::json!({
            "uptime_secs": self.uptime_secs(),
            "process": {
                "pid": std::process::id(),
            },
            "totals": {
                "total_connections": get(&self.total_connections),
                "active_connections": get(&self.active_connections),
                "total_requests": get(&self.total_requests),
                "total_responses": get(&self.total_responses),
                "admission_rejects": get(&self.admission_rejects),
                "ddos_drops": get(&self.ddos_drops),
                "conn_limit_drops": get(&self.conn_limit_drops),
                "no_backend_errors": get(&self.no_backend_errors),
                "backend_errors": get(&self.backend_errors),
                "timeouts": get(&self.timeouts),
                "cache_hits": get(&self.cache_hits),
                "cache_misses": get(&self.cache_misses),
                "cache_errors": get(&self.cache_errors),
                "mirror_errors": get(&self.mirror_errors),
                "batch_merged_requests": get(&self.batch_merged_requests),
                "batch_flushes": get(&self.batch_flushes),
                "batch_failures": get(&self.batch_failures),
                "tunnel_connections": get(&self.tunnel_connections),
            },
            "latency_ms": {
                "count": count,
                "avg": avg,
                "p50": p50,
                "p90": p90,
                "p99": p99,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_appear_in_snapshot() {
        let stats = ProxyStats::new();
        ProxyStats::bump(&stats.total_requests);
        ProxyStats::bump(&stats.total_requests);
        ProxyStats::bump(&stats.ddos_drops);

        let snap = stats.snapshot();
        assert_eq!(snap["totals"]["total_requests"], 2);
        assert_eq!(snap["totals"]["ddos_drops"], 1);
        assert_eq!(snap["totals"]["cache_hits"], 0);
    }

    #[test]
    fn percentiles_track_distribution() {
        let stats = ProxyStats::new();
        for _ in 0..90 {
            stats.record_latency(4.0);
        }
        for _ in 0..10 {
            stats.record_latency(400.0);
        }
        let snap = stats.snapshot();
        assert_eq!(snap["latency_ms"]["count"], 100);
        assert_eq!(snap["latency_ms"]["p50"], 5);
        assert_eq!(snap["latency_ms"]["p99"], 500);
    }

    #[test]
    fn empty_histogram_is_zero() {
        let stats = ProxyStats::new();
        let snap = stats.snapshot();
        assert_eq!(snap["latency_ms"]["p50"], 0);
        assert_eq!(snap["latency_ms"]["avg"], 0.0);
    }
}
