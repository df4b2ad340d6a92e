//! Per-key rate limiting and connection caps.
//!
//! Both structures bound their key sets. The rate limiter keeps the
//! conservative overflow behavior of accounting traffic for brand-new
//! keys against the most recently seen entry instead of dropping it;
//! the connection limiter rejects outright when the key table is full.

use std::time::Instant;

use dashmap::DashMap;
use parking_lot::Mutex;

use infermesh_config::PerKeyRateConfig;

use crate::bucket::TokenBucket;

struct KeyedBucket {
    bucket: TokenBucket,
    last_seen: Mutex<Instant>,
}

/// Token buckets keyed by an arbitrary string (client IP, path, user).
pub struct PerKeyRateLimiter {
    buckets: DashMap<String, KeyedBucket>,
    cfg: PerKeyRateConfig,
    last_key: Mutex<Option<String>>,
}

impl PerKeyRateLimiter {
    pub fn new(cfg: PerKeyRateConfig) -> Self {
        Self {
            buckets: DashMap::new(),
            cfg,
            last_key: Mutex::new(None),
        }
    }

    /// Consume one token for `key`.
    pub fn try_acquire(&self, key: &str) -> bool {
        if self.cfg.qps <= 0.0 {
            return true;
        }

        if let Some(entry) = self.buckets.get(key) {
            *entry.last_seen.lock() = Instant::now();
            *self.last_key.lock() = Some(key.to_string());
            return entry.bucket.try_acquire(1.0);
        }

        if self.cfg.max_entries > 0 && self.buckets.len() >= self.cfg.max_entries {
            // Key table full: charge the most recently seen entry.
            let fallback = self.last_key.lock().clone();
            if let Some(last) = fallback {
                if let Some(entry) = self.buckets.get(&last) {
                    return entry.bucket.try_acquire(1.0);
                }
            }
            return true;
        }

        let entry = self.buckets.entry(key.to_string()).or_insert_with(|| KeyedBucket {
            bucket: TokenBucket::new(infermesh_config::RateConfig {
                qps: self.cfg.qps,
                burst: self.cfg.burst,
            }),
            last_seen: Mutex::new(Instant::now()),
        });
        *self.last_key.lock() = Some(key.to_string());
        entry.bucket.try_acquire(1.0)
    }

    /// Drop buckets idle longer than the configured idle window.
    pub fn sweep_idle(&self) {
        let now = Instant::now();
        let idle = std::time::Duration::from_secs(self.cfg.idle_secs.max(1));
        self.buckets
            .retain(|_, entry| now.duration_since(*entry.last_seen.lock()) < idle);
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

/// Active-connection counters keyed by user or service.
pub struct PerKeyConnectionLimiter {
    entries: DashMap<String, usize>,
    max_connections: usize,
    max_entries: usize,
}

impl PerKeyConnectionLimiter {
    pub fn new(max_connections: usize, max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            max_connections,
            max_entries,
        }
    }

    /// Increment the counter for `key` unless at cap.
    pub fn try_acquire(&self, key: &str) -> bool {
        if self.max_connections == 0 {
            return true;
        }
        if let Some(mut entry) = self.entries.get_mut(key) {
            if *entry >= self.max_connections {
                return false;
            }
            *entry += 1;
            return true;
        }
        if self.max_entries > 0 && self.entries.len() >= self.max_entries {
            return false;
        }
        self.entries.insert(key.to_string(), 1);
        true
    }

    /// Decrement the counter for `key`, removing drained entries.
    pub fn release(&self, key: &str) {
        if self.max_connections == 0 {
            return;
        }
        let drained = if let Some(mut entry) = self.entries.get_mut(key) {
            if *entry > 0 {
                *entry -= 1;
            }
            *entry == 0
        } else {
            false
        };
        if drained {
            self.entries.remove_if(key, |_, v| *v == 0);
        }
    }

    pub fn active(&self, key: &str) -> usize {
        self.entries.get(key).map(|e| *e).unwrap_or(0)
    }
}
