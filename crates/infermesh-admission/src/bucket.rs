//! Continuous-refill token bucket.

use std::time::Instant;

use parking_lot::Mutex;

use infermesh_config::RateConfig;

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
    qps: f64,
    burst: f64,
}

/// Thread-safe token bucket refilling at `qps` tokens per second up to
/// a cap of `burst`. A bucket with `qps <= 0` admits everything.
#[derive(Debug)]
pub struct TokenBucket {
    state: Mutex<BucketState>,
}

impl TokenBucket {
    pub fn new(cfg: RateConfig) -> Self {
        Self {
            state: Mutex::new(BucketState {
                tokens: cfg.burst.max(0.0),
                last_refill: Instant::now(),
                qps: cfg.qps,
                burst: cfg.burst.max(0.0),
            }),
        }
    }

    /// Consume `n` tokens if available.
    pub fn try_acquire(&self, n: f64) -> bool {
        let mut st = self.state.lock();
        if st.qps <= 0.0 {
            return true;
        }
        let now = Instant::now();
        let elapsed = now.duration_since(st.last_refill).as_secs_f64();
        st.tokens = (st.tokens + elapsed * st.qps).min(st.burst);
        st.last_refill = now;

        if st.tokens >= n {
            st.tokens -= n;
            true
        } else {
            false
        }
    }

    /// Replace rate parameters, keeping the current fill level capped
    /// to the new burst.
    pub fn reconfigure(&self, cfg: RateConfig) {
        let mut st = self.state.lock();
        st.qps = cfg.qps;
        st.burst = cfg.burst.max(0.0);
        st.tokens = st.tokens.min(st.burst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn cfg(qps: f64, burst: f64) -> RateConfig {
        RateConfig { qps, burst }
    }

    #[test]
    fn burst_then_reject() {
        let bucket = TokenBucket::new(cfg(1.0, 3.0));
        assert!(bucket.try_acquire(1.0));
        assert!(bucket.try_acquire(1.0));
        assert!(bucket.try_acquire(1.0));
        assert!(!bucket.try_acquire(1.0));
    }

    #[test]
    fn refills_over_time() {
        let bucket = TokenBucket::new(cfg(1000.0, 2.0));
        assert!(bucket.try_acquire(2.0));
        assert!(!bucket.try_acquire(1.0));
        std::thread::sleep(Duration::from_millis(5));
        assert!(bucket.try_acquire(1.0));
    }

    #[test]
    fn disabled_bucket_admits_all() {
        let bucket = TokenBucket::new(cfg(0.0, 0.0));
        for _ in 0..1000 {
            assert!(bucket.try_acquire(1.0));
        }
    }

    #[test]
    fn reconfigure_caps_fill() {
        let bucket = TokenBucket::new(cfg(10.0, 100.0));
        bucket.reconfigure(cfg(10.0, 1.0));
        assert!(bucket.try_acquire(1.0));
        assert!(!bucket.try_acquire(1.0));
    }
}
