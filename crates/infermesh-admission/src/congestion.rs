//! AIMD congestion window over in-flight backend requests.
//!
//! The window grows by `increase / window` per completed request
//! (additive increase per window of traffic) and shrinks
//! multiplicatively on backend failure. Requests beyond the current
//! window are rejected with 503 by the caller.

use parking_lot::Mutex;

use infermesh_config::CongestionConfig;

#[derive(Debug)]
struct WindowState {
    window: f64,
    inflight: usize,
}

pub struct CongestionWindow {
    state: Mutex<WindowState>,
    cfg: CongestionConfig,
}

impl CongestionWindow {
    pub fn new(cfg: CongestionConfig) -> Self {
        let initial = cfg
            .initial_window
            .clamp(cfg.min_window.max(1), cfg.max_window.max(1));
        Self {
            state: Mutex::new(WindowState {
                window: initial as f64,
                inflight: 0,
            }),
            cfg,
        }
    }

    /// Admit one request into the window, or reject.
    pub fn try_start(&self) -> bool {
        let mut st = self.state.lock();
        if (st.inflight as f64) >= st.window {
            return false;
        }
        st.inflight += 1;
        true
    }

    /// Complete a request; `ok=false` signals a backend failure.
    pub fn end(&self, ok: bool) {
        let mut st = self.state.lock();
        if st.inflight > 0 {
            st.inflight -= 1;
        }
        if ok {
            let step = self.cfg.increase.max(1) as f64 / st.window.max(1.0);
            st.window = (st.window + step).min(self.cfg.max_window.max(1) as f64);
        } else {
            st.window = (st.window * self.cfg.decrease).max(self.cfg.min_window.max(1) as f64);
        }
    }

    pub fn window(&self) -> usize {
        self.state.lock().window as usize
    }

    pub fn inflight(&self) -> usize {
        self.state.lock().inflight
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(initial: usize, min: usize, max: usize) -> CongestionConfig {
        CongestionConfig {
            initial_window: initial,
            min_window: min,
            max_window: max,
            increase: 1,
            decrease: 0.5,
        }
    }

    #[test]
    fn rejects_over_window() {
        let cw = CongestionWindow::new(cfg(2, 1, 100));
        assert!(cw.try_start());
        assert!(cw.try_start());
        assert!(!cw.try_start());
        cw.end(true);
        assert!(cw.try_start());
    }

    #[test]
    fn failure_halves_window() {
        let cw = CongestionWindow::new(cfg(64, 4, 100));
        assert!(cw.try_start());
        cw.end(false);
        assert_eq!(cw.window(), 32);
    }

    #[test]
    fn window_never_below_min() {
        let cw = CongestionWindow::new(cfg(8, 4, 100));
        for _ in 0..10 {
            assert!(cw.try_start());
            cw.end(false);
        }
        assert_eq!(cw.window(), 4);
    }

    #[test]
    fn success_grows_to_cap() {
        let cw = CongestionWindow::new(cfg(4, 4, 6));
        for _ in 0..100 {
            assert!(cw.try_start());
            cw.end(true);
        }
        assert_eq!(cw.window(), 6);
    }
}
