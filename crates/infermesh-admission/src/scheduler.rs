//! In-flight request scheduler.
//!
//! Enforces a proxy-wide `max_inflight` budget with three queueing
//! disciplines: strict priority, per-flow fair queuing, and earliest
//! deadline first. Admission hands out an RAII permit; dropping the
//! permit releases the slot and wakes the next eligible waiter.
//!
//! The in-flight slot itself travels through the wake-up channel as a
//! [`Ticket`], so a waiter that disappears while being woken (client
//! disconnect) returns its slot automatically instead of leaking it.

use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::oneshot;

use infermesh_config::{SchedulerConfig, SchedulerMode};

/// Scheduling key for one request, derived from request metadata.
#[derive(Debug, Clone)]
pub enum SchedKey {
    Priority { value: i64 },
    Fair { flow: String },
    Edf { deadline: Instant },
}

struct Ticket {
    // `None` after disarming; the slot was reclaimed by hand.
    sched: Option<Arc<Scheduler>>,
}

impl Ticket {
    fn new(sched: Arc<Scheduler>) -> Self {
        Self { sched: Some(sched) }
    }
}

impl Drop for Ticket {
    fn drop(&mut self) {
        if let Some(sched) = self.sched.take() {
            sched.release_slot();
        }
    }
}

/// Held for the lifetime of an admitted request.
pub struct SchedulerPermit {
    _ticket: Option<Ticket>,
}

struct Waiter {
    tx: oneshot::Sender<Ticket>,
}

struct EdfWaiter {
    deadline: Instant,
    seq: u64,
    waiter: Waiter,
}

impl PartialEq for EdfWaiter {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for EdfWaiter {}

impl PartialOrd for EdfWaiter {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for EdfWaiter {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // BinaryHeap is a max-heap; invert so the earliest deadline
        // (FIFO among equals) surfaces first.
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct SchedState {
    inflight: usize,
    high: VecDeque<Waiter>,
    low: VecDeque<Waiter>,
    flows: HashMap<String, VecDeque<Waiter>>,
    flow_order: VecDeque<String>,
    edf: BinaryHeap<EdfWaiter>,
    seq: u64,
}

impl SchedState {
    fn queued(&self) -> usize {
        self.high.len()
            + self.low.len()
            + self.flows.values().map(|q| q.len()).sum::<usize>()
            + self.edf.len()
    }

    fn enqueue(&mut self, cfg: &SchedulerConfig, key: SchedKey, tx: oneshot::Sender<Ticket>) {
        let waiter = Waiter { tx };
        match (cfg.mode, key) {
            (SchedulerMode::Priority, SchedKey::Priority { value }) => {
                if value >= cfg.high_threshold {
                    self.high.push_back(waiter);
                } else {
                    self.low.push_back(waiter);
                }
            }
            (SchedulerMode::Fair, SchedKey::Fair { flow }) => {
                let queue = self.flows.entry(flow.clone()).or_default();
                if queue.is_empty() {
                    self.flow_order.push_back(flow);
                }
                queue.push_back(waiter);
            }
            (SchedulerMode::Edf, SchedKey::Edf { deadline }) => {
                self.seq += 1;
                self.edf.push(EdfWaiter {
                    deadline,
                    seq: self.seq,
                    waiter,
                });
            }
            // Key kind does not match the configured mode; treat as
            // lowest priority rather than dropping the request.
            (SchedulerMode::Priority, _) => self.low.push_back(waiter),
            (SchedulerMode::Fair, _) => {
                let queue = self.flows.entry(String::new()).or_default();
                if queue.is_empty() {
                    self.flow_order.push_back(String::new());
                }
                queue.push_back(waiter);
            }
            (SchedulerMode::Edf, _) => {
                self.seq += 1;
                self.edf.push(EdfWaiter {
                    deadline: Instant::now() + Duration::from_millis(cfg.default_deadline_ms),
                    seq: self.seq,
                    waiter,
                });
            }
        }
    }

    fn pop_next(&mut self, cfg: &SchedulerConfig) -> Option<Waiter> {
        match cfg.mode {
            SchedulerMode::Priority => self.high.pop_front().or_else(|| self.low.pop_front()),
            SchedulerMode::Fair => {
                while let Some(flow) = self.flow_order.pop_front() {
                    if let Some(queue) = self.flows.get_mut(&flow) {
                        let waiter = queue.pop_front();
                        if queue.is_empty() {
                            self.flows.remove(&flow);
                        } else {
                            self.flow_order.push_back(flow);
                        }
                        if waiter.is_some() {
                            return waiter;
                        }
                    }
                }
                None
            }
            SchedulerMode::Edf => self.edf.pop().map(|e| e.waiter),
        }
    }
}

pub struct Scheduler {
    cfg: SchedulerConfig,
    state: Mutex<SchedState>,
}

impl Scheduler {
    pub fn new(cfg: SchedulerConfig) -> Arc<Self> {
        Arc::new(Self {
            cfg,
            state: Mutex::new(SchedState::default()),
        })
    }

    /// Build the scheduling key for a request from extracted metadata.
    pub fn classify(
        &self,
        priority: Option<i64>,
        flow: Option<String>,
        deadline_ms: Option<u64>,
        client_ip: &str,
    ) -> SchedKey {
        match self.cfg.mode {
            SchedulerMode::Priority => SchedKey::Priority {
                value: priority.unwrap_or(0),
            },
            SchedulerMode::Fair => SchedKey::Fair {
                flow: flow.unwrap_or_else(|| client_ip.to_string()),
            },
            SchedulerMode::Edf => SchedKey::Edf {
                deadline: Instant::now()
                    + Duration::from_millis(deadline_ms.unwrap_or(self.cfg.default_deadline_ms)),
            },
        }
    }

    /// Admit one request, waiting for a slot when over budget.
    pub async fn admit(self: &Arc<Self>, key: SchedKey) -> SchedulerPermit {
        if self.cfg.max_inflight == 0 {
            self.state.lock().inflight += 1;
            return SchedulerPermit {
                _ticket: Some(Ticket::new(self.clone())),
            };
        }

        if self.cfg.mode == SchedulerMode::Priority && self.cfg.low_delay_ms > 0 {
            if let SchedKey::Priority { value } = &key {
                if *value < self.cfg.high_threshold {
                    tokio::time::sleep(Duration::from_millis(self.cfg.low_delay_ms)).await;
                }
            }
        }

        let rx = {
            let mut st = self.state.lock();
            if st.inflight < self.cfg.max_inflight {
                st.inflight += 1;
                None
            } else {
                let (tx, rx) = oneshot::channel();
                st.enqueue(&self.cfg, key, tx);
                Some(rx)
            }
        };

        match rx {
            None => SchedulerPermit {
                _ticket: Some(Ticket::new(self.clone())),
            },
            Some(rx) => match rx.await {
                Ok(ticket) => SchedulerPermit {
                    _ticket: Some(ticket),
                },
                // Scheduler torn down while waiting; admit uncounted.
                Err(_) => SchedulerPermit { _ticket: None },
            },
        }
    }

    fn release_slot(self: &Arc<Self>) {
        {
            let mut st = self.state.lock();
            if st.inflight > 0 {
                st.inflight -= 1;
            }
        }
        self.pump();
    }

    /// Wake the next eligible waiter, skipping any that vanished.
    fn pump(self: &Arc<Self>) {
        if self.cfg.max_inflight == 0 {
            return;
        }
        loop {
            let waiter = {
                let mut st = self.state.lock();
                if st.inflight >= self.cfg.max_inflight {
                    return;
                }
                match st.pop_next(&self.cfg) {
                    Some(w) => {
                        st.inflight += 1;
                        w
                    }
                    None => return,
                }
            };
            let ticket = Ticket::new(self.clone());
            if let Err(mut ticket) = waiter.tx.send(ticket) {
                // Waiter disappeared. Disarm the ticket (its Drop
                // would re-enter pump) and reclaim the slot by hand.
                ticket.sched = None;
                let mut st = self.state.lock();
                if st.inflight > 0 {
                    st.inflight -= 1;
                }
                continue;
            }
            return;
        }
    }

    pub fn inflight(&self) -> usize {
        self.state.lock().inflight
    }

    pub fn queued(&self) -> usize {
        self.state.lock().queued()
    }
}
