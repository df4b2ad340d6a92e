//! # InferMesh Admission
//!
//! Everything that gates a request before backend selection: token
//! buckets (global and per-key), IP/token access control, per-key
//! connection caps, an AIMD congestion window, the in-flight
//! scheduler, and audit logging of admission decisions.

pub mod access;
pub mod audit;
pub mod bucket;
pub mod congestion;
pub mod per_key;
pub mod scheduler;

pub use access::AccessControl;
pub use audit::AuditLogger;
pub use bucket::TokenBucket;
pub use congestion::CongestionWindow;
pub use per_key::{PerKeyConnectionLimiter, PerKeyRateLimiter};
pub use scheduler::{SchedKey, Scheduler, SchedulerPermit};
