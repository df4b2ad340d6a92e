//! Configuration types for the proxy.
//!
//! Every tunable the proxy understands lives here as a serde type so
//! the whole configuration can round-trip through the admin surface.
//! Defaults match the values the proxy ships with when a section is
//! omitted from the file.

use serde::{Deserialize, Serialize};

/// Top-level proxy configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProxyConfig {
    #[serde(default)]
    pub listener: ListenerConfig,

    /// TLS termination. When present, the listener serves both HTTPS
    /// and plain HTTP on the same port via first-byte sniffing.
    #[serde(default)]
    pub tls: Option<TlsConfig>,

    /// Optional raw L4 tunnel listener.
    #[serde(default)]
    pub tunnel: Option<TunnelConfig>,

    /// ACME HTTP-01 challenge directory.
    #[serde(default)]
    pub acme_challenge_dir: Option<String>,

    #[serde(default)]
    pub admin: AdminConfig,

    /// Load-balancing strategy for backend selection.
    #[serde(default)]
    pub strategy: StrategyKind,

    /// Recompute effective weights from queue/GPU/latency metrics.
    #[serde(default = "default_true")]
    pub auto_weight_adjust: bool,

    #[serde(default)]
    pub pool: PoolConfig,

    /// Statically configured backends, registered at startup.
    #[serde(default)]
    pub backends: Vec<StaticBackend>,

    #[serde(default)]
    pub health: HealthCheckConfig,

    #[serde(default)]
    pub ai_check: Option<AiCheckConfig>,

    #[serde(default)]
    pub warmup: Option<WarmupConfig>,

    #[serde(default)]
    pub admission: AdmissionConfig,

    #[serde(default)]
    pub scheduler: Option<SchedulerConfig>,

    #[serde(default)]
    pub batch: Option<BatchConfig>,

    #[serde(default)]
    pub rewrite: Vec<RewriteRule>,

    #[serde(default)]
    pub mirror: Option<MirrorConfig>,

    #[serde(default)]
    pub cache: Option<CacheConfig>,

    #[serde(default)]
    pub affinity: AffinityConfig,

    #[serde(default)]
    pub http: HttpLimits,

    #[serde(default)]
    pub headers: HeaderNames,
}

fn default_true() -> bool {
    true
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listener: ListenerConfig::default(),
            tls: None,
            tunnel: None,
            acme_challenge_dir: None,
            admin: AdminConfig::default(),
            strategy: StrategyKind::default(),
            auto_weight_adjust: true,
            pool: PoolConfig::default(),
            backends: Vec::new(),
            health: HealthCheckConfig::default(),
            ai_check: None,
            warmup: None,
            admission: AdmissionConfig::default(),
            scheduler: None,
            batch: None,
            rewrite: Vec::new(),
            mirror: None,
            cache: None,
            affinity: AffinityConfig::default(),
            http: HttpLimits::default(),
            headers: HeaderNames::default(),
        }
    }
}

/// L7 listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ListenerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Bind with SO_REUSEPORT so multiple processes can share a port.
    #[serde(default)]
    pub reuse_port: bool,

    /// Global connection cap. 0 disables.
    #[serde(default)]
    pub max_connections: usize,

    /// Per-client-IP connection cap. 0 disables.
    #[serde(default)]
    pub max_connections_per_ip: usize,

    /// Idle connections older than this are force-closed. 0 disables.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,

    /// Accept-rate token bucket shared by all clients.
    #[serde(default)]
    pub accept_rate: Option<RateConfig>,

    /// Accept-rate token buckets keyed by client IP.
    #[serde(default)]
    pub per_ip_accept_rate: Option<PerKeyRateConfig>,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_idle_timeout() -> u64 {
    0
}

fn default_cleanup_interval() -> u64 {
    1
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            reuse_port: false,
            max_connections: 0,
            max_connections_per_ip: 0,
            idle_timeout_secs: 0,
            cleanup_interval_secs: default_cleanup_interval(),
            accept_rate: None,
            per_ip_accept_rate: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TlsConfig {
    pub cert_path: String,
    pub key_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TunnelConfig {
    #[serde(default = "default_host")]
    pub host: String,
    pub port: u16,
}

/// Admin HTTP surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AdminConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_admin_host")]
    pub host: String,

    #[serde(default = "default_admin_port")]
    pub port: u16,
}

fn default_admin_host() -> String {
    "127.0.0.1".to_string()
}

fn default_admin_port() -> u16 {
    9900
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: default_admin_host(),
            port: default_admin_port(),
        }
    }
}

/// Backend selection strategy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    #[default]
    RoundRobin,
    Hash,
    LeastConn,
    LeastQueue,
    ResponseTime,
    Gpu,
}

/// Keep-alive connection pool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PoolConfig {
    /// Number of pool shards; connections are assigned round-robin.
    #[serde(default = "default_pool_shards")]
    pub shards: usize,

    #[serde(default = "default_max_idle")]
    pub max_idle_per_backend: usize,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
}

fn default_pool_shards() -> usize {
    1
}

fn default_max_idle() -> usize {
    32
}

fn default_connect_timeout() -> u64 {
    2000
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            shards: default_pool_shards(),
            max_idle_per_backend: default_max_idle(),
            connect_timeout_ms: default_connect_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StaticBackend {
    pub host: String,
    pub port: u16,

    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    1
}

/// Active health checking.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HealthCheckConfig {
    #[serde(default)]
    pub mode: HealthCheckMode,

    #[serde(default = "default_check_interval")]
    pub interval_secs: f64,

    #[serde(default = "default_check_timeout")]
    pub timeout_secs: f64,

    #[serde(default = "default_check_host")]
    pub http_host: String,

    #[serde(default = "default_health_path")]
    pub http_path: String,

    #[serde(default = "default_ok_min")]
    pub ok_status_min: u16,

    #[serde(default = "default_ok_max")]
    pub ok_status_max: u16,

    /// Shell command for `script` mode; `{ip}` and `{port}` expand.
    #[serde(default)]
    pub script_cmd: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthCheckMode {
    Off,
    #[default]
    Tcp,
    Http,
    Script,
}

fn default_check_interval() -> f64 {
    5.0
}

fn default_check_timeout() -> f64 {
    2.0
}

fn default_check_host() -> String {
    "127.0.0.1".to_string()
}

fn default_health_path() -> String {
    "/health".to_string()
}

fn default_ok_min() -> u16 {
    200
}

fn default_ok_max() -> u16 {
    399
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            mode: HealthCheckMode::Tcp,
            interval_secs: default_check_interval(),
            timeout_secs: default_check_timeout(),
            http_host: default_check_host(),
            http_path: default_health_path(),
            ok_status_min: default_ok_min(),
            ok_status_max: default_ok_max(),
            script_cmd: String::new(),
        }
    }
}

/// AI status polling (queue depth, GPU, loaded model).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AiCheckConfig {
    #[serde(default = "default_check_interval")]
    pub interval_secs: f64,

    #[serde(default = "default_check_timeout")]
    pub timeout_secs: f64,

    #[serde(default = "default_check_host")]
    pub http_host: String,

    #[serde(default = "default_ai_status_path")]
    pub http_path: String,
}

fn default_ai_status_path() -> String {
    "/ai/status".to_string()
}

/// Model warmup gating for newly added or re-onlined backends.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WarmupConfig {
    pub model: String,

    #[serde(default = "default_check_timeout")]
    pub timeout_secs: f64,

    #[serde(default = "default_check_host")]
    pub http_host: String,

    #[serde(default = "default_warmup_path")]
    pub http_path: String,
}

fn default_warmup_path() -> String {
    "/ai/warmup".to_string()
}

/// Token bucket parameters.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RateConfig {
    pub qps: f64,
    pub burst: f64,
}

/// Token bucket parameters for per-key limiters with a bounded key set.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PerKeyRateConfig {
    pub qps: f64,
    pub burst: f64,

    #[serde(default = "default_key_idle")]
    pub idle_secs: u64,

    #[serde(default = "default_key_entries")]
    pub max_entries: usize,
}

fn default_key_idle() -> u64 {
    60
}

fn default_key_entries() -> usize {
    10_000
}

/// Admission control, applied in order before selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AdmissionConfig {
    #[serde(default)]
    pub access: Option<AccessControlConfig>,

    /// Global request token bucket.
    #[serde(default)]
    pub global_rate: Option<RateConfig>,

    #[serde(default)]
    pub per_ip_rate: Option<PerKeyRateConfig>,

    #[serde(default)]
    pub per_path_rate: Option<PerKeyRateConfig>,

    #[serde(default)]
    pub congestion: Option<CongestionConfig>,

    /// Per-user connection cap. 0 disables.
    #[serde(default)]
    pub max_connections_per_user: usize,

    /// Per-service (path root) connection cap. 0 disables.
    #[serde(default)]
    pub max_connections_per_service: usize,

    #[serde(default = "default_key_entries")]
    pub max_key_entries: usize,

    /// Append one line per admission decision to this file.
    #[serde(default)]
    pub audit_log: Option<String>,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            access: None,
            global_rate: None,
            per_ip_rate: None,
            per_path_rate: None,
            congestion: None,
            max_connections_per_user: 0,
            max_connections_per_service: 0,
            max_key_entries: default_key_entries(),
            audit_log: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AccessControlConfig {
    /// When non-empty, only these client IPs are admitted.
    #[serde(default)]
    pub allow_ips: Vec<String>,

    #[serde(default)]
    pub deny_ips: Vec<String>,

    /// Optional shared-secret header check.
    #[serde(default)]
    pub token_header: Option<String>,

    #[serde(default)]
    pub token_value: Option<String>,
}

/// AIMD congestion window over in-flight backend requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CongestionConfig {
    #[serde(default = "default_cc_initial")]
    pub initial_window: usize,

    #[serde(default = "default_cc_min")]
    pub min_window: usize,

    #[serde(default = "default_cc_max")]
    pub max_window: usize,

    /// Additive increase per successful completion cycle.
    #[serde(default = "default_cc_increase")]
    pub increase: usize,

    /// Multiplicative decrease factor applied on failure.
    #[serde(default = "default_cc_decrease")]
    pub decrease: f64,
}

fn default_cc_initial() -> usize {
    64
}

fn default_cc_min() -> usize {
    4
}

fn default_cc_max() -> usize {
    4096
}

fn default_cc_increase() -> usize {
    1
}

fn default_cc_decrease() -> f64 {
    0.5
}

impl Default for CongestionConfig {
    fn default() -> Self {
        Self {
            initial_window: default_cc_initial(),
            min_window: default_cc_min(),
            max_window: default_cc_max(),
            increase: default_cc_increase(),
            decrease: default_cc_decrease(),
        }
    }
}

/// In-flight request scheduling.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SchedulerConfig {
    #[serde(default)]
    pub mode: SchedulerMode,

    /// 0 means unlimited (scheduling effectively disabled).
    #[serde(default)]
    pub max_inflight: usize,

    /// Priority value at or above which a request is high class.
    #[serde(default = "default_high_threshold")]
    pub high_threshold: i64,

    /// Artificial delay for low-class enqueues, reduces inversion.
    #[serde(default)]
    pub low_delay_ms: u64,

    #[serde(default = "default_priority_header")]
    pub priority_header: String,

    #[serde(default = "default_priority_query")]
    pub priority_query: String,

    #[serde(default = "default_flow_header")]
    pub flow_header: String,

    #[serde(default = "default_flow_query")]
    pub flow_query: String,

    #[serde(default = "default_deadline_header")]
    pub deadline_header: String,

    #[serde(default = "default_deadline_query")]
    pub deadline_query: String,

    #[serde(default = "default_deadline_ms")]
    pub default_deadline_ms: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerMode {
    #[default]
    Priority,
    Fair,
    Edf,
}

fn default_high_threshold() -> i64 {
    8
}

fn default_priority_header() -> String {
    "X-Priority".to_string()
}

fn default_priority_query() -> String {
    "priority".to_string()
}

fn default_flow_header() -> String {
    "X-Flow".to_string()
}

fn default_flow_query() -> String {
    "flow".to_string()
}

fn default_deadline_header() -> String {
    "X-Deadline-Ms".to_string()
}

fn default_deadline_query() -> String {
    "deadline_ms".to_string()
}

fn default_deadline_ms() -> u64 {
    60_000
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            mode: SchedulerMode::Priority,
            max_inflight: 0,
            high_threshold: default_high_threshold(),
            low_delay_ms: 0,
            priority_header: default_priority_header(),
            priority_query: default_priority_query(),
            flow_header: default_flow_header(),
            flow_query: default_flow_query(),
            deadline_header: default_deadline_header(),
            deadline_query: default_deadline_query(),
            default_deadline_ms: default_deadline_ms(),
        }
    }
}

/// JSON POST micro-batching.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BatchConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_batch_window")]
    pub window_ms: u64,

    #[serde(default = "default_batch_items")]
    pub max_items: usize,

    #[serde(default = "default_batch_bytes")]
    pub max_bytes: usize,

    #[serde(default = "default_batch_response_bytes")]
    pub max_response_bytes: usize,

    /// Paths eligible for batching. Empty allows every path.
    #[serde(default)]
    pub paths: Vec<String>,

    /// Require the opt-in header on each request.
    #[serde(default)]
    pub require_header: bool,
}

fn default_batch_window() -> u64 {
    20
}

fn default_batch_items() -> usize {
    8
}

fn default_batch_bytes() -> usize {
    256 * 1024
}

fn default_batch_response_bytes() -> usize {
    8 * 1024 * 1024
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window_ms: default_batch_window(),
            max_items: default_batch_items(),
            max_bytes: default_batch_bytes(),
            max_response_bytes: default_batch_response_bytes(),
            paths: Vec::new(),
            require_header: false,
        }
    }
}

/// A single header/body rewrite rule; rules apply in declared order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RewriteRule {
    pub path_prefix: String,

    #[serde(default)]
    pub method: Option<String>,

    #[serde(default)]
    pub set_request_headers: Vec<HeaderPair>,

    #[serde(default)]
    pub remove_request_headers: Vec<String>,

    #[serde(default)]
    pub request_body_replace: Vec<Replacement>,

    #[serde(default)]
    pub set_response_headers: Vec<HeaderPair>,

    #[serde(default)]
    pub remove_response_headers: Vec<String>,

    #[serde(default)]
    pub response_body_replace: Vec<Replacement>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HeaderPair {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Replacement {
    pub from: String,
    pub to: String,
}

/// Best-effort UDP mirroring of request metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MirrorConfig {
    /// Collector address, `host:port`.
    pub addr: String,

    #[serde(default = "default_sample_rate")]
    pub sample_rate: f64,

    #[serde(default = "default_mirror_packet")]
    pub max_packet_bytes: usize,

    #[serde(default = "default_mirror_body")]
    pub max_body_bytes: usize,
}

fn default_sample_rate() -> f64 {
    1.0
}

fn default_mirror_packet() -> usize {
    8 * 1024
}

fn default_mirror_body() -> usize {
    2 * 1024
}

/// External response cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheConfig {
    pub dialect: CacheDialect,
    pub host: String,
    pub port: u16,

    #[serde(default = "default_cache_ttl")]
    pub ttl_secs: u64,

    #[serde(default = "default_cache_timeout")]
    pub timeout_ms: u64,

    #[serde(default = "default_cache_value_bytes")]
    pub max_value_bytes: usize,

    /// Headers mixed into the request fingerprint.
    #[serde(default)]
    pub vary_headers: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheDialect {
    Redis,
    Memcached,
}

fn default_cache_ttl() -> u64 {
    60
}

fn default_cache_timeout() -> u64 {
    5
}

fn default_cache_value_bytes() -> usize {
    1024 * 1024
}

/// Sticky session selection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AffinityConfig {
    #[serde(default)]
    pub mode: AffinityMode,

    #[serde(default)]
    pub header_name: String,

    #[serde(default)]
    pub cookie_name: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AffinityMode {
    #[default]
    None,
    Ip,
    Header,
    Cookie,
}

/// HTTP parsing and buffering limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HttpLimits {
    #[serde(default = "default_max_header")]
    pub max_header_bytes: usize,

    #[serde(default = "default_max_request_body")]
    pub max_request_body_bytes: usize,

    /// Soft cap for buffering a response before degrading to streaming.
    #[serde(default = "default_response_buffer")]
    pub response_buffer_limit: usize,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_max_header() -> usize {
    32 * 1024
}

fn default_max_request_body() -> usize {
    16 * 1024 * 1024
}

fn default_response_buffer() -> usize {
    8 * 1024 * 1024
}

fn default_request_timeout() -> u64 {
    60
}

impl Default for HttpLimits {
    fn default() -> Self {
        Self {
            max_header_bytes: default_max_header(),
            max_request_body_bytes: default_max_request_body(),
            response_buffer_limit: default_response_buffer(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

/// Names of the request metadata headers the proxy inspects.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HeaderNames {
    #[serde(default = "default_model_header")]
    pub model: String,

    #[serde(default = "default_model_version_header")]
    pub model_version: String,

    #[serde(default = "default_api_token_header")]
    pub api_token: String,

    #[serde(default = "default_batch_header")]
    pub batch: String,

    #[serde(default = "default_batch_split_header")]
    pub batch_split: String,

    #[serde(default = "default_stream_header")]
    pub stream: String,
}

fn default_model_header() -> String {
    "X-Model".to_string()
}

fn default_model_version_header() -> String {
    "X-Model-Version".to_string()
}

fn default_api_token_header() -> String {
    "X-Api-Token".to_string()
}

fn default_batch_header() -> String {
    "X-Batch".to_string()
}

fn default_batch_split_header() -> String {
    "X-Batch-Split".to_string()
}

fn default_stream_header() -> String {
    "X-Stream".to_string()
}

impl Default for HeaderNames {
    fn default() -> Self {
        Self {
            model: default_model_header(),
            model_version: default_model_version_header(),
            api_token: default_api_token_header(),
            batch: default_batch_header(),
            batch_split: default_batch_split_header(),
            stream: default_stream_header(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_object_yields_defaults() {
        let cfg: ProxyConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.listener.port, 8080);
        assert_eq!(cfg.strategy, StrategyKind::RoundRobin);
        assert!(cfg.auto_weight_adjust);
        assert_eq!(cfg.pool.max_idle_per_backend, 32);
        assert_eq!(cfg.headers.model, "X-Model");
    }

    #[test]
    fn strategy_names_parse() {
        for (name, kind) in [
            ("round_robin", StrategyKind::RoundRobin),
            ("hash", StrategyKind::Hash),
            ("least_conn", StrategyKind::LeastConn),
            ("least_queue", StrategyKind::LeastQueue),
            ("response_time", StrategyKind::ResponseTime),
            ("gpu", StrategyKind::Gpu),
        ] {
            let json = format!(r#"{{"strategy":"{}"}}"#, name);
            let cfg: ProxyConfig = serde_json::from_str(&json).unwrap();
            assert_eq!(cfg.strategy, kind);
        }
    }

    #[test]
    fn round_trips_through_json() {
        let mut cfg = ProxyConfig::default();
        cfg.listener.port = 9444;
        cfg.backends.push(StaticBackend {
            host: "10.0.0.1".into(),
            port: 9000,
            weight: 3,
        });
        cfg.scheduler = Some(SchedulerConfig {
            mode: SchedulerMode::Edf,
            max_inflight: 4,
            ..SchedulerConfig::default()
        });

        let text = serde_json::to_string(&cfg).unwrap();
        let back: ProxyConfig = serde_json::from_str(&text).unwrap();
        assert_eq!(back.listener.port, 9444);
        assert_eq!(back.backends.len(), 1);
        assert_eq!(back.scheduler.unwrap().mode, SchedulerMode::Edf);
    }
}
