use serde::{Deserialize, Deserializer, Serialize};

/// Deserialize a `T` that implements `Default` — treats JSON `null` the same as
/// a missing field (returns `T::default()`).  Use with:
///   `#[serde(default, deserialize_with = "deserialize_null_default")]`
fn deserialize_null_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Top-level proxy configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResinConfig {
    #[serde(default)]
    pub proxy: ProxyAuthConfig,

    #[serde(default)]
    pub transport: TransportConfig,

    #[serde(default)]
    pub traffic: TrafficConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,

    #[serde(default)]
    pub request_log: RequestLogConfig,

    /// Tenants served by this instance. The static router round-robins each
    /// platform's nodes; a subscription-managed pool replaces this at wiring
    /// time without touching the data plane.
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub platforms: Vec<PlatformConfig>,

    /// Account-extraction rules for reverse-proxy requests without an
    /// explicit account in the path.
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub account_rules: Vec<AccountRuleConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyAuthConfig {
    /// Forward-proxy token, matched against the Basic-auth user. Empty
    /// disables the check.
    #[serde(default)]
    pub token: String,

    /// Reverse-proxy path token. Empty disables the check.
    #[serde(default)]
    pub reverse_token: String,

    /// Require `platform:account` form in the reverse path identity segment.
    #[serde(default)]
    pub enforce_account_format: bool,

    /// CONNECT dial timeout (seconds).
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: f64,

    /// End-to-end upstream round-trip timeout for forwarded HTTP (seconds).
    #[serde(default = "default_upstream_timeout")]
    pub upstream_timeout_secs: f64,
}

impl Default for ProxyAuthConfig {
    fn default() -> Self {
        Self {
            token: String::new(),
            reverse_token: String::new(),
            enforce_account_format: false,
            connect_timeout_secs: default_connect_timeout(),
            upstream_timeout_secs: default_upstream_timeout(),
        }
    }
}

fn default_connect_timeout() -> f64 {
    10.0
}

fn default_upstream_timeout() -> f64 {
    60.0
}

/// Keep-alive pool settings for the per-node outbound transports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportConfig {
    #[serde(default = "default_max_idle_conns")]
    pub max_idle_conns: usize,

    #[serde(default = "default_max_idle_per_host")]
    pub max_idle_per_host: usize,

    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// When false, upstream TLS certificates are not verified — the common
    /// case for tunneled egress where the far end is not ours to attest.
    #[serde(default)]
    pub tls_verify: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_idle_conns: default_max_idle_conns(),
            max_idle_per_host: default_max_idle_per_host(),
            idle_timeout_secs: default_idle_timeout(),
            tls_verify: false,
        }
    }
}

fn default_max_idle_conns() -> usize {
    1024
}

fn default_max_idle_per_host() -> usize {
    64
}

fn default_idle_timeout() -> u64 {
    90
}

/// Flush policy for per-connection byte counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrafficConfig {
    /// Pending bytes (either direction) that force an immediate flush.
    #[serde(default = "default_flush_threshold")]
    pub flush_threshold_bytes: u64,

    /// Deferred flush delay for slow connections (milliseconds).
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
}

impl Default for TrafficConfig {
    fn default() -> Self {
        Self {
            flush_threshold_bytes: default_flush_threshold(),
            flush_interval_ms: default_flush_interval_ms(),
        }
    }
}

fn default_flush_threshold() -> u64 {
    32 * 1024
}

fn default_flush_interval_ms() -> u64 {
    1000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Aggregation bucket width (seconds). Buckets align to wall-clock
    /// multiples of this value.
    #[serde(default = "default_bucket_seconds")]
    pub bucket_seconds: i64,

    #[serde(default = "default_throughput_interval")]
    pub throughput_interval_secs: u64,

    #[serde(default = "default_connections_interval")]
    pub connections_interval_secs: u64,

    #[serde(default = "default_leases_interval")]
    pub leases_interval_secs: u64,

    /// Capacity of each realtime ring (samples).
    #[serde(default = "default_ring_capacity")]
    pub ring_capacity: usize,

    /// Latency histogram bin width (ms).
    #[serde(default = "default_latency_bin_ms")]
    pub latency_bin_ms: u64,

    /// Samples at or above this land in the overflow bucket (ms).
    #[serde(default = "default_latency_over_ms")]
    pub latency_over_ms: u64,

    #[serde(default = "default_lease_channel_capacity")]
    pub lease_channel_capacity: usize,

    #[serde(default = "default_shutdown_flush_retries")]
    pub shutdown_flush_retries: u32,

    #[serde(default = "default_shutdown_retry_delay_ms")]
    pub shutdown_retry_delay_ms: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            bucket_seconds: default_bucket_seconds(),
            throughput_interval_secs: default_throughput_interval(),
            connections_interval_secs: default_connections_interval(),
            leases_interval_secs: default_leases_interval(),
            ring_capacity: default_ring_capacity(),
            latency_bin_ms: default_latency_bin_ms(),
            latency_over_ms: default_latency_over_ms(),
            lease_channel_capacity: default_lease_channel_capacity(),
            shutdown_flush_retries: default_shutdown_flush_retries(),
            shutdown_retry_delay_ms: default_shutdown_retry_delay_ms(),
        }
    }
}

fn default_bucket_seconds() -> i64 {
    300
}

fn default_throughput_interval() -> u64 {
    1
}

fn default_connections_interval() -> u64 {
    5
}

fn default_leases_interval() -> u64 {
    5
}

fn default_ring_capacity() -> usize {
    900
}

fn default_latency_bin_ms() -> u64 {
    100
}

fn default_latency_over_ms() -> u64 {
    3000
}

fn default_lease_channel_capacity() -> usize {
    8192
}

fn default_shutdown_flush_retries() -> u32 {
    3
}

fn default_shutdown_retry_delay_ms() -> u64 {
    500
}

/// Request-log and reverse-detail capture flags. Read through `ArcSwap` at
/// emit time so hot-reloads apply to in-flight requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestLogConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default)]
    pub reverse_detail_enabled: bool,

    /// Per-field capture caps in bytes; -1 = unbounded.
    #[serde(default = "default_cap")]
    pub req_headers_cap: i64,

    #[serde(default = "default_cap")]
    pub req_body_cap: i64,

    #[serde(default = "default_cap")]
    pub resp_headers_cap: i64,

    #[serde(default = "default_cap")]
    pub resp_body_cap: i64,
}

impl Default for RequestLogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            reverse_detail_enabled: false,
            req_headers_cap: default_cap(),
            req_body_cap: default_cap(),
            resp_headers_cap: default_cap(),
            resp_body_cap: default_cap(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_cap() -> i64 {
    -1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformConfig {
    pub id: String,

    pub name: String,

    /// Requests with no platform name resolve to the default platform.
    #[serde(default, rename = "default")]
    pub is_default: bool,

    /// What to do when no account can be extracted: `reject` or `random`.
    /// Unknown values behave like `random`.
    #[serde(default = "default_empty_account_behavior")]
    pub empty_account_behavior: String,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub nodes: Vec<NodeConfig>,
}

fn default_empty_account_behavior() -> String {
    "random".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// `host:port` the direct outbound dials through.
    pub address: String,

    #[serde(default)]
    pub tag: String,

    #[serde(default)]
    pub egress_ip: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountRuleConfig {
    /// `host` or `host/path/...` prefix; `*` is the catch-all.
    pub prefix: String,

    /// Header names checked in order; the first non-empty value wins.
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub headers: Vec<String>,

    #[serde(default)]
    pub updated_at_ns: i64,
}
