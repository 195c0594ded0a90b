use std::sync::Arc;

/// Which data-plane entry point served the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyType {
    Forward,
    Reverse,
}

impl ProxyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyType::Forward => "forward",
            ProxyType::Reverse => "reverse",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnEvent {
    Open,
    Close,
}

/// Compact per-request completion event consumed by the metrics engine.
#[derive(Debug, Clone)]
pub struct RequestFinished {
    pub platform_id: String,
    pub proxy_type: ProxyType,
    pub is_connect: bool,
    pub net_ok: bool,
    pub duration_ns: u64,
}

/// A captured payload field: the (possibly truncated) bytes, the true
/// observed length, and whether truncation happened.
#[derive(Debug, Clone, Default)]
pub struct PayloadCapture {
    pub bytes: Vec<u8>,
    pub total_len: u64,
    pub truncated: bool,
}

impl PayloadCapture {
    /// Re-apply a byte cap (`-1` = unbounded), preserving `total_len`.
    pub fn apply_cap(&mut self, cap: i64) {
        if cap >= 0 && self.bytes.len() as i64 > cap {
            self.bytes.truncate(cap as usize);
        }
        self.truncated = self.total_len > self.bytes.len() as u64;
    }
}

/// The full access-log record for one finished request.
#[derive(Debug, Clone)]
pub struct RequestLogEntry {
    pub started_at_unix_ms: i64,
    pub client_ip: String,
    pub method: String,
    pub proxy_type: ProxyType,
    pub is_connect: bool,

    pub platform_id: String,
    pub platform_name: String,
    pub account: String,
    pub target_host: String,
    pub target_url: String,
    pub node_hash: String,
    pub node_tag: String,
    pub egress_ip: String,

    pub http_status: u16,
    pub net_ok: bool,
    pub upstream_stage: String,
    pub ingress_bytes: u64,
    pub egress_bytes: u64,
    pub duration_ns: u64,

    pub req_headers: Option<PayloadCapture>,
    pub req_body: Option<PayloadCapture>,
    pub resp_headers: Option<PayloadCapture>,
    pub resp_body: Option<PayloadCapture>,
}

/// Emission seam between the request lifecycle and whatever consumes events
/// (the metrics manager plus the structured access log).
pub trait EventEmitter: Send + Sync {
    fn emit_request_finished(&self, ev: &RequestFinished);
    fn emit_request_log(&self, entry: RequestLogEntry);
}

/// Hot-path sink for byte deltas and connection lifecycle transitions.
/// Implemented by the metrics manager; called from counting connections and
/// accept loops, so implementations must never block.
pub trait MetricsEventSink: Send + Sync {
    /// `platform_id` may be empty for global-scope (connection-level) traffic.
    fn on_traffic_delta(&self, platform_id: &str, ingress: u64, egress: u64);
    fn on_connection_event(&self, direction: Direction, event: ConnEvent);
}

/// Per-field byte caps for reverse-proxy detail capture; `-1` = unbounded.
#[derive(Debug, Clone, Copy)]
pub struct CaptureLimits {
    pub req_headers: i64,
    pub req_body: i64,
    pub resp_headers: i64,
    pub resp_body: i64,
}

impl Default for CaptureLimits {
    fn default() -> Self {
        Self {
            req_headers: -1,
            req_body: -1,
            resp_headers: -1,
            resp_body: -1,
        }
    }
}

type FlagFn = Box<dyn Fn() -> bool + Send + Sync>;
type DetailFn = Box<dyn Fn() -> Option<CaptureLimits> + Send + Sync>;

/// Wraps a base emitter with runtime-evaluated feature flags.
///
/// Flags are zero-argument accessors re-read on every emit, so config
/// hot-reloads take effect without any subsystem retaining stale booleans.
pub struct ConfigAwareEventEmitter {
    base: Arc<dyn EventEmitter>,
    request_log_enabled: FlagFn,
    reverse_detail: DetailFn,
}

impl ConfigAwareEventEmitter {
    pub fn new(base: Arc<dyn EventEmitter>, request_log_enabled: FlagFn, reverse_detail: DetailFn) -> Self {
        Self {
            base,
            request_log_enabled,
            reverse_detail,
        }
    }

    /// Capture configuration for a request starting now. `None` means the
    /// proxy should not capture payloads at all.
    pub fn detail_config(&self, proxy_type: ProxyType) -> Option<CaptureLimits> {
        match proxy_type {
            ProxyType::Reverse => (self.reverse_detail)(),
            ProxyType::Forward => None,
        }
    }
}

impl EventEmitter for ConfigAwareEventEmitter {
    fn emit_request_finished(&self, ev: &RequestFinished) {
        self.base.emit_request_finished(ev);
    }

    fn emit_request_log(&self, mut entry: RequestLogEntry) {
        if !(self.request_log_enabled)() {
            return;
        }

        if entry.proxy_type == ProxyType::Reverse {
            match (self.reverse_detail)() {
                Some(limits) => {
                    if let Some(ref mut c) = entry.req_headers {
                        c.apply_cap(limits.req_headers);
                    }
                    if let Some(ref mut c) = entry.req_body {
                        c.apply_cap(limits.req_body);
                    }
                    if let Some(ref mut c) = entry.resp_headers {
                        c.apply_cap(limits.resp_headers);
                    }
                    if let Some(ref mut c) = entry.resp_body {
                        c.apply_cap(limits.resp_body);
                    }
                }
                // Detail switched off since capture started: drop payloads.
                None => {
                    entry.req_headers = None;
                    entry.req_body = None;
                    entry.resp_headers = None;
                    entry.resp_body = None;
                }
            }
        } else {
            entry.req_headers = None;
            entry.req_body = None;
            entry.resp_headers = None;
            entry.resp_body = None;
        }

        self.base.emit_request_log(entry);
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::RecordingEmitter;
    use super::*;

    fn entry_with_body(total: usize) -> RequestLogEntry {
        RequestLogEntry {
            started_at_unix_ms: 0,
            client_ip: "127.0.0.1".into(),
            method: "GET".into(),
            proxy_type: ProxyType::Reverse,
            is_connect: false,
            platform_id: "plat-1".into(),
            platform_name: "plat".into(),
            account: String::new(),
            target_host: "example.com".into(),
            target_url: "https://example.com/".into(),
            node_hash: String::new(),
            node_tag: String::new(),
            egress_ip: String::new(),
            http_status: 200,
            net_ok: true,
            upstream_stage: String::new(),
            ingress_bytes: 0,
            egress_bytes: 0,
            duration_ns: 0,
            req_headers: None,
            req_body: Some(PayloadCapture {
                bytes: vec![b'x'; total],
                total_len: total as u64,
                truncated: false,
            }),
            resp_headers: None,
            resp_body: None,
        }
    }

    #[test]
    fn test_request_log_gate() {
        let base = Arc::new(RecordingEmitter::default());
        let emitter = ConfigAwareEventEmitter::new(
            base.clone(),
            Box::new(|| false),
            Box::new(|| None),
        );
        emitter.emit_request_log(entry_with_body(10));
        assert!(base.logs.lock().unwrap().is_empty());
    }

    #[test]
    fn test_detail_disabled_clears_payloads() {
        let base = Arc::new(RecordingEmitter::default());
        let emitter = ConfigAwareEventEmitter::new(
            base.clone(),
            Box::new(|| true),
            Box::new(|| None),
        );
        emitter.emit_request_log(entry_with_body(10));
        let logs = base.logs.lock().unwrap();
        assert!(logs[0].req_body.is_none());
    }

    #[test]
    fn test_caps_truncate_preserving_total() {
        let base = Arc::new(RecordingEmitter::default());
        let emitter = ConfigAwareEventEmitter::new(
            base.clone(),
            Box::new(|| true),
            Box::new(|| {
                Some(CaptureLimits {
                    req_body: 4,
                    ..CaptureLimits::default()
                })
            }),
        );
        emitter.emit_request_log(entry_with_body(10));
        let logs = base.logs.lock().unwrap();
        let cap = logs[0].req_body.as_ref().unwrap();
        assert_eq!(cap.bytes.len(), 4);
        assert_eq!(cap.total_len, 10);
        assert!(cap.truncated);
    }

    #[test]
    fn test_forward_never_carries_payloads() {
        let base = Arc::new(RecordingEmitter::default());
        let emitter = ConfigAwareEventEmitter::new(
            base.clone(),
            Box::new(|| true),
            Box::new(|| Some(CaptureLimits::default())),
        );
        let mut entry = entry_with_body(10);
        entry.proxy_type = ProxyType::Forward;
        emitter.emit_request_log(entry);
        assert!(base.logs.lock().unwrap()[0].req_body.is_none());
        assert!(emitter.detail_config(ProxyType::Forward).is_none());
    }
}
