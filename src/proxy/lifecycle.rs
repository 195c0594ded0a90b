use crate::events::{
    ConfigAwareEventEmitter, EventEmitter, PayloadCapture, ProxyType, RequestFinished,
    RequestLogEntry,
};
use crate::proxy::capture::CaptureBuffer;
use crate::route::RouteResult;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

#[derive(Default)]
struct LifecycleState {
    http_status: u16,
    net_ok: bool,
    account: String,
    target_host: String,
    target_url: String,
    route: Option<RouteResult>,
    upstream_stage: String,
    req_headers: Option<PayloadCapture>,
    req_body: Option<Arc<CaptureBuffer>>,
    resp_headers: Option<PayloadCapture>,
    resp_body: Option<Arc<CaptureBuffer>>,
}

/// Per-request mutable carrier. Accumulates identity, routing, byte counters
/// and capture handles; `finish` drains everything into exactly one
/// `RequestFinished` and one `RequestLog` emission, no matter how many paths
/// race to call it.
pub struct RequestLifecycle {
    emitter: Arc<ConfigAwareEventEmitter>,
    started: Instant,
    started_at_unix_ms: i64,
    proxy_type: ProxyType,
    is_connect: bool,
    method: String,
    client_ip: String,
    ingress: Arc<AtomicU64>,
    egress: Arc<AtomicU64>,
    state: Mutex<LifecycleState>,
    finished: AtomicBool,
}

impl RequestLifecycle {
    pub fn new(
        emitter: Arc<ConfigAwareEventEmitter>,
        proxy_type: ProxyType,
        is_connect: bool,
        method: &str,
        client_ip: &str,
    ) -> Arc<Self> {
        let started_at_unix_ms = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        Arc::new(Self {
            emitter,
            started: Instant::now(),
            started_at_unix_ms,
            proxy_type,
            is_connect,
            method: method.to_string(),
            client_ip: client_ip.to_string(),
            ingress: Arc::new(AtomicU64::new(0)),
            egress: Arc::new(AtomicU64::new(0)),
            state: Mutex::new(LifecycleState::default()),
            finished: AtomicBool::new(false),
        })
    }

    pub fn started(&self) -> Instant {
        self.started
    }

    /// Shared counter for bytes flowing upstream→client.
    pub fn ingress_counter(&self) -> Arc<AtomicU64> {
        self.ingress.clone()
    }

    /// Shared counter for bytes flowing client→upstream.
    pub fn egress_counter(&self) -> Arc<AtomicU64> {
        self.egress.clone()
    }

    pub fn add_ingress(&self, n: u64) {
        self.ingress.fetch_add(n, Ordering::AcqRel);
    }

    pub fn add_egress(&self, n: u64) {
        self.egress.fetch_add(n, Ordering::AcqRel);
    }

    pub fn ingress_bytes(&self) -> u64 {
        self.ingress.load(Ordering::Acquire)
    }

    pub fn egress_bytes(&self) -> u64 {
        self.egress.load(Ordering::Acquire)
    }

    pub fn set_status(&self, status: u16) {
        self.state.lock().unwrap().http_status = status;
    }

    pub fn set_net_ok(&self, net_ok: bool) {
        self.state.lock().unwrap().net_ok = net_ok;
    }

    pub fn set_account(&self, account: &str) {
        self.state.lock().unwrap().account = account.to_string();
    }

    pub fn set_target(&self, host: &str, url: &str) {
        let mut state = self.state.lock().unwrap();
        state.target_host = host.to_string();
        state.target_url = url.to_string();
    }

    pub fn set_route(&self, route: RouteResult) {
        self.state.lock().unwrap().route = Some(route);
    }

    pub fn set_upstream_stage(&self, stage: &str) {
        self.state.lock().unwrap().upstream_stage = stage.to_string();
    }

    pub fn set_req_headers_capture(&self, capture: PayloadCapture) {
        self.state.lock().unwrap().req_headers = Some(capture);
    }

    pub fn set_req_body_capture(&self, buf: Arc<CaptureBuffer>) {
        self.state.lock().unwrap().req_body = Some(buf);
    }

    pub fn set_resp_headers_capture(&self, capture: PayloadCapture) {
        self.state.lock().unwrap().resp_headers = Some(capture);
    }

    pub fn set_resp_body_capture(&self, buf: Arc<CaptureBuffer>) {
        self.state.lock().unwrap().resp_body = Some(buf);
    }

    /// Emit the two completion events. Idempotent: only the first caller
    /// emits; racing body hooks and handler paths are safe.
    pub fn finish(&self) {
        if self
            .finished
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let duration_ns = self.started.elapsed().as_nanos() as u64;
        let mut state = self.state.lock().unwrap();

        let (platform_id, platform_name, node_hash, node_tag, egress_ip) = match state.route {
            Some(ref r) => (
                r.platform_id.clone(),
                r.platform_name.clone(),
                r.node_hash.to_string(),
                r.node_tag.clone(),
                r.egress_ip.clone(),
            ),
            None => Default::default(),
        };

        let finished = RequestFinished {
            platform_id: platform_id.clone(),
            proxy_type: self.proxy_type,
            is_connect: self.is_connect,
            net_ok: state.net_ok,
            duration_ns,
        };

        let entry = RequestLogEntry {
            started_at_unix_ms: self.started_at_unix_ms,
            client_ip: self.client_ip.clone(),
            method: self.method.clone(),
            proxy_type: self.proxy_type,
            is_connect: self.is_connect,
            platform_id,
            platform_name,
            account: std::mem::take(&mut state.account),
            target_host: std::mem::take(&mut state.target_host),
            target_url: std::mem::take(&mut state.target_url),
            node_hash,
            node_tag,
            egress_ip,
            http_status: state.http_status,
            net_ok: state.net_ok,
            upstream_stage: std::mem::take(&mut state.upstream_stage),
            ingress_bytes: self.ingress_bytes(),
            egress_bytes: self.egress_bytes(),
            duration_ns,
            req_headers: state.req_headers.take(),
            req_body: state.req_body.take().map(|b| b.take()),
            resp_headers: state.resp_headers.take(),
            resp_body: state.resp_body.take().map(|b| b.take()),
        };
        drop(state);

        metrics::counter!(
            "resin_http_requests_total",
            "proxy_type" => self.proxy_type.as_str(),
            "method" => self.method.clone(),
            "status_code" => entry.http_status.to_string(),
            "platform" => entry.platform_name.clone(),
        )
        .increment(1);

        metrics::histogram!(
            "resin_http_request_duration_seconds",
            "proxy_type" => self.proxy_type.as_str(),
            "platform" => entry.platform_name.clone(),
        )
        .record(duration_ns as f64 / 1e9);

        self.emitter.emit_request_finished(&finished);
        self.emitter.emit_request_log(entry);
    }
}
