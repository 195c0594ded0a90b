use std::collections::HashMap;
use std::sync::Mutex;

/// Per-scope traffic accumulated inside one bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrafficDelta {
    pub ingress_bytes: u64,
    pub egress_bytes: u64,
}

/// Per-scope request counts accumulated inside one bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestDelta {
    pub total: u64,
    pub success: u64,
}

/// One flushed bucket, keyed by its aligned start. The empty-string key in
/// the per-scope maps is the global scope.
#[derive(Debug, Clone, Default)]
pub struct BucketFlushData {
    pub bucket_start_unix: i64,
    pub traffic: HashMap<String, TrafficDelta>,
    pub requests: HashMap<String, RequestDelta>,
    pub probes: u64,
    pub lease_lifetimes: HashMap<String, Vec<u64>>,
}

impl BucketFlushData {
    pub fn is_empty(&self) -> bool {
        self.traffic.is_empty()
            && self.requests.is_empty()
            && self.probes == 0
            && self.lease_lifetimes.is_empty()
    }
}

#[derive(Default)]
struct AggState {
    current_start: i64,
    traffic: HashMap<String, TrafficDelta>,
    requests: HashMap<String, RequestDelta>,
    probes: u64,
    lease_lifetimes: HashMap<String, Vec<u64>>,
}

impl AggState {
    fn has_data(&self) -> bool {
        !self.traffic.is_empty()
            || !self.requests.is_empty()
            || self.probes > 0
            || !self.lease_lifetimes.is_empty()
    }

    fn drain(&mut self) -> BucketFlushData {
        BucketFlushData {
            bucket_start_unix: self.current_start,
            traffic: std::mem::take(&mut self.traffic),
            requests: std::mem::take(&mut self.requests),
            probes: std::mem::take(&mut self.probes),
            lease_lifetimes: std::mem::take(&mut self.lease_lifetimes),
        }
    }
}

/// Wall-clock-aligned time-bucket aggregator. All mutation happens under one
/// mutex, so every bucket observes a single total order of updates.
pub struct BucketAggregator {
    bucket_seconds: i64,
    state: Mutex<AggState>,
}

fn align(now_unix: i64, width: i64) -> i64 {
    now_unix.div_euclid(width) * width
}

impl BucketAggregator {
    pub fn new(bucket_seconds: i64, now_unix: i64) -> Self {
        Self {
            bucket_seconds,
            state: Mutex::new(AggState {
                current_start: align(now_unix, bucket_seconds),
                ..AggState::default()
            }),
        }
    }

    pub fn bucket_seconds(&self) -> i64 {
        self.bucket_seconds
    }

    pub fn current_start(&self) -> i64 {
        self.state.lock().unwrap().current_start
    }

    /// Test/recovery hook: pin the current bucket's start.
    pub fn set_current_start(&self, start_unix: i64) {
        self.state.lock().unwrap().current_start = start_unix;
    }

    /// Add traffic to the platform scope (when non-empty) and the global
    /// scope.
    pub fn add_traffic(&self, platform_id: &str, ingress: u64, egress: u64) {
        if ingress == 0 && egress == 0 {
            return;
        }
        let mut state = self.state.lock().unwrap();
        if !platform_id.is_empty() {
            let t = state.traffic.entry(platform_id.to_string()).or_default();
            t.ingress_bytes += ingress;
            t.egress_bytes += egress;
        }
        let g = state.traffic.entry(String::new()).or_default();
        g.ingress_bytes += ingress;
        g.egress_bytes += egress;
    }

    /// Add request counts; `success` is clamped to `[0, total]`.
    pub fn add_request_counts(&self, platform_id: &str, total: u64, success: u64) {
        if total == 0 && success == 0 {
            return;
        }
        let success = success.min(total);
        let mut state = self.state.lock().unwrap();
        if !platform_id.is_empty() {
            let r = state.requests.entry(platform_id.to_string()).or_default();
            r.total += total;
            r.success += success;
        }
        let g = state.requests.entry(String::new()).or_default();
        g.total += total;
        g.success += success;
    }

    pub fn add_probe_count(&self, n: u64) {
        if n == 0 {
            return;
        }
        self.state.lock().unwrap().probes += n;
    }

    pub fn add_lease_lifetime(&self, platform_id: &str, lifetime_ns: u64) {
        self.state
            .lock()
            .unwrap()
            .lease_lifetimes
            .entry(platform_id.to_string())
            .or_default()
            .push(lifetime_ns);
    }

    /// Flush iff the current bucket has closed (`now >= start + width`).
    /// On flush the state resets and the window advances to the bucket
    /// containing `now`.
    pub fn maybe_flush(&self, now_unix: i64) -> Option<BucketFlushData> {
        let mut state = self.state.lock().unwrap();
        if now_unix < state.current_start + self.bucket_seconds {
            return None;
        }
        let data = state.drain();
        state.current_start = align(now_unix, self.bucket_seconds);
        Some(data)
    }

    /// Flush whatever the in-progress bucket holds, if anything.
    pub fn force_flush(&self) -> Option<BucketFlushData> {
        let mut state = self.state.lock().unwrap();
        if !state.has_data() {
            return None;
        }
        Some(state.drain())
    }

    // Read-only views of the in-progress bucket, for history merging.

    pub fn snapshot_traffic(&self) -> HashMap<String, TrafficDelta> {
        self.state.lock().unwrap().traffic.clone()
    }

    pub fn snapshot_requests(&self) -> HashMap<String, RequestDelta> {
        self.state.lock().unwrap().requests.clone()
    }

    pub fn snapshot_probes(&self) -> u64 {
        self.state.lock().unwrap().probes
    }

    /// Defensive copy; callers must not observe later sample appends.
    pub fn snapshot_lease_lifetimes(&self) -> HashMap<String, Vec<u64>> {
        self.state.lock().unwrap().lease_lifetimes.clone()
    }
}

/// Percentile of nanosecond samples, returned in milliseconds.
/// `idx = ⌊k·(n−1)⌋`, clamped — the convention the dashboard expects.
pub fn percentile_ms(samples_ns: &[u64], k: f64) -> f64 {
    if samples_ns.is_empty() {
        return 0.0;
    }
    let mut sorted = samples_ns.to_vec();
    sorted.sort_unstable();
    let idx = ((k * (sorted.len() - 1) as f64).floor() as usize).min(sorted.len() - 1);
    sorted[idx] as f64 / 1e6
}

/// `(p1_ms, p5_ms, p50_ms, sample_count)` for a lease-lifetime sample list.
pub fn lease_percentiles(samples_ns: &[u64]) -> (f64, f64, f64, u64) {
    (
        percentile_ms(samples_ns, 0.01),
        percentile_ms(samples_ns, 0.05),
        percentile_ms(samples_ns, 0.50),
        samples_ns.len() as u64,
    )
}
