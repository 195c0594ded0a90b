use crate::events::Direction;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

/// Probe counter kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeKind {
    Egress,
    Latency,
}

/// Read-consistent copy of one scope's counters. Individual fields are read
/// atomically; the snapshot as a whole is not cross-field atomic.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CountersSnapshot {
    pub requests: u64,
    pub success_requests: u64,
    pub ingress_bytes: u64,
    pub egress_bytes: u64,
    pub inbound_conns: i64,
    pub outbound_conns: i64,
    pub probe_egress: u64,
    pub probe_latency: u64,
    pub latency_buckets: Vec<u64>,
    pub latency_bin_ms: u64,
    pub latency_over_ms: u64,
}

struct CounterSet {
    requests: AtomicU64,
    success_requests: AtomicU64,
    ingress_bytes: AtomicU64,
    egress_bytes: AtomicU64,
    inbound_conns: AtomicI64,
    outbound_conns: AtomicI64,
    probe_egress: AtomicU64,
    probe_latency: AtomicU64,
    latency_buckets: Vec<AtomicU64>,
}

impl CounterSet {
    fn new(bucket_count: usize) -> Self {
        Self {
            requests: AtomicU64::new(0),
            success_requests: AtomicU64::new(0),
            ingress_bytes: AtomicU64::new(0),
            egress_bytes: AtomicU64::new(0),
            inbound_conns: AtomicI64::new(0),
            outbound_conns: AtomicI64::new(0),
            probe_egress: AtomicU64::new(0),
            probe_latency: AtomicU64::new(0),
            latency_buckets: (0..bucket_count).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    fn snapshot(&self, bin_ms: u64, over_ms: u64) -> CountersSnapshot {
        CountersSnapshot {
            requests: self.requests.load(Ordering::Acquire),
            success_requests: self.success_requests.load(Ordering::Acquire),
            ingress_bytes: self.ingress_bytes.load(Ordering::Acquire),
            egress_bytes: self.egress_bytes.load(Ordering::Acquire),
            inbound_conns: self.inbound_conns.load(Ordering::Acquire),
            outbound_conns: self.outbound_conns.load(Ordering::Acquire),
            probe_egress: self.probe_egress.load(Ordering::Acquire),
            probe_latency: self.probe_latency.load(Ordering::Acquire),
            latency_buckets: self
                .latency_buckets
                .iter()
                .map(|b| b.load(Ordering::Acquire))
                .collect(),
            latency_bin_ms: bin_ms,
            latency_over_ms: over_ms,
        }
    }

    /// Read-and-zero every latency bucket, returning the deltas.
    fn swap_latency_buckets(&self) -> Vec<u64> {
        self.latency_buckets
            .iter()
            .map(|b| b.swap(0, Ordering::AcqRel))
            .collect()
    }
}

/// Lock-free hot-path counters: one global scope plus a concurrent map of
/// per-platform scopes, all per-field atomics.
pub struct Collector {
    global: CounterSet,
    platforms: DashMap<String, Arc<CounterSet>>,
    bin_ms: u64,
    over_ms: u64,
    bucket_count: usize,
}

impl Collector {
    /// `bin_ms`/`over_ms` fix the histogram shape:
    /// `ceil(over/bin)` regular buckets plus one overflow bucket.
    pub fn new(bin_ms: u64, over_ms: u64) -> Self {
        let regular = over_ms.div_ceil(bin_ms) as usize;
        Self {
            global: CounterSet::new(regular + 1),
            platforms: DashMap::new(),
            bin_ms,
            over_ms,
            bucket_count: regular + 1,
        }
    }

    fn platform(&self, platform_id: &str) -> Arc<CounterSet> {
        if let Some(set) = self.platforms.get(platform_id) {
            return set.value().clone();
        }
        self.platforms
            .entry(platform_id.to_string())
            .or_insert_with(|| Arc::new(CounterSet::new(self.bucket_count)))
            .clone()
    }

    fn bucket_index(&self, latency_ms: u64) -> usize {
        if latency_ms >= self.over_ms {
            return self.bucket_count - 1;
        }
        ((latency_ms / self.bin_ms) as usize).min(self.bucket_count - 2)
    }

    /// Record one finished request. `latency_ms < 0` or CONNECT tunnels skip
    /// the histogram (tunnel duration is not a request latency).
    pub fn record_request(&self, platform_id: &str, success: bool, latency_ms: i64, is_connect: bool) {
        let idx = if !is_connect && latency_ms >= 0 {
            Some(self.bucket_index(latency_ms as u64))
        } else {
            None
        };

        self.global.requests.fetch_add(1, Ordering::AcqRel);
        if success {
            self.global.success_requests.fetch_add(1, Ordering::AcqRel);
        }
        if let Some(i) = idx {
            self.global.latency_buckets[i].fetch_add(1, Ordering::AcqRel);
        }

        if !platform_id.is_empty() {
            let set = self.platform(platform_id);
            set.requests.fetch_add(1, Ordering::AcqRel);
            if success {
                set.success_requests.fetch_add(1, Ordering::AcqRel);
            }
            if let Some(i) = idx {
                set.latency_buckets[i].fetch_add(1, Ordering::AcqRel);
            }
        }
    }

    pub fn record_traffic(&self, platform_id: &str, ingress: u64, egress: u64) {
        self.global.ingress_bytes.fetch_add(ingress, Ordering::AcqRel);
        self.global.egress_bytes.fetch_add(egress, Ordering::AcqRel);
        if !platform_id.is_empty() {
            let set = self.platform(platform_id);
            set.ingress_bytes.fetch_add(ingress, Ordering::AcqRel);
            set.egress_bytes.fetch_add(egress, Ordering::AcqRel);
        }
    }

    /// `delta` is ±1 per connection open/close. Connection gauges are global
    /// only.
    pub fn record_connection(&self, direction: Direction, delta: i64) {
        match direction {
            Direction::Inbound => self.global.inbound_conns.fetch_add(delta, Ordering::AcqRel),
            Direction::Outbound => self.global.outbound_conns.fetch_add(delta, Ordering::AcqRel),
        };
    }

    pub fn record_probe(&self, kind: ProbeKind) {
        match kind {
            ProbeKind::Egress => self.global.probe_egress.fetch_add(1, Ordering::AcqRel),
            ProbeKind::Latency => self.global.probe_latency.fetch_add(1, Ordering::AcqRel),
        };
    }

    pub fn snapshot(&self) -> CountersSnapshot {
        self.global.snapshot(self.bin_ms, self.over_ms)
    }

    pub fn platform_snapshot(&self, platform_id: &str) -> Option<CountersSnapshot> {
        self.platforms
            .get(platform_id)
            .map(|set| set.snapshot(self.bin_ms, self.over_ms))
    }

    pub fn platform_snapshots(&self) -> HashMap<String, CountersSnapshot> {
        self.platforms
            .iter()
            .map(|e| (e.key().clone(), e.value().snapshot(self.bin_ms, self.over_ms)))
            .collect()
    }

    pub fn swap_latency_buckets(&self) -> Vec<u64> {
        self.global.swap_latency_buckets()
    }

    /// Read-and-zero latency buckets for every platform scope.
    pub fn platform_swap_all(&self) -> HashMap<String, Vec<u64>> {
        self.platforms
            .iter()
            .map(|e| (e.key().clone(), e.value().swap_latency_buckets()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latency_bucket_placement() {
        for (ms, want) in [(0i64, 0usize), (100, 1), (2999, 29), (3000, 30), (3001, 30)] {
            let c = Collector::new(100, 3000);
            c.record_request("p", true, ms, false);
            let snap = c.snapshot();
            assert_eq!(snap.latency_buckets.len(), 31);
            assert_eq!(snap.latency_buckets[want], 1, "latency {ms} in bucket {want}");
        }
    }

    #[test]
    fn test_connect_and_negative_latency_skip_histogram() {
        let c = Collector::new(100, 3000);
        c.record_request("p", true, 120, true);
        c.record_request("p", false, -1, false);
        let snap = c.snapshot();
        assert_eq!(snap.requests, 2);
        assert_eq!(snap.success_requests, 1);
        assert!(snap.latency_buckets.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_platform_and_global_scopes() {
        let c = Collector::new(100, 3000);
        c.record_request("plat-1", true, 50, false);
        c.record_request("plat-2", false, 150, false);
        c.record_traffic("plat-1", 100, 200);
        c.record_traffic("", 10, 20);

        let g = c.snapshot();
        assert_eq!(g.requests, 2);
        assert_eq!(g.success_requests, 1);
        assert_eq!(g.ingress_bytes, 110);
        assert_eq!(g.egress_bytes, 220);

        let p1 = c.platform_snapshot("plat-1").unwrap();
        assert_eq!(p1.requests, 1);
        assert_eq!(p1.ingress_bytes, 100);
        assert_eq!(p1.latency_buckets[0], 1);

        let p2 = c.platform_snapshot("plat-2").unwrap();
        assert_eq!(p2.latency_buckets[1], 1);
        assert!(c.platform_snapshot("plat-3").is_none());
    }

    #[test]
    fn test_connection_gauges() {
        let c = Collector::new(100, 3000);
        c.record_connection(Direction::Inbound, 1);
        c.record_connection(Direction::Inbound, 1);
        c.record_connection(Direction::Inbound, -1);
        c.record_connection(Direction::Outbound, 1);
        let snap = c.snapshot();
        assert_eq!(snap.inbound_conns, 1);
        assert_eq!(snap.outbound_conns, 1);
    }

    #[test]
    fn test_swap_latency_buckets_zeroes() {
        let c = Collector::new(100, 3000);
        c.record_request("p", true, 250, false);
        c.record_request("p", true, 250, false);

        let deltas = c.swap_latency_buckets();
        assert_eq!(deltas[2], 2);
        assert!(c.snapshot().latency_buckets.iter().all(|&b| b == 0));

        let by_platform = c.platform_swap_all();
        assert_eq!(by_platform["p"][2], 2);
        assert!(c
            .platform_snapshot("p")
            .unwrap()
            .latency_buckets
            .iter()
            .all(|&b| b == 0));
    }

    #[test]
    fn test_probe_counters() {
        let c = Collector::new(100, 3000);
        c.record_probe(ProbeKind::Egress);
        c.record_probe(ProbeKind::Egress);
        c.record_probe(ProbeKind::Latency);
        let snap = c.snapshot();
        assert_eq!(snap.probe_egress, 2);
        assert_eq!(snap.probe_latency, 1);
    }
}
