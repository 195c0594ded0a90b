use std::collections::HashMap;
use std::sync::RwLock;

/// Throughput sample, bytes per second.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ThroughputSample {
    pub ingress_bps: u64,
    pub egress_bps: u64,
}

/// Active connection counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionSample {
    pub inbound_conns: i64,
    pub outbound_conns: i64,
}

/// Leases held, by platform id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LeaseSample {
    pub by_platform: HashMap<String, u64>,
}

/// Fixed-capacity ring of timestamped samples. Samples are appended with
/// monotonically increasing timestamps; the oldest is overwritten when full.
/// Reads share an RW lock.
pub struct RealtimeRing<T> {
    inner: RwLock<RingInner<T>>,
}

struct RingInner<T> {
    buf: Vec<Option<(i64, T)>>,
    head: usize,
    len: usize,
}

impl<T: Clone> RealtimeRing<T> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring capacity must be positive");
        Self {
            inner: RwLock::new(RingInner {
                buf: vec![None; capacity],
                head: 0,
                len: 0,
            }),
        }
    }

    pub fn push(&self, timestamp: i64, sample: T) {
        let mut inner = self.inner.write().unwrap();
        let cap = inner.buf.len();
        let head = inner.head;
        inner.buf[head] = Some((timestamp, sample));
        inner.head = (head + 1) % cap;
        if inner.len < cap {
            inner.len += 1;
        }
    }

    pub fn latest(&self) -> Option<(i64, T)> {
        let inner = self.inner.read().unwrap();
        if inner.len == 0 {
            return None;
        }
        let cap = inner.buf.len();
        let idx = (inner.head + cap - 1) % cap;
        inner.buf[idx].clone()
    }

    /// Samples with timestamp in `(from, to]`, newest first. The walk stops
    /// at the first sample at or before `from`, so a query over recent time
    /// touches only recent slots.
    pub fn query(&self, from: i64, to: i64) -> Vec<(i64, T)> {
        let inner = self.inner.read().unwrap();
        let cap = inner.buf.len();
        let mut out = Vec::new();

        for i in 0..inner.len {
            let idx = (inner.head + cap - 1 - i) % cap;
            let Some((ts, ref sample)) = inner.buf[idx] else {
                break;
            };
            if ts <= from {
                break;
            }
            if ts <= to {
                out.push((ts, sample.clone()));
            }
        }
        out
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
