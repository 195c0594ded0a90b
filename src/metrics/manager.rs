use crate::config::MetricsConfig;
use crate::events::{ConnEvent, Direction, EventEmitter, MetricsEventSink, RequestFinished, RequestLogEntry};
use crate::metrics::bucket::{BucketAggregator, BucketFlushData};
use crate::metrics::collector::{Collector, CountersSnapshot};
use crate::metrics::ring::{ConnectionSample, LeaseSample, RealtimeRing, ThroughputSample};
use crate::route::{LeaseEvent, LeaseOp, NodePoolSnapshot, RuntimeStatsProvider};
use crate::storage::MetricsRepo;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub throughput_interval_secs: u64,
    pub connections_interval_secs: u64,
    pub leases_interval_secs: u64,
    pub bucket_seconds: i64,
    pub ring_capacity: usize,
    pub lease_channel_capacity: usize,
    pub shutdown_flush_retries: u32,
    pub shutdown_retry_delay: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self::from(&MetricsConfig::default())
    }
}

impl From<&MetricsConfig> for ManagerConfig {
    fn from(c: &MetricsConfig) -> Self {
        Self {
            throughput_interval_secs: c.throughput_interval_secs.max(1),
            connections_interval_secs: c.connections_interval_secs.max(1),
            leases_interval_secs: c.leases_interval_secs.max(1),
            bucket_seconds: c.bucket_seconds.max(1),
            ring_capacity: c.ring_capacity.max(1),
            lease_channel_capacity: c.lease_channel_capacity,
            shutdown_flush_retries: c.shutdown_flush_retries,
            shutdown_retry_delay: Duration::from_millis(c.shutdown_retry_delay_ms),
        }
    }
}

/// One bucket awaiting persistence. Tasks are retried head-first in FIFO
/// order; a failing head blocks later tasks so buckets land in time order.
#[derive(Debug, Clone)]
pub struct PendingTask {
    pub bucket: BucketFlushData,
    pub node_pool: Option<NodePoolSnapshot>,
    pub global_latency: Vec<u64>,
    pub platform_latency: HashMap<String, Vec<u64>>,
}

impl PendingTask {
    fn is_empty(&self) -> bool {
        self.bucket.is_empty()
            && self.node_pool.is_none()
            && self.global_latency.iter().all(|&d| d == 0)
            && self
                .platform_latency
                .values()
                .all(|v| v.iter().all(|&d| d == 0))
    }
}

#[derive(Default)]
struct Baselines {
    global: CountersSnapshot,
    platforms: HashMap<String, CountersSnapshot>,
    throughput_prev: (u64, u64),
}

/// Wires the collector, aggregator, realtime rings, and repository together,
/// and owns the four background workers started by [`MetricsManager::start`].
pub struct MetricsManager {
    cfg: ManagerConfig,
    collector: Arc<Collector>,
    aggregator: Arc<BucketAggregator>,
    throughput_ring: RealtimeRing<ThroughputSample>,
    connections_ring: RealtimeRing<ConnectionSample>,
    leases_ring: RealtimeRing<LeaseSample>,
    repo: Arc<dyn MetricsRepo>,
    stats: Option<Arc<dyn RuntimeStatsProvider>>,

    pending: Mutex<VecDeque<PendingTask>>,
    baselines: Mutex<Baselines>,

    lease_tx: mpsc::Sender<(String, u64)>,
    lease_rx: Mutex<mpsc::Receiver<(String, u64)>>,
    dropped_leases: AtomicU64,

    shutdown: Notify,
    stopped: AtomicBool,
    workers: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn spawn_loop<F>(manager: Arc<MetricsManager>, interval: Duration, tick: F)
where
    F: Fn(&MetricsManager) + Send + Sync + 'static,
{
    let owner = manager.clone();
    let handle = tokio::spawn(async move {
        loop {
            if manager.sleep_or_shutdown(interval).await {
                return;
            }
            tick(&manager);
        }
    });
    owner.workers.lock().unwrap().push(handle);
}

impl MetricsManager {
    pub fn new(
        cfg: ManagerConfig,
        collector: Arc<Collector>,
        repo: Arc<dyn MetricsRepo>,
        stats: Option<Arc<dyn RuntimeStatsProvider>>,
    ) -> Arc<Self> {
        let (lease_tx, lease_rx) = mpsc::channel(cfg.lease_channel_capacity.max(1));
        let aggregator = Arc::new(BucketAggregator::new(cfg.bucket_seconds, now_unix()));
        Arc::new(Self {
            throughput_ring: RealtimeRing::new(cfg.ring_capacity),
            connections_ring: RealtimeRing::new(cfg.ring_capacity),
            leases_ring: RealtimeRing::new(cfg.ring_capacity),
            collector,
            aggregator,
            repo,
            stats,
            pending: Mutex::new(VecDeque::new()),
            baselines: Mutex::new(Baselines::default()),
            lease_tx,
            lease_rx: Mutex::new(lease_rx),
            dropped_leases: AtomicU64::new(0),
            shutdown: Notify::new(),
            stopped: AtomicBool::new(false),
            workers: Mutex::new(Vec::new()),
            cfg,
        })
    }

    pub fn collector(&self) -> &Arc<Collector> {
        &self.collector
    }

    pub fn aggregator(&self) -> &Arc<BucketAggregator> {
        &self.aggregator
    }

    pub fn throughput_ring(&self) -> &RealtimeRing<ThroughputSample> {
        &self.throughput_ring
    }

    pub fn connections_ring(&self) -> &RealtimeRing<ConnectionSample> {
        &self.connections_ring
    }

    pub fn leases_ring(&self) -> &RealtimeRing<LeaseSample> {
        &self.leases_ring
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    pub fn dropped_lease_samples(&self) -> u64 {
        self.dropped_leases.load(Ordering::Relaxed)
    }

    // -- background workers ------------------------------------------------

    /// Launch the throughput / connections / leases / bucket workers.
    pub fn start(self: Arc<Self>) {
        spawn_loop(
            self.clone(),
            Duration::from_secs(self.cfg.throughput_interval_secs),
            move |m| {
                m.take_throughput_sample(now_unix());
            },
        );

        spawn_loop(
            self.clone(),
            Duration::from_secs(self.cfg.connections_interval_secs),
            move |m| {
                m.take_connections_sample(now_unix());
            },
        );

        if self.stats.is_some() {
            spawn_loop(
                self.clone(),
                Duration::from_secs(self.cfg.leases_interval_secs),
                move |m| {
                    m.take_leases_sample(now_unix());
                },
            );
        }

        // Bucket worker: align the first tick to the next bucket boundary,
        // then tick every bucket width.
        let manager = self.clone();
        let handle = tokio::spawn(async move {
            let width = manager.cfg.bucket_seconds.max(1) as u64;
            let now = now_unix();
            let next_boundary = (now.div_euclid(width as i64) + 1) * width as i64;
            let initial = Duration::from_secs((next_boundary - now).max(0) as u64);
            if manager.sleep_or_shutdown(initial).await {
                return;
            }
            loop {
                manager.flush_bucket(now_unix()).await;
                if manager.sleep_or_shutdown(Duration::from_secs(width)).await {
                    return;
                }
            }
        });
        self.workers.lock().unwrap().push(handle);

        info!(
            "metrics: manager started, bucket_seconds={}, rings={}",
            self.cfg.bucket_seconds, self.cfg.ring_capacity
        );
    }

    async fn sleep_or_shutdown(&self, duration: Duration) -> bool {
        if self.stopped.load(Ordering::Acquire) {
            return true;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => self.stopped.load(Ordering::Acquire),
            _ = self.shutdown.notified() => true,
        }
    }

    /// Stop workers, flush the in-progress bucket, and drain the pending
    /// queue with bounded retries. Persistence failure at this point is
    /// non-fatal but logged loudly.
    pub async fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        self.shutdown.notify_waiters();

        let workers: Vec<_> = self.workers.lock().unwrap().drain(..).collect();
        for handle in workers {
            let _ = handle.await;
        }

        self.sync_current_bucket_state();
        if let Some(data) = self.aggregator.force_flush() {
            self.enqueue_task(data);
        }

        for attempt in 0..=self.cfg.shutdown_flush_retries {
            self.drain_pending().await;
            if self.pending_len() == 0 {
                break;
            }
            if attempt < self.cfg.shutdown_flush_retries {
                tokio::time::sleep(self.cfg.shutdown_retry_delay).await;
            }
        }

        let remaining = self.pending_len();
        if remaining > 0 {
            error!(
                "metrics: shutdown drain exhausted retries, unrecoverable_buckets={}",
                remaining
            );
        } else {
            info!("metrics: manager stopped, all buckets persisted");
        }
    }

    // -- sampling ----------------------------------------------------------

    /// Snapshot cumulative traffic, normalize the delta to bytes/sec over the
    /// sampling interval, and push onto the throughput ring.
    pub fn take_throughput_sample(&self, now_unix: i64) {
        let snap = self.collector.snapshot();
        let interval = self.cfg.throughput_interval_secs.max(1);

        let (prev_in, prev_out) = {
            let mut baselines = self.baselines.lock().unwrap();
            let prev = baselines.throughput_prev;
            baselines.throughput_prev = (snap.ingress_bytes, snap.egress_bytes);
            prev
        };

        let sample = ThroughputSample {
            ingress_bps: snap.ingress_bytes.saturating_sub(prev_in) / interval,
            egress_bps: snap.egress_bytes.saturating_sub(prev_out) / interval,
        };
        self.throughput_ring.push(now_unix, sample);
    }

    pub fn take_connections_sample(&self, now_unix: i64) {
        let snap = self.collector.snapshot();
        self.connections_ring.push(
            now_unix,
            ConnectionSample {
                inbound_conns: snap.inbound_conns.max(0),
                outbound_conns: snap.outbound_conns.max(0),
            },
        );
    }

    pub fn take_leases_sample(&self, now_unix: i64) {
        let Some(ref stats) = self.stats else {
            return;
        };
        self.leases_ring.push(
            now_unix,
            LeaseSample {
                by_platform: stats.lease_counts_by_platform(),
            },
        );
    }

    // -- bucket flushing ---------------------------------------------------

    /// One bucket tick: reconcile collector deltas into the aggregator, flush
    /// if the bucket closed, then drain the pending queue head-first.
    pub async fn flush_bucket(&self, now_unix: i64) {
        self.sync_current_bucket_state();

        if let Some(data) = self.aggregator.maybe_flush(now_unix) {
            self.enqueue_task(data);
        }

        self.drain_pending().await;
    }

    /// Move collector request/probe growth since the last sync into the
    /// aggregator. The global-only residual (auth-less or unattributed
    /// requests) lands under the empty platform so per-scope bucket totals
    /// always sum to the global totals.
    pub fn sync_current_bucket_state(&self) {
        let global = self.collector.snapshot();
        let platforms = self.collector.platform_snapshots();

        let mut baselines = self.baselines.lock().unwrap();

        let mut platform_total_sum = 0u64;
        let mut platform_success_sum = 0u64;
        for (platform_id, snap) in &platforms {
            let base = baselines.platforms.get(platform_id);
            let d_total = snap
                .requests
                .saturating_sub(base.map_or(0, |b| b.requests));
            let d_success = snap
                .success_requests
                .saturating_sub(base.map_or(0, |b| b.success_requests));
            platform_total_sum += d_total;
            platform_success_sum += d_success;
            if d_total > 0 || d_success > 0 {
                self.aggregator
                    .add_request_counts(platform_id, d_total, d_success);
            }
        }

        let g_total = global
            .requests
            .saturating_sub(baselines.global.requests);
        let g_success = global
            .success_requests
            .saturating_sub(baselines.global.success_requests);

        let residual_total = g_total.saturating_sub(platform_total_sum);
        let residual_success = g_success.saturating_sub(platform_success_sum);
        if residual_total > 0 || residual_success > 0 {
            self.aggregator
                .add_request_counts("", residual_total, residual_success);
        }

        let probes_now = global.probe_egress + global.probe_latency;
        let probes_before = baselines.global.probe_egress + baselines.global.probe_latency;
        let d_probes = probes_now.saturating_sub(probes_before);
        if d_probes > 0 {
            self.aggregator.add_probe_count(d_probes);
        }

        baselines.global = global;
        baselines.platforms = platforms;
        drop(baselines);

        self.drain_lease_channel();
    }

    fn drain_lease_channel(&self) {
        let mut drained = 0usize;
        {
            let mut rx = self.lease_rx.lock().unwrap();
            while let Ok((platform_id, lifetime_ns)) = rx.try_recv() {
                self.aggregator.add_lease_lifetime(&platform_id, lifetime_ns);
                drained += 1;
            }
        }
        let dropped = self.dropped_leases.swap(0, Ordering::AcqRel);
        if dropped > 0 {
            warn!(
                "metrics: lease channel overflowed, dropped_samples={}, drained={}",
                dropped, drained
            );
        } else if drained > 0 {
            debug!("metrics: drained lease samples, count={}", drained);
        }
    }

    fn enqueue_task(&self, data: BucketFlushData) {
        let task = PendingTask {
            bucket: data,
            node_pool: self.stats.as_ref().map(|s| s.node_pool_snapshot()),
            global_latency: self.collector.swap_latency_buckets(),
            platform_latency: self.collector.platform_swap_all(),
        };
        if task.is_empty() {
            return;
        }
        self.pending.lock().unwrap().push_back(task);
    }

    /// Persist pending tasks strictly FIFO. The head is retried until it
    /// succeeds; later buckets wait behind it.
    async fn drain_pending(&self) {
        loop {
            let task = match self.pending.lock().unwrap().front() {
                Some(t) => t.clone(),
                None => return,
            };

            match self.write_persist_task(&task).await {
                Ok(()) => {
                    self.pending.lock().unwrap().pop_front();
                    debug!(
                        "metrics: persisted bucket, start={}",
                        task.bucket.bucket_start_unix
                    );
                }
                Err(e) => {
                    warn!(
                        "metrics: bucket persist failed, start={}, pending={}, error={}",
                        task.bucket.bucket_start_unix,
                        self.pending_len(),
                        e
                    );
                    return;
                }
            }
        }
    }

    async fn write_persist_task(&self, task: &PendingTask) -> anyhow::Result<()> {
        let start = task.bucket.bucket_start_unix;

        self.repo.write_bucket(&task.bucket).await?;

        if let Some(ref snap) = task.node_pool {
            self.repo.write_node_pool_snapshot(start, snap).await?;
        }

        if task.global_latency.iter().any(|&d| d > 0) {
            self.repo
                .write_latency_bucket(start, "", &task.global_latency)
                .await?;
        }
        for (platform_id, deltas) in &task.platform_latency {
            if deltas.iter().any(|&d| d > 0) {
                self.repo
                    .write_latency_bucket(start, platform_id, deltas)
                    .await?;
            }
        }
        Ok(())
    }

    // -- hot-path event intake ---------------------------------------------

    pub fn on_request_finished(&self, ev: &RequestFinished) {
        let latency_ms = (ev.duration_ns / 1_000_000) as i64;
        self.collector
            .record_request(&ev.platform_id, ev.net_ok, latency_ms, ev.is_connect);
    }

    /// Non-blocking lease-sample intake; overflow increments a drop counter
    /// reported at the next drain.
    pub fn on_lease_event(&self, ev: &LeaseEvent) {
        if !matches!(ev.op, LeaseOp::Remove | LeaseOp::Expire) || ev.lifetime_ns == 0 {
            return;
        }
        if self
            .lease_tx
            .try_send((ev.platform_id.clone(), ev.lifetime_ns))
            .is_err()
        {
            self.dropped_leases.fetch_add(1, Ordering::Relaxed);
        }
    }
}

impl MetricsEventSink for MetricsManager {
    fn on_traffic_delta(&self, platform_id: &str, ingress: u64, egress: u64) {
        self.collector.record_traffic(platform_id, ingress, egress);
        self.aggregator.add_traffic(platform_id, ingress, egress);
    }

    fn on_connection_event(&self, direction: Direction, event: ConnEvent) {
        let delta = match event {
            ConnEvent::Open => 1,
            ConnEvent::Close => -1,
        };
        self.collector.record_connection(direction, delta);
    }
}

/// Base event emitter: feeds the metrics manager and writes the structured
/// access log line.
pub struct ManagerEventEmitter {
    manager: Arc<MetricsManager>,
}

impl ManagerEventEmitter {
    pub fn new(manager: Arc<MetricsManager>) -> Self {
        Self { manager }
    }
}

impl EventEmitter for ManagerEventEmitter {
    fn emit_request_finished(&self, ev: &RequestFinished) {
        self.manager.on_request_finished(ev);
    }

    fn emit_request_log(&self, entry: RequestLogEntry) {
        info!(
            client_ip = %entry.client_ip,
            method = %entry.method,
            proxy_type = entry.proxy_type.as_str(),
            connect = entry.is_connect,
            platform = %entry.platform_name,
            account = %entry.account,
            upstream_host = %entry.target_host,
            node = %entry.node_tag,
            status = entry.http_status,
            net_ok = entry.net_ok,
            upstream_stage = %entry.upstream_stage,
            ingress_bytes = entry.ingress_bytes,
            egress_bytes = entry.egress_bytes,
            latency_ms = entry.duration_ns / 1_000_000,
            "access"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ProxyType;
    use crate::storage::MemoryRepo;

    fn manager_with(bucket_seconds: i64, repo: Arc<MemoryRepo>) -> Arc<MetricsManager> {
        let cfg = ManagerConfig {
            bucket_seconds,
            throughput_interval_secs: 5,
            ..ManagerConfig::default()
        };
        let collector = Arc::new(Collector::new(100, 3000));
        MetricsManager::new(cfg, collector, repo, None)
    }

    fn finished(platform: &str, net_ok: bool, latency_ms: u64) -> RequestFinished {
        RequestFinished {
            platform_id: platform.to_string(),
            proxy_type: ProxyType::Forward,
            is_connect: false,
            net_ok,
            duration_ns: latency_ms * 1_000_000,
        }
    }

    #[tokio::test]
    async fn test_bucket_flush_retry() {
        let repo = Arc::new(MemoryRepo::new());
        let manager = manager_with(1, repo.clone());
        repo.set_open(false);

        let now = now_unix();
        manager.aggregator.set_current_start(now - 2);
        manager.on_request_finished(&finished("plat-1", true, 120));
        manager.on_request_finished(&finished("plat-1", false, 380));

        manager.flush_bucket(now).await;
        assert_eq!(manager.pending_len(), 1);

        repo.set_open(true);
        manager.flush_bucket(now).await;
        assert_eq!(manager.pending_len(), 0);

        let rows = repo
            .query_requests(0, now + 10, Some("plat-1"))
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].total_requests, 2);
        assert_eq!(rows[0].success_requests, 1);

        // Latency deltas were swapped into the task and persisted.
        let latency = repo
            .query_access_latency(0, now + 10, Some("plat-1"))
            .await
            .unwrap();
        assert_eq!(latency.len(), 1);
        let deltas: Vec<u64> = serde_json::from_str(&latency[0].buckets_json).unwrap();
        assert_eq!(deltas[1], 1); // 120ms
        assert_eq!(deltas[3], 1); // 380ms
    }

    #[tokio::test]
    async fn test_throughput_normalization() {
        let repo = Arc::new(MemoryRepo::new());
        let manager = manager_with(300, repo);

        manager.on_traffic_delta("", 100, 250);
        manager.take_throughput_sample(5);
        assert_eq!(
            manager.throughput_ring.latest().unwrap(),
            (5, ThroughputSample { ingress_bps: 20, egress_bps: 50 })
        );

        manager.on_traffic_delta("", 50, 150);
        manager.take_throughput_sample(10);
        assert_eq!(
            manager.throughput_ring.latest().unwrap(),
            (10, ThroughputSample { ingress_bps: 10, egress_bps: 30 })
        );
    }

    #[tokio::test]
    async fn test_global_residual_conservation() {
        let repo = Arc::new(MemoryRepo::new());
        let manager = manager_with(300, repo);

        // One request with no platform attribution, two attributed.
        manager.on_request_finished(&finished("", true, 10));
        manager.on_request_finished(&finished("p", true, 10));
        manager.on_request_finished(&finished("p", false, 10));

        manager.sync_current_bucket_state();

        let reqs = manager.aggregator.snapshot_requests();
        assert_eq!(reqs["p"].total, 2);
        assert_eq!(reqs["p"].success, 1);
        // Global = platform sum + residual.
        assert_eq!(reqs[""].total, 3);
        assert_eq!(reqs[""].success, 2);

        // A second sync with no new activity adds nothing.
        manager.sync_current_bucket_state();
        assert_eq!(manager.aggregator.snapshot_requests()[""].total, 3);
    }

    #[tokio::test]
    async fn test_pending_fifo_order() {
        let repo = Arc::new(MemoryRepo::new());
        let manager = manager_with(1, repo.clone());
        repo.set_open(false);

        let now = now_unix();
        manager.aggregator.set_current_start(now - 10);
        manager.on_request_finished(&finished("p", true, 10));
        manager.flush_bucket(now - 5).await;

        manager.aggregator.set_current_start(now - 4);
        manager.on_request_finished(&finished("p", true, 10));
        manager.flush_bucket(now).await;
        assert_eq!(manager.pending_len(), 2);

        repo.set_open(true);
        manager.flush_bucket(now).await;
        assert_eq!(manager.pending_len(), 0);

        let rows = repo.query_requests(0, now, Some("p")).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows[0].bucket_start_unix < rows[1].bucket_start_unix);
    }

    #[tokio::test]
    async fn test_lease_events_filtered_and_drained() {
        let repo = Arc::new(MemoryRepo::new());
        let manager = manager_with(300, repo);

        manager.on_lease_event(&LeaseEvent {
            platform_id: "p".into(),
            op: LeaseOp::Acquire,
            lifetime_ns: 5,
        });
        manager.on_lease_event(&LeaseEvent {
            platform_id: "p".into(),
            op: LeaseOp::Remove,
            lifetime_ns: 0,
        });
        manager.on_lease_event(&LeaseEvent {
            platform_id: "p".into(),
            op: LeaseOp::Remove,
            lifetime_ns: 7_000_000,
        });
        manager.on_lease_event(&LeaseEvent {
            platform_id: "p".into(),
            op: LeaseOp::Expire,
            lifetime_ns: 9_000_000,
        });

        manager.sync_current_bucket_state();
        let samples = manager.aggregator.snapshot_lease_lifetimes();
        assert_eq!(samples["p"], vec![7_000_000, 9_000_000]);
    }

    #[tokio::test]
    async fn test_lease_channel_overflow_counts_drops() {
        let repo = Arc::new(MemoryRepo::new());
        let cfg = ManagerConfig {
            lease_channel_capacity: 1,
            ..ManagerConfig::default()
        };
        let collector = Arc::new(Collector::new(100, 3000));
        let manager = MetricsManager::new(cfg, collector, repo, None);

        for _ in 0..3 {
            manager.on_lease_event(&LeaseEvent {
                platform_id: "p".into(),
                op: LeaseOp::Expire,
                lifetime_ns: 1_000_000,
            });
        }
        assert_eq!(manager.dropped_lease_samples(), 2);

        manager.sync_current_bucket_state();
        assert_eq!(manager.dropped_lease_samples(), 0);
        assert_eq!(
            manager.aggregator.snapshot_lease_lifetimes()["p"].len(),
            1
        );
    }

    #[tokio::test]
    async fn test_stop_persists_in_progress_bucket() {
        let repo = Arc::new(MemoryRepo::new());
        let manager = manager_with(300, repo.clone());

        manager.on_request_finished(&finished("p", true, 25));
        manager.stop().await;

        let rows = repo
            .query_requests(0, now_unix() + 10, Some("p"))
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].total_requests, 1);
    }

    #[tokio::test]
    async fn test_connection_events_update_gauges() {
        let repo = Arc::new(MemoryRepo::new());
        let manager = manager_with(300, repo);
        manager.on_connection_event(Direction::Inbound, ConnEvent::Open);
        manager.on_connection_event(Direction::Outbound, ConnEvent::Open);
        manager.on_connection_event(Direction::Outbound, ConnEvent::Close);

        manager.take_connections_sample(1);
        assert_eq!(
            manager.connections_ring.latest().unwrap().1,
            ConnectionSample {
                inbound_conns: 1,
                outbound_conns: 0
            }
        );
    }
}
