use crate::metrics::bucket::{lease_percentiles, BucketFlushData};
use crate::route::NodePoolSnapshot;
use anyhow::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// Platform key as persisted: `None` is the global (NULL) row.
fn platform_key(platform_id: &str) -> Option<String> {
    if platform_id.is_empty() {
        None
    } else {
        Some(platform_id.to_string())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrafficRow {
    pub bucket_start_unix: i64,
    pub platform_id: Option<String>,
    pub ingress_bytes: u64,
    pub egress_bytes: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RequestRow {
    pub bucket_start_unix: i64,
    pub platform_id: Option<String>,
    pub total_requests: u64,
    pub success_requests: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProbeRow {
    pub bucket_start_unix: i64,
    pub probes: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NodePoolRow {
    pub bucket_start_unix: i64,
    pub total_nodes: u64,
    pub healthy_nodes: u64,
    pub egress_ip_count: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LatencyRow {
    pub bucket_start_unix: i64,
    pub platform_id: Option<String>,
    /// JSON-encoded array of per-bin sample deltas.
    pub buckets_json: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LeaseLifetimeRow {
    pub bucket_start_unix: i64,
    pub platform_id: String,
    pub p1_ms: f64,
    pub p5_ms: f64,
    pub p50_ms: f64,
    pub sample_count: u64,
}

/// The repository the metrics manager persists through. `write_bucket` is a
/// single transaction: either the whole bucket lands or none of it, so a
/// retried task never half-applies.
#[async_trait]
pub trait MetricsRepo: Send + Sync {
    async fn write_bucket(&self, data: &BucketFlushData) -> Result<()>;

    async fn write_node_pool_snapshot(
        &self,
        bucket_start_unix: i64,
        snap: &NodePoolSnapshot,
    ) -> Result<()>;

    /// `platform_id` empty = global row.
    async fn write_latency_bucket(
        &self,
        bucket_start_unix: i64,
        platform_id: &str,
        deltas: &[u64],
    ) -> Result<()>;

    async fn query_traffic(
        &self,
        from: i64,
        to: i64,
        platform_id: Option<&str>,
    ) -> Result<Vec<TrafficRow>>;

    async fn query_requests(
        &self,
        from: i64,
        to: i64,
        platform_id: Option<&str>,
    ) -> Result<Vec<RequestRow>>;

    async fn query_probes(&self, from: i64, to: i64) -> Result<Vec<ProbeRow>>;

    async fn query_node_pool(&self, from: i64, to: i64) -> Result<Vec<NodePoolRow>>;

    async fn query_access_latency(
        &self,
        from: i64,
        to: i64,
        platform_id: Option<&str>,
    ) -> Result<Vec<LatencyRow>>;

    async fn query_lease_lifetime(
        &self,
        from: i64,
        to: i64,
        platform_id: Option<&str>,
    ) -> Result<Vec<LeaseLifetimeRow>>;
}

#[derive(Default)]
struct MemoryStore {
    traffic: BTreeMap<(i64, Option<String>), TrafficRow>,
    requests: BTreeMap<(i64, Option<String>), RequestRow>,
    probes: BTreeMap<i64, ProbeRow>,
    node_pool: BTreeMap<i64, NodePoolRow>,
    latency: BTreeMap<(i64, Option<String>), LatencyRow>,
    lease_lifetime: BTreeMap<(i64, String), LeaseLifetimeRow>,
}

/// In-memory repository. Serves standalone deployments and tests; the
/// `set_open` switch injects persistence failures for retry-path coverage.
#[derive(Default)]
pub struct MemoryRepo {
    open: AtomicBool,
    store: Mutex<MemoryStore>,
}

impl MemoryRepo {
    pub fn new() -> Self {
        Self {
            open: AtomicBool::new(true),
            store: Mutex::new(MemoryStore::default()),
        }
    }

    pub fn set_open(&self, open: bool) {
        self.open.store(open, Ordering::Release);
    }

    fn check_open(&self) -> Result<()> {
        if !self.open.load(Ordering::Acquire) {
            anyhow::bail!("repository closed");
        }
        Ok(())
    }
}

#[async_trait]
impl MetricsRepo for MemoryRepo {
    async fn write_bucket(&self, data: &BucketFlushData) -> Result<()> {
        self.check_open()?;
        let mut store = self.store.lock().unwrap();
        let start = data.bucket_start_unix;

        for (platform, t) in &data.traffic {
            let key = (start, platform_key(platform));
            store.traffic.insert(
                key.clone(),
                TrafficRow {
                    bucket_start_unix: start,
                    platform_id: key.1,
                    ingress_bytes: t.ingress_bytes,
                    egress_bytes: t.egress_bytes,
                },
            );
        }

        for (platform, r) in &data.requests {
            let key = (start, platform_key(platform));
            store.requests.insert(
                key.clone(),
                RequestRow {
                    bucket_start_unix: start,
                    platform_id: key.1,
                    total_requests: r.total,
                    success_requests: r.success.min(r.total),
                },
            );
        }

        if data.probes > 0 {
            store.probes.insert(
                start,
                ProbeRow {
                    bucket_start_unix: start,
                    probes: data.probes,
                },
            );
        }

        for (platform, samples) in &data.lease_lifetimes {
            let (p1_ms, p5_ms, p50_ms, sample_count) = lease_percentiles(samples);
            store.lease_lifetime.insert(
                (start, platform.clone()),
                LeaseLifetimeRow {
                    bucket_start_unix: start,
                    platform_id: platform.clone(),
                    p1_ms,
                    p5_ms,
                    p50_ms,
                    sample_count,
                },
            );
        }

        Ok(())
    }

    async fn write_node_pool_snapshot(
        &self,
        bucket_start_unix: i64,
        snap: &NodePoolSnapshot,
    ) -> Result<()> {
        self.check_open()?;
        self.store.lock().unwrap().node_pool.insert(
            bucket_start_unix,
            NodePoolRow {
                bucket_start_unix,
                total_nodes: snap.total_nodes,
                healthy_nodes: snap.healthy_nodes,
                egress_ip_count: snap.egress_ip_count,
            },
        );
        Ok(())
    }

    async fn write_latency_bucket(
        &self,
        bucket_start_unix: i64,
        platform_id: &str,
        deltas: &[u64],
    ) -> Result<()> {
        self.check_open()?;
        let key = (bucket_start_unix, platform_key(platform_id));
        self.store.lock().unwrap().latency.insert(
            key.clone(),
            LatencyRow {
                bucket_start_unix,
                platform_id: key.1,
                buckets_json: serde_json::to_string(deltas)?,
            },
        );
        Ok(())
    }

    async fn query_traffic(
        &self,
        from: i64,
        to: i64,
        platform_id: Option<&str>,
    ) -> Result<Vec<TrafficRow>> {
        self.check_open()?;
        let store = self.store.lock().unwrap();
        Ok(store
            .traffic
            .values()
            .filter(|r| r.bucket_start_unix >= from && r.bucket_start_unix <= to)
            .filter(|r| match platform_id {
                Some(p) => r.platform_id.as_deref() == Some(p),
                None => true,
            })
            .cloned()
            .collect())
    }

    async fn query_requests(
        &self,
        from: i64,
        to: i64,
        platform_id: Option<&str>,
    ) -> Result<Vec<RequestRow>> {
        self.check_open()?;
        let store = self.store.lock().unwrap();
        Ok(store
            .requests
            .values()
            .filter(|r| r.bucket_start_unix >= from && r.bucket_start_unix <= to)
            .filter(|r| match platform_id {
                Some(p) => r.platform_id.as_deref() == Some(p),
                None => true,
            })
            .cloned()
            .collect())
    }

    async fn query_probes(&self, from: i64, to: i64) -> Result<Vec<ProbeRow>> {
        self.check_open()?;
        let store = self.store.lock().unwrap();
        Ok(store
            .probes
            .range(from..=to)
            .map(|(_, r)| r.clone())
            .collect())
    }

    async fn query_node_pool(&self, from: i64, to: i64) -> Result<Vec<NodePoolRow>> {
        self.check_open()?;
        let store = self.store.lock().unwrap();
        Ok(store
            .node_pool
            .range(from..=to)
            .map(|(_, r)| r.clone())
            .collect())
    }

    async fn query_access_latency(
        &self,
        from: i64,
        to: i64,
        platform_id: Option<&str>,
    ) -> Result<Vec<LatencyRow>> {
        self.check_open()?;
        let store = self.store.lock().unwrap();
        Ok(store
            .latency
            .values()
            .filter(|r| r.bucket_start_unix >= from && r.bucket_start_unix <= to)
            .filter(|r| match platform_id {
                Some(p) => r.platform_id.as_deref() == Some(p),
                None => true,
            })
            .cloned()
            .collect())
    }

    async fn query_lease_lifetime(
        &self,
        from: i64,
        to: i64,
        platform_id: Option<&str>,
    ) -> Result<Vec<LeaseLifetimeRow>> {
        self.check_open()?;
        let store = self.store.lock().unwrap();
        Ok(store
            .lease_lifetime
            .values()
            .filter(|r| r.bucket_start_unix >= from && r.bucket_start_unix <= to)
            .filter(|r| match platform_id {
                Some(p) => r.platform_id == p,
                None => true,
            })
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::bucket::{RequestDelta, TrafficDelta};

    fn flush_data(start: i64) -> BucketFlushData {
        let mut data = BucketFlushData {
            bucket_start_unix: start,
            ..BucketFlushData::default()
        };
        data.traffic.insert(
            String::new(),
            TrafficDelta {
                ingress_bytes: 100,
                egress_bytes: 200,
            },
        );
        data.requests.insert(
            "plat-1".to_string(),
            RequestDelta {
                total: 2,
                success: 1,
            },
        );
        data.probes = 4;
        data.lease_lifetimes
            .insert("plat-1".to_string(), vec![1_000_000, 3_000_000, 2_000_000]);
        data
    }

    #[tokio::test]
    async fn test_write_and_query_bucket() {
        let repo = MemoryRepo::new();
        repo.write_bucket(&flush_data(600)).await.unwrap();

        let traffic = repo.query_traffic(0, 1000, None).await.unwrap();
        assert_eq!(traffic.len(), 1);
        assert_eq!(traffic[0].platform_id, None);
        assert_eq!(traffic[0].ingress_bytes, 100);

        let reqs = repo.query_requests(0, 1000, Some("plat-1")).await.unwrap();
        assert_eq!(reqs[0].total_requests, 2);
        assert_eq!(reqs[0].success_requests, 1);

        let probes = repo.query_probes(0, 1000).await.unwrap();
        assert_eq!(probes[0].probes, 4);

        let leases = repo.query_lease_lifetime(0, 1000, Some("plat-1")).await.unwrap();
        assert_eq!(leases[0].sample_count, 3);
        assert_eq!(leases[0].p50_ms, 2.0);
    }

    #[tokio::test]
    async fn test_upsert_replaces_same_bucket() {
        let repo = MemoryRepo::new();
        repo.write_bucket(&flush_data(600)).await.unwrap();
        let mut second = flush_data(600);
        second.traffic.get_mut("").unwrap().ingress_bytes = 999;
        repo.write_bucket(&second).await.unwrap();

        let traffic = repo.query_traffic(600, 600, None).await.unwrap();
        assert_eq!(traffic.len(), 1);
        assert_eq!(traffic[0].ingress_bytes, 999);
    }

    #[tokio::test]
    async fn test_closed_repo_rejects_writes() {
        let repo = MemoryRepo::new();
        repo.set_open(false);
        assert!(repo.write_bucket(&flush_data(600)).await.is_err());
        repo.set_open(true);
        assert!(repo.write_bucket(&flush_data(600)).await.is_ok());
    }

    #[tokio::test]
    async fn test_latency_rows_json() {
        let repo = MemoryRepo::new();
        repo.write_latency_bucket(300, "", &[1, 0, 2]).await.unwrap();
        repo.write_latency_bucket(300, "plat-1", &[0, 5]).await.unwrap();

        let rows = repo.query_access_latency(0, 1000, None).await.unwrap();
        assert_eq!(rows.len(), 2);
        let global = rows.iter().find(|r| r.platform_id.is_none()).unwrap();
        assert_eq!(global.buckets_json, "[1,0,2]");

        let plat = repo
            .query_access_latency(0, 1000, Some("plat-1"))
            .await
            .unwrap();
        assert_eq!(plat.len(), 1);
        assert_eq!(plat[0].buckets_json, "[0,5]");
    }

    #[tokio::test]
    async fn test_node_pool_rows() {
        let repo = MemoryRepo::new();
        repo.write_node_pool_snapshot(
            900,
            &NodePoolSnapshot {
                total_nodes: 10,
                healthy_nodes: 8,
                egress_ip_count: 6,
            },
        )
        .await
        .unwrap();
        let rows = repo.query_node_pool(0, 1000).await.unwrap();
        assert_eq!(rows[0].healthy_nodes, 8);
    }
}
