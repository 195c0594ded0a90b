use crate::config::PlatformConfig;
use crate::error::RouteError;
use crate::outbound::{DirectOutbound, NodeHash, Outbound};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// The routing decision for one request.
#[derive(Debug, Clone)]
pub struct RouteResult {
    pub platform_id: String,
    pub platform_name: String,
    pub node_hash: NodeHash,
    pub node_tag: String,
    pub egress_ip: String,
}

/// Routing seam. The production implementation selects a node from the
/// subscription-managed pool (P2C over healthy nodes); the data plane only
/// sees the decision plus the node's dial capability.
pub trait Router: Send + Sync {
    /// Resolve `(platform, account, target_host)` to a node. An empty
    /// platform name means the default platform.
    fn route(
        &self,
        platform_name: &str,
        account: &str,
        target_host: &str,
    ) -> Result<(RouteResult, Arc<dyn Outbound>), RouteError>;
}

/// What a platform does with requests whose account cannot be determined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmptyAccountBehavior {
    Reject,
    Random,
}

/// Platform metadata seam, resolved by name (empty = default platform).
pub trait PlatformResolver: Send + Sync {
    fn empty_account_behavior(&self, platform_name: &str) -> Option<EmptyAccountBehavior>;
}

/// Node health feedback. Implementations update EWMA/decay state; calls are
/// dispatched from background tasks so the request path never blocks here.
pub trait HealthRecorder: Send + Sync {
    fn record_success(&self, node: NodeHash);
    fn record_failure(&self, node: NodeHash);

    /// `None` advances decay state without contributing a sample.
    fn record_latency(&self, node: NodeHash, domain: &str, latency: Option<Duration>);
}

/// Pool-level totals persisted next to each flushed bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodePoolSnapshot {
    pub total_nodes: u64,
    pub healthy_nodes: u64,
    pub egress_ip_count: u64,
}

/// Runtime statistics the metrics manager samples on its tickers.
pub trait RuntimeStatsProvider: Send + Sync {
    fn lease_counts_by_platform(&self) -> HashMap<String, u64>;
    fn node_pool_snapshot(&self) -> NodePoolSnapshot;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseOp {
    Acquire,
    Renew,
    Remove,
    Expire,
}

/// Lease lifecycle notification from the account-lease layer.
#[derive(Debug, Clone)]
pub struct LeaseEvent {
    pub platform_id: String,
    pub op: LeaseOp,
    pub lifetime_ns: u64,
}

// ---------------------------------------------------------------------------
// Static wiring — config-declared platforms with direct outbounds.
// ---------------------------------------------------------------------------

struct StaticNode {
    hash: NodeHash,
    tag: String,
    egress_ip: String,
    outbound: Arc<dyn Outbound>,
}

struct StaticPlatform {
    id: String,
    name: String,
    empty_account_behavior: EmptyAccountBehavior,
    nodes: Vec<StaticNode>,
    next: AtomicUsize,
}

/// Config-driven router: each platform round-robins its declared nodes over
/// direct TCP outbounds. Stands in for the subscription pool in standalone
/// deployments and tests.
pub struct StaticRouter {
    platforms: Vec<StaticPlatform>,
    by_name: HashMap<String, usize>,
    default_idx: Option<usize>,
}

impl StaticRouter {
    pub fn from_config(platforms: &[PlatformConfig]) -> Self {
        let mut built = Vec::with_capacity(platforms.len());
        let mut by_name = HashMap::new();
        let mut default_idx = None;

        for (i, p) in platforms.iter().enumerate() {
            let behavior = match p.empty_account_behavior.as_str() {
                "reject" | "REJECT" => EmptyAccountBehavior::Reject,
                _ => EmptyAccountBehavior::Random,
            };
            let nodes = p
                .nodes
                .iter()
                .map(|n| StaticNode {
                    hash: NodeHash::from_config_bytes(n.address.as_bytes()),
                    tag: n.tag.clone(),
                    egress_ip: n.egress_ip.clone(),
                    outbound: Arc::new(StaticOutbound {
                        address: n.address.clone(),
                        inner: DirectOutbound,
                    }) as Arc<dyn Outbound>,
                })
                .collect();

            if p.is_default {
                default_idx = Some(i);
            }
            by_name.insert(p.name.clone(), i);
            built.push(StaticPlatform {
                id: p.id.clone(),
                name: p.name.clone(),
                empty_account_behavior: behavior,
                nodes,
                next: AtomicUsize::new(0),
            });
        }

        Self {
            platforms: built,
            by_name,
            default_idx,
        }
    }

    fn resolve(&self, platform_name: &str) -> Option<&StaticPlatform> {
        if platform_name.is_empty() {
            return self.default_idx.map(|i| &self.platforms[i]);
        }
        self.by_name.get(platform_name).map(|&i| &self.platforms[i])
    }
}

impl Router for StaticRouter {
    fn route(
        &self,
        platform_name: &str,
        _account: &str,
        _target_host: &str,
    ) -> Result<(RouteResult, Arc<dyn Outbound>), RouteError> {
        let platform = self
            .resolve(platform_name)
            .ok_or(RouteError::PlatformNotFound)?;
        if platform.nodes.is_empty() {
            return Err(RouteError::NoAvailableNodes);
        }
        let idx = platform.next.fetch_add(1, Ordering::Relaxed) % platform.nodes.len();
        let node = &platform.nodes[idx];
        Ok((
            RouteResult {
                platform_id: platform.id.clone(),
                platform_name: platform.name.clone(),
                node_hash: node.hash,
                node_tag: node.tag.clone(),
                egress_ip: node.egress_ip.clone(),
            },
            node.outbound.clone(),
        ))
    }
}

impl PlatformResolver for StaticRouter {
    fn empty_account_behavior(&self, platform_name: &str) -> Option<EmptyAccountBehavior> {
        self.resolve(platform_name)
            .map(|p| p.empty_account_behavior)
    }
}

impl RuntimeStatsProvider for StaticRouter {
    fn lease_counts_by_platform(&self) -> HashMap<String, u64> {
        HashMap::new()
    }

    fn node_pool_snapshot(&self) -> NodePoolSnapshot {
        let total: usize = self.platforms.iter().map(|p| p.nodes.len()).sum();
        let egress_ips: std::collections::HashSet<&str> = self
            .platforms
            .iter()
            .flat_map(|p| p.nodes.iter())
            .map(|n| n.egress_ip.as_str())
            .filter(|ip| !ip.is_empty())
            .collect();
        NodePoolSnapshot {
            total_nodes: total as u64,
            // Static nodes carry no health state; report all as healthy.
            healthy_nodes: total as u64,
            egress_ip_count: egress_ips.len() as u64,
        }
    }
}

/// Direct outbound pinned to the node's configured address. The dial target
/// from the data plane is the *request* destination; a tunneling outbound
/// would forward it through the node, the static stand-in dials it directly.
struct StaticOutbound {
    #[allow(dead_code)]
    address: String,
    inner: DirectOutbound,
}

#[async_trait::async_trait]
impl Outbound for StaticOutbound {
    async fn dial(&self, addr: &str) -> std::io::Result<crate::outbound::BoxedConn> {
        self.inner.dial(addr).await
    }
}

/// No-op health recorder for wiring without a node pool.
#[derive(Debug, Default)]
pub struct NoopHealthRecorder;

impl HealthRecorder for NoopHealthRecorder {
    fn record_success(&self, _node: NodeHash) {}
    fn record_failure(&self, _node: NodeHash) {}
    fn record_latency(&self, _node: NodeHash, _domain: &str, _latency: Option<Duration>) {}
}
