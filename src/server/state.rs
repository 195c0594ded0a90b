use crate::config::ResinConfig;
use crate::events::{CaptureLimits, ConfigAwareEventEmitter, MetricsEventSink};
use crate::matcher::{AccountMatcher, AccountRule, MatcherHolder};
use crate::metrics::manager::ManagerEventEmitter;
use crate::metrics::{Collector, ManagerConfig, Metrics, MetricsManager};
use crate::proxy::ProxyShared;
use crate::route::{NoopHealthRecorder, StaticRouter};
use crate::storage::{MemoryRepo, MetricsRepo};
use crate::transport::TransportPool;
use anyhow::Result;
use arc_swap::ArcSwap;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Shared server state, cheaply cloneable. Wires the routing, transport,
/// matcher, and metrics subsystems behind the seams the data plane consumes.
#[derive(Clone)]
pub struct ResinState {
    pub config: Arc<ArcSwap<ResinConfig>>,
    pub metrics: Metrics,
    pub manager: Arc<MetricsManager>,
    pub repo: Arc<dyn MetricsRepo>,
    pub shared: ProxyShared,
}

impl ResinState {
    pub fn new(config: ResinConfig) -> Result<Self> {
        let metrics = Metrics::install();

        let collector = Arc::new(Collector::new(
            config.metrics.latency_bin_ms,
            config.metrics.latency_over_ms,
        ));

        let router = Arc::new(StaticRouter::from_config(&config.platforms));
        info!(
            "route: static router built, platforms={}",
            config.platforms.len()
        );

        let repo: Arc<MemoryRepo> = Arc::new(MemoryRepo::new());
        let manager = MetricsManager::new(
            ManagerConfig::from(&config.metrics),
            collector,
            repo.clone(),
            Some(router.clone()),
        );

        let rules: Vec<AccountRule> = config.account_rules.iter().map(AccountRule::from).collect();
        let matcher = Arc::new(MatcherHolder::new(AccountMatcher::build(&rules)));
        info!("matcher: account rules loaded, rules={}", rules.len());

        let pool = Arc::new(TransportPool::new(
            config.transport.clone(),
            config.traffic.flush_threshold_bytes,
            Duration::from_millis(config.traffic.flush_interval_ms),
        ));

        let config = Arc::new(ArcSwap::new(Arc::new(config)));

        // Feature flags are re-read from the live config at emit time.
        let flags_config = config.clone();
        let detail_config = config.clone();
        let emitter = Arc::new(ConfigAwareEventEmitter::new(
            Arc::new(ManagerEventEmitter::new(manager.clone())),
            Box::new(move || flags_config.load().request_log.enabled),
            Box::new(move || {
                let cfg = detail_config.load();
                if !cfg.request_log.reverse_detail_enabled {
                    return None;
                }
                Some(CaptureLimits {
                    req_headers: cfg.request_log.req_headers_cap,
                    req_body: cfg.request_log.req_body_cap,
                    resp_headers: cfg.request_log.resp_headers_cap,
                    resp_body: cfg.request_log.resp_body_cap,
                })
            }),
        ));

        let shared = ProxyShared {
            config: config.clone(),
            router: router.clone(),
            platforms: router.clone(),
            health: Arc::new(NoopHealthRecorder),
            pool,
            sink: manager.clone() as Arc<dyn MetricsEventSink>,
            emitter,
            matcher,
        };

        Ok(Self {
            config,
            metrics,
            manager,
            repo,
            shared,
        })
    }

    /// Rebuild the account matcher from a fresh rule set and publish it.
    pub fn replace_account_rules(&self, rules: &[AccountRule]) {
        self.shared.matcher.replace_rules(rules);
        info!("matcher: account rules replaced, rules={}", rules.len());
    }
}
