use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Histogram bucket boundaries for latency metrics (seconds).
const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Thin handle around the global metrics recorder.
///
/// These are the operational Prometheus metrics rendered by the admin
/// listener; the domain metrics engine (collector/aggregator/rings) is
/// separate and authoritative for billing-grade numbers.
#[derive(Clone)]
pub struct Metrics {
    handle: PrometheusHandle,
}

impl Metrics {
    /// Install the global Prometheus recorder and register metric
    /// descriptions. Must be called **once** at startup.
    pub fn install() -> Self {
        let handle = PrometheusBuilder::new()
            .set_buckets_for_metric(
                metrics_exporter_prometheus::Matcher::Suffix("_duration_seconds".to_string()),
                LATENCY_BUCKETS,
            )
            .expect("valid matcher")
            .install_recorder()
            .expect("failed to install metrics recorder");

        describe_counter!(
            "resin_http_requests_total",
            Unit::Count,
            "Total proxy requests processed"
        );
        describe_histogram!(
            "resin_http_request_duration_seconds",
            Unit::Seconds,
            "Request duration from client perspective"
        );
        describe_counter!(
            "resin_proxy_errors_total",
            Unit::Count,
            "Requests that ended in a proxy error, by tag"
        );

        describe_gauge!(
            "resin_connections_active",
            Unit::Count,
            "Active downstream connections, by listener"
        );
        describe_counter!(
            "resin_connections_total",
            Unit::Count,
            "Connections accepted, by listener"
        );

        describe_counter!(
            "resin_tunnel_bytes_total",
            Unit::Bytes,
            "CONNECT tunnel bytes copied, by direction"
        );
        describe_gauge!(
            "resin_pending_persist_tasks",
            Unit::Count,
            "Metric buckets waiting for persistence"
        );

        Self { handle }
    }

    /// Render all metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        self.handle.render()
    }
}
