pub mod counting;

use crate::config::TransportConfig;
use crate::events::MetricsEventSink;
use crate::outbound::{BoxedConn, NodeHash, Outbound};
use crate::proxy::BoxBody;
use crate::route::HealthRecorder;
use crate::transport::counting::{CountedStream, TlsLatencyObserver};
use dashmap::DashMap;
use http::Uri;
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tracing::debug;

/// A rustls `ServerCertVerifier` that accepts any certificate without
/// validation. Used when `tls_verify: false` — upstream endpoints reached
/// through third-party egress nodes are not ours to attest.
#[derive(Debug)]
struct NoVerifier;

impl rustls::client::danger::ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Connection type produced by [`OutboundConnector`]: the dialed stream under
/// a passive TLS-latency observer and a byte counter, adapted to hyper's io
/// traits.
pub type NodeConn = TokioIo<CountedStream<TlsLatencyObserver<BoxedConn>>>;

/// hyper connector that dials through a node's [`Outbound`] instead of the
/// host network stack, instrumenting every connection it opens.
#[derive(Clone)]
pub struct OutboundConnector {
    outbound: Arc<dyn Outbound>,
    sink: Option<Arc<dyn MetricsEventSink>>,
    health: Option<(Arc<dyn HealthRecorder>, NodeHash)>,
    flush_threshold: u64,
    flush_interval: Duration,
}

impl tower_service::Service<Uri> for OutboundConnector {
    type Response = NodeConn;
    type Error = std::io::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, dst: Uri) -> Self::Future {
        let outbound = self.outbound.clone();
        let sink = self.sink.clone();
        let health = self.health.clone();
        let flush_threshold = self.flush_threshold;
        let flush_interval = self.flush_interval;

        Box::pin(async move {
            let addr = dial_address(&dst)?;
            let conn = outbound.dial(&addr).await?;

            if let Some(ref sink) = sink {
                sink.on_connection_event(
                    crate::events::Direction::Outbound,
                    crate::events::ConnEvent::Open,
                );
            }

            // The observer only reports when TLS will actually be layered on
            // top of this stream (first write = Client Hello).
            let is_https = dst.scheme_str() == Some("https");
            let observed = match (&health, is_https) {
                (Some((recorder, node)), true) => {
                    let recorder = recorder.clone();
                    let node = *node;
                    let domain = dst.host().unwrap_or_default().to_string();
                    TlsLatencyObserver::new(
                        conn,
                        Box::new(move |latency| {
                            recorder.record_latency(node, &domain, Some(latency));
                        }),
                    )
                }
                _ => TlsLatencyObserver::new(conn, Box::new(|_| {})),
            };

            let sink = sink.unwrap_or_else(|| Arc::new(NoopSink) as Arc<dyn MetricsEventSink>);
            let counted =
                CountedStream::with_policy(observed, sink, flush_threshold, flush_interval);
            Ok(TokioIo::new(counted))
        })
    }
}

/// Sink used when a transport is built without metrics wiring.
struct NoopSink;

impl MetricsEventSink for NoopSink {
    fn on_traffic_delta(&self, _platform_id: &str, _ingress: u64, _egress: u64) {}
    fn on_connection_event(
        &self,
        _direction: crate::events::Direction,
        _event: crate::events::ConnEvent,
    ) {
    }
}

fn dial_address(dst: &Uri) -> std::io::Result<String> {
    let host = dst.host().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "uri has no host")
    })?;
    let port = dst
        .port_u16()
        .unwrap_or_else(|| if dst.scheme_str() == Some("https") { 443 } else { 80 });

    // Re-bracket bare IPv6 literals for the dialer.
    if host.contains(':') && !host.starts_with('[') {
        Ok(format!("[{host}]:{port}"))
    } else {
        Ok(format!("{host}:{port}"))
    }
}

pub type PooledClient = Client<HttpsConnector<OutboundConnector>, BoxBody>;

/// Per-node keep-alive transport pool keyed by [`NodeHash`].
///
/// `get` has load-or-compute semantics: subsequent calls with the same hash
/// return clones of the same client, sharing its connection pool. Evicting a
/// node drops the client, which closes its idle connections.
pub struct TransportPool {
    entries: DashMap<NodeHash, PooledClient>,
    config: TransportConfig,
    flush_threshold: u64,
    flush_interval: Duration,
}

impl TransportPool {
    pub fn new(config: TransportConfig, flush_threshold: u64, flush_interval: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            config,
            flush_threshold,
            flush_interval,
        }
    }

    pub fn get(
        &self,
        hash: NodeHash,
        outbound: Arc<dyn Outbound>,
        sink: Option<Arc<dyn MetricsEventSink>>,
        health: Option<Arc<dyn HealthRecorder>>,
    ) -> PooledClient {
        if let Some(existing) = self.entries.get(&hash) {
            return existing.value().clone();
        }
        self.entries
            .entry(hash)
            .or_insert_with(|| {
                debug!("transport: building pooled client, node={}", hash);
                self.build_client(OutboundConnector {
                    outbound,
                    sink,
                    health: health.map(|h| (h, hash)),
                    flush_threshold: self.flush_threshold,
                    flush_interval: self.flush_interval,
                })
            })
            .clone()
    }

    /// Drop the node's transport. Idle connections close when the last
    /// borrowed clone is released.
    pub fn evict(&self, hash: NodeHash) -> bool {
        let removed = self.entries.remove(&hash).is_some();
        if removed {
            debug!("transport: evicted node transport, node={}", hash);
        }
        removed
    }

    pub fn close_all(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Build a hyper client over the outbound dialer supporting both
    /// `http://` and `https://` targets. HTTP/2 is negotiated via ALPN on
    /// TLS connections; plain HTTP stays on 1.1.
    fn build_client(&self, connector: OutboundConnector) -> PooledClient {
        let https = if self.config.tls_verify {
            hyper_rustls::HttpsConnectorBuilder::new()
                .with_webpki_roots()
                .https_or_http()
                .enable_http1()
                .enable_http2()
                .wrap_connector(connector)
        } else {
            let tls_config = rustls::ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(NoVerifier))
                .with_no_client_auth();

            hyper_rustls::HttpsConnectorBuilder::new()
                .with_tls_config(tls_config)
                .https_or_http()
                .enable_http1()
                .enable_http2()
                .wrap_connector(connector)
        };

        Client::builder(TokioExecutor::new())
            .pool_timer(TokioTimer::new())
            .pool_idle_timeout(Duration::from_secs(self.config.idle_timeout_secs))
            .pool_max_idle_per_host(
                self.config.max_idle_per_host.min(self.config.max_idle_conns),
            )
            .build(https)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbound::DirectOutbound;

    fn pool() -> TransportPool {
        TransportPool::new(
            TransportConfig::default(),
            counting::TRAFFIC_FLUSH_THRESHOLD,
            counting::TRAFFIC_FLUSH_INTERVAL,
        )
    }

    #[tokio::test]
    async fn test_get_reuses_entry() {
        let pool = pool();
        let hash = NodeHash::from_config_bytes(b"node-a");
        let outbound = Arc::new(DirectOutbound) as Arc<dyn Outbound>;
        let _a = pool.get(hash, outbound.clone(), None, None);
        let _b = pool.get(hash, outbound, None, None);
        assert_eq!(pool.len(), 1);
    }

    #[tokio::test]
    async fn test_evict_and_close_all() {
        let pool = pool();
        let a = NodeHash::from_config_bytes(b"node-a");
        let b = NodeHash::from_config_bytes(b"node-b");
        let outbound = Arc::new(DirectOutbound) as Arc<dyn Outbound>;
        pool.get(a, outbound.clone(), None, None);
        pool.get(b, outbound, None, None);

        assert!(pool.evict(a));
        assert!(!pool.evict(a));
        assert_eq!(pool.len(), 1);

        pool.close_all();
        assert!(pool.is_empty());
    }

    #[test]
    fn test_dial_address_forms() {
        let uri: Uri = "https://example.com/x".parse().unwrap();
        assert_eq!(dial_address(&uri).unwrap(), "example.com:443");
        let uri: Uri = "http://example.com:8080/x".parse().unwrap();
        assert_eq!(dial_address(&uri).unwrap(), "example.com:8080");
        let uri: Uri = "http://[::1]:9000/".parse().unwrap();
        assert_eq!(dial_address(&uri).unwrap(), "[::1]:9000");
    }
}
