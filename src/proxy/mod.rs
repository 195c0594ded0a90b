pub mod capture;
pub mod forward;
pub mod lifecycle;
pub mod reverse;

use crate::config::ResinConfig;
use crate::error::ProxyError;
use crate::events::{ConfigAwareEventEmitter, MetricsEventSink};
use crate::matcher::MatcherHolder;
use crate::route::{HealthRecorder, PlatformResolver, Router};
use crate::transport::TransportPool;
use arc_swap::ArcSwap;
use bytes::Bytes;
use http::header::{HeaderName, CONNECTION};
use http::{HeaderMap, HeaderValue};
use http_body_util::{BodyExt, Full};
use std::sync::Arc;

pub type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

pub fn full_body(data: impl Into<Bytes>) -> BoxBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed()
}

pub fn empty_body() -> BoxBody {
    Full::new(Bytes::new())
        .map_err(|never| match never {})
        .boxed()
}

/// Everything the data plane needs, wired once at bootstrap. Cheaply
/// cloneable; each listener task holds one.
#[derive(Clone)]
pub struct ProxyShared {
    pub config: Arc<ArcSwap<ResinConfig>>,
    pub router: Arc<dyn Router>,
    pub platforms: Arc<dyn PlatformResolver>,
    pub health: Arc<dyn HealthRecorder>,
    pub pool: Arc<TransportPool>,
    pub sink: Arc<dyn MetricsEventSink>,
    pub emitter: Arc<ConfigAwareEventEmitter>,
    pub matcher: Arc<MatcherHolder>,
}

/// Hop-by-hop headers stripped on every forward, in both directions.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Remove the fixed hop-by-hop set plus any header named in `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let mut listed: Vec<HeaderName> = Vec::new();
    for value in headers.get_all(CONNECTION) {
        if let Ok(s) = value.to_str() {
            for name in s.split(',') {
                if let Ok(h) = name.trim().parse::<HeaderName>() {
                    listed.push(h);
                }
            }
        }
    }
    for h in listed {
        headers.remove(h);
    }
    for h in HOP_BY_HOP {
        headers.remove(*h);
    }
}

/// Forwarding-identity headers the reverse proxy never passes upstream.
/// Includes `X-Forwarded-For` so the upstream sees the egress identity only.
const IDENTITY_HEADERS: &[&str] = &[
    "forwarded",
    "x-forwarded-for",
    "x-forwarded-host",
    "x-forwarded-proto",
    "x-forwarded-port",
    "x-forwarded-server",
    "via",
    "x-real-ip",
    "x-client-ip",
    "true-client-ip",
    "cf-connecting-ip",
    "x-proxyuser-ip",
];

pub fn strip_identity_headers(headers: &mut HeaderMap) {
    for h in IDENTITY_HEADERS {
        headers.remove(*h);
    }
}

/// Single exit point for error responses: stable tag header, plain-text
/// body, and the operational error counter.
pub fn proxy_error_response(err: ProxyError) -> hyper::Response<BoxBody> {
    metrics::counter!(
        "resin_proxy_errors_total",
        "tag" => err.tag(),
    )
    .increment(1);

    let mut builder = hyper::Response::builder()
        .status(err.http_code())
        .header("content-type", "text/plain; charset=utf-8")
        .header("x-resin-error", err.tag());

    if err == ProxyError::AuthRequired {
        builder = builder.header(
            "proxy-authenticate",
            HeaderValue::from_static("Basic realm=\"Resin\""),
        );
    }

    builder.body(full_body(err.message())).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_hop_by_hop_fixed_set() {
        let mut headers = HeaderMap::new();
        headers.insert("proxy-authorization", "Basic abc".parse().unwrap());
        headers.insert("transfer-encoding", "chunked".parse().unwrap());
        headers.insert("upgrade", "websocket".parse().unwrap());
        headers.insert("x-keep", "yes".parse().unwrap());
        strip_hop_by_hop(&mut headers);
        assert_eq!(headers.len(), 1);
        assert!(headers.contains_key("x-keep"));
    }

    #[test]
    fn test_strip_connection_listed_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("connection", "x-session-token, x-other".parse().unwrap());
        headers.insert("x-session-token", "s".parse().unwrap());
        headers.insert("x-other", "o".parse().unwrap());
        headers.insert("x-keep", "yes".parse().unwrap());
        strip_hop_by_hop(&mut headers);
        assert_eq!(headers.len(), 1);
        assert!(headers.contains_key("x-keep"));
    }

    #[test]
    fn test_strip_identity_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "1.2.3.4".parse().unwrap());
        headers.insert("cf-connecting-ip", "1.2.3.4".parse().unwrap());
        headers.insert("authorization", "Bearer t".parse().unwrap());
        strip_identity_headers(&mut headers);
        assert_eq!(headers.len(), 1);
        assert!(headers.contains_key("authorization"));
    }

    #[test]
    fn test_error_response_contract() {
        let resp = proxy_error_response(ProxyError::AuthRequired);
        assert_eq!(resp.status(), 407);
        assert_eq!(
            resp.headers().get("x-resin-error").unwrap(),
            "AUTH_REQUIRED"
        );
        assert_eq!(
            resp.headers().get("proxy-authenticate").unwrap(),
            "Basic realm=\"Resin\""
        );
        assert_eq!(
            resp.headers().get("content-type").unwrap(),
            "text/plain; charset=utf-8"
        );

        let resp = proxy_error_response(ProxyError::NoAvailableNodes);
        assert_eq!(resp.status(), 503);
        assert!(resp.headers().get("proxy-authenticate").is_none());
    }
}
