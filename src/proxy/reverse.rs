use crate::error::{classify_upstream_error, map_route_error, ProxyError};
use crate::events::ProxyType;
use crate::matcher::extract_account_from_headers;
use crate::proxy::capture::{headers_wire_len, serialize_headers, CaptureBuffer, ObservedBody};
use crate::proxy::lifecycle::RequestLifecycle;
use crate::proxy::{
    empty_body, proxy_error_response, strip_hop_by_hop, strip_identity_headers, BoxBody,
    ProxyShared,
};
use crate::route::EmptyAccountBehavior;
use http::{Request, Response, StatusCode, Uri};
use http_body_util::BodyExt;
use hyper::body::{Body, Incoming};
use hyper_util::rt::TokioIo;
use percent_encoding::percent_decode_str;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// The decoded reverse-proxy target:
/// `/<token>/<platform[:account]>/<protocol>/<host>[/<escapedPath>]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedPath {
    pub platform_name: String,
    pub account: String,
    pub protocol: String,
    pub host: String,
    /// Remainder kept escaped so `%2F` survives to the upstream.
    pub escaped_path: String,
}

fn decode_segment(seg: &str) -> Result<String, ProxyError> {
    percent_decode_str(seg)
        .decode_utf8()
        .map(|s| s.into_owned())
        .map_err(|_| ProxyError::UrlParseError)
}

fn validate_host(host: &str) -> bool {
    if host.is_empty()
        || host.chars().any(|c| c.is_whitespace())
        || host.contains('@')
        || host.contains('/')
    {
        return false;
    }
    // IPv6 literals must be bracketed; a bare multi-colon host is ambiguous.
    if !host.starts_with('[') && host.bytes().filter(|&b| b == b':').count() > 1 {
        return false;
    }
    match format!("http://{host}/").parse::<Uri>() {
        Ok(uri) => uri.host().map(|h| !h.is_empty()).unwrap_or(false),
        Err(_) => false,
    }
}

/// Parse the escaped request path against the reverse-proxy grammar. The
/// token check runs on the decoded first segment; an empty configured token
/// disables it.
pub fn parse_reverse_path(
    escaped_path: &str,
    token: &str,
    enforce_account_format: bool,
) -> Result<ParsedPath, ProxyError> {
    let trimmed = escaped_path.strip_prefix('/').unwrap_or(escaped_path);
    if trimmed.is_empty() {
        return Err(ProxyError::AuthFailed);
    }

    let mut segments = trimmed.splitn(5, '/');
    let token_seg = segments.next().unwrap_or("");
    let ident_seg = segments.next();
    let proto_seg = segments.next();
    let host_seg = segments.next();
    let rest = segments.next();

    if !token.is_empty() && decode_segment(token_seg)? != token {
        return Err(ProxyError::AuthFailed);
    }

    let (Some(ident_seg), Some(proto_seg), Some(host_seg)) = (ident_seg, proto_seg, host_seg)
    else {
        return Err(ProxyError::UrlParseError);
    };

    let ident = decode_segment(ident_seg)?;
    let (platform_name, account) = match ident.split_once(':') {
        Some((p, a)) => (p.to_string(), a.to_string()),
        None if enforce_account_format => return Err(ProxyError::UrlParseError),
        None => (ident, String::new()),
    };

    let protocol = decode_segment(proto_seg)?.to_ascii_lowercase();
    if protocol != "http" && protocol != "https" {
        return Err(ProxyError::InvalidProtocol);
    }

    let host = decode_segment(host_seg)?;
    if !validate_host(&host) {
        return Err(ProxyError::InvalidHost);
    }

    let escaped_path = match rest {
        Some(r) => format!("/{r}"),
        None => String::new(),
    };

    Ok(ParsedPath {
        platform_name,
        account,
        protocol,
        host,
        escaped_path,
    })
}

/// Reverse-proxy entry point.
pub async fn handle_reverse(
    shared: ProxyShared,
    mut req: Request<Incoming>,
    peer: SocketAddr,
) -> Result<Response<BoxBody>, hyper::Error> {
    let cfg = shared.config.load();
    let parsed = match parse_reverse_path(
        req.uri().path(),
        &cfg.proxy.reverse_token,
        cfg.proxy.enforce_account_format,
    ) {
        Ok(p) => p,
        // Parse and token failures never reach telemetry.
        Err(e) => return Ok(proxy_error_response(e)),
    };
    let upstream_timeout = Duration::from_secs_f64(cfg.proxy.upstream_timeout_secs);
    drop(cfg);

    let lifecycle = RequestLifecycle::new(
        shared.emitter.clone(),
        ProxyType::Reverse,
        false,
        req.method().as_str(),
        &peer.ip().to_string(),
    );

    // Capture configuration is decided once, at request start.
    let detail = shared.emitter.detail_config(ProxyType::Reverse);
    if let Some(limits) = detail {
        let wire = serialize_headers(req.headers());
        lifecycle
            .set_req_headers_capture(CaptureBuffer::from_bytes(limits.req_headers, &wire).take());
    }

    // Resolve the account: explicit path account, else matcher-driven header
    // extraction, else the platform's empty-account policy.
    let mut account = parsed.account.clone();
    if account.is_empty() {
        let matcher = shared.matcher.current();
        let decoded_path = percent_decode_str(&parsed.escaped_path)
            .decode_utf8()
            .map(|s| s.into_owned())
            .unwrap_or_else(|_| parsed.escaped_path.clone());
        if let Some(header_names) = matcher.match_headers(&parsed.host, &decoded_path) {
            account = extract_account_from_headers(req.headers(), &header_names);
        }
        if account.is_empty() {
            match shared.platforms.empty_account_behavior(&parsed.platform_name) {
                None => {
                    lifecycle.set_status(404);
                    lifecycle.finish();
                    return Ok(proxy_error_response(ProxyError::PlatformNotFound));
                }
                Some(EmptyAccountBehavior::Reject) => {
                    debug!(
                        "reverse: empty account rejected, platform={}, host={}",
                        parsed.platform_name, parsed.host
                    );
                    lifecycle.set_status(403);
                    lifecycle.finish();
                    return Ok(proxy_error_response(ProxyError::AccountRejected));
                }
                Some(EmptyAccountBehavior::Random) => {}
            }
        }
    }
    lifecycle.set_account(&account);

    let (route, outbound) =
        match shared
            .router
            .route(&parsed.platform_name, &account, &parsed.host)
        {
            Ok(r) => r,
            Err(e) => {
                let err = map_route_error(&e);
                debug!(
                    "reverse: routing failed, platform={}, error={}",
                    parsed.platform_name, e
                );
                lifecycle.set_status(err.http_code().as_u16());
                lifecycle.finish();
                return Ok(proxy_error_response(err));
            }
        };
    lifecycle.set_route(route.clone());

    // Nil-latency ping: the node's decay state advances even if this request
    // goes on to fail.
    {
        let health = shared.health.clone();
        let node = route.node_hash;
        let domain = parsed.host.clone();
        tokio::spawn(async move {
            health.record_latency(node, &domain, None);
        });
    }

    let query = req
        .uri()
        .query()
        .map(|q| format!("?{q}"))
        .unwrap_or_default();
    let target_url = format!(
        "{}://{}{}{}",
        parsed.protocol, parsed.host, parsed.escaped_path, query
    );
    let out_uri: Uri = match target_url.parse() {
        Ok(u) => u,
        Err(_) => {
            lifecycle.set_status(400);
            lifecycle.finish();
            return Ok(proxy_error_response(ProxyError::UrlParseError));
        }
    };
    lifecycle.set_target(&parsed.host, &target_url);

    let client = shared.pool.get(
        route.node_hash,
        outbound,
        Some(shared.sink.clone()),
        Some(shared.health.clone()),
    );

    // The client must upgrade through us for 101 responses; take the handle
    // before the request is consumed.
    let client_upgrade = hyper::upgrade::on(&mut req);

    let (parts, body) = req.into_parts();
    let mut headers = parts.headers.clone();
    strip_hop_by_hop(&mut headers);
    strip_identity_headers(&mut headers);
    // The upstream Host comes from the target URL, not the proxy's own.
    headers.remove(http::header::HOST);
    lifecycle.add_egress(headers_wire_len(&headers));

    let req_body_capture = match detail {
        Some(limits) if !body.is_end_stream() => {
            let buf = CaptureBuffer::new(limits.req_body);
            lifecycle.set_req_body_capture(buf.clone());
            Some(buf)
        }
        _ => None,
    };
    let out_body = ObservedBody::new(
        body.boxed(),
        Some(lifecycle.egress_counter()),
        req_body_capture,
        None,
    );

    let mut builder = Request::builder()
        .method(parts.method.clone())
        .uri(out_uri.clone());
    for (name, value) in &headers {
        builder = builder.header(name, value);
    }
    let upstream_req = match builder.body(out_body.boxed()) {
        Ok(r) => r,
        Err(e) => {
            warn!("reverse: failed to build upstream request, error={}", e);
            lifecycle.set_status(500);
            lifecycle.finish();
            return Ok(proxy_error_response(ProxyError::Internal));
        }
    };

    let resp = match tokio::time::timeout(upstream_timeout, client.request(upstream_req)).await {
        Ok(Ok(resp)) => resp,
        Ok(Err(e)) => {
            let err =
                classify_upstream_error(&e, false).unwrap_or(ProxyError::UpstreamRequestFailed);
            warn!(
                "reverse: upstream request failed, target={}, node={}, error={}",
                target_url, route.node_tag, e
            );
            lifecycle.set_net_ok(false);
            lifecycle.set_status(err.http_code().as_u16());
            let health = shared.health.clone();
            let node = route.node_hash;
            tokio::spawn(async move {
                health.record_failure(node);
            });
            lifecycle.finish();
            return Ok(proxy_error_response(err));
        }
        Err(_) => {
            warn!(
                "reverse: upstream timed out, target={}, node={}",
                target_url, route.node_tag
            );
            lifecycle.set_net_ok(false);
            lifecycle.set_status(504);
            let health = shared.health.clone();
            let node = route.node_hash;
            tokio::spawn(async move {
                health.record_failure(node);
            });
            lifecycle.finish();
            return Ok(proxy_error_response(ProxyError::UpstreamTimeout));
        }
    };

    let status = resp.status();
    lifecycle.set_status(status.as_u16());
    lifecycle.add_ingress(headers_wire_len(resp.headers()));

    // Node success is attributed once, at headers-received; a later
    // mid-stream failure is not re-counted against the node.
    lifecycle.set_net_ok(true);
    {
        let health = shared.health.clone();
        let node = route.node_hash;
        tokio::spawn(async move {
            health.record_success(node);
        });
    }
    // Plain-HTTP upstreams have no handshake to observe; fall back to
    // first-response-byte latency.
    if parsed.protocol == "http" {
        let health = shared.health.clone();
        let node = route.node_hash;
        let domain = parsed.host.clone();
        let elapsed = lifecycle.started().elapsed();
        tokio::spawn(async move {
            health.record_latency(node, &domain, Some(elapsed));
        });
    }

    if let Some(limits) = detail {
        let wire = serialize_headers(resp.headers());
        lifecycle.set_resp_headers_capture(
            CaptureBuffer::from_bytes(limits.resp_headers, &wire).take(),
        );
    }

    if status == StatusCode::SWITCHING_PROTOCOLS {
        return Ok(handle_upgrade(lifecycle, client_upgrade, resp));
    }

    let (resp_parts, resp_body) = resp.into_parts();
    let mut resp_headers = resp_parts.headers.clone();
    strip_hop_by_hop(&mut resp_headers);

    let resp_body_capture = match detail {
        Some(limits) => {
            let buf = CaptureBuffer::new(limits.resp_body);
            lifecycle.set_resp_body_capture(buf.clone());
            Some(buf)
        }
        None => None,
    };

    let hook_lifecycle = lifecycle.clone();
    let observed = ObservedBody::new(
        resp_body.boxed(),
        Some(lifecycle.ingress_counter()),
        resp_body_capture,
        Some(Box::new(move |_end| {
            hook_lifecycle.finish();
        })),
    );

    let mut builder = Response::builder().status(resp_parts.status);
    for (name, value) in &resp_headers {
        builder = builder.header(name, value);
    }
    Ok(builder.body(observed.boxed()).unwrap())
}

/// Bridge a `101 Switching Protocols` response: hand the 101 (headers
/// intact — `Connection`/`Upgrade` are load-bearing here) back to the
/// client, then splice the two upgraded streams with read-write byte
/// accounting on the upstream side.
fn handle_upgrade(
    lifecycle: Arc<RequestLifecycle>,
    client_upgrade: hyper::upgrade::OnUpgrade,
    resp: Response<Incoming>,
) -> Response<BoxBody> {
    let mut client_resp = Response::builder().status(StatusCode::SWITCHING_PROTOCOLS);
    for (name, value) in resp.headers() {
        client_resp = client_resp.header(name, value);
    }

    let upstream_upgrade = hyper::upgrade::on(resp);
    tokio::spawn(async move {
        let (client_io, upstream_io) =
            match tokio::try_join!(client_upgrade, upstream_upgrade) {
                Ok(pair) => pair,
                Err(e) => {
                    debug!("reverse: upgrade bridge failed, error={}", e);
                    lifecycle.finish();
                    return;
                }
            };

        let mut client_io = TokioIo::new(client_io);
        // Upstream side: reads are upstream→client (ingress), writes
        // client→upstream (egress).
        let mut upstream_io = crate::proxy::capture::TallyStream::new(
            TokioIo::new(upstream_io),
            lifecycle.ingress_counter(),
            lifecycle.egress_counter(),
        );

        if let Err(e) = tokio::io::copy_bidirectional(&mut client_io, &mut upstream_io).await {
            if !crate::error::is_benign_close(&e) {
                debug!("reverse: upgrade tunnel ended, error={}", e);
            }
        }
        lifecycle.finish();
    });

    client_resp.body(empty_body()).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_path() {
        let p = parse_reverse_path(
            "/tok/plat:acct/https/example.com/v1/items",
            "tok",
            false,
        )
        .unwrap();
        assert_eq!(
            p,
            ParsedPath {
                platform_name: "plat".into(),
                account: "acct".into(),
                protocol: "https".into(),
                host: "example.com".into(),
                escaped_path: "/v1/items".into(),
            }
        );
    }

    #[test]
    fn test_parse_preserves_escaped_path() {
        let p = parse_reverse_path(
            "/tok/plat:acct/http/example.com/a%2Fb/c",
            "tok",
            false,
        )
        .unwrap();
        assert_eq!(p.escaped_path, "/a%2Fb/c");
    }

    #[test]
    fn test_parse_empty_path_is_auth_failed() {
        assert_eq!(
            parse_reverse_path("/", "tok", false),
            Err(ProxyError::AuthFailed)
        );
        assert_eq!(
            parse_reverse_path("", "tok", false),
            Err(ProxyError::AuthFailed)
        );
    }

    #[test]
    fn test_parse_token_mismatch() {
        assert_eq!(
            parse_reverse_path("/wrong/p:a/http/example.com", "tok", false),
            Err(ProxyError::AuthFailed)
        );
        // Token compared after unescape.
        assert!(parse_reverse_path("/t%6Fk/p:a/http/example.com", "tok", false).is_ok());
    }

    #[test]
    fn test_parse_empty_token_disables_check() {
        assert!(parse_reverse_path("/anything/p:a/http/example.com", "", false).is_ok());
    }

    #[test]
    fn test_parse_missing_segments() {
        assert_eq!(
            parse_reverse_path("/tok/p:a/http", "tok", false),
            Err(ProxyError::UrlParseError)
        );
        assert_eq!(
            parse_reverse_path("/tok", "tok", false),
            Err(ProxyError::UrlParseError)
        );
    }

    #[test]
    fn test_parse_identity_format() {
        let p = parse_reverse_path("/tok/plat/http/example.com", "tok", false).unwrap();
        assert_eq!(p.platform_name, "plat");
        assert_eq!(p.account, "");

        assert_eq!(
            parse_reverse_path("/tok/plat/http/example.com", "tok", true),
            Err(ProxyError::UrlParseError)
        );

        // Empty platform with account separator is allowed.
        let p = parse_reverse_path("/tok/:acct/http/example.com", "tok", true).unwrap();
        assert_eq!(p.platform_name, "");
        assert_eq!(p.account, "acct");
    }

    #[test]
    fn test_parse_protocol() {
        assert!(parse_reverse_path("/tok/p:a/HTTPS/example.com", "tok", false).is_ok());
        assert_eq!(
            parse_reverse_path("/tok/p:a/ftp/example.com", "tok", false),
            Err(ProxyError::InvalidProtocol)
        );
    }

    #[test]
    fn test_parse_invalid_hosts() {
        for host in [
            "",
            "bad%20host",
            "user%40example.com",
            "%3A%3A1",    // unbracketed IPv6
            "a%2Fb",      // decoded slash
        ] {
            let path = format!("/tok/p:a/http/{host}");
            let got = parse_reverse_path(&path, "tok", false);
            assert!(
                matches!(got, Err(ProxyError::InvalidHost) | Err(ProxyError::UrlParseError)),
                "host {host:?} gave {got:?}"
            );
        }
    }

    #[test]
    fn test_parse_valid_hosts() {
        for host in ["example.com", "example.com:8443", "192.168.0.1:80", "%5B%3A%3A1%5D:443"] {
            let path = format!("/tok/p:a/https/{host}");
            assert!(
                parse_reverse_path(&path, "tok", false).is_ok(),
                "host {host:?} rejected"
            );
        }
    }

    #[test]
    fn test_validate_host_rules() {
        assert!(validate_host("example.com"));
        assert!(validate_host("example.com:443"));
        assert!(validate_host("[::1]:443"));
        assert!(!validate_host("::1"));
        assert!(!validate_host("a b"));
        assert!(!validate_host("user@host"));
        assert!(!validate_host(""));
    }
}
