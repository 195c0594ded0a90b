use crate::error::{
    classify_connect_error, classify_upstream_error, map_route_error, ProxyError,
};
use crate::events::{ConnEvent, Direction, ProxyType};
use crate::proxy::capture::{headers_wire_len, BodyEnd, ObservedBody, TallyStream};
use crate::proxy::lifecycle::RequestLifecycle;
use crate::proxy::{empty_body, proxy_error_response, strip_hop_by_hop, BoxBody, ProxyShared};
use crate::route::{HealthRecorder, RouteResult};
use crate::transport::counting::{CountedStream, TlsLatencyObserver};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use http::header::PROXY_AUTHORIZATION;
use http::{HeaderMap, Method, Request, Response, StatusCode, Uri};
use hyper::body::Incoming;
use hyper_util::rt::TokioIo;
use http_body_util::BodyExt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Credentials carried in `Proxy-Authorization: Basic base64(user:pass)`,
/// where `pass = platform[":"account]`.
#[derive(Debug, PartialEq, Eq)]
pub struct ProxyCredentials {
    pub platform: String,
    pub account: String,
}

/// Parse and verify forward-proxy authentication. An empty configured token
/// disables the user check. Failures are silent for telemetry.
pub fn parse_proxy_auth(
    headers: &HeaderMap,
    token: &str,
) -> Result<ProxyCredentials, ProxyError> {
    let raw = headers
        .get(PROXY_AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or(ProxyError::AuthRequired)?;

    let mut parts = raw.splitn(2, ' ');
    let scheme = parts.next().unwrap_or("");
    let payload = parts.next().unwrap_or("").trim();
    if !scheme.eq_ignore_ascii_case("basic") || payload.is_empty() {
        return Err(ProxyError::AuthRequired);
    }

    let decoded = BASE64
        .decode(payload)
        .map_err(|_| ProxyError::AuthRequired)?;
    let decoded = String::from_utf8(decoded).map_err(|_| ProxyError::AuthRequired)?;
    let (user, pass) = decoded.split_once(':').ok_or(ProxyError::AuthRequired)?;

    if !token.is_empty() && user != token {
        return Err(ProxyError::AuthFailed);
    }

    let (platform, account) = match pass.split_once(':') {
        Some((p, a)) => (p, a),
        None => (pass, ""),
    };
    Ok(ProxyCredentials {
        platform: platform.to_string(),
        account: account.to_string(),
    })
}

/// Forward-proxy entry point: authenticate, then dispatch CONNECT vs HTTP.
pub async fn handle_forward(
    shared: ProxyShared,
    req: Request<Incoming>,
    peer: SocketAddr,
) -> Result<Response<BoxBody>, hyper::Error> {
    let cfg = shared.config.load();
    let creds = match parse_proxy_auth(req.headers(), &cfg.proxy.token) {
        Ok(c) => c,
        // Auth failures never reach telemetry.
        Err(e) => return Ok(proxy_error_response(e)),
    };
    drop(cfg);

    if req.method() == Method::CONNECT {
        handle_connect(shared, req, peer, creds).await
    } else {
        handle_http(shared, req, peer, creds).await
    }
}

fn record_failure_async(health: &Arc<dyn HealthRecorder>, route: &RouteResult) {
    let health = health.clone();
    let node = route.node_hash;
    tokio::spawn(async move {
        health.record_failure(node);
    });
}

fn record_success_async(health: &Arc<dyn HealthRecorder>, route: &RouteResult) {
    let health = health.clone();
    let node = route.node_hash;
    tokio::spawn(async move {
        health.record_success(node);
    });
}

async fn handle_http(
    shared: ProxyShared,
    req: Request<Incoming>,
    peer: SocketAddr,
    creds: ProxyCredentials,
) -> Result<Response<BoxBody>, hyper::Error> {
    let lifecycle = RequestLifecycle::new(
        shared.emitter.clone(),
        ProxyType::Forward,
        false,
        req.method().as_str(),
        &peer.ip().to_string(),
    );
    lifecycle.set_account(&creds.account);

    // Forward proxies receive absolute-form URIs; fall back to the Host
    // header for clients that send origin-form.
    let out_uri: Uri = if req.uri().scheme().is_some() {
        req.uri().clone()
    } else {
        let host = req
            .headers()
            .get(http::header::HOST)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        let pq = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        match format!("http://{host}{pq}").parse() {
            Ok(u) => u,
            Err(_) => {
                return Ok(proxy_error_response(ProxyError::UrlParseError));
            }
        }
    };

    let target_host = out_uri.host().unwrap_or_default().to_string();
    let authority = out_uri
        .authority()
        .map(|a| a.to_string())
        .unwrap_or_default();
    lifecycle.set_target(&authority, &out_uri.to_string());

    let (route, outbound) =
        match shared
            .router
            .route(&creds.platform, &creds.account, &target_host)
        {
            Ok(r) => r,
            Err(e) => {
                let err = map_route_error(&e);
                debug!("forward: routing failed, platform={}, error={}", creds.platform, e);
                lifecycle.set_status(err.http_code().as_u16());
                lifecycle.finish();
                return Ok(proxy_error_response(err));
            }
        };
    lifecycle.set_route(route.clone());

    let client = shared.pool.get(
        route.node_hash,
        outbound,
        Some(shared.sink.clone()),
        Some(shared.health.clone()),
    );

    let (parts, body) = req.into_parts();
    let mut headers = parts.headers.clone();
    strip_hop_by_hop(&mut headers);
    lifecycle.add_egress(headers_wire_len(&headers));

    let out_body = ObservedBody::new(
        body.boxed(),
        Some(lifecycle.egress_counter()),
        None,
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
            warn!("forward: failed to build upstream request, error={}", e);
            lifecycle.set_status(500);
            lifecycle.finish();
            return Ok(proxy_error_response(ProxyError::Internal));
        }
    };

    let timeout = {
        let cfg = shared.config.load();
        Duration::from_secs_f64(cfg.proxy.upstream_timeout_secs)
    };

    let resp = match tokio::time::timeout(timeout, client.request(upstream_req)).await {
        Ok(Ok(resp)) => resp,
        Ok(Err(e)) => {
            let err =
                classify_upstream_error(&e, false).unwrap_or(ProxyError::UpstreamRequestFailed);
            warn!(
                "forward: upstream request failed, target={}, node={}, error={}",
                authority, route.node_tag, e
            );
            record_failure_async(&shared.health, &route);
            lifecycle.set_status(err.http_code().as_u16());
            lifecycle.finish();
            return Ok(proxy_error_response(err));
        }
        Err(_) => {
            warn!(
                "forward: upstream timed out, target={}, node={}",
                authority, route.node_tag
            );
            record_failure_async(&shared.health, &route);
            lifecycle.set_status(504);
            lifecycle.finish();
            return Ok(proxy_error_response(ProxyError::UpstreamTimeout));
        }
    };

    let (resp_parts, resp_body) = resp.into_parts();
    lifecycle.set_status(resp_parts.status.as_u16());

    let mut resp_headers = resp_parts.headers.clone();
    strip_hop_by_hop(&mut resp_headers);
    lifecycle.add_ingress(headers_wire_len(&resp_headers));

    // Node success is recorded only after the full body transfer; a body
    // dropped by the client is a silent close with no health update.
    let hook_lifecycle = lifecycle.clone();
    let hook_health = shared.health.clone();
    let hook_route = route.clone();
    let observed = ObservedBody::new(
        resp_body.boxed(),
        Some(lifecycle.ingress_counter()),
        None,
        Some(Box::new(move |end| {
            match end {
                BodyEnd::Complete => {
                    hook_lifecycle.set_net_ok(true);
                    record_success_async(&hook_health, &hook_route);
                }
                BodyEnd::Error => {
                    hook_lifecycle.set_net_ok(false);
                    record_failure_async(&hook_health, &hook_route);
                }
                BodyEnd::Dropped => {
                    hook_lifecycle.set_net_ok(true);
                }
            }
            hook_lifecycle.finish();
        })),
    );

    let mut builder = Response::builder().status(resp_parts.status);
    for (name, value) in &resp_headers {
        builder = builder.header(name, value);
    }
    Ok(builder.body(observed.boxed()).unwrap())
}

fn connect_dial_address(uri: &Uri) -> Option<(String, String)> {
    let authority = uri.authority()?;
    let host = authority.host().trim_matches(|c| c == '[' || c == ']');
    let port = authority.port_u16().unwrap_or(443);
    let addr = if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    };
    Some((addr, host.to_string()))
}

async fn handle_connect(
    shared: ProxyShared,
    req: Request<Incoming>,
    peer: SocketAddr,
    creds: ProxyCredentials,
) -> Result<Response<BoxBody>, hyper::Error> {
    let lifecycle = RequestLifecycle::new(
        shared.emitter.clone(),
        ProxyType::Forward,
        true,
        "CONNECT",
        &peer.ip().to_string(),
    );
    lifecycle.set_account(&creds.account);

    let Some((dial_addr, domain)) = connect_dial_address(req.uri()) else {
        // Malformed request line: parse errors stay silent.
        return Ok(proxy_error_response(ProxyError::UrlParseError));
    };
    lifecycle.set_target(&dial_addr, &dial_addr);

    let (route, outbound) = match shared.router.route(&creds.platform, &creds.account, &domain) {
        Ok(r) => r,
        Err(e) => {
            let err = map_route_error(&e);
            debug!("connect: routing failed, platform={}, error={}", creds.platform, e);
            lifecycle.set_status(err.http_code().as_u16());
            lifecycle.finish();
            return Ok(proxy_error_response(err));
        }
    };
    lifecycle.set_route(route.clone());

    let (connect_timeout, flush_threshold, flush_interval) = {
        let cfg = shared.config.load();
        (
            Duration::from_secs_f64(cfg.proxy.connect_timeout_secs),
            cfg.traffic.flush_threshold_bytes,
            Duration::from_millis(cfg.traffic.flush_interval_ms),
        )
    };

    let conn = match tokio::time::timeout(connect_timeout, outbound.dial(&dial_addr)).await {
        Ok(Ok(conn)) => conn,
        Ok(Err(e)) => {
            let err = classify_connect_error(&e, false).unwrap_or(ProxyError::UpstreamConnectFailed);
            warn!(
                "connect: dial failed, target={}, node={}, error={}",
                dial_addr, route.node_tag, e
            );
            record_failure_async(&shared.health, &route);
            lifecycle.set_status(err.http_code().as_u16());
            lifecycle.finish();
            return Ok(proxy_error_response(err));
        }
        Err(_) => {
            warn!(
                "connect: dial timed out, target={}, node={}",
                dial_addr, route.node_tag
            );
            record_failure_async(&shared.health, &route);
            lifecycle.set_status(504);
            lifecycle.finish();
            return Ok(proxy_error_response(ProxyError::UpstreamTimeout));
        }
    };

    shared
        .sink
        .on_connection_event(Direction::Outbound, ConnEvent::Open);

    // First write is the Client Hello, first read the Server Hello; the gap
    // is the node's TLS latency toward this domain.
    let health = shared.health.clone();
    let node = route.node_hash;
    let observe_domain = domain.clone();
    let observed = TlsLatencyObserver::new(
        conn,
        Box::new(move |latency| {
            health.record_latency(node, &observe_domain, Some(latency));
        }),
    );
    let counted = CountedStream::with_policy(
        observed,
        shared.sink.clone(),
        flush_threshold,
        flush_interval,
    );

    let upgrade = hyper::upgrade::on(req);
    let tunnel_lifecycle = lifecycle.clone();
    let tunnel_health = shared.health.clone();
    let tunnel_route = route.clone();

    tokio::spawn(async move {
        let upgraded = match upgrade.await {
            Ok(u) => u,
            Err(e) => {
                debug!("connect: client upgrade failed, error={}", e);
                tunnel_lifecycle.set_status(200);
                tunnel_lifecycle.set_net_ok(false);
                tunnel_lifecycle.finish();
                return;
            }
        };

        // Client-side tally: reads are client→upstream (egress), writes
        // upstream→client (ingress). Bytes pre-read past the CONNECT head
        // are already in the upgraded stream's buffer.
        let mut client_io = TallyStream::new(
            TokioIo::new(upgraded),
            tunnel_lifecycle.egress_counter(),
            tunnel_lifecycle.ingress_counter(),
        );
        let mut upstream = counted;

        if let Err(e) = tokio::io::copy_bidirectional(&mut client_io, &mut upstream).await {
            if !crate::error::is_benign_close(&e) {
                debug!("connect: tunnel copy ended, error={}", e);
            }
        }

        let egress = tunnel_lifecycle.egress_bytes();
        let ingress = tunnel_lifecycle.ingress_bytes();
        metrics::counter!("resin_tunnel_bytes_total", "direction" => "egress").increment(egress);
        metrics::counter!("resin_tunnel_bytes_total", "direction" => "ingress").increment(ingress);

        tunnel_lifecycle.set_status(200);
        if egress == 0 && ingress == 0 {
            tunnel_lifecycle.set_upstream_stage("connect_zero_traffic");
            tunnel_lifecycle.set_net_ok(false);
            record_failure_async(&tunnel_health, &tunnel_route);
        } else if egress == 0 {
            // The upstream spoke but the client never did; not the node's
            // fault.
            tunnel_lifecycle.set_upstream_stage("connect_no_egress_traffic");
            tunnel_lifecycle.set_net_ok(false);
        } else {
            tunnel_lifecycle.set_net_ok(true);
            record_success_async(&tunnel_health, &tunnel_route);
        }
        tunnel_lifecycle.finish();
    });

    let mut resp = Response::builder()
        .status(StatusCode::OK)
        .body(empty_body())
        .unwrap();
    // The wire contract is the literal "HTTP/1.1 200 Connection Established".
    resp.extensions_mut()
        .insert(hyper::ext::ReasonPhrase::from_static(
            b"Connection Established",
        ));
    Ok(resp)
}
