use super::ResinState;
use crate::proxy::{full_body, BoxBody};
use hyper::body::Incoming;
use hyper::{Request, Response};

fn json_response(body: String) -> Response<BoxBody> {
    Response::builder()
        .status(200)
        .header("content-type", "application/json")
        .body(full_body(body))
        .unwrap()
}

/// Parse `?from=..&to=..` (unix seconds). Defaults to the last 15 minutes.
fn parse_range(query: Option<&str>) -> (i64, i64) {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    let mut from = now - 900;
    let mut to = now;
    if let Some(q) = query {
        for pair in q.split('&') {
            let mut kv = pair.splitn(2, '=');
            match (kv.next(), kv.next().and_then(|v| v.parse::<i64>().ok())) {
                (Some("from"), Some(v)) => from = v,
                (Some("to"), Some(v)) => to = v,
                _ => {}
            }
        }
    }
    (from, to)
}

pub fn handle_admin(
    req: Request<Incoming>,
    state: ResinState,
) -> Result<Response<BoxBody>, hyper::Error> {
    match req.uri().path() {
        "/health" | "/healthz" => Ok(json_response(r#"{"status":"ok"}"#.to_string())),

        "/ready" | "/readyz" => {
            let cfg = state.config.load();
            Ok(json_response(format!(
                r#"{{"status":"ready","platforms":{},"pending_persist_tasks":{}}}"#,
                cfg.platforms.len(),
                state.manager.pending_len(),
            )))
        }

        "/metrics" => {
            metrics::gauge!("resin_pending_persist_tasks")
                .set(state.manager.pending_len() as f64);
            let body = state.metrics.render();
            Ok(Response::builder()
                .status(200)
                .header("content-type", "text/plain; version=0.0.4; charset=utf-8")
                .body(full_body(body))
                .unwrap())
        }

        "/realtime/throughput" => {
            let (from, to) = parse_range(req.uri().query());
            let samples: Vec<serde_json::Value> = state
                .manager
                .throughput_ring()
                .query(from, to)
                .into_iter()
                .map(|(ts, s)| {
                    serde_json::json!({
                        "timestamp": ts,
                        "ingress_bps": s.ingress_bps,
                        "egress_bps": s.egress_bps,
                    })
                })
                .collect();
            Ok(json_response(
                serde_json::to_string(&samples).unwrap_or_default(),
            ))
        }

        "/realtime/connections" => {
            let (from, to) = parse_range(req.uri().query());
            let samples: Vec<serde_json::Value> = state
                .manager
                .connections_ring()
                .query(from, to)
                .into_iter()
                .map(|(ts, s)| {
                    serde_json::json!({
                        "timestamp": ts,
                        "inbound_conns": s.inbound_conns,
                        "outbound_conns": s.outbound_conns,
                    })
                })
                .collect();
            Ok(json_response(
                serde_json::to_string(&samples).unwrap_or_default(),
            ))
        }

        "/realtime/leases" => {
            let (from, to) = parse_range(req.uri().query());
            let samples: Vec<serde_json::Value> = state
                .manager
                .leases_ring()
                .query(from, to)
                .into_iter()
                .map(|(ts, s)| {
                    serde_json::json!({
                        "timestamp": ts,
                        "leases_by_platform": s.by_platform,
                    })
                })
                .collect();
            Ok(json_response(
                serde_json::to_string(&samples).unwrap_or_default(),
            ))
        }

        _ => Ok(Response::builder()
            .status(404)
            .body(full_body(r#"{"error":"not found"}"#))
            .unwrap()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_range_defaults() {
        let (from, to) = parse_range(None);
        assert_eq!(to - from, 900);
    }

    #[test]
    fn test_parse_range_explicit() {
        let (from, to) = parse_range(Some("from=100&to=200"));
        assert_eq!((from, to), (100, 200));
    }

    #[test]
    fn test_parse_range_partial() {
        let (_, to) = parse_range(Some("to=500"));
        assert_eq!(to, 500);
        let (from, _) = parse_range(Some("from=abc&from=50"));
        assert_eq!(from, 50);
    }
}
