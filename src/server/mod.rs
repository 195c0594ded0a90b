mod admin;
pub mod bootstrap;
pub mod runtime;
mod state;

pub use state::ResinState;

use crate::events::{ConnEvent, Direction};
use crate::proxy;
use anyhow::Result;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tracing::{error, info};

/// Which data-plane handler a listener serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerMode {
    Forward,
    Reverse,
}

impl ListenerMode {
    fn as_str(&self) -> &'static str {
        match self {
            ListenerMode::Forward => "forward",
            ListenerMode::Reverse => "reverse",
        }
    }
}

/// Run a proxy listener with graceful shutdown support.
///
/// Each accepted connection is counted as an inbound connection-lifecycle
/// event for the metrics engine. When `shutdown` is notified the listener
/// stops accepting and waits up to `DRAIN_TIMEOUT` for in-flight
/// connections to finish.
pub async fn run_proxy_server(
    listen: &str,
    mode: ListenerMode,
    state: ResinState,
    shutdown: Arc<Notify>,
) -> Result<()> {
    const DRAIN_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

    let addr: SocketAddr = listen.parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!(
        "server: {} proxy listening, addr={}",
        mode.as_str(),
        addr
    );

    let active_conns = Arc::new(AtomicI64::new(0));

    loop {
        let accepted = tokio::select! {
            result = listener.accept() => result,
            _ = shutdown.notified() => {
                info!("server: {}: stop accepting, draining...", mode.as_str());
                break;
            }
        };

        let (stream, peer_addr) = match accepted {
            Ok(v) => {
                metrics::counter!(
                    "resin_connections_total",
                    "listener" => mode.as_str(),
                    "status" => "accepted",
                )
                .increment(1);
                v
            }
            Err(e) => {
                error!("server: {}: accept failed, error={}", mode.as_str(), e);
                metrics::counter!(
                    "resin_connections_total",
                    "listener" => mode.as_str(),
                    "status" => "error",
                )
                .increment(1);
                continue;
            }
        };

        metrics::gauge!("resin_connections_active", "listener" => mode.as_str()).increment(1.0);
        state
            .shared
            .sink
            .on_connection_event(Direction::Inbound, ConnEvent::Open);
        active_conns.fetch_add(1, Ordering::Relaxed);

        let state = state.clone();
        let active_conns = active_conns.clone();

        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let shared = state.shared.clone();
            let svc = service_fn(move |req: Request<Incoming>| {
                let shared = shared.clone();
                async move {
                    match mode {
                        ListenerMode::Forward => {
                            proxy::forward::handle_forward(shared, req, peer_addr).await
                        }
                        ListenerMode::Reverse => {
                            proxy::reverse::handle_reverse(shared, req, peer_addr).await
                        }
                    }
                }
            });

            if let Err(e) = auto::Builder::new(TokioExecutor::new())
                .http1()
                .keep_alive(true)
                .http2()
                .keep_alive_interval(Some(std::time::Duration::from_secs(20)))
                .serve_connection_with_upgrades(io, svc)
                .await
            {
                if !e.to_string().contains("connection closed") {
                    error!(
                        "server: {}: connection error, peer={}, error={}",
                        mode.as_str(),
                        peer_addr,
                        e
                    );
                }
            }

            metrics::gauge!("resin_connections_active", "listener" => mode.as_str())
                .decrement(1.0);
            state
                .shared
                .sink
                .on_connection_event(Direction::Inbound, ConnEvent::Close);
            active_conns.fetch_sub(1, Ordering::Relaxed);
        });
    }

    // Drain phase: wait for in-flight connections (or the timeout).
    let active = active_conns.load(Ordering::Relaxed);
    if active > 0 {
        info!(
            "server: {}: waiting for {} active connections to drain",
            mode.as_str(),
            active
        );
        let drain = async {
            while active_conns.load(Ordering::Relaxed) > 0 {
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            }
        };
        match tokio::time::timeout(DRAIN_TIMEOUT, drain).await {
            Ok(_) => info!("server: {}: all connections drained", mode.as_str()),
            Err(_) => info!(
                "server: {}: drain timeout ({}s), {} connections still active",
                mode.as_str(),
                DRAIN_TIMEOUT.as_secs(),
                active_conns.load(Ordering::Relaxed)
            ),
        }
    }

    Ok(())
}

/// Run the admin server for health, metrics, and realtime views.
pub async fn run_admin_server(listen: &str, state: ResinState) -> Result<()> {
    let addr: SocketAddr = listen.parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!("server: admin listening, addr={}", addr);

    loop {
        let (stream, _) = listener.accept().await?;
        let state = state.clone();

        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let svc = service_fn(move |req: Request<Incoming>| {
                let state = state.clone();
                async move { admin::handle_admin(req, state) }
            });

            if let Err(e) = auto::Builder::new(TokioExecutor::new())
                .http1()
                .keep_alive(true)
                .serve_connection_with_upgrades(io, svc)
                .await
            {
                if !e.to_string().contains("connection closed") {
                    error!("server: admin: connection error, error={}", e);
                }
            }
        });
    }
}
