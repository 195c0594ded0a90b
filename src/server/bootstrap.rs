use crate::config::ResinConfig;
use crate::server::{self, ListenerMode, ResinState};
use anyhow::Result;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// CLI arguments forwarded from `main()`.
pub struct BootstrapArgs {
    pub config_path: std::path::PathBuf,
    pub listen: String,
    pub reverse_listen: String,
    pub admin_listen: String,
}

/// Proxy lifecycle: init → wire state → start workers → serve → shutdown.
pub async fn run(args: BootstrapArgs) -> Result<()> {
    init_tracing();

    let config = ResinConfig::load(&args.config_path)?;
    let state = ResinState::new(config)?;

    // Metrics workers before traffic so the first bucket is aligned.
    state.manager.clone().start();

    let shutdown = Arc::new(Notify::new());

    start_admin_server(&state, &args);

    let reverse_handle = tokio::spawn({
        let listen = args.reverse_listen.clone();
        let state = state.clone();
        let shutdown = shutdown.clone();
        async move { server::run_proxy_server(&listen, ListenerMode::Reverse, state, shutdown).await }
    });

    tracing::info!(
        "server: starting resin, forward={}, reverse={}",
        args.listen,
        args.reverse_listen
    );

    let forward_handle = tokio::spawn({
        let listen = args.listen.clone();
        let state = state.clone();
        let shutdown = shutdown.clone();
        async move { server::run_proxy_server(&listen, ListenerMode::Forward, state, shutdown).await }
    });

    // Block until signal, then clean up.
    wait_for_shutdown(&shutdown).await;

    if let Err(e) = forward_handle.await {
        tracing::error!("server: forward task error: {}", e);
    }
    if let Err(e) = reverse_handle.await {
        tracing::error!("server: reverse task error: {}", e);
    }

    // Flush in-progress metrics and drain pending persistence.
    state.manager.stop().await;
    state.shared.pool.close_all();

    tracing::info!("server: shutdown complete");
    Ok(())
}

fn init_tracing() {
    let (non_blocking, _guard) = tracing_appender::non_blocking::NonBlockingBuilder::default()
        .buffered_lines_limit(128_000)
        .lossy(true)
        .finish(std::io::stdout());

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(false)
                .json(),
        )
        .init();

    std::mem::forget(_guard);
}

fn start_admin_server(state: &ResinState, args: &BootstrapArgs) {
    let s = state.clone();
    let admin_addr = args.admin_listen.clone();
    tokio::spawn(async move {
        if let Err(e) = server::run_admin_server(&admin_addr, s).await {
            tracing::error!("server: admin failed, error={}", e);
        }
    });
}

async fn wait_for_shutdown(shutdown: &Arc<Notify>) {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("server: received SIGINT, shutting down"),
        _ = terminate => tracing::info!("server: received SIGTERM, shutting down"),
    }

    shutdown.notify_waiters();
}
