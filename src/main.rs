#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use anyhow::Result;
use clap::Parser;
use resin::server;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "resin", about = "Dual-mode HTTP proxy over a pooled outbound layer")]
struct Cli {
    /// Path to the proxy config file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Forward-proxy listen address
    #[arg(short, long, default_value = "0.0.0.0:8080")]
    listen: String,

    /// Reverse-proxy listen address
    #[arg(short, long, default_value = "0.0.0.0:8081")]
    reverse_listen: String,

    /// Admin API listen address (health/metrics/realtime)
    #[arg(long, default_value = "0.0.0.0:9091")]
    admin_listen: String,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let worker_threads = server::runtime::worker_threads();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(worker_threads)
        .enable_all()
        .build()?;

    rt.block_on(server::bootstrap::run(server::bootstrap::BootstrapArgs {
        config_path: cli.config,
        listen: cli.listen,
        reverse_listen: cli.reverse_listen,
        admin_listen: cli.admin_listen,
    }))
}
