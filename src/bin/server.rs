//! Reference DFE service binary
//!
//! Run with: cargo run --bin dfe-server -- --help

use anyhow::Result;
use clap::Parser;
use dfe_session::server::{run_server, ServerConfig};

#[derive(Parser, Debug)]
#[command(name = "dfe-server")]
#[command(about = "Reference DFE service simulating an accelerator in host memory")]
struct Args {
    /// TCP listen address
    #[arg(long, default_value = "0.0.0.0:9090")]
    listen_addr: String,

    /// Memory pool size for remote buffers in MB
    #[arg(long, default_value = "256")]
    memory_mb: usize,

    /// LMem size per engine in MB
    #[arg(long, default_value = "64")]
    lmem_mb: usize,

    /// Number of engines that may be loaded at once
    #[arg(long, default_value = "1")]
    engines: usize,

    /// Device name matched by non-wildcard engine selectors
    #[arg(long, default_value = "local:0")]
    device_name: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Number of worker threads for connection tasks
    #[arg(long, default_value = "4")]
    worker_threads: usize,
}

async fn run_with_config(args: Args) -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&args.log_level)),
        )
        .init();

    let config = ServerConfig {
        listen_addr: args.listen_addr.clone(),
        memory_pool_size: args.memory_mb * 1024 * 1024,
        lmem_size: args.lmem_mb * 1024 * 1024,
        num_engines: args.engines,
        device_name: args.device_name.clone(),
    };

    tracing::info!("=== DFE Service Configuration ===");
    tracing::info!("Worker threads: {}", args.worker_threads);
    tracing::info!("Listen address: {}", args.listen_addr);
    tracing::info!("Memory pool: {} MB", args.memory_mb);
    tracing::info!("LMem per engine: {} MB", args.lmem_mb);
    tracing::info!("Engines: {} ({})", args.engines, args.device_name);
    tracing::info!("=================================");

    run_server(config).await
}

fn main() -> Result<()> {
    let args = Args::parse();
    let worker_threads = args.worker_threads;

    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(worker_threads)
        .enable_all()
        .build()?
        .block_on(run_with_config(args))
}
