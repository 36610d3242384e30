//! realm-gate server binary.
//!
//! Loads configuration, registers the built-in handlers and serves until
//! interrupted.

use realm_gate::dispatch::HandlerCatalog;
use realm_gate::handlers::BuiltinHandlers;
use realm_gate::session::{AuditLog, ObserverSet};
use realm_gate::{Config, Server};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let workers = config
        .workers
        .unwrap_or_else(|| std::thread::available_parallelism().map_or(1, |n| n.get()));

    info!(
        listen = %config.listen,
        workers,
        max_connections = config.max_connections,
        buffer_size = config.buffer_size,
        idle_timeout_secs = config.idle_timeout.map(|d| d.as_secs()),
        "Starting realm-gate server"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(workers)
        .thread_name("realm-gate-worker")
        .enable_all()
        .build()?;

    runtime.block_on(serve(config))
}

async fn serve(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let mut catalog = HandlerCatalog::new();
    catalog.with_provider(&BuiltinHandlers::new(config.encoding.clone()));

    let observer = ObserverSet::new().with(Arc::new(AuditLog));
    let server = Server::new(&config, catalog, Arc::new(observer));
    server.start().await?;

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");

    server.stop().await;
    let stats = server.stats();
    info!(
        accepted = stats.connections_accepted,
        packets_in = stats.packets_in,
        packets_out = stats.packets_out,
        bytes_in = stats.bytes_in,
        bytes_out = stats.bytes_out,
        handler_faults = stats.handler_faults,
        dropped = stats.packets_dropped,
        pool_fallbacks = server.context().pool().fallbacks(),
        "Final traffic counters"
    );
    Ok(())
}
