mod alerts;
mod api;
mod app;
mod cloud;
mod codec;
mod config;
mod feeder;
mod meter;
mod registers;
mod scheduler;
mod snapshot;
mod status;
mod telemetry;
mod transform;
mod util;

use anyhow::Result;
use config::AppConfig;
use telemetry::init_tracing;
use tracing::{info, warn};

fn main() -> Result<()> {
    let cfg = AppConfig::load()?;
    init_tracing(&cfg.telemetry);

    // The worker-pool size is configuration, so the runtime is built by
    // hand instead of through the macro.
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(cfg.scheduler.workers)
        .enable_all()
        .build()?;
    runtime.block_on(run(cfg))
}

async fn run(cfg: AppConfig) -> Result<()> {
    let state = app::AppState::new(cfg.clone())?;
    state.start();

    let addr = cfg.server.socket_addr()?;
    info!(%addr, version = env!("CARGO_PKG_VERSION"), "starting meter bridge");

    let router = api::router(state.clone());
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(telemetry::shutdown_signal())
        .await?;

    state.shutdown().await;
    warn!("shutdown complete");
    Ok(())
}
