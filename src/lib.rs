// modules
pub mod db;
pub mod logger;
pub mod mcp;
pub mod monitor;
pub mod proxy;
pub mod settings;
pub mod state;

use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;

use db::MainStore;
use monitor::{HealthMonitor, StartupSynchronizer};
use settings::Settings;
use state::AppState;

/// Starts the proxy: logger, store, background tasks, HTTP server. Returns
/// when the server has drained after a shutdown signal.
pub async fn run() -> anyhow::Result<()> {
    let settings = Settings::from_env();
    logger::setup_logger(settings.log_dir.as_deref()).context("logger setup failed")?;
    log::info!("one-mcp {} starting", env!("CARGO_PKG_VERSION"));

    let store = MainStore::new(&settings.db_path)
        .map_err(|e| anyhow::anyhow!("failed to open store at {}: {}", settings.db_path, e))?;
    let state = AppState::new(settings, store);
    let ct = state.shutdown.clone();

    // Background tasks: stat drainer, health monitor, startup synchronizer.
    let drainer = tokio::spawn(state.meter.clone().run_drainer(ct.clone()));
    let monitor = tokio::spawn(Arc::new(HealthMonitor::new(state.clone())).run(ct.clone()));
    let synchronizer =
        tokio::spawn(Arc::new(StartupSynchronizer::new(state.clone())).run(ct.clone()));

    let app = proxy::router::routes(state.clone());
    let listener = TcpListener::bind(&state.settings.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", state.settings.bind_addr))?;
    log::info!("Listening on http://{}", listener.local_addr()?);

    // Ctrl-c cancels the root token; the server drains, the tasks stop.
    {
        let ct = ct.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                log::info!("Shutdown signal received");
                ct.cancel();
            }
        });
    }

    axum::serve(listener, app)
        .with_graceful_shutdown(ct.clone().cancelled_owned())
        .await
        .context("server error")?;

    ct.cancel();
    let _ = tokio::join!(drainer, monitor, synchronizer);
    log::info!("one-mcp stopped");
    Ok(())
}
