//! proxrepl engine daemon
//!
//! Startup order: logging, configuration, database + migrations, config
//! defaults, SSH identity, crash recovery, scheduler. Process exit is the
//! universal cancellation for in-flight pipelines; abandoned runs are
//! cleaned on the next start.

use proxrepl_engine::config::EngineConfig;
use proxrepl_engine::db::{settings, Database};
use proxrepl_engine::logging::LoggingConfig;
use proxrepl_engine::scheduler::{Scheduler, CRASH_RECOVERY_HORIZON_SECS};
use proxrepl_engine::AppState;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _log_guard = LoggingConfig::init_from_env();

    let config = EngineConfig::from_env();
    config.ensure_dirs().await?;
    info!("proxrepl engine starting (data dir: {})", config.data_dir.display());

    let database = Database::new(&config.database_url).await?;
    database.migrate().await?;
    settings::init_defaults(database.pool()).await?;

    let state = AppState::new(config, database);

    // The control plane's own SSH identity, generated on first start
    match state
        .executor
        .ensure_keypair(&state.config.ssh_key_path)
        .await
    {
        Ok(_) => info!("SSH identity ready at {}", state.config.ssh_key_path.display()),
        Err(e) => error!("SSH identity unavailable: {}", e),
    }

    // Runs left in a transient state by a previous crash
    Scheduler::recover_abandoned(&state.database, CRASH_RECOVERY_HORIZON_SECS).await?;

    let scheduler = state.scheduler();
    let scheduler_handle = scheduler.spawn();

    info!("proxrepl engine running");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    scheduler_handle.abort();
    state.database.close().await;

    info!("proxrepl engine stopped");
    Ok(())
}
