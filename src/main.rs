use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use jobserv_core::artifact_store::LocalArtifactStore;
use jobserv_core::config::Config;
use jobserv_core::http::{router, AppState};
use jobserv_core::notify::LoggingNotifier;
use jobserv_core::store::Store;
use jobserv_core::surge::SurgeMonitor;
use jobserv_core::vault::Vault;

#[derive(Parser)]
#[command(author, version, about = "JobServ scheduling core")]
struct Args {
    /// Path to the TOML config file (database_url, artifact_root, ...).
    #[arg(short, long, default_value = "jobserv.toml")]
    config: PathBuf,

    /// Address to bind the HTTP surface to.
    #[arg(long, default_value = "0.0.0.0:8080")]
    listen: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let config = Arc::new(Config::load(&args.config)?);
    let store = Store::connect(&config.database_url).await?;
    let artifacts = Arc::new(LocalArtifactStore::new(config.artifact_root.clone()));
    let notifier = Arc::new(LoggingNotifier);
    let vault = Arc::new(Vault::new(&config.vault_key));

    spawn_surge_monitor(store.clone(), notifier.clone(), config.clone());

    let state = AppState {
        store,
        artifacts,
        notifier,
        vault,
        config: config.clone(),
    };
    let app = router(state);

    log::info!("listening on {}", args.listen);
    let listener = tokio::net::TcpListener::bind(&args.listen).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

/// The surge-monitor tick (§4.7): runs on `surge_cadence_s` forever,
/// independent of the HTTP surface, exactly as `run_monitor_workers` runs
/// as its own loop in the source this is grounded on.
fn spawn_surge_monitor(store: Store, notifier: Arc<LoggingNotifier>, config: Arc<Config>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(config.surge_cadence());
        loop {
            ticker.tick().await;
            let monitor = SurgeMonitor::new(
                &store,
                notifier.as_ref(),
                config.worker_state_dir.clone(),
                config.surge_support_ratio as i64,
                config.ping_log_max_bytes,
            );
            if let Err(e) = monitor.check_workers().await {
                log::warn!("surge monitor: worker liveness pass failed: {e}");
                continue;
            }
            if let Err(e) = monitor.check_queue().await {
                log::warn!("surge monitor: queue-vs-capacity pass failed: {e}");
            }
        }
    });
}
