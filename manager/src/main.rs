use anyhow::Result;
use std::sync::Arc;
use tokio::sync::{oneshot, Mutex};
use tokio::time;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use locker_manager::config::ConfigManager;
use locker_manager::constants::shutdown as shutdown_constants;
use locker_manager::installer::Installer;
use locker_manager::registry::Registry;
use locker_manager::shutdown::ShutdownCoordinator;
use locker_manager::supervisor::ProcessSupervisor;
use locker_manager::web::{start_web_server, AppState};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging with reduced verbosity
    let env_filter = EnvFilter::from_default_env()
        .add_directive("locker_manager=info".parse()?)
        .add_directive("lockerd=info".parse()?)
        .add_directive("tower_http=warn".parse()?)
        .add_directive("hyper=warn".parse()?);

    fmt().with_env_filter(env_filter).init();

    info!("Starting locker service manager");

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config/lockerd.toml".to_string());
    let config_manager = ConfigManager::load(&config_path).await?;
    let config = config_manager.current();

    // Catalog what is available on disk, then what is installed
    let mut registry = Registry::new(config.me_dir());
    for dir in config.service_dir_paths() {
        registry.scan_directory(&dir).await;
    }
    registry.load_installed().await?;
    info!(
        "Registry loaded: {} available, {} installed",
        registry.available.len(),
        registry.installed.len()
    );
    let registry = Arc::new(Mutex::new(registry));

    let shutdown = Arc::new(ShutdownCoordinator::new());
    let supervisor = Arc::new(ProcessSupervisor::new(
        registry.clone(),
        config.clone(),
        shutdown.clone(),
    ));
    let installer = Arc::new(Installer::new(registry.clone(), config.clone()));

    let state = AppState::new(config.clone(), registry.clone(), installer, supervisor);
    tokio::spawn(async move {
        if let Err(e) = start_web_server(state).await {
            error!("Web server error: {}", e);
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, stopping services");

    let (notify, barrier) = oneshot::channel();
    shutdown.begin(&registry, notify).await;
    match time::timeout(shutdown_constants::DRAIN_TIMEOUT, barrier).await {
        Ok(_) => info!("All services stopped"),
        Err(_) => warn!("Timed out waiting for services to stop"),
    }

    Ok(())
}
