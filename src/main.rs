//! Fleetwarden daemon entry point.

use std::path::PathBuf;
use std::sync::Arc;

use log::{error, info};
use tokio::sync::mpsc;
use tokio_util::task::TaskTracker;

mod chat;
mod config;
mod correlator;
mod error;
mod exclusions;
mod handler;
mod heartbeat;
mod messages;
mod notifier;
mod poller;
mod registry;
mod router;
mod runtime;
mod shutdown;
mod store;
mod updater;
mod versions;

use chat::{ChatTransport, TelegramBot};
use config::Config;
use correlator::{Correlator, CorrelatorTimings};
use exclusions::ExclusionConfig;
use handler::Handler;
use heartbeat::Heartbeat;
use notifier::run_notifier;
use poller::Poller;
use registry::{FleetRegistry, VERSION};
use router::Router;
use runtime::{ContainerRuntime, DockerRuntime};
use store::LockedStore;
use updater::{UpdateTimings, Updater};
use versions::VersionProber;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    env_logger::init();

    // Load configuration; nothing is registered without a complete identity.
    let cfg = match Config::load() {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("{:#}", e);
            return Err(e);
        }
    };
    info!(
        "Starting fleetwarden v{} on {} (primary: {})",
        VERSION,
        cfg.host_id,
        if cfg.primary_host_id.is_empty() { "none" } else { cfg.primary_host_id.as_str() }
    );
    std::fs::create_dir_all(&cfg.data_dir)?;

    let token = shutdown::install_shutdown_handler();

    // Shared documents
    let store = |path: PathBuf| LockedStore::new(path).with_lock_timeout(cfg.lock_timeout());
    let exclusions = ExclusionConfig::new(store(cfg.exclusions_path()), &cfg.host_id);
    let registry = FleetRegistry::new(
        store(cfg.registry_path()),
        &cfg.host_id,
        &cfg.primary_host_id,
        cfg.liveness_timeout(),
    );

    // Container Runtime (Docker)
    let runtime: Arc<dyn ContainerRuntime> = Arc::new(DockerRuntime::connect()?);
    let versions = Arc::new(VersionProber::new(&cfg.version_probes)?);
    let updater = Arc::new(Updater::new(
        Arc::clone(&runtime),
        Arc::clone(&versions),
        UpdateTimings::from_config(&cfg),
    ));

    // Chat transport
    let chat: Arc<dyn ChatTransport> =
        Arc::new(TelegramBot::new(&cfg.api_base, &cfg.bot_token, &cfg.chat_id)?);

    let heartbeat = Heartbeat::new(
        registry.clone(),
        Arc::clone(&runtime),
        exclusions.clone(),
        cfg.ignored_containers.clone(),
        cfg.heartbeat_interval(),
    );
    registry.register(heartbeat.workload_count().await).await;
    chat.send_message(&messages::startup(&cfg.host_id, cfg.is_primary()), None)
        .await;

    let tasks = TaskTracker::new();

    // Heartbeat ticker
    let heartbeat_token = token.clone();
    tasks.spawn(async move { heartbeat.run(heartbeat_token).await });

    // Chat poller
    let handler = Arc::new(Handler::new(
        &cfg.host_id,
        Arc::clone(&chat),
        Arc::clone(&runtime),
        exclusions.clone(),
        updater,
        cfg.ignored_containers.clone(),
        tasks.clone(),
    ));
    let poller = Poller::new(
        Arc::clone(&chat),
        handler,
        registry.clone(),
        Router::new(&cfg.host_id, &cfg.primary_host_id),
        cfg.chat_id.clone(),
    );
    tasks.spawn(poller.run(token.clone()));

    // Notice channel
    let (notice_tx, notice_rx) = mpsc::channel(128);
    let notifier = tokio::spawn(run_notifier(cfg.host_id.clone(), Arc::clone(&chat), notice_rx));

    // Log correlator on the main task until shutdown
    let correlator = Correlator::new(
        Arc::clone(&runtime),
        exclusions,
        versions,
        cfg.ignored_containers.clone(),
        CorrelatorTimings::from_config(&cfg),
        notice_tx,
    );
    correlator.run(cfg.watcher_container.clone(), token).await;

    // Graceful Shutdown
    info!("Waiting for running tasks to finish...");
    tasks.close();
    tasks.wait().await;
    if let Err(e) = notifier.await {
        error!("Notifier task failed: {}", e);
    }

    chat.send_message(&messages::shutdown(&cfg.host_id), None).await;
    info!("Shutdown complete.");
    Ok(())
}
