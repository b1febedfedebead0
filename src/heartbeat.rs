use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::exclusions::ExclusionConfig;
use crate::registry::FleetRegistry;
use crate::runtime::ContainerRuntime;

/// Running containers that are neither ignored nor excluded, sorted.
pub async fn monitored_running(
    runtime: &dyn ContainerRuntime,
    exclusions: &ExclusionConfig,
    ignored: &[String],
) -> anyhow::Result<Vec<String>> {
    let mut running = runtime.list_running().await?;
    running.retain(|name| !ignored.contains(name));
    running.sort();
    Ok(exclusions.monitored(running).await)
}

/// Periodically refreshes this host's registry record.
pub struct Heartbeat {
    registry: FleetRegistry,
    runtime: Arc<dyn ContainerRuntime>,
    exclusions: ExclusionConfig,
    ignored: Vec<String>,
    interval: Duration,
}

impl Heartbeat {
    pub fn new(
        registry: FleetRegistry,
        runtime: Arc<dyn ContainerRuntime>,
        exclusions: ExclusionConfig,
        ignored: Vec<String>,
        interval: Duration,
    ) -> Self {
        Self {
            registry,
            runtime,
            exclusions,
            ignored,
            interval,
        }
    }

    /// Monitored workload count; zero when the runtime cannot be reached.
    pub async fn workload_count(&self) -> usize {
        match monitored_running(&*self.runtime, &self.exclusions, &self.ignored).await {
            Ok(names) => names.len(),
            Err(e) => {
                warn!("Could not list containers: {:#}", e);
                0
            }
        }
    }

    pub async fn beat(&self) -> bool {
        let count = self.workload_count().await;
        self.registry.heartbeat(count).await
    }

    pub async fn run(&self, token: CancellationToken) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately and registration just wrote.
        interval.tick().await;
        info!("Heartbeat every {:?}", self.interval);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = interval.tick() => {
                    if !self.beat().await {
                        warn!("Heartbeat for {} was not saved", self.registry.host_id());
                    }
                }
            }
        }
        debug!("Heartbeat stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::registry::unix_now;
    use crate::runtime::fake::FakeRuntime;
    use crate::store::LockedStore;
    use tempfile::TempDir;

    fn setup(dir: &TempDir) -> (Heartbeat, FleetRegistry, ExclusionConfig) {
        let runtime = Arc::new(
            FakeRuntime::default()
                .with_container("web", "nginx", "sha256:1")
                .with_container("db", "postgres", "sha256:2")
                .with_container("watchtower", "containrrr/watchtower", "sha256:3"),
        );
        let registry = FleetRegistry::new(
            LockedStore::new(dir.path().join("server_registry.json")),
            "alpha",
            "alpha",
            Duration::from_secs(90),
        );
        let exclusions = ExclusionConfig::new(
            LockedStore::new(dir.path().join("monitor_config.json")),
            "alpha",
        );
        let heartbeat = Heartbeat::new(
            registry.clone(),
            runtime,
            exclusions.clone(),
            Config::default().ignored_containers,
            Duration::from_millis(10),
        );
        (heartbeat, registry, exclusions)
    }

    #[tokio::test]
    async fn workload_excludes_ignored_and_excluded_containers() {
        let dir = TempDir::new().unwrap();
        let (heartbeat, _, exclusions) = setup(&dir);
        assert_eq!(heartbeat.workload_count().await, 2);
        exclusions.exclude("db").await;
        assert_eq!(heartbeat.workload_count().await, 1);
    }

    #[tokio::test]
    async fn ticker_refreshes_the_record_until_cancelled() {
        let dir = TempDir::new().unwrap();
        let (heartbeat, registry, _) = setup(&dir);
        registry.register_at(unix_now() - 1000.0, 0).await;

        let token = CancellationToken::new();
        let stopper = token.clone();
        let task = tokio::spawn(async move { heartbeat.run(token).await });
        tokio::time::sleep(Duration::from_millis(100)).await;
        stopper.cancel();
        task.await.unwrap();

        let snap = registry.snapshot().await;
        assert_eq!(snap.active_hosts(), vec!["alpha"]);
        assert_eq!(snap.record("alpha").unwrap().workload_count, 2);
    }
}
