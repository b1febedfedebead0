//! Pull-and-recreate of a single container.
//!
//! The container is replaced, not mutated: once the old one is removed there
//! is no rollback, and a failed create leaves the host without it.  Every
//! step is bounded by a timeout and nothing is retried automatically.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use log::{error, info};

use crate::config::Config;
use crate::error::UpdateFailure;
use crate::messages::truncate;
use crate::runtime::{ContainerRuntime, ContainerSpec};
use crate::versions::VersionProber;

/// Operator messages are cut to this many characters.
pub const MESSAGE_LIMIT: usize = 200;

/// Polls for the product version file of a freshly started container.
const NEW_VERSION_ATTEMPTS: usize = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Inspecting,
    Pulling,
    ReadingConfig,
    Stopping,
    Removing,
    Starting,
    Verifying,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Phase::Inspecting => "📋 Reading container info...",
            Phase::Pulling => "🔄 Pulling image...",
            Phase::ReadingConfig => "📦 Reading container configuration...",
            Phase::Stopping => "⏸️ Stopping old container...",
            Phase::Removing => "🗑️ Removing old container...",
            Phase::Starting => "🚀 Starting new container...",
            Phase::Verifying => "🔍 Checking new container...",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateOutcome {
    pub succeeded: bool,
    pub message: String,
    pub old_version: String,
    pub new_version: String,
}

#[derive(Debug, Clone)]
pub struct UpdateTimings {
    pub settle: Duration,
    pub stop_timeout: Duration,
    pub pull_timeout: Duration,
    pub run_timeout: Duration,
    /// Inspect, remove and other short engine calls.
    pub call_timeout: Duration,
}

impl UpdateTimings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            settle: Duration::from_secs(config.update_settle_secs),
            stop_timeout: Duration::from_secs(config.stop_timeout_secs),
            pull_timeout: Duration::from_secs(config.pull_timeout_secs),
            run_timeout: Duration::from_secs(config.run_timeout_secs),
            call_timeout: Duration::from_secs(10),
        }
    }
}

pub struct Updater {
    runtime: Arc<dyn ContainerRuntime>,
    versions: Arc<VersionProber>,
    timings: UpdateTimings,
}

async fn step<T, F>(
    phase: &'static str,
    limit: Duration,
    fut: F,
    wrap: fn(String) -> UpdateFailure,
) -> Result<T, UpdateFailure>
where
    F: Future<Output = anyhow::Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(wrap(format!("{:#}", e))),
        Err(_) => Err(UpdateFailure::Timeout(phase)),
    }
}

impl Updater {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        versions: Arc<VersionProber>,
        timings: UpdateTimings,
    ) -> Self {
        Self {
            runtime,
            versions,
            timings,
        }
    }

    pub async fn update_container(
        &self,
        name: &str,
        on_progress: &mut (dyn FnMut(Phase) + Send),
    ) -> UpdateOutcome {
        let mut outcome = UpdateOutcome::default();
        match self.replace(name, on_progress, &mut outcome).await {
            Ok(message) => {
                info!("Update of {} finished: {}", name, message);
                outcome.succeeded = true;
                outcome.message = message.to_string();
            }
            Err(failure) => {
                error!("Update of {} failed: {}", name, failure);
                outcome.message = truncate(&failure.to_string(), MESSAGE_LIMIT);
            }
        }
        outcome
    }

    async fn replace(
        &self,
        name: &str,
        progress: &mut (dyn FnMut(Phase) + Send),
        outcome: &mut UpdateOutcome,
    ) -> Result<&'static str, UpdateFailure> {
        let rt = &*self.runtime;
        let t = &self.timings;

        progress(Phase::Inspecting);
        let current = step("inspect", t.call_timeout, rt.inspect(name), UpdateFailure::Inspect).await?;
        outcome.old_version = self
            .versions
            .label(rt, name, &current.image, &current.image_id, 1)
            .await;

        progress(Phase::Pulling);
        info!("Pulling {} for {} (created {})", current.image, name, current.created);
        step("pull", t.pull_timeout, rt.pull(&current.image), UpdateFailure::Pull).await?;
        let pulled = step(
            "image inspect",
            t.call_timeout,
            rt.image_digest(&current.image),
            UpdateFailure::Pull,
        )
        .await?;
        if pulled == current.image_id {
            outcome.new_version = outcome.old_version.clone();
            return Ok("image is already current, nothing to do");
        }

        progress(Phase::ReadingConfig);
        let config = step("inspect", t.call_timeout, rt.inspect(name), UpdateFailure::Config).await?;
        let spec = ContainerSpec::from_details(&config, &current.image);

        progress(Phase::Stopping);
        info!("Stopping {}", name);
        step(
            "stop",
            t.stop_timeout + t.call_timeout,
            rt.stop(name, t.stop_timeout),
            UpdateFailure::Stop,
        )
        .await?;

        progress(Phase::Removing);
        info!("Removing {}", name);
        step("remove", t.call_timeout, rt.remove(name), UpdateFailure::Remove).await?;

        progress(Phase::Starting);
        info!("Starting new {} from {}", name, spec.image);
        step("create", t.run_timeout, rt.run(&spec), UpdateFailure::Create).await?;

        progress(Phase::Verifying);
        tokio::time::sleep(t.settle).await;
        let fresh = step("inspect", t.call_timeout, rt.inspect(name), UpdateFailure::Inspect).await?;
        if !fresh.running {
            return Err(UpdateFailure::NotRunning);
        }
        outcome.new_version = self
            .versions
            .label(rt, name, &fresh.image, &fresh.image_id, NEW_VERSION_ATTEMPTS)
            .await;
        Ok("container updated")
    }
}
