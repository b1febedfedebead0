//! Turns the auto-update agent's log into per-container notices.
//!
//! The agent stops a container before replacing it and prints a session
//! summary once a pass is over.  A stop line snapshots the container's
//! current version; a summary with a positive update count flushes every
//! snapshot into an old → new notice.  Error lines are alerted on directly.

use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use futures_util::StreamExt;
use log::{debug, error, info, warn};
use regex::Regex;
use tokio::sync::mpsc;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::exclusions::ExclusionConfig;
use crate::runtime::{split_reference, ContainerRuntime};
use crate::versions::VersionProber;

const STOP_MARKER: &str = "Stopping /";
const SESSION_MARKER: &str = "Session done";
const BENIGN: [&str; 5] = [
    "skipping",
    "already up to date",
    "no new images",
    "connection refused",
    "timeout",
];
const CONTAINER_KEYS: [&str; 3] = ["container=", "container:", "container "];
const WATCHER_ATTEMPTS: usize = 60;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogEvent {
    Stopping { container: String },
    SessionDone { updated: u32 },
    Failure { container: Option<String>, line: String },
}

fn updated_count(line: &str) -> Option<u32> {
    static UPDATED: OnceLock<Option<Regex>> = OnceLock::new();
    let re = UPDATED
        .get_or_init(|| Regex::new(r"Updated=(\d+)").ok())
        .as_ref()?;
    re.captures(line)?.get(1)?.as_str().parse().ok()
}

/// Text from `start` up to the next space.
fn word_at(line: &str, start: usize) -> &str {
    let rest = &line[start..];
    rest.split(' ').next().unwrap_or_default()
}

fn clean_name(raw: &str) -> Option<String> {
    let name = raw
        .trim()
        .trim_matches(|c| c == '"' || c == '\'')
        .trim_start_matches('/');
    (!name.is_empty()).then(|| name.to_string())
}

fn failure_container(line: &str) -> Option<String> {
    let lower = line.to_ascii_lowercase();
    CONTAINER_KEYS.iter().find_map(|key| {
        let at = lower.find(key)? + key.len();
        clean_name(word_at(line, at))
    })
}

pub fn parse_log_line(line: &str) -> Option<LogEvent> {
    if let Some(at) = line.find(STOP_MARKER) {
        let container = clean_name(word_at(line, at + STOP_MARKER.len()))?;
        return Some(LogEvent::Stopping { container });
    }
    if line.contains(SESSION_MARKER) {
        return updated_count(line).map(|updated| LogEvent::SessionDone { updated });
    }
    let lower = line.to_ascii_lowercase();
    if lower.contains("level=error") || lower.contains("level=fatal") {
        if BENIGN.iter().any(|b| lower.contains(b)) {
            return None;
        }
        return Some(LogEvent::Failure {
            container: failure_container(line),
            line: line.to_string(),
        });
    }
    None
}

/// What the notifier should tell the operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    Updated {
        container: String,
        image: String,
        old_version: String,
        new_version: String,
        running: bool,
    },
    WatcherError {
        container: String,
        line: String,
    },
}

#[derive(Debug, Clone)]
struct PendingUpdate {
    old_version: String,
    captured_at: Instant,
}

#[derive(Debug, Clone)]
pub struct CorrelatorTimings {
    pub settle: Duration,
    pub running_wait: Duration,
    pub poll_interval: Duration,
    pub pending_ttl: Duration,
    pub watcher_poll: Duration,
    pub reconnect_delay: Duration,
}

impl CorrelatorTimings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            settle: Duration::from_secs(config.update_settle_secs),
            running_wait: Duration::from_secs(config.running_wait_secs),
            poll_interval: Duration::from_secs(1),
            pending_ttl: Duration::from_secs(config.pending_ttl_secs),
            watcher_poll: Duration::from_secs(2),
            reconnect_delay: Duration::from_secs(5),
        }
    }
}

pub struct Correlator {
    runtime: Arc<dyn ContainerRuntime>,
    exclusions: ExclusionConfig,
    versions: Arc<VersionProber>,
    ignored: Vec<String>,
    timings: CorrelatorTimings,
    pending: BTreeMap<String, PendingUpdate>,
    notices: mpsc::Sender<Notice>,
}

impl Correlator {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        exclusions: ExclusionConfig,
        versions: Arc<VersionProber>,
        ignored: Vec<String>,
        timings: CorrelatorTimings,
        notices: mpsc::Sender<Notice>,
    ) -> Self {
        Self {
            runtime,
            exclusions,
            versions,
            ignored,
            timings,
            pending: BTreeMap::new(),
            notices,
        }
    }

    async fn watches(&self, container: &str) -> bool {
        !self.ignored.iter().any(|c| c == container) && self.exclusions.is_monitored(container).await
    }

    pub async fn handle_line(&mut self, line: &str) {
        if let Some(event) = parse_log_line(line) {
            self.apply(event).await;
        }
    }

    pub async fn apply(&mut self, event: LogEvent) {
        self.expire_stale();
        match event {
            LogEvent::Stopping { container } => self.capture(container).await,
            LogEvent::SessionDone { updated } => {
                info!("Update session done, updated={}", updated);
                if updated == 0 {
                    if !self.pending.is_empty() {
                        debug!("Dropping {} pending containers", self.pending.len());
                    }
                    self.pending.clear();
                } else if !self.pending.is_empty() {
                    self.flush().await;
                }
            }
            LogEvent::Failure {
                container: Some(container),
                line,
            } => {
                if self.watches(&container).await {
                    warn!("Auto-update error for {}: {}", container, line);
                    self.emit(Notice::WatcherError { container, line }).await;
                } else {
                    debug!("Ignoring error for unmonitored {}", container);
                }
            }
            LogEvent::Failure { container: None, .. } => debug!("Error line names no container"),
        }
    }

    fn expire_stale(&mut self) {
        let ttl = self.timings.pending_ttl;
        self.pending.retain(|name, entry| {
            let fresh = entry.captured_at.elapsed() < ttl;
            if !fresh {
                warn!("Discarding stale pending update of {}", name);
            }
            fresh
        });
    }

    async fn capture(&mut self, container: String) {
        if !self.watches(&container).await {
            debug!("{} is not monitored, not tracking its stop", container);
            return;
        }
        let details = match self.runtime.inspect(&container).await {
            Ok(d) => d,
            Err(e) => {
                error!("Could not snapshot {} before update: {:#}", container, e);
                return;
            }
        };
        let old_version = self
            .versions
            .label(&*self.runtime, &container, &details.image, &details.image_id, 1)
            .await;
        info!("Captured stop of {} at {}", container, old_version);
        self.pending.insert(
            container,
            PendingUpdate {
                old_version,
                captured_at: Instant::now(),
            },
        );
    }

    async fn flush(&mut self) {
        let pending = std::mem::take(&mut self.pending);
        info!("Processing {} updated containers", pending.len());
        for (container, entry) in pending {
            if !self.watches(&container).await {
                info!("{} was excluded meanwhile, skipping", container);
                continue;
            }
            sleep(self.timings.settle).await;
            let running = self.wait_until_running(&container).await;
            let details = match self.runtime.inspect(&container).await {
                Ok(d) => d,
                Err(e) => {
                    error!("Could not inspect {} after update: {:#}", container, e);
                    continue;
                }
            };
            let new_version = self
                .versions
                .label(&*self.runtime, &container, &details.image, &details.image_id, 1)
                .await;
            self.emit(Notice::Updated {
                image: split_reference(&details.image).0,
                container,
                old_version: entry.old_version,
                new_version,
                running: running && details.running,
            })
            .await;
        }
        info!("All updated containers processed");
    }

    async fn wait_until_running(&self, container: &str) -> bool {
        let deadline = Instant::now() + self.timings.running_wait;
        loop {
            if let Ok(d) = self.runtime.inspect(container).await {
                if d.running {
                    return true;
                }
            }
            if Instant::now() >= deadline {
                return false;
            }
            sleep(self.timings.poll_interval).await;
        }
    }

    async fn emit(&self, notice: Notice) {
        if self.notices.send(notice).await.is_err() {
            warn!("Notice channel closed, dropping notice");
        }
    }

    async fn wait_for_watcher(&self, watcher: &str, token: &CancellationToken) {
        info!("Waiting for {} to run", watcher);
        for _ in 0..WATCHER_ATTEMPTS {
            if let Ok(d) = self.runtime.inspect(watcher).await {
                if d.running {
                    info!("{} is running", watcher);
                    return;
                }
            }
            tokio::select! {
                _ = token.cancelled() => return,
                _ = sleep(self.timings.watcher_poll) => {}
            }
        }
        warn!("{} did not start in time, tailing anyway", watcher);
    }

    /// Tails `watcher` until `token` is cancelled, reconnecting whenever the
    /// log stream ends.
    pub async fn run(mut self, watcher: String, token: CancellationToken) {
        while !token.is_cancelled() {
            self.wait_for_watcher(&watcher, &token).await;
            let mut lines = self.runtime.tail_logs(&watcher);
            info!("Tailing {} log", watcher);
            loop {
                let next = tokio::select! {
                    _ = token.cancelled() => return,
                    next = lines.next() => next,
                };
                match next {
                    Some(Ok(line)) => {
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        info!("{}", line);
                        self.handle_line(line).await;
                    }
                    Some(Err(e)) => {
                        warn!("Reading {} log failed: {:#}", watcher, e);
                        break;
                    }
                    None => break,
                }
            }
            warn!("{} log stream ended, reconnecting", watcher);
            tokio::select! {
                _ = token.cancelled() => return,
                _ = sleep(self.timings.reconnect_delay) => {}
            }
        }
    }
}
