//! Answers the commands and button presses routed to this host.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info};
use tokio::sync::mpsc;
use tokio::time::{sleep, Instant};
use tokio_util::task::TaskTracker;

use crate::chat::{Button, ChatTransport, Keyboard};
use crate::exclusions::ExclusionConfig;
use crate::heartbeat::monitored_running;
use crate::messages::{self, truncate, StatusLine};
use crate::registry::RegistrySnapshot;
use crate::router::{Callback, Command, MonitorOp};
use crate::runtime::ContainerRuntime;
use crate::updater::{Phase, Updater, MESSAGE_LIMIT};
use crate::versions::image_tag;

#[derive(Debug, Clone)]
pub struct HandlerTimings {
    /// Pause between answering a callback and editing its message.
    pub first_edit_delay: Duration,
    /// Minimum spacing of progress edits during an update.
    pub progress_interval: Duration,
    /// Minimum spacing before a result edit, so the transport does not
    /// drop it as a rapid repeat.
    pub edit_gap: Duration,
    pub restart_timeout: Duration,
}

impl Default for HandlerTimings {
    fn default() -> Self {
        Self {
            first_edit_delay: Duration::from_millis(300),
            progress_interval: Duration::from_secs(2),
            edit_gap: Duration::from_millis(600),
            restart_timeout: Duration::from_secs(30),
        }
    }
}

/// The message a button press came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Origin {
    pub chat_id: String,
    pub message_id: i64,
}

pub struct Handler {
    host_id: String,
    chat: Arc<dyn ChatTransport>,
    runtime: Arc<dyn ContainerRuntime>,
    exclusions: ExclusionConfig,
    updater: Arc<Updater>,
    ignored: Vec<String>,
    tasks: TaskTracker,
    timings: HandlerTimings,
}

async fn wait_out(since: Instant, gap: Duration) {
    let elapsed = since.elapsed();
    if elapsed < gap {
        sleep(gap - elapsed).await;
    }
}

fn host_picker(hosts: &[String], to_callback: impl Fn(String) -> Callback) -> Keyboard {
    Keyboard::column(
        hosts
            .iter()
            .map(|h| Button::new(format!("🖥️ {}", h), &to_callback(h.clone()))),
    )
}

fn confirm_keyboard(confirm: &str, callback: Callback) -> Keyboard {
    Keyboard::column([
        Button::new(confirm, &callback),
        Button::new("❌ Cancel", &Callback::Cancel),
    ])
}

impl Handler {
    pub fn new(
        host_id: impl Into<String>,
        chat: Arc<dyn ChatTransport>,
        runtime: Arc<dyn ContainerRuntime>,
        exclusions: ExclusionConfig,
        updater: Arc<Updater>,
        ignored: Vec<String>,
        tasks: TaskTracker,
    ) -> Self {
        Self {
            host_id: host_id.into(),
            chat,
            runtime,
            exclusions,
            updater,
            ignored,
            tasks,
            timings: HandlerTimings::default(),
        }
    }

    pub fn with_timings(mut self, timings: HandlerTimings) -> Self {
        self.timings = timings;
        self
    }

    /// Running containers minus the ignored ones.
    async fn visible_containers(&self) -> Vec<String> {
        match self.runtime.list_running().await {
            Ok(mut names) => {
                names.retain(|n| !self.ignored.contains(n));
                names.sort();
                names
            }
            Err(e) => {
                error!("Could not list containers: {:#}", e);
                Vec::new()
            }
        }
    }

    async fn monitored_containers(&self) -> Vec<String> {
        monitored_running(&*self.runtime, &self.exclusions, &self.ignored)
            .await
            .unwrap_or_else(|e| {
                error!("Could not list containers: {:#}", e);
                Vec::new()
            })
    }

    pub async fn handle_command(&self, command: &Command, snapshot: &RegistrySnapshot) {
        info!("Handling command {:?}", command);
        match command {
            Command::Start | Command::Help => {
                self.chat.send_message(&messages::help(snapshot), None).await;
            }
            Command::Servers => {
                self.chat.send_message(&messages::servers(snapshot), None).await;
            }
            Command::Status => self.status(snapshot).await,
            Command::Update => {
                let hosts = snapshot.active_hosts();
                match hosts.len() {
                    0 => {
                        self.chat.send_message(&messages::no_hosts(), None).await;
                    }
                    1 => self.send_update_picker().await,
                    _ => {
                        let kb = host_picker(&hosts, |host| Callback::UpdateHost { host });
                        self.chat
                            .send_message(&messages::pick_host("update containers on"), Some(&kb))
                            .await;
                    }
                }
            }
            Command::Restart => {
                let hosts = snapshot.active_hosts();
                match hosts.len() {
                    0 => {
                        self.chat.send_message(&messages::no_hosts(), None).await;
                    }
                    1 => self.send_restart_picker().await,
                    _ => {
                        let kb = host_picker(&hosts, |host| Callback::RestartHost { host });
                        self.chat
                            .send_message(&messages::pick_host("restart containers on"), Some(&kb))
                            .await;
                    }
                }
            }
            Command::Monitor => {
                let kb = Keyboard::column([
                    Button::new("➕ Add to monitoring", &Callback::MonitorMenu(MonitorOp::Add)),
                    Button::new("➖ Remove from monitoring", &Callback::MonitorMenu(MonitorOp::Remove)),
                    Button::new("📋 Show list", &Callback::MonitorMenu(MonitorOp::List)),
                ]);
                self.chat.send_message(&messages::monitor_menu(), Some(&kb)).await;
            }
            Command::Unknown(word) => debug!("Ignoring unknown command {}", word),
        }
    }

    async fn status(&self, snapshot: &RegistrySnapshot) {
        let hosts = snapshot.active_hosts();
        if hosts.len() > 1 {
            let kb = host_picker(&hosts, |host| Callback::StatusHost { host });
            self.chat
                .send_message(&messages::pick_host("show the status of"), Some(&kb))
                .await;
        } else {
            self.send_status().await;
        }
    }

    async fn send_status(&self) {
        let total = self.visible_containers().await.len();
        let mut lines = Vec::new();
        for name in self.monitored_containers().await {
            let (running, tag) = match self.runtime.inspect(&name).await {
                Ok(d) => (d.running, image_tag(&d.image)),
                Err(_) => (false, "latest".to_string()),
            };
            lines.push(StatusLine { name, running, tag });
        }
        let excluded = self.exclusions.excluded().await;
        let text = messages::host_status(&self.host_id, total, &lines, &excluded);
        self.chat.send_message(&text, None).await;
    }

    async fn send_update_picker(&self) {
        let containers = self.monitored_containers().await;
        if containers.is_empty() {
            self.chat
                .send_message(&messages::nothing_to_pick(&self.host_id, "update"), None)
                .await;
            return;
        }
        let kb = Keyboard::column(containers.into_iter().map(|container| {
            let cb = Callback::PickUpdate {
                host: self.host_id.clone(),
                container: container.clone(),
            };
            Button::new(format!("📦 {}", container), &cb)
        }));
        self.chat
            .send_message(&messages::pick_container(&self.host_id, "update"), Some(&kb))
            .await;
    }

    async fn send_restart_picker(&self) {
        let containers = self.visible_containers().await;
        if containers.is_empty() {
            self.chat
                .send_message(&messages::nothing_to_pick(&self.host_id, "restart"), None)
                .await;
            return;
        }
        let kb = Keyboard::column(containers.into_iter().map(|container| {
            let cb = Callback::PickRestart {
                host: self.host_id.clone(),
                container: container.clone(),
            };
            Button::new(format!("🔄 {}", container), &cb)
        }));
        self.chat
            .send_message(&messages::pick_container(&self.host_id, "restart"), Some(&kb))
            .await;
    }

    async fn edit(&self, origin: &Origin, text: &str, keyboard: Option<&Keyboard>) -> bool {
        self.chat
            .edit_message(&origin.chat_id, origin.message_id, text, keyboard)
            .await
    }

    /// `callback` is `None` when the payload did not parse.
    pub async fn handle_callback(
        self: &Arc<Self>,
        callback_id: &str,
        origin: Origin,
        callback: Option<Callback>,
        snapshot: &RegistrySnapshot,
    ) {
        let Some(callback) = callback else {
            self.chat
                .answer_callback(callback_id, "❌ Unsupported action", false)
                .await;
            return;
        };
        info!("Handling callback {}", callback);
        self.chat.answer_callback(callback_id, "", false).await;
        sleep(self.timings.first_edit_delay).await;

        match callback {
            Callback::StatusHost { .. } => self.send_status().await,
            Callback::UpdateHost { .. } => self.send_update_picker().await,
            Callback::RestartHost { .. } => self.send_restart_picker().await,
            Callback::PickUpdate { host, container } => {
                let kb = confirm_keyboard(
                    "✅ Confirm update",
                    Callback::ConfirmUpdate {
                        host: host.clone(),
                        container: container.clone(),
                    },
                );
                self.edit(&origin, &messages::confirm_update(&host, &container), Some(&kb))
                    .await;
            }
            Callback::ConfirmUpdate { host, container } => {
                let this = Arc::clone(self);
                self.tasks
                    .spawn(async move { this.run_update(origin, host, container).await });
            }
            Callback::PickRestart { host, container } => {
                let kb = confirm_keyboard(
                    "✅ Confirm restart",
                    Callback::ConfirmRestart {
                        host: host.clone(),
                        container: container.clone(),
                    },
                );
                self.edit(&origin, &messages::confirm_restart(&host, &container), Some(&kb))
                    .await;
            }
            Callback::ConfirmRestart { host, container } => {
                let this = Arc::clone(self);
                self.tasks
                    .spawn(async move { this.run_restart(origin, host, container).await });
            }
            Callback::MonitorMenu(MonitorOp::List) => self.status(snapshot).await,
            Callback::MonitorMenu(op) => {
                let hosts = snapshot.active_hosts();
                if hosts.len() > 1 {
                    let kb = host_picker(&hosts, |host| Callback::MonitorHost { host, op });
                    self.edit(&origin, &messages::monitor_pick_host(op == MonitorOp::Add), Some(&kb))
                        .await;
                } else {
                    self.monitor_host(&origin, op).await;
                }
            }
            Callback::MonitorHost { op, .. } => self.monitor_host(&origin, op).await,
            Callback::AddMonitor { host, container } => {
                let saved = self.exclusions.include(&container).await;
                self.edit(&origin, &messages::monitor_changed(&host, &container, true, saved), None)
                    .await;
            }
            Callback::RemoveMonitor { host, container } => {
                let saved = self.exclusions.exclude(&container).await;
                self.edit(&origin, &messages::monitor_changed(&host, &container, false, saved), None)
                    .await;
            }
            Callback::Cancel => {
                self.edit(&origin, &messages::cancelled(), None).await;
            }
        }
    }

    async fn monitor_host(&self, origin: &Origin, op: MonitorOp) {
        let adding = op == MonitorOp::Add;
        let candidates: Vec<String> = if adding {
            self.exclusions.excluded().await.into_iter().collect()
        } else {
            self.monitored_containers().await
        };
        if candidates.is_empty() {
            let text = if adding {
                messages::all_monitored(&self.host_id)
            } else {
                messages::none_monitored(&self.host_id)
            };
            self.edit(origin, &text, None).await;
            return;
        }
        let kb = Keyboard::column(candidates.into_iter().map(|container| {
            let host = self.host_id.clone();
            if adding {
                Button::new(
                    format!("➕ {}", container),
                    &Callback::AddMonitor {
                        host,
                        container: container.clone(),
                    },
                )
            } else {
                Button::new(
                    format!("➖ {}", container),
                    &Callback::RemoveMonitor {
                        host,
                        container: container.clone(),
                    },
                )
            }
        }));
        self.edit(
            origin,
            &messages::monitor_pick_container(&self.host_id, adding),
            Some(&kb),
        )
        .await;
    }

    async fn run_update(&self, origin: Origin, host: String, container: String) {
        self.edit(&origin, &messages::update_progress(&container, "📋 Preparing update..."), None)
            .await;
        let started = Instant::now();

        let (tx, mut rx) = mpsc::unbounded_channel::<Phase>();
        let interval = self.timings.progress_interval;
        let updater = Arc::clone(&self.updater);
        let name = container.clone();
        let work = async move {
            let mut last = started;
            let mut progress = |phase: Phase| {
                if last.elapsed() >= interval {
                    last = Instant::now();
                    // The receiver outlives the update.
                    let _ = tx.send(phase);
                }
            };
            updater.update_container(&name, &mut progress).await
        };
        let forward = async {
            let mut last_edit = started;
            while let Some(phase) = rx.recv().await {
                self.edit(&origin, &messages::update_progress(&container, &phase.to_string()), None)
                    .await;
                last_edit = Instant::now();
            }
            last_edit
        };
        let (outcome, last_edit) = tokio::join!(work, forward);

        wait_out(last_edit, self.timings.edit_gap).await;
        let text = messages::update_result(&host, &container, &outcome);
        if !self.edit(&origin, &text, None).await {
            self.chat.send_message(&text, None).await;
        }
    }

    async fn run_restart(&self, origin: Origin, host: String, container: String) {
        self.edit(&origin, &messages::restarting(&container), None).await;
        let started = Instant::now();
        let limit = self.timings.restart_timeout;

        info!("Restarting {}", container);
        let error = match tokio::time::timeout(
            limit + Duration::from_secs(10),
            self.runtime.restart(&container, limit),
        )
        .await
        {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(truncate(&format!("{:#}", e), MESSAGE_LIMIT)),
            Err(_) => Some("restart timed out".to_string()),
        };
        if let Some(e) = &error {
            error!("Restart of {} failed: {}", container, e);
        }

        wait_out(started, self.timings.edit_gap).await;
        let text = messages::restart_result(&host, &container, error.as_deref());
        if !self.edit(&origin, &text, None).await {
            self.chat.send_message(&text, None).await;
        }
    }
}
