//! Long-polls the chat and dispatches each event that this host owns.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, info, warn};
use lru::LruCache;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::chat::{ChatTransport, UpdateKind};
use crate::handler::{Handler, Origin};
use crate::registry::FleetRegistry;
use crate::router::{Callback, Command, Decision, Router};

const SEEN_CAPACITY: usize = 1000;

#[derive(Debug, Clone)]
pub struct PollerTimings {
    pub long_poll: Duration,
    pub retry_delay: Duration,
    /// How long a processed callback stays in the duplicate set.
    pub callback_hold: Duration,
}

impl Default for PollerTimings {
    fn default() -> Self {
        Self {
            long_poll: Duration::from_secs(30),
            retry_delay: Duration::from_secs(5),
            callback_hold: Duration::from_secs(2),
        }
    }
}

type KeySet = Arc<Mutex<LruCache<String, ()>>>;

fn key_set() -> KeySet {
    let cap = NonZeroUsize::new(SEEN_CAPACITY).unwrap_or(NonZeroUsize::MIN);
    Arc::new(Mutex::new(LruCache::new(cap)))
}

/// Inserts `key`; `false` when it was already present.
fn claim(keys: &KeySet, key: &str) -> bool {
    let mut keys = match keys.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    keys.put(key.to_string(), ()).is_none()
}

fn release(keys: &KeySet, key: &str) {
    let mut keys = match keys.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    keys.pop(key);
}

pub struct Poller {
    chat: Arc<dyn ChatTransport>,
    handler: Arc<Handler>,
    registry: FleetRegistry,
    router: Router,
    chat_id: String,
    seen_updates: LruCache<i64, ()>,
    callbacks: KeySet,
    timings: PollerTimings,
}

impl Poller {
    pub fn new(
        chat: Arc<dyn ChatTransport>,
        handler: Arc<Handler>,
        registry: FleetRegistry,
        router: Router,
        chat_id: impl Into<String>,
    ) -> Self {
        let cap = NonZeroUsize::new(SEEN_CAPACITY).unwrap_or(NonZeroUsize::MIN);
        Self {
            chat,
            handler,
            registry,
            router,
            chat_id: chat_id.into(),
            seen_updates: LruCache::new(cap),
            callbacks: key_set(),
            timings: PollerTimings::default(),
        }
    }

    pub fn with_timings(mut self, timings: PollerTimings) -> Self {
        self.timings = timings;
        self
    }

    pub async fn run(mut self, token: CancellationToken) {
        info!("Chat poller started");
        let mut offset = 0i64;
        loop {
            let batch = tokio::select! {
                _ = token.cancelled() => break,
                batch = self.chat.poll_updates(offset, self.timings.long_poll) => batch,
            };
            let Some(batch) = batch else {
                warn!("Polling the chat failed, retrying in {:?}", self.timings.retry_delay);
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = sleep(self.timings.retry_delay) => {}
                }
                continue;
            };
            for update in batch {
                offset = offset.max(update.update_id + 1);
                if self.seen_updates.put(update.update_id, ()).is_some() {
                    debug!("Skipping duplicate update {}", update.update_id);
                    continue;
                }
                self.dispatch(update.kind).await;
            }
        }
        info!("Chat poller stopped");
    }

    async fn dispatch(&self, kind: UpdateKind) {
        match kind {
            UpdateKind::Message { chat_id, text } => {
                if chat_id != self.chat_id {
                    debug!("Ignoring message from chat {}", chat_id);
                    return;
                }
                if !text.starts_with('/') {
                    return;
                }
                let command = Command::parse(&text);
                let snapshot = self.registry.snapshot().await;
                match self.router.route_command(&command, &snapshot) {
                    Decision::Handle => self.handler.handle_command(&command, &snapshot).await,
                    Decision::Ignore => debug!("{:?} is handled by another host", command),
                }
            }
            UpdateKind::Callback {
                id,
                chat_id,
                message_id,
                data,
            } => {
                if chat_id != self.chat_id {
                    debug!("Ignoring callback from chat {}", chat_id);
                    return;
                }
                let key = format!("{}:{}", id, data);
                if !claim(&self.callbacks, &key) {
                    debug!("Skipping duplicate callback {}", data);
                    return;
                }

                let callback = Callback::parse(&data);
                let snapshot = self.registry.snapshot().await;
                match self.router.route_callback(callback.as_ref(), &snapshot) {
                    Decision::Handle => {
                        let origin = Origin {
                            chat_id,
                            message_id,
                        };
                        self.handler
                            .handle_callback(&id, origin, callback, &snapshot)
                            .await;
                    }
                    Decision::Ignore => debug!("Callback {} is handled by another host", data),
                }

                let keys = Arc::clone(&self.callbacks);
                let hold = self.timings.callback_hold;
                tokio::spawn(async move {
                    sleep(hold).await;
                    release(&keys, &key);
                });
            }
            UpdateKind::Other => {}
        }
    }
}
