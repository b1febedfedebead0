use std::sync::Arc;

use log::{info, warn};
use tokio::sync::mpsc;

use crate::chat::ChatTransport;
use crate::correlator::Notice;
use crate::messages;

pub fn render(host: &str, notice: &Notice) -> String {
    match notice {
        Notice::Updated {
            container,
            image,
            old_version,
            new_version,
            running,
        } => messages::container_updated(host, container, image, old_version, new_version, *running),
        Notice::WatcherError { container, line } => messages::watcher_error(host, container, line),
    }
}

/// Forwards correlator notices to the chat until every sender is gone.
pub async fn run_notifier(host: String, chat: Arc<dyn ChatTransport>, mut rx: mpsc::Receiver<Notice>) {
    while let Some(notice) = rx.recv().await {
        if !chat.send_message(&render(&host, &notice), None).await {
            warn!("Could not deliver notice: {:?}", notice);
        }
    }
    info!("Notice channel closed, notifier stopping");
}
