use std::time::Duration;

use async_trait::async_trait;

use crate::router::Callback;

pub mod telegram;
pub use telegram::TelegramBot;

#[cfg(test)]
pub mod fake;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Button {
    pub text: String,
    pub data: String,
}

impl Button {
    pub fn new(text: impl Into<String>, callback: &Callback) -> Self {
        Self {
            text: text.into(),
            data: callback.to_string(),
        }
    }
}

/// Inline keyboard, one button per row.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Keyboard {
    pub rows: Vec<Vec<Button>>,
}

impl Keyboard {
    pub fn column(buttons: impl IntoIterator<Item = Button>) -> Self {
        Self {
            rows: buttons.into_iter().map(|b| vec![b]).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateKind {
    Message {
        chat_id: String,
        text: String,
    },
    Callback {
        id: String,
        chat_id: String,
        message_id: i64,
        data: String,
    },
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatUpdate {
    pub update_id: i64,
    pub kind: UpdateKind,
}

/// The chat service the bot talks through.  Every call reports success as a
/// boolean; failures are logged by the implementation.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn send_message(&self, text: &str, keyboard: Option<&Keyboard>) -> bool;

    async fn edit_message(
        &self,
        chat_id: &str,
        message_id: i64,
        text: &str,
        keyboard: Option<&Keyboard>,
    ) -> bool;

    async fn answer_callback(&self, callback_id: &str, text: &str, show_alert: bool) -> bool;

    /// Long-polls for updates after `offset`.  `None` on transport failure.
    async fn poll_updates(&self, offset: i64, timeout: Duration) -> Option<Vec<ChatUpdate>>;
}
