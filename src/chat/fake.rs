//! Recording transport used by the unit tests.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use super::{ChatTransport, ChatUpdate, Keyboard};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sent {
    Message {
        text: String,
        keyboard: Option<Keyboard>,
    },
    Edit {
        message_id: i64,
        text: String,
        keyboard: Option<Keyboard>,
    },
    Answer {
        callback_id: String,
    },
}

#[derive(Default)]
pub struct FakeChat {
    sent: Mutex<Vec<Sent>>,
    inbox: Mutex<VecDeque<Vec<ChatUpdate>>>,
}

impl FakeChat {
    pub fn sent(&self) -> MutexGuard<'_, Vec<Sent>> {
        self.sent.lock().unwrap()
    }

    /// Queue one batch to be returned by the next poll.
    pub fn push_batch(&self, batch: Vec<ChatUpdate>) {
        self.inbox.lock().unwrap().push_back(batch);
    }

    pub fn texts(&self) -> Vec<String> {
        self.sent()
            .iter()
            .filter_map(|s| match s {
                Sent::Message { text, .. } | Sent::Edit { text, .. } => Some(text.clone()),
                Sent::Answer { .. } => None,
            })
            .collect()
    }

    pub fn last_keyboard(&self) -> Option<Keyboard> {
        self.sent().iter().rev().find_map(|s| match s {
            Sent::Message { keyboard, .. } | Sent::Edit { keyboard, .. } => keyboard.clone(),
            Sent::Answer { .. } => None,
        })
    }
}

#[async_trait]
impl ChatTransport for FakeChat {
    async fn send_message(&self, text: &str, keyboard: Option<&Keyboard>) -> bool {
        self.sent().push(Sent::Message {
            text: text.to_string(),
            keyboard: keyboard.cloned(),
        });
        true
    }

    async fn edit_message(
        &self,
        _chat_id: &str,
        message_id: i64,
        text: &str,
        keyboard: Option<&Keyboard>,
    ) -> bool {
        self.sent().push(Sent::Edit {
            message_id,
            text: text.to_string(),
            keyboard: keyboard.cloned(),
        });
        true
    }

    async fn answer_callback(&self, callback_id: &str, _text: &str, _show_alert: bool) -> bool {
        self.sent().push(Sent::Answer {
            callback_id: callback_id.to_string(),
        });
        true
    }

    async fn poll_updates(&self, _offset: i64, _timeout: Duration) -> Option<Vec<ChatUpdate>> {
        let next = self.inbox.lock().unwrap().pop_front();
        match next {
            Some(batch) => Some(batch),
            None => {
                tokio::time::sleep(Duration::from_millis(10)).await;
                Some(Vec::new())
            }
        }
    }
}
