//! Telegram Bot API transport.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use log::{debug, error, warn};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::time::sleep;

use super::{ChatTransport, ChatUpdate, Keyboard, UpdateKind};
use crate::error::ChatError;

const SEND_ATTEMPTS: u32 = 3;
const EDIT_ATTEMPTS: u32 = 3;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const ANSWER_TIMEOUT: Duration = Duration::from_secs(10);
/// Edits of one message closer together than this are dropped.
const EDIT_DEBOUNCE: Duration = Duration::from_millis(500);

#[derive(Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

#[derive(Deserialize)]
struct RawChat {
    id: i64,
}

#[derive(Deserialize)]
struct RawMessage {
    message_id: i64,
    chat: RawChat,
    text: Option<String>,
}

#[derive(Deserialize)]
struct RawCallback {
    id: String,
    data: Option<String>,
    message: Option<RawMessage>,
}

#[derive(Deserialize)]
struct RawUpdate {
    update_id: i64,
    message: Option<RawMessage>,
    callback_query: Option<RawCallback>,
}

impl From<RawUpdate> for ChatUpdate {
    fn from(raw: RawUpdate) -> Self {
        let kind = match (raw.callback_query, raw.message) {
            (Some(cb), _) => match cb.message {
                Some(msg) => UpdateKind::Callback {
                    id: cb.id,
                    chat_id: msg.chat.id.to_string(),
                    message_id: msg.message_id,
                    data: cb.data.unwrap_or_default(),
                },
                None => UpdateKind::Other,
            },
            (None, Some(msg)) => match msg.text {
                Some(text) => UpdateKind::Message {
                    chat_id: msg.chat.id.to_string(),
                    text,
                },
                None => UpdateKind::Other,
            },
            (None, None) => UpdateKind::Other,
        };
        ChatUpdate {
            update_id: raw.update_id,
            kind,
        }
    }
}

fn keyboard_json(keyboard: &Keyboard) -> Value {
    let rows: Vec<Vec<Value>> = keyboard
        .rows
        .iter()
        .map(|row| {
            row.iter()
                .map(|b| json!({ "text": b.text, "callback_data": b.data }))
                .collect()
        })
        .collect();
    json!({ "inline_keyboard": rows })
}

pub struct TelegramBot {
    client: reqwest::Client,
    api_url: String,
    chat_id: String,
    last_edit: Mutex<HashMap<(String, i64), Instant>>,
}

impl TelegramBot {
    pub fn new(api_base: &str, token: &str, chat_id: &str) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .build()?;
        Ok(Self {
            client,
            api_url: format!("{}/bot{}", api_base.trim_end_matches('/'), token),
            chat_id: chat_id.to_string(),
            last_edit: Mutex::new(HashMap::new()),
        })
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        payload: &Value,
        timeout: Duration,
    ) -> Result<T, ChatError> {
        let response: ApiResponse<T> = self
            .client
            .post(format!("{}/{}", self.api_url, method))
            .json(payload)
            .timeout(timeout)
            .send()
            .await?
            .json()
            .await?;
        match (response.ok, response.result) {
            (true, Some(result)) => Ok(result),
            _ => Err(ChatError::Api(
                response
                    .description
                    .unwrap_or_else(|| "unknown error".to_string()),
            )),
        }
    }

    /// `true` when this edit should be dropped as too soon after the last one.
    fn debounced(&self, chat_id: &str, message_id: i64) -> bool {
        let mut last = match self.last_edit.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let now = Instant::now();
        let key = (chat_id.to_string(), message_id);
        if let Some(previous) = last.get(&key) {
            if now.duration_since(*previous) < EDIT_DEBOUNCE {
                return true;
            }
        }
        last.insert(key, now);
        false
    }
}

#[async_trait]
impl ChatTransport for TelegramBot {
    async fn send_message(&self, text: &str, keyboard: Option<&Keyboard>) -> bool {
        let mut payload = json!({
            "chat_id": self.chat_id,
            "text": text,
            "parse_mode": "HTML",
        });
        if let Some(kb) = keyboard {
            payload["reply_markup"] = keyboard_json(kb);
        }

        for attempt in 0..SEND_ATTEMPTS {
            match self.call::<Value>("sendMessage", &payload, REQUEST_TIMEOUT).await {
                Ok(_) => return true,
                Err(e) => error!("sendMessage failed (attempt {}): {}", attempt + 1, e),
            }
            if attempt + 1 < SEND_ATTEMPTS {
                sleep(Duration::from_secs(5 * u64::from(attempt + 1))).await;
            }
        }
        false
    }

    async fn edit_message(
        &self,
        chat_id: &str,
        message_id: i64,
        text: &str,
        keyboard: Option<&Keyboard>,
    ) -> bool {
        if self.debounced(chat_id, message_id) {
            debug!("Skipping rapid edit of message {}", message_id);
            return false;
        }

        let mut payload = json!({
            "chat_id": chat_id,
            "message_id": message_id,
            "text": text,
            "parse_mode": "HTML",
        });
        if let Some(kb) = keyboard {
            payload["reply_markup"] = keyboard_json(kb);
        }

        for attempt in 0..EDIT_ATTEMPTS {
            match self
                .call::<Value>("editMessageText", &payload, REQUEST_TIMEOUT)
                .await
            {
                Ok(_) => return true,
                Err(ChatError::Api(desc)) if desc.to_lowercase().contains("message is not modified") => {
                    return true
                }
                Err(e) => debug!("editMessageText failed (attempt {}): {}", attempt + 1, e),
            }
            if attempt + 1 < EDIT_ATTEMPTS {
                sleep(Duration::from_secs(1)).await;
            }
        }
        false
    }

    async fn answer_callback(&self, callback_id: &str, text: &str, show_alert: bool) -> bool {
        let mut payload = json!({
            "callback_query_id": callback_id,
            "show_alert": show_alert,
        });
        if !text.is_empty() {
            payload["text"] = json!(text);
        }
        match self
            .call::<Value>("answerCallbackQuery", &payload, ANSWER_TIMEOUT)
            .await
        {
            Ok(_) => true,
            Err(e) => {
                warn!("answerCallbackQuery failed: {}", e);
                false
            }
        }
    }

    async fn poll_updates(&self, offset: i64, timeout: Duration) -> Option<Vec<ChatUpdate>> {
        let payload = json!({ "offset": offset, "timeout": timeout.as_secs() });
        match self
            .call::<Vec<RawUpdate>>("getUpdates", &payload, timeout + Duration::from_secs(10))
            .await
        {
            Ok(updates) => Some(updates.into_iter().map(ChatUpdate::from).collect()),
            Err(e) => {
                debug!("getUpdates failed: {}", e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::Button;

    #[test]
    fn callback_updates_keep_their_message_coordinates() {
        let raw: RawUpdate = serde_json::from_value(json!({
            "update_id": 7,
            "callback_query": {
                "id": "cb1",
                "data": "status_srv:alpha",
                "message": { "message_id": 42, "chat": { "id": -100 } }
            }
        }))
        .unwrap();
        assert_eq!(
            ChatUpdate::from(raw).kind,
            UpdateKind::Callback {
                id: "cb1".into(),
                chat_id: "-100".into(),
                message_id: 42,
                data: "status_srv:alpha".into(),
            }
        );
    }

    #[test]
    fn non_text_messages_are_ignored() {
        let raw: RawUpdate = serde_json::from_value(json!({
            "update_id": 8,
            "message": { "message_id": 1, "chat": { "id": 5 } }
        }))
        .unwrap();
        assert_eq!(ChatUpdate::from(raw).kind, UpdateKind::Other);
    }

    #[test]
    fn keyboards_serialize_as_inline_keyboard_rows() {
        let kb = Keyboard {
            rows: vec![vec![Button {
                text: "go".into(),
                data: "cancel".into(),
            }]],
        };
        assert_eq!(
            keyboard_json(&kb),
            json!({ "inline_keyboard": [[{ "text": "go", "callback_data": "cancel" }]] })
        );
    }

    #[test]
    fn rapid_edits_of_one_message_are_debounced() {
        let bot = TelegramBot::new("https://example.invalid", "t", "1").unwrap();
        assert!(!bot.debounced("1", 10));
        assert!(bot.debounced("1", 10));
        assert!(!bot.debounced("1", 11));
    }
}
