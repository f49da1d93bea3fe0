//! Telegram channel — long-polls the Bot API for updates.
//!
//! Translates Telegram messages and callback queries into channel events
//! and renders outbound messages with reply/inline keyboards. Photos are
//! downloaded to raw bytes before the event is emitted, so nothing
//! upstream ever sees a Telegram file id.

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde_json::json;

use crate::channels::{
    Channel, EventStream, IncomingEvent, IncomingKind, Keyboard, OutgoingMessage,
};
use crate::error::ChannelError;

/// Maximum message length for Telegram's sendMessage API.
const TELEGRAM_MAX_MESSAGE_LENGTH: usize = 4096;

/// Telegram channel — connects to the Bot API via long-polling.
pub struct TelegramChannel {
    bot_token: String,
    allowed_users: Vec<String>,
    poll_timeout_secs: u64,
    client: reqwest::Client,
}

impl TelegramChannel {
    pub fn new(bot_token: String, allowed_users: Vec<String>, poll_timeout_secs: u64) -> Self {
        Self {
            bot_token,
            allowed_users,
            poll_timeout_secs,
            client: reqwest::Client::new(),
        }
    }

    fn api_url(&self, method: &str) -> String {
        format!("https://api.telegram.org/bot{}/{method}", self.bot_token)
    }

    /// Check if a username is in the allowed list.
    pub fn is_user_allowed(&self, username: &str) -> bool {
        self.allowed_users.iter().any(|u| u == "*" || u == username)
    }

    /// Check if any of the provided identities is allowed.
    pub fn is_any_user_allowed<'a, I>(&self, identities: I) -> bool
    where
        I: IntoIterator<Item = &'a str>,
    {
        identities.into_iter().any(|id| self.is_user_allowed(id))
    }

    /// Send a text message, trying Markdown first with plain text fallback.
    /// Splits long messages that exceed Telegram's 4096 char limit; the
    /// keyboard rides on the last chunk only.
    async fn send_message(
        &self,
        chat_id: &str,
        text: &str,
        keyboard: Option<&Keyboard>,
    ) -> Result<(), ChannelError> {
        let chunks = split_message(text, TELEGRAM_MAX_MESSAGE_LENGTH);
        let last = chunks.len() - 1;

        for (i, chunk) in chunks.iter().enumerate() {
            let kb = if i == last { keyboard } else { None };
            self.send_message_chunk(chat_id, chunk, kb).await?;
        }
        Ok(())
    }

    /// Send a single message chunk (≤4096 chars), Markdown-first with fallback.
    async fn send_message_chunk(
        &self,
        chat_id: &str,
        text: &str,
        keyboard: Option<&Keyboard>,
    ) -> Result<(), ChannelError> {
        let mut markdown_body = json!({
            "chat_id": chat_id,
            "text": text,
            "parse_mode": "Markdown"
        });
        if let Some(kb) = keyboard {
            markdown_body["reply_markup"] = keyboard_markup(kb);
        }

        let markdown_resp = self
            .client
            .post(self.api_url("sendMessage"))
            .json(&markdown_body)
            .send()
            .await
            .map_err(|e| ChannelError::SendFailed {
                name: "telegram".into(),
                reason: e.to_string(),
            })?;

        if markdown_resp.status().is_success() {
            return Ok(());
        }

        let markdown_status = markdown_resp.status();
        let _markdown_err = markdown_resp.text().await.unwrap_or_default();
        tracing::warn!(
            status = ?markdown_status,
            "Telegram sendMessage with Markdown failed; retrying without parse_mode"
        );

        let mut plain_body = json!({
            "chat_id": chat_id,
            "text": text,
        });
        if let Some(kb) = keyboard {
            plain_body["reply_markup"] = keyboard_markup(kb);
        }
        let plain_resp = self
            .client
            .post(self.api_url("sendMessage"))
            .json(&plain_body)
            .send()
            .await
            .map_err(|e| ChannelError::SendFailed {
                name: "telegram".into(),
                reason: e.to_string(),
            })?;

        if !plain_resp.status().is_success() {
            let plain_err = plain_resp.text().await.unwrap_or_default();
            return Err(ChannelError::SendFailed {
                name: "telegram".into(),
                reason: format!(
                    "sendMessage failed (markdown: {}, plain: {})",
                    markdown_status, plain_err
                ),
            });
        }

        Ok(())
    }

    /// Send a photo from bytes (in-memory) with a caption and an optional
    /// keyboard.
    pub async fn send_photo_bytes(
        &self,
        chat_id: &str,
        file_bytes: Vec<u8>,
        file_name: &str,
        caption: &str,
        keyboard: Option<&Keyboard>,
    ) -> Result<(), ChannelError> {
        let part = Part::bytes(file_bytes).file_name(file_name.to_string());

        let mut form = Form::new()
            .text("chat_id", chat_id.to_string())
            .text("caption", caption.to_string())
            .text("parse_mode", "Markdown")
            .part("photo", part);

        if let Some(kb) = keyboard {
            form = form.text("reply_markup", keyboard_markup(kb).to_string());
        }

        let resp = self
            .client
            .post(self.api_url("sendPhoto"))
            .multipart(form)
            .send()
            .await
            .map_err(|e| ChannelError::SendFailed {
                name: "telegram".into(),
                reason: e.to_string(),
            })?;

        if !resp.status().is_success() {
            let err = resp.text().await.unwrap_or_default();
            return Err(ChannelError::SendFailed {
                name: "telegram".into(),
                reason: format!("sendPhoto failed: {err}"),
            });
        }

        tracing::debug!("Telegram photo sent to {chat_id}: {file_name}");
        Ok(())
    }

    /// Replace the caption (and inline keyboard) of an existing message.
    async fn edit_message_caption(
        &self,
        chat_id: &str,
        message_id: i64,
        caption: &str,
        keyboard: Option<&Keyboard>,
    ) -> Result<(), ChannelError> {
        let mut body = json!({
            "chat_id": chat_id,
            "message_id": message_id,
            "caption": caption,
        });
        if let Some(kb) = keyboard {
            body["reply_markup"] = keyboard_markup(kb);
        }

        let resp = self
            .client
            .post(self.api_url("editMessageCaption"))
            .json(&body)
            .send()
            .await
            .map_err(|e| ChannelError::SendFailed {
                name: "telegram".into(),
                reason: e.to_string(),
            })?;

        if !resp.status().is_success() {
            let err = resp.text().await.unwrap_or_default();
            return Err(ChannelError::SendFailed {
                name: "telegram".into(),
                reason: format!("editMessageCaption failed: {err}"),
            });
        }
        Ok(())
    }

    /// Delete a message by chat and message id.
    async fn delete_message(&self, chat_id: &str, message_id: i64) -> Result<(), ChannelError> {
        let body = json!({
            "chat_id": chat_id,
            "message_id": message_id,
        });

        let resp = self
            .client
            .post(self.api_url("deleteMessage"))
            .json(&body)
            .send()
            .await
            .map_err(|e| ChannelError::SendFailed {
                name: "telegram".into(),
                reason: e.to_string(),
            })?;

        if !resp.status().is_success() {
            let err = resp.text().await.unwrap_or_default();
            return Err(ChannelError::SendFailed {
                name: "telegram".into(),
                reason: format!("deleteMessage failed: {err}"),
            });
        }
        Ok(())
    }
}

// ── Channel trait implementation ────────────────────────────────────

#[async_trait]
impl Channel for TelegramChannel {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn start(&self) -> Result<EventStream, ChannelError> {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let bot_token = self.bot_token.clone();
        let allowed_users = self.allowed_users.clone();
        let poll_timeout_secs = self.poll_timeout_secs;
        let client = self.client.clone();

        tokio::spawn(async move {
            let mut offset: i64 = 0;

            tracing::info!("Telegram channel listening for updates...");

            loop {
                let url = format!("https://api.telegram.org/bot{bot_token}/getUpdates");
                let body = json!({
                    "offset": offset,
                    "timeout": poll_timeout_secs,
                    "allowed_updates": ["message", "callback_query"]
                });

                let resp = match client.post(&url).json(&body).send().await {
                    Ok(r) => r,
                    Err(e) => {
                        tracing::warn!("Telegram poll error: {e}");
                        tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                        continue;
                    }
                };

                let data: serde_json::Value = match resp.json().await {
                    Ok(d) => d,
                    Err(e) => {
                        tracing::warn!("Telegram parse error: {e}");
                        tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                        continue;
                    }
                };

                if let Some(results) = data.get("result").and_then(serde_json::Value::as_array) {
                    for update in results {
                        if let Some(uid) =
                            update.get("update_id").and_then(serde_json::Value::as_i64)
                        {
                            offset = uid + 1;
                        }

                        let event = if let Some(message) = update.get("message") {
                            parse_message(&client, &bot_token, &allowed_users, message).await
                        } else if let Some(callback) = update.get("callback_query") {
                            parse_callback(&client, &bot_token, &allowed_users, callback).await
                        } else {
                            None
                        };

                        let Some(event) = event else { continue };

                        if tx.send(event).is_err() {
                            tracing::info!("Telegram listener channel closed");
                            return;
                        }
                    }
                }
            }
        });

        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|msg| (msg, rx))
        });

        Ok(Box::pin(stream))
    }

    async fn respond(
        &self,
        event: &IncomingEvent,
        message: OutgoingMessage,
    ) -> Result<(), ChannelError> {
        let chat_id = event
            .metadata
            .get("chat_id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ChannelError::SendFailed {
                name: "telegram".into(),
                reason: "No chat_id in event metadata".into(),
            })?;

        match message {
            OutgoingMessage::Text { text, keyboard } => {
                self.send_message(chat_id, &text, keyboard.as_ref()).await
            }
            OutgoingMessage::Photo {
                data,
                caption,
                keyboard,
            } => {
                self.send_photo_bytes(chat_id, data, "item.jpg", &caption, keyboard.as_ref())
                    .await
            }
            OutgoingMessage::EditCaption { caption, keyboard } => {
                let message_id = require_message_id(event)?;
                self.edit_message_caption(chat_id, message_id, &caption, keyboard.as_ref())
                    .await
            }
            OutgoingMessage::DeleteMessage => {
                let message_id = require_message_id(event)?;
                self.delete_message(chat_id, message_id).await
            }
        }
    }

    async fn health_check(&self) -> Result<(), ChannelError> {
        let resp = self
            .client
            .get(self.api_url("getMe"))
            .send()
            .await
            .map_err(|e| ChannelError::StartupFailed {
                name: "telegram".into(),
                reason: e.to_string(),
            })?;

        if resp.status().is_success() {
            Ok(())
        } else {
            Err(ChannelError::StartupFailed {
                name: "telegram".into(),
                reason: format!("getMe returned {}", resp.status()),
            })
        }
    }

    async fn shutdown(&self) -> Result<(), ChannelError> {
        tracing::info!("Telegram channel shutting down");
        Ok(())
    }
}

// ── Update parsing ──────────────────────────────────────────────────

/// Identity fields shared by messages and callback queries.
fn sender_identities(from: &serde_json::Value) -> (String, Option<String>) {
    let username = from
        .get("username")
        .and_then(|u| u.as_str())
        .unwrap_or("unknown")
        .to_string();
    let user_id = from
        .get("id")
        .and_then(serde_json::Value::as_i64)
        .map(|id| id.to_string());
    (username, user_id)
}

/// Check if any identity in the iterator matches the allowed users list.
fn check_user_allowed<'a>(
    allowed_users: &[String],
    identities: impl IntoIterator<Item = &'a str>,
) -> bool {
    let ids: Vec<&str> = identities.into_iter().collect();
    allowed_users
        .iter()
        .any(|u| u == "*" || ids.contains(&u.as_str()))
}

fn allowed(
    allowed_users: &[String],
    username: &str,
    user_id: Option<&str>,
) -> bool {
    let mut identities = vec![username];
    if let Some(id) = user_id {
        identities.push(id);
    }
    check_user_allowed(allowed_users, identities)
}

/// Turn a Telegram message into an incoming event. Photo messages are
/// downloaded to bytes here; messages without text or photo are dropped.
async fn parse_message(
    client: &reqwest::Client,
    bot_token: &str,
    allowed_users: &[String],
    message: &serde_json::Value,
) -> Option<IncomingEvent> {
    let from = message.get("from")?;
    let (username, user_id) = sender_identities(from);

    if !allowed(allowed_users, &username, user_id.as_deref()) {
        tracing::warn!(
            "Telegram: ignoring message from unauthorized user: \
             username={username}, user_id={}",
            user_id.as_deref().unwrap_or("unknown")
        );
        return None;
    }

    let chat_id = message
        .get("chat")
        .and_then(|c| c.get("id"))
        .and_then(serde_json::Value::as_i64)
        .map(|id| id.to_string())
        .unwrap_or_default();
    let message_id = message
        .get("message_id")
        .and_then(serde_json::Value::as_i64)
        .unwrap_or_default();

    let kind = if let Some(text) = message.get("text").and_then(serde_json::Value::as_str) {
        IncomingKind::Text(text.to_string())
    } else if let Some(sizes) = message.get("photo").and_then(serde_json::Value::as_array) {
        // The last size entry is the largest rendition.
        let file_id = sizes
            .last()
            .and_then(|p| p.get("file_id"))
            .and_then(|f| f.as_str())?;
        match download_file(client, bot_token, file_id).await {
            Ok(bytes) => IncomingKind::Photo(bytes),
            Err(e) => {
                tracing::warn!("Telegram photo download failed: {e}");
                return None;
            }
        }
    } else {
        return None;
    };

    Some(
        IncomingEvent::new("telegram", user_id.as_deref().unwrap_or(&username), kind)
            .with_metadata(json!({
                "chat_id": chat_id,
                "message_id": message_id,
                "username": username,
            })),
    )
}

/// Turn a callback query into a button event. The query is acknowledged
/// immediately so the client stops showing a spinner.
async fn parse_callback(
    client: &reqwest::Client,
    bot_token: &str,
    allowed_users: &[String],
    callback: &serde_json::Value,
) -> Option<IncomingEvent> {
    if let Some(callback_id) = callback.get("id").and_then(|i| i.as_str()) {
        let url = format!("https://api.telegram.org/bot{bot_token}/answerCallbackQuery");
        let _ = client
            .post(&url)
            .json(&json!({ "callback_query_id": callback_id }))
            .send()
            .await;
    }

    let from = callback.get("from")?;
    let (username, user_id) = sender_identities(from);

    if !allowed(allowed_users, &username, user_id.as_deref()) {
        tracing::warn!(
            "Telegram: ignoring callback from unauthorized user: username={username}"
        );
        return None;
    }

    let tag = callback.get("data").and_then(|d| d.as_str())?.to_string();

    // The message the button sat on: needed for caption edits and deletes.
    let origin = callback.get("message");
    let chat_id = origin
        .and_then(|m| m.get("chat"))
        .and_then(|c| c.get("id"))
        .and_then(serde_json::Value::as_i64)
        .map(|id| id.to_string())
        .unwrap_or_default();
    let message_id = origin
        .and_then(|m| m.get("message_id"))
        .and_then(serde_json::Value::as_i64)
        .unwrap_or_default();

    Some(
        IncomingEvent::new(
            "telegram",
            user_id.as_deref().unwrap_or(&username),
            IncomingKind::Button(tag),
        )
        .with_metadata(json!({
            "chat_id": chat_id,
            "message_id": message_id,
            "username": username,
        })),
    )
}

/// Download a file's bytes via getFile + the file endpoint.
async fn download_file(
    client: &reqwest::Client,
    bot_token: &str,
    file_id: &str,
) -> Result<Vec<u8>, ChannelError> {
    let url = format!("https://api.telegram.org/bot{bot_token}/getFile");
    let resp = client
        .post(&url)
        .json(&json!({ "file_id": file_id }))
        .send()
        .await
        .map_err(|e| ChannelError::SendFailed {
            name: "telegram".into(),
            reason: e.to_string(),
        })?;

    let data: serde_json::Value = resp.json().await.map_err(|e| ChannelError::SendFailed {
        name: "telegram".into(),
        reason: e.to_string(),
    })?;

    let file_path = data
        .get("result")
        .and_then(|r| r.get("file_path"))
        .and_then(|p| p.as_str())
        .ok_or_else(|| ChannelError::SendFailed {
            name: "telegram".into(),
            reason: "getFile returned no file_path".into(),
        })?;

    let file_url = format!("https://api.telegram.org/file/bot{bot_token}/{file_path}");
    let bytes = client
        .get(&file_url)
        .send()
        .await
        .map_err(|e| ChannelError::SendFailed {
            name: "telegram".into(),
            reason: e.to_string(),
        })?
        .bytes()
        .await
        .map_err(|e| ChannelError::SendFailed {
            name: "telegram".into(),
            reason: e.to_string(),
        })?;

    Ok(bytes.to_vec())
}

// ── Helpers ─────────────────────────────────────────────────────────

fn require_message_id(event: &IncomingEvent) -> Result<i64, ChannelError> {
    event
        .metadata
        .get("message_id")
        .and_then(serde_json::Value::as_i64)
        .filter(|id| *id != 0)
        .ok_or_else(|| ChannelError::SendFailed {
            name: "telegram".into(),
            reason: "No message_id in event metadata".into(),
        })
}

/// Render a keyboard as Telegram's reply_markup JSON.
fn keyboard_markup(keyboard: &Keyboard) -> serde_json::Value {
    match keyboard {
        Keyboard::Reply(rows) => json!({
            "keyboard": rows
                .iter()
                .map(|row| row.iter().map(|label| json!({ "text": label })).collect::<Vec<_>>())
                .collect::<Vec<_>>(),
            "resize_keyboard": true,
        }),
        Keyboard::Remove => json!({ "remove_keyboard": true }),
        Keyboard::Inline(rows) => json!({
            "inline_keyboard": rows
                .iter()
                .map(|row| {
                    row.iter()
                        .map(|b| json!({ "text": b.label, "callback_data": b.tag }))
                        .collect::<Vec<_>>()
                })
                .collect::<Vec<_>>(),
        }),
    }
}

/// Largest byte index `<= max` that falls on a char boundary of `s`.
fn floor_char_boundary(s: &str, max: usize) -> usize {
    if max >= s.len() {
        return s.len();
    }
    let mut i = max;
    while !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

/// Split a message into chunks that fit Telegram's character limit.
/// Tries to split on newlines, then spaces, then hard-cuts. Cuts land on
/// char boundaries, never inside a multi-byte character.
fn split_message(text: &str, max_len: usize) -> Vec<String> {
    if text.len() <= max_len {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut remaining = text;

    while !remaining.is_empty() {
        if remaining.len() <= max_len {
            chunks.push(remaining.to_string());
            break;
        }

        // Find a good split point. If max_len is smaller than the first
        // character, cut after that character rather than looping forever.
        let hard_end = match floor_char_boundary(remaining, max_len) {
            0 => remaining.chars().next().map_or(remaining.len(), char::len_utf8),
            n => n,
        };
        let chunk = &remaining[..hard_end];
        let split_at = chunk
            .rfind('\n')
            .or_else(|| chunk.rfind(' '))
            .unwrap_or(hard_end);

        // Don't split at position 0 (infinite loop guard)
        let split_at = if split_at == 0 { hard_end } else { split_at };

        chunks.push(remaining[..split_at].to_string());
        remaining = remaining[split_at..].trim_start();
    }

    chunks
}

// ── Tests ───────────────────────────────────────────────────────────
