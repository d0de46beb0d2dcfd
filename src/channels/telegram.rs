//! Telegram channel. Long-polls the Bot API for updates.
//!
//! The poll loop doubles as the session's reconnect loop: a failed poll
//! emits `Disconnected { recoverable: true }` once and retries with an
//! exponential backoff, a successful poll after that emits `Connected`
//! again, and a 401 from the Bot API is treated as a terminal logout.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use tokio::sync::mpsc::UnboundedSender;

use crate::channels::{
    Attachment, AttachmentKind, Channel, EventStream, IncomingMessage, TransportEvent,
};
use crate::error::ChannelError;

/// Maximum message length for Telegram's sendMessage API.
const TELEGRAM_MAX_MESSAGE_LENGTH: usize = 4096;

const API_BASE: &str = "https://api.telegram.org";

/// Telegram channel, connected to the Bot API via long-polling.
pub struct TelegramChannel {
    bot_token: SecretString,
    client: reqwest::Client,
    initial_backoff: Duration,
    max_backoff: Duration,
}

impl TelegramChannel {
    pub fn new(bot_token: SecretString) -> Self {
        Self {
            bot_token,
            client: reqwest::Client::new(),
            initial_backoff: Duration::from_secs(5),
            max_backoff: Duration::from_secs(60),
        }
    }

    /// Override the reconnect backoff window.
    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max.max(initial);
        self
    }

    fn api_url(&self, method: &str) -> String {
        api_url(self.bot_token.expose_secret(), method)
    }

    /// Send a text message, trying Markdown first with plain text fallback.
    /// Splits long messages that exceed Telegram's 4096 char limit.
    async fn send_message(&self, chat_id: &str, text: &str) -> Result<(), ChannelError> {
        let chunks = split_message(text, TELEGRAM_MAX_MESSAGE_LENGTH);

        for chunk in &chunks {
            self.send_message_chunk(chat_id, chunk).await?;
        }
        Ok(())
    }

    /// Send a single message chunk (≤4096 chars), Markdown-first with fallback.
    async fn send_message_chunk(&self, chat_id: &str, text: &str) -> Result<(), ChannelError> {
        let markdown_body = serde_json::json!({
            "chat_id": chat_id,
            "text": text,
            "parse_mode": "Markdown"
        });

        let markdown_resp = self
            .client
            .post(self.api_url("sendMessage"))
            .json(&markdown_body)
            .send()
            .await
            .map_err(|e| send_failed(e.to_string()))?;

        if markdown_resp.status().is_success() {
            return Ok(());
        }

        let markdown_status = markdown_resp.status();
        tracing::warn!(
            status = ?markdown_status,
            "Telegram sendMessage with Markdown failed; retrying without parse_mode"
        );

        let plain_body = serde_json::json!({
            "chat_id": chat_id,
            "text": text,
        });
        let plain_resp = self
            .client
            .post(self.api_url("sendMessage"))
            .json(&plain_body)
            .send()
            .await
            .map_err(|e| send_failed(e.to_string()))?;

        if !plain_resp.status().is_success() {
            let plain_err = plain_resp.text().await.unwrap_or_default();
            return Err(send_failed(format!(
                "sendMessage failed (markdown: {}, plain: {})",
                markdown_status, plain_err
            )));
        }

        Ok(())
    }

    /// Resolve a `file_id` to a downloadable path on Telegram's file server.
    async fn resolve_file_path(&self, file_id: &str) -> Result<String, ChannelError> {
        let resp = self
            .client
            .post(self.api_url("getFile"))
            .json(&serde_json::json!({ "file_id": file_id }))
            .send()
            .await
            .map_err(|e| download_failed(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(download_failed(format!("getFile returned {}", resp.status())));
        }

        let data: Value = resp
            .json()
            .await
            .map_err(|e| download_failed(e.to_string()))?;

        data.get("result")
            .and_then(|r| r.get("file_path"))
            .and_then(Value::as_str)
            .map(String::from)
            .ok_or_else(|| download_failed("getFile response has no file_path".into()))
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
        let poller = Poller {
            token: self.bot_token.clone(),
            client: self.client.clone(),
            initial_backoff: self.initial_backoff,
            max_backoff: self.max_backoff,
        };

        tokio::spawn(async move { poller.run(tx).await });

        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        });

        Ok(Box::pin(stream))
    }

    async fn send(&self, chat_id: &str, text: &str) -> Result<(), ChannelError> {
        self.send_message(chat_id, text).await
    }

    async fn download_attachment(
        &self,
        attachment: &Attachment,
        dest_dir: &Path,
    ) -> Result<PathBuf, ChannelError> {
        let file_path = self.resolve_file_path(&attachment.file_id).await?;
        let url = format!(
            "{API_BASE}/file/bot{}/{file_path}",
            self.bot_token.expose_secret()
        );

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| download_failed(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(download_failed(format!("file download returned {}", resp.status())));
        }
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| download_failed(e.to_string()))?;

        let stamp = chrono::Utc::now().timestamp_millis();
        let target = dest_dir.join(format!("media_{stamp}.{}", attachment.extension()));
        tokio::fs::write(&target, &bytes)
            .await
            .map_err(|e| download_failed(e.to_string()))?;

        tracing::info!(path = %target.display(), size = bytes.len(), "Telegram attachment saved");
        Ok(target)
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

// ── Poll loop ───────────────────────────────────────────────────────

enum PollError {
    /// Network or server trouble; the loop retries.
    Transient(String),
    /// The token was rejected; the session is over.
    Unauthorized(String),
}

struct Poller {
    token: SecretString,
    client: reqwest::Client,
    initial_backoff: Duration,
    max_backoff: Duration,
}

impl Poller {
    async fn run(self, tx: UnboundedSender<TransportEvent>) {
        let mut offset: i64 = 0;
        let mut account: Option<String> = None;
        let mut backoff = self.initial_backoff;

        tracing::info!("Telegram channel listening for messages...");

        loop {
            let result = match account.clone() {
                Some(bot_id) => self.poll(offset, &bot_id).await,
                None => match self.get_me().await {
                    Ok(bot_id) => {
                        tracing::info!(bot_id = %bot_id, "Telegram session connected");
                        account = Some(bot_id.clone());
                        backoff = self.initial_backoff;
                        if tx
                            .send(TransportEvent::Connected {
                                account_id: bot_id.clone(),
                            })
                            .is_err()
                        {
                            return;
                        }
                        self.poll(offset, &bot_id).await
                    }
                    Err(e) => Err(e),
                },
            };

            match result {
                Ok(updates) => {
                    for (update_id, message) in updates {
                        offset = update_id + 1;
                        let Some(message) = message else { continue };
                        if tx.send(TransportEvent::Message(message)).is_err() {
                            tracing::info!("Telegram listener channel closed");
                            return;
                        }
                    }
                }
                Err(PollError::Unauthorized(reason)) => {
                    tracing::error!(%reason, "Telegram rejected the bot token; stopping");
                    let _ = tx.send(TransportEvent::Disconnected {
                        reason,
                        recoverable: false,
                    });
                    return;
                }
                Err(PollError::Transient(reason)) => {
                    if account.take().is_some() {
                        tracing::warn!(%reason, "Telegram session lost");
                        if tx
                            .send(TransportEvent::Disconnected {
                                reason: reason.clone(),
                                recoverable: true,
                            })
                            .is_err()
                        {
                            return;
                        }
                    }
                    tracing::warn!(
                        %reason,
                        backoff_secs = backoff.as_secs(),
                        "Telegram poll failed, reconnecting after backoff"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = std::cmp::min(backoff * 2, self.max_backoff);
                }
            }
        }
    }

    async fn get_me(&self) -> Result<String, PollError> {
        let resp = self
            .client
            .get(api_url(self.token.expose_secret(), "getMe"))
            .send()
            .await
            .map_err(|e| PollError::Transient(e.to_string()))?;
        let data = read_api_response(resp).await?;
        data.get("result")
            .and_then(|r| r.get("id"))
            .and_then(Value::as_i64)
            .map(|id| id.to_string())
            .ok_or_else(|| PollError::Transient("getMe response has no id".into()))
    }

    async fn poll(
        &self,
        offset: i64,
        bot_id: &str,
    ) -> Result<Vec<(i64, Option<IncomingMessage>)>, PollError> {
        let body = serde_json::json!({
            "offset": offset,
            "timeout": 30,
            "allowed_updates": ["message"]
        });

        let resp = self
            .client
            .post(api_url(self.token.expose_secret(), "getUpdates"))
            .json(&body)
            .send()
            .await
            .map_err(|e| PollError::Transient(e.to_string()))?;
        let data = read_api_response(resp).await?;

        let updates = data
            .get("result")
            .and_then(Value::as_array)
            .map(|results| {
                results
                    .iter()
                    .filter_map(|update| {
                        let id = update.get("update_id").and_then(Value::as_i64)?;
                        Some((id, parse_update(update, bot_id)))
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(updates)
    }
}

async fn read_api_response(resp: reqwest::Response) -> Result<Value, PollError> {
    let status = resp.status();
    if status == reqwest::StatusCode::UNAUTHORIZED {
        let body = resp.text().await.unwrap_or_default();
        return Err(PollError::Unauthorized(format!("401 Unauthorized: {body}")));
    }
    if !status.is_success() {
        return Err(PollError::Transient(format!("Bot API returned {status}")));
    }
    resp.json()
        .await
        .map_err(|e| PollError::Transient(format!("Telegram parse error: {e}")))
}

// ── Helpers ─────────────────────────────────────────────────────────

fn api_url(token: &str, method: &str) -> String {
    format!("{API_BASE}/bot{token}/{method}")
}

fn send_failed(reason: String) -> ChannelError {
    ChannelError::SendFailed {
        name: "telegram".into(),
        reason,
    }
}

fn download_failed(reason: String) -> ChannelError {
    ChannelError::DownloadFailed {
        name: "telegram".into(),
        reason,
    }
}

/// Turn a Bot API update into an inbound message.
///
/// Returns `None` for updates that carry neither text nor supported media.
fn parse_update(update: &Value, bot_id: &str) -> Option<IncomingMessage> {
    let message = update.get("message")?;

    let sender_id = message
        .get("from")
        .and_then(|f| f.get("id"))
        .and_then(Value::as_i64)
        .map(|id| id.to_string())?;

    let chat_id = message
        .get("chat")
        .and_then(|c| c.get("id"))
        .and_then(Value::as_i64)
        .map(|id| id.to_string())
        .unwrap_or_else(|| sender_id.clone());

    let text = message
        .get("text")
        .or_else(|| message.get("caption"))
        .and_then(Value::as_str)
        .unwrap_or_default();

    let attachment = parse_attachment(message);
    if text.is_empty() && attachment.is_none() {
        return None;
    }

    let mut incoming = IncomingMessage::new("telegram", &sender_id, text).with_chat(chat_id);
    if let Some(attachment) = attachment {
        incoming = incoming.with_attachment(attachment);
    }
    if sender_id == bot_id {
        incoming = incoming.from_self();
    }
    Some(incoming)
}

fn parse_attachment(message: &Value) -> Option<Attachment> {
    // Photos arrive as an array of sizes, largest last.
    if let Some(photo) = message
        .get("photo")
        .and_then(Value::as_array)
        .and_then(|sizes| sizes.last())
    {
        let file_id = photo.get("file_id").and_then(Value::as_str)?;
        return Some(Attachment::new(AttachmentKind::Image, file_id).with_mime_type("image/jpeg"));
    }

    if let Some(video) = message.get("video") {
        let file_id = video.get("file_id").and_then(Value::as_str)?;
        let mut attachment = Attachment::new(AttachmentKind::Video, file_id);
        if let Some(mime) = video.get("mime_type").and_then(Value::as_str) {
            attachment = attachment.with_mime_type(mime);
        }
        return Some(attachment);
    }

    let document = message.get("document")?;
    let file_id = document.get("file_id").and_then(Value::as_str)?;
    let mime = document.get("mime_type").and_then(Value::as_str);
    let kind = match mime {
        Some(m) if m.starts_with("image/") => AttachmentKind::Image,
        Some(m) if m.starts_with("video/") => AttachmentKind::Video,
        _ => AttachmentKind::Document,
    };
    let mut attachment = Attachment::new(kind, file_id);
    if let Some(mime) = mime {
        attachment = attachment.with_mime_type(mime);
    }
    if let Some(name) = document.get("file_name").and_then(Value::as_str) {
        attachment = attachment.with_file_name(name);
    }
    Some(attachment)
}

/// Split a message into chunks that fit Telegram's character limit.
/// Tries to split on newlines, then spaces, then hard-cuts.
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

        let mut cut = max_len;
        while !remaining.is_char_boundary(cut) {
            cut -= 1;
        }
        let chunk = &remaining[..cut];
        let split_at = chunk
            .rfind('\n')
            .or_else(|| chunk.rfind(' '))
            .unwrap_or(cut);

        // Don't split at position 0 (infinite loop guard)
        let split_at = if split_at == 0 { cut } else { split_at };

        chunks.push(remaining[..split_at].to_string());
        remaining = remaining[split_at..].trim_start();
    }

    chunks
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn channel() -> TelegramChannel {
        TelegramChannel::new(SecretString::from("123:ABC"))
    }

    #[test]
    fn telegram_channel_name() {
        assert_eq!(channel().name(), "telegram");
    }

    #[test]
    fn telegram_api_url() {
        assert_eq!(
            channel().api_url("getMe"),
            "https://api.telegram.org/bot123:ABC/getMe"
        );
    }

    #[test]
    fn backoff_max_never_below_initial() {
        let ch = channel().with_backoff(Duration::from_secs(10), Duration::from_secs(1));
        assert_eq!(ch.max_backoff, Duration::from_secs(10));
    }

    // ── Update parsing ──────────────────────────────────────────────

    #[test]
    fn parse_text_update() {
        let update = serde_json::json!({
            "update_id": 7,
            "message": {
                "from": {"id": 111, "username": "alice"},
                "chat": {"id": 222},
                "text": "https://example.com/v"
            }
        });
        let msg = parse_update(&update, "999").unwrap();
        assert_eq!(msg.sender_id, "111");
        assert_eq!(msg.chat_id, "222");
        assert_eq!(msg.text, "https://example.com/v");
        assert!(!msg.from_me);
        assert!(msg.attachment.is_none());
    }

    #[test]
    fn parse_photo_picks_largest_size() {
        let update = serde_json::json!({
            "update_id": 8,
            "message": {
                "from": {"id": 111},
                "chat": {"id": 111},
                "photo": [{"file_id": "small"}, {"file_id": "large"}]
            }
        });
        let msg = parse_update(&update, "999").unwrap();
        let attachment = msg.attachment.unwrap();
        assert_eq!(attachment.file_id, "large");
        assert_eq!(attachment.kind, AttachmentKind::Image);
        assert!(msg.text.is_empty());
    }

    #[test]
    fn parse_video_with_caption() {
        let update = serde_json::json!({
            "update_id": 9,
            "message": {
                "from": {"id": 111},
                "chat": {"id": 111},
                "caption": "look",
                "video": {"file_id": "vid", "mime_type": "video/mp4"}
            }
        });
        let msg = parse_update(&update, "999").unwrap();
        assert_eq!(msg.text, "look");
        let attachment = msg.attachment.unwrap();
        assert_eq!(attachment.kind, AttachmentKind::Video);
        assert_eq!(attachment.extension(), "mp4");
    }

    #[test]
    fn parse_document_classified_by_mime() {
        let update = serde_json::json!({
            "update_id": 10,
            "message": {
                "from": {"id": 111},
                "chat": {"id": 111},
                "document": {"file_id": "doc", "mime_type": "image/png", "file_name": "a.png"}
            }
        });
        let attachment = parse_update(&update, "999").unwrap().attachment.unwrap();
        assert_eq!(attachment.kind, AttachmentKind::Image);
        assert_eq!(attachment.file_name.as_deref(), Some("a.png"));
    }

    #[test]
    fn parse_update_from_bot_account_is_self_authored() {
        let update = serde_json::json!({
            "update_id": 11,
            "message": {"from": {"id": 999}, "chat": {"id": 5}, "text": ".on"}
        });
        assert!(parse_update(&update, "999").unwrap().from_me);
    }

    #[test]
    fn parse_update_without_content_is_skipped() {
        let update = serde_json::json!({
            "update_id": 12,
            "message": {"from": {"id": 111}, "chat": {"id": 111}, "sticker": {}}
        });
        assert!(parse_update(&update, "999").is_none());
    }

    // ── Message splitting tests ─────────────────────────────────────

    #[test]
    fn split_message_short() {
        let chunks = split_message("Hello", 4096);
        assert_eq!(chunks, vec!["Hello"]);
    }

    #[test]
    fn split_message_exact_limit() {
        let msg = "a".repeat(4096);
        let chunks = split_message(&msg, 4096);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].len(), 4096);
    }

    #[test]
    fn split_message_over_limit_on_newline() {
        let msg = format!("{}\n{}", "a".repeat(2000), "b".repeat(3000));
        let chunks = split_message(&msg, 4096);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0], "a".repeat(2000));
        assert_eq!(chunks[1], "b".repeat(3000));
    }

    #[test]
    fn split_message_no_good_split_point() {
        let msg = "a".repeat(5000);
        let chunks = split_message(&msg, 4096);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].len(), 4096);
        assert_eq!(chunks[1].len(), 904);
    }

    #[test]
    fn split_message_respects_char_boundaries() {
        let msg = "é".repeat(3000);
        let chunks = split_message(&msg, 4096);
        assert_eq!(chunks.concat(), msg);
        assert!(chunks.iter().all(|c| c.len() <= 4096));
    }
}
