//! Transport session contract shared by every chat channel.

use std::path::{Path, PathBuf};
use std::pin::Pin;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::error::ChannelError;

/// Kind of media carried by an inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentKind {
    Image,
    Video,
    Document,
}

impl AttachmentKind {
    /// File extension used when the transport gives no hint.
    pub fn default_extension(&self) -> &'static str {
        match self {
            Self::Image => "jpg",
            Self::Video => "mp4",
            Self::Document => "bin",
        }
    }
}

/// Reference to a media blob held by the transport.
///
/// The bytes stay on the transport side until a job asks for them through
/// [`Channel::download_attachment`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub kind: AttachmentKind,
    /// Transport-specific handle (Telegram `file_id`, for example).
    pub file_id: String,
    pub mime_type: Option<String>,
    pub file_name: Option<String>,
}

impl Attachment {
    pub fn new(kind: AttachmentKind, file_id: impl Into<String>) -> Self {
        Self {
            kind,
            file_id: file_id.into(),
            mime_type: None,
            file_name: None,
        }
    }

    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }

    pub fn with_file_name(mut self, file_name: impl Into<String>) -> Self {
        self.file_name = Some(file_name.into());
        self
    }

    /// Extension derived from the mime subtype (`video/mp4` → `mp4`).
    pub fn extension(&self) -> String {
        self.mime_type
            .as_deref()
            .and_then(|m| m.split('/').nth(1))
            .map(|ext| ext.split(';').next().unwrap_or(ext).trim().to_string())
            .filter(|ext| !ext.is_empty())
            .unwrap_or_else(|| self.kind.default_extension().to_string())
    }
}

/// A message received from a channel.
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    /// Channel the message arrived on.
    pub channel: String,
    /// Sender identity as reported by the transport.
    pub sender_id: String,
    /// Conversation replies should go to.
    pub chat_id: String,
    /// Text body or media caption. Empty when the message is media-only.
    pub text: String,
    pub attachment: Option<Attachment>,
    /// Authored by the account the bot is connected as.
    pub from_me: bool,
    pub received_at: DateTime<Utc>,
}

impl IncomingMessage {
    /// Create a message whose reply conversation is the sender itself.
    pub fn new(channel: impl Into<String>, sender_id: impl Into<String>, text: impl Into<String>) -> Self {
        let sender_id = sender_id.into();
        Self {
            channel: channel.into(),
            chat_id: sender_id.clone(),
            sender_id,
            text: text.into(),
            attachment: None,
            from_me: false,
            received_at: Utc::now(),
        }
    }

    pub fn with_chat(mut self, chat_id: impl Into<String>) -> Self {
        self.chat_id = chat_id.into();
        self
    }

    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.attachment = Some(attachment);
        self
    }

    pub fn from_self(mut self) -> Self {
        self.from_me = true;
        self
    }
}

/// Everything a transport session emits.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// Session is up. `account_id` is the identity the bot is connected as.
    Connected { account_id: String },
    /// Session dropped. Recoverable drops are followed by the channel's own
    /// reconnect loop; terminal ones (logout) are not.
    Disconnected { reason: String, recoverable: bool },
    Message(IncomingMessage),
}

/// Stream of transport events.
pub type EventStream = Pin<Box<dyn Stream<Item = TransportEvent> + Send>>;

/// A chat transport.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Channel name (e.g. "telegram", "cli").
    fn name(&self) -> &str;

    /// Connect and begin delivering events.
    async fn start(&self) -> Result<EventStream, ChannelError>;

    /// Send a text message to a conversation.
    async fn send(&self, chat_id: &str, text: &str) -> Result<(), ChannelError>;

    /// Download an attachment into `dest_dir`, returning the written file.
    async fn download_attachment(
        &self,
        attachment: &Attachment,
        dest_dir: &Path,
    ) -> Result<PathBuf, ChannelError>;

    async fn health_check(&self) -> Result<(), ChannelError>;

    async fn shutdown(&self) -> Result<(), ChannelError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn incoming_message_defaults_reply_to_sender() {
        let msg = IncomingMessage::new("telegram", "42", "hello");
        assert_eq!(msg.chat_id, "42");
        assert!(!msg.from_me);
        assert!(msg.attachment.is_none());
    }

    #[test]
    fn attachment_extension_from_mime() {
        let a = Attachment::new(AttachmentKind::Video, "f1").with_mime_type("video/quicktime");
        assert_eq!(a.extension(), "quicktime");
        let b = Attachment::new(AttachmentKind::Image, "f2");
        assert_eq!(b.extension(), "jpg");
        let c = Attachment::new(AttachmentKind::Image, "f3").with_mime_type("image/png; q=1");
        assert_eq!(c.extension(), "png");
    }
}
