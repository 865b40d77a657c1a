//! Channel, render sink and media resolver traits.
//!
//! A Channel connects Parley to a messaging platform (Telegram, the terminal).
//! It yields incoming messages and, through [`RenderSink`], shows the
//! assistant's answer as it grows.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ChannelError;
use crate::message::{ContentBlock, ConversationId, MediaPart};

/// Unique identifier for a channel instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelId(pub String);

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A message received from a channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelMessage {
    /// The channel this message belongs to
    pub channel_id: ChannelId,

    /// Conversation the message belongs to (chat, or chat thread)
    pub conversation_id: ConversationId,

    /// Sender identifier (platform-specific user ID)
    pub sender_id: String,

    /// Human-readable sender name (if available)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,

    /// Sender's language code (if the platform reports one)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_language: Option<String>,

    /// The text content (message text or media caption)
    pub content: String,

    /// Attachments (images, documents)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
}

impl ChannelMessage {
    /// The message as user content blocks: attachments first, then text.
    pub fn to_blocks(&self) -> Vec<ContentBlock> {
        let mut blocks: Vec<ContentBlock> = self.attachments.iter().map(Attachment::to_block).collect();
        if !self.content.trim().is_empty() {
            blocks.push(ContentBlock::text(self.content.clone()));
        }
        blocks
    }

    /// If the text is a slash command, its name without the slash or bot suffix.
    pub fn command(&self) -> Option<&str> {
        let first = self.content.split_whitespace().next()?;
        let name = first.strip_prefix('/')?;
        Some(name.split('@').next().unwrap_or(name))
    }
}

/// An attachment in a channel message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    /// Type of attachment
    pub kind: AttachmentKind,

    /// Platform file identifier
    pub file_id: String,

    /// Optional filename
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,

    /// MIME type
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

impl Attachment {
    pub fn to_block(&self) -> ContentBlock {
        match self.kind {
            AttachmentKind::Image => ContentBlock::Image {
                file_id: self.file_id.clone(),
                mime_type: self.mime_type.clone().unwrap_or_else(|| "image/jpeg".into()),
            },
            AttachmentKind::Document => ContentBlock::Document {
                file_id: self.file_id.clone(),
                filename: self.filename.clone().unwrap_or_else(|| "document".into()),
                mime_type: self
                    .mime_type
                    .clone()
                    .unwrap_or_else(|| "application/octet-stream".into()),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentKind {
    Image,
    Document,
}

/// The core Channel trait.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Human-readable channel name (e.g., "telegram", "cli").
    fn name(&self) -> &str;

    /// Start listening for incoming messages.
    async fn start(
        &self,
    ) -> std::result::Result<
        tokio::sync::mpsc::Receiver<std::result::Result<ChannelMessage, ChannelError>>,
        ChannelError,
    >;

    /// Send a standalone message (command replies, errors).
    async fn send(&self, conversation_id: &ConversationId, content: &str) -> std::result::Result<(), ChannelError>;

    /// Send a typing indicator (if the platform supports it).
    async fn send_typing(&self, _conversation_id: &ConversationId) -> std::result::Result<(), ChannelError> {
        Ok(())
    }

    /// Stop the channel gracefully.
    async fn stop(&self) -> std::result::Result<(), ChannelError> {
        Ok(())
    }

    /// Health check — is the channel connected and operational?
    async fn health_check(&self) -> std::result::Result<bool, ChannelError> {
        Ok(true)
    }
}

/// Where incremental snapshots of an answer are shown.
///
/// Each conversation has at most one live message. `push_update` replaces its
/// full text (creating it on first push); `seal` freezes it so the next push
/// starts a fresh message.
#[async_trait]
pub trait RenderSink: Send + Sync {
    async fn push_update(&self, conversation_id: &ConversationId, text: &str) -> std::result::Result<(), ChannelError>;

    async fn seal(&self, conversation_id: &ConversationId) -> std::result::Result<(), ChannelError>;

    /// Largest snapshot, in characters, one message can hold.
    fn max_payload(&self) -> usize;
}

/// Turns stored media references into provider-consumable parts.
#[async_trait]
pub trait MediaResolver: Send + Sync {
    async fn resolve(&self, block: &ContentBlock) -> std::result::Result<MediaPart, ChannelError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(content: &str) -> ChannelMessage {
        ChannelMessage {
            channel_id: ChannelId("telegram".into()),
            conversation_id: ConversationId::from("tg:1"),
            sender_id: "12345".into(),
            sender_name: Some("Alice".into()),
            sender_language: None,
            content: content.into(),
            attachments: vec![],
        }
    }

    #[test]
    fn command_strips_bot_suffix() {
        assert_eq!(message("/redo@parley_bot").command(), Some("redo"));
        assert_eq!(message("/thinking on").command(), Some("thinking"));
        assert_eq!(message("hello").command(), None);
    }

    #[test]
    fn blocks_put_attachments_before_caption() {
        let mut msg = message("what is this?");
        msg.attachments.push(Attachment {
            kind: AttachmentKind::Image,
            file_id: "photo-1".into(),
            filename: None,
            mime_type: None,
        });
        let blocks = msg.to_blocks();
        assert_eq!(blocks.len(), 2);
        assert!(matches!(&blocks[0], ContentBlock::Image { file_id, .. } if file_id == "photo-1"));
        assert_eq!(blocks[1], ContentBlock::text("what is this?"));
    }

    #[test]
    fn blank_caption_is_dropped() {
        let mut msg = message("  ");
        msg.attachments.push(Attachment {
            kind: AttachmentKind::Document,
            file_id: "doc".into(),
            filename: Some("a.pdf".into()),
            mime_type: Some("application/pdf".into()),
        });
        assert_eq!(msg.to_blocks().len(), 1);
    }
}
