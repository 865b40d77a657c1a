//! Telegram channel adapter over the Bot HTTP API.
//!
//! Long polling (`getUpdates`) feeds incoming messages; answers are streamed by
//! sending one message and then editing it in place. Forum threads are kept
//! apart: the conversation id is `tg:{chat_id}` or `tg:{chat_id}:{thread_id}`.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use dashmap::DashMap;
use parley_config::TelegramConfig;
use parley_core::channel::{
    Attachment, AttachmentKind, Channel, ChannelId, ChannelMessage, MediaResolver, RenderSink,
};
use parley_core::error::ChannelError;
use parley_core::message::{ContentBlock, ConversationId, MediaPart};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const CHANNEL: &str = "telegram";

/// Thin client for the handful of Bot API methods Parley uses.
struct BotApi {
    client: reqwest::Client,
    method_base: String,
    file_base: String,
}

impl BotApi {
    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        body: serde_json::Value,
    ) -> Result<T, ChannelError> {
        let response = self
            .client
            .post(format!("{}/{}", self.method_base, method))
            .json(&body)
            .send()
            .await
            .map_err(|e| ChannelError::ConnectionLost(format!("{method}: {e}")))?;

        let envelope: ApiResponse<T> = response
            .json()
            .await
            .map_err(|e| ChannelError::InvalidPayload(format!("{method}: {e}")))?;
        envelope.into_result(method)
    }

    async fn download(&self, file_path: &str) -> Result<Vec<u8>, ChannelError> {
        let response = self
            .client
            .get(format!("{}/{}", self.file_base, file_path))
            .send()
            .await
            .map_err(|e| ChannelError::MediaUnavailable(e.to_string()))?;
        if !response.status().is_success() {
            return Err(ChannelError::MediaUnavailable(format!(
                "download returned HTTP {}",
                response.status().as_u16()
            )));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| ChannelError::MediaUnavailable(e.to_string()))?;
        Ok(bytes.to_vec())
    }
}

/// The message currently being edited in a conversation.
#[derive(Debug, Clone)]
struct LiveMessage {
    message_id: i64,
    text: String,
}

/// Telegram channel adapter.
pub struct TelegramChannel {
    api: Arc<BotApi>,
    channel_id: ChannelId,
    poll_timeout_secs: u64,
    max_payload: usize,
    live: DashMap<ConversationId, LiveMessage>,
    shutdown: CancellationToken,
}

impl TelegramChannel {
    pub fn new(config: &TelegramConfig, max_payload: usize) -> Result<Self, ChannelError> {
        let token = config
            .bot_token
            .as_deref()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ChannelError::NotConfigured("telegram.bot_token / TELEGRAM_BOT_TOKEN is not set".into()))?;

        // Long polls hold the request open for poll_timeout_secs.
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.poll_timeout_secs + 15))
            .build()
            .map_err(|e| ChannelError::NotConfigured(format!("HTTP client: {e}")))?;

        let api_base = config.api_base.trim_end_matches('/');
        Ok(Self {
            api: Arc::new(BotApi {
                client,
                method_base: format!("{api_base}/bot{token}"),
                file_base: format!("{api_base}/file/bot{token}"),
            }),
            channel_id: ChannelId(CHANNEL.into()),
            poll_timeout_secs: config.poll_timeout_secs,
            max_payload,
            live: DashMap::new(),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn id(&self) -> &ChannelId {
        &self.channel_id
    }

    /// The bot's own username, via `getMe`.
    pub async fn username(&self) -> Result<String, ChannelError> {
        let me: TgUser = self.api.call("getMe", serde_json::json!({})).await?;
        Ok(me.username.unwrap_or(me.first_name))
    }

    async fn send_text(&self, conversation_id: &ConversationId, text: &str) -> Result<i64, ChannelError> {
        let (chat_id, thread_id) = parse_conversation_id(conversation_id)?;
        let mut body = serde_json::json!({ "chat_id": chat_id, "text": text });
        if let Some(thread_id) = thread_id {
            body["message_thread_id"] = thread_id.into();
        }
        let sent: TgMessage = self.api.call("sendMessage", body).await?;
        Ok(sent.message_id)
    }

    async fn edit_text(
        &self,
        conversation_id: &ConversationId,
        message_id: i64,
        text: &str,
    ) -> Result<(), ChannelError> {
        let (chat_id, _) = parse_conversation_id(conversation_id)?;
        let body = serde_json::json!({ "chat_id": chat_id, "message_id": message_id, "text": text });
        match self.api.call::<serde_json::Value>("editMessageText", body).await {
            Ok(_) => Ok(()),
            Err(ChannelError::DeliveryFailed { reason, .. }) if reason.contains("message is not modified") => {
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl Channel for TelegramChannel {
    fn name(&self) -> &str {
        CHANNEL
    }

    async fn start(
        &self,
    ) -> Result<mpsc::Receiver<Result<ChannelMessage, ChannelError>>, ChannelError> {
        let (tx, rx) = mpsc::channel(64);
        let api = self.api.clone();
        let shutdown = self.shutdown.clone();
        let channel_id = self.channel_id.clone();
        let poll_timeout = self.poll_timeout_secs;

        info!("Telegram long polling started");
        tokio::spawn(async move {
            let mut offset: i64 = 0;
            loop {
                let body = serde_json::json!({
                    "offset": offset,
                    "timeout": poll_timeout,
                    "allowed_updates": ["message"],
                });
                let result = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    r = api.call::<Vec<TgUpdate>>("getUpdates", body) => r,
                };

                let updates = match result {
                    Ok(updates) => updates,
                    Err(ChannelError::RateLimited { retry_after_secs, .. }) => {
                        tokio::time::sleep(Duration::from_secs(retry_after_secs)).await;
                        continue;
                    }
                    Err(e) => {
                        warn!(error = %e, "Telegram polling failed, retrying");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        continue;
                    }
                };

                for update in updates {
                    offset = offset.max(update.update_id + 1);
                    let Some(message) = update.message.and_then(|m| m.into_channel_message(&channel_id)) else {
                        continue;
                    };
                    if tx.send(Ok(message)).await.is_err() {
                        debug!("Telegram receiver dropped, stopping poll loop");
                        return;
                    }
                }
            }
            info!("Telegram long polling stopped");
        });

        Ok(rx)
    }

    async fn send(&self, conversation_id: &ConversationId, content: &str) -> Result<(), ChannelError> {
        self.send_text(conversation_id, content).await.map(|_| ())
    }

    async fn send_typing(&self, conversation_id: &ConversationId) -> Result<(), ChannelError> {
        let (chat_id, thread_id) = parse_conversation_id(conversation_id)?;
        let mut body = serde_json::json!({ "chat_id": chat_id, "action": "typing" });
        if let Some(thread_id) = thread_id {
            body["message_thread_id"] = thread_id.into();
        }
        self.api.call::<bool>("sendChatAction", body).await.map(|_| ())
    }

    async fn stop(&self) -> Result<(), ChannelError> {
        info!("Telegram channel stopping");
        self.shutdown.cancel();
        Ok(())
    }

    async fn health_check(&self) -> Result<bool, ChannelError> {
        self.username().await.map(|_| true)
    }
}

#[async_trait]
impl RenderSink for TelegramChannel {
    async fn push_update(&self, conversation_id: &ConversationId, text: &str) -> Result<(), ChannelError> {
        let live = self.live.get(conversation_id).map(|entry| entry.value().clone());
        match live {
            Some(live) if live.text == text => Ok(()),
            Some(live) => {
                self.edit_text(conversation_id, live.message_id, text).await?;
                self.live.insert(
                    conversation_id.clone(),
                    LiveMessage {
                        message_id: live.message_id,
                        text: text.to_string(),
                    },
                );
                Ok(())
            }
            None => {
                let message_id = self.send_text(conversation_id, text).await?;
                self.live.insert(
                    conversation_id.clone(),
                    LiveMessage {
                        message_id,
                        text: text.to_string(),
                    },
                );
                Ok(())
            }
        }
    }

    async fn seal(&self, conversation_id: &ConversationId) -> Result<(), ChannelError> {
        self.live.remove(conversation_id);
        Ok(())
    }

    fn max_payload(&self) -> usize {
        self.max_payload
    }
}

#[async_trait]
impl MediaResolver for TelegramChannel {
    async fn resolve(&self, block: &ContentBlock) -> Result<MediaPart, ChannelError> {
        let file_id = match block {
            ContentBlock::Image { file_id, .. } | ContentBlock::Document { file_id, .. } => file_id,
            other => {
                return Err(ChannelError::MediaUnavailable(format!(
                    "'{}' block is not media",
                    other.kind()
                )));
            }
        };

        let file: TgFile = self
            .api
            .call("getFile", serde_json::json!({ "file_id": file_id }))
            .await
            .map_err(|e| ChannelError::MediaUnavailable(e.to_string()))?;
        let path = file
            .file_path
            .ok_or_else(|| ChannelError::MediaUnavailable(format!("no file path for {file_id}")))?;
        let bytes = self.api.download(&path).await?;
        let encoded = BASE64.encode(bytes);

        Ok(match block {
            ContentBlock::Document { filename, mime_type, .. } => MediaPart::Document {
                filename: filename.clone(),
                data_url: format!("data:{mime_type};base64,{encoded}"),
            },
            _ => MediaPart::Image {
                url: format!("data:{};base64,{encoded}", image_mime(&path)),
            },
        })
    }
}

/// Split a `tg:{chat}[:{thread}]` conversation id.
pub fn parse_conversation_id(id: &ConversationId) -> Result<(i64, Option<i64>), ChannelError> {
    let invalid = || ChannelError::InvalidPayload(format!("not a Telegram conversation: {id}"));
    let rest = id.as_str().strip_prefix("tg:").ok_or_else(invalid)?;
    let mut parts = rest.splitn(2, ':');
    let chat_id = parts
        .next()
        .and_then(|p| p.parse::<i64>().ok())
        .ok_or_else(invalid)?;
    let thread_id = match parts.next() {
        Some(p) => Some(p.parse::<i64>().map_err(|_| invalid())?),
        None => None,
    };
    Ok((chat_id, thread_id))
}

pub fn conversation_id(chat_id: i64, thread_id: Option<i64>) -> ConversationId {
    match thread_id {
        Some(thread) => ConversationId(format!("tg:{chat_id}:{thread}")),
        None => ConversationId(format!("tg:{chat_id}")),
    }
}

fn image_mime(path: &str) -> &'static str {
    let ext = Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    match ext.as_deref() {
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        _ => "image/jpeg",
    }
}

// --- Bot API types (internal) ---

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    error_code: Option<u16>,
    #[serde(default)]
    parameters: Option<ResponseParameters>,
}

#[derive(Debug, Deserialize)]
struct ResponseParameters {
    retry_after: Option<u64>,
}

impl<T> ApiResponse<T> {
    fn into_result(self, method: &str) -> Result<T, ChannelError> {
        if self.ok {
            return self
                .result
                .ok_or_else(|| ChannelError::InvalidPayload(format!("{method}: ok response without result")));
        }
        if self.error_code == Some(429) {
            let retry_after_secs = self.parameters.and_then(|p| p.retry_after).unwrap_or(1);
            return Err(ChannelError::RateLimited {
                channel: CHANNEL.into(),
                retry_after_secs,
            });
        }
        Err(ChannelError::DeliveryFailed {
            channel: CHANNEL.into(),
            reason: format!(
                "{method}: {}",
                self.description.unwrap_or_else(|| "unknown error".into())
            ),
        })
    }
}

#[derive(Debug, Deserialize)]
struct TgUpdate {
    update_id: i64,
    message: Option<TgMessage>,
}

#[derive(Debug, Deserialize)]
struct TgMessage {
    message_id: i64,
    chat: TgChat,
    from: Option<TgUser>,
    message_thread_id: Option<i64>,
    text: Option<String>,
    caption: Option<String>,
    photo: Option<Vec<TgPhotoSize>>,
    document: Option<TgDocument>,
}

#[derive(Debug, Deserialize)]
struct TgChat {
    id: i64,
}

#[derive(Debug, Deserialize)]
struct TgUser {
    id: i64,
    #[serde(default)]
    first_name: String,
    username: Option<String>,
    language_code: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TgPhotoSize {
    file_id: String,
}

#[derive(Debug, Deserialize)]
struct TgDocument {
    file_id: String,
    file_name: Option<String>,
    mime_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TgFile {
    file_path: Option<String>,
}

impl TgMessage {
    fn into_channel_message(self, channel_id: &ChannelId) -> Option<ChannelMessage> {
        let from = self.from?;
        let mut attachments = Vec::new();
        // Sizes are ascending; the last is the largest.
        if let Some(photo) = self.photo.and_then(|sizes| sizes.into_iter().last()) {
            attachments.push(Attachment {
                kind: AttachmentKind::Image,
                file_id: photo.file_id,
                filename: None,
                mime_type: None,
            });
        }
        if let Some(doc) = self.document {
            let is_image = doc.mime_type.as_deref().is_some_and(|m| m.starts_with("image/"));
            attachments.push(Attachment {
                kind: if is_image { AttachmentKind::Image } else { AttachmentKind::Document },
                file_id: doc.file_id,
                filename: doc.file_name,
                mime_type: doc.mime_type,
            });
        }

        let content = self.text.or(self.caption).unwrap_or_default();
        if content.trim().is_empty() && attachments.is_empty() {
            return None;
        }

        Some(ChannelMessage {
            channel_id: channel_id.clone(),
            conversation_id: conversation_id(self.chat.id, self.message_thread_id),
            sender_id: from.id.to_string(),
            sender_name: Some(from.first_name).filter(|n| !n.is_empty()).or(from.username),
            sender_language: from.language_code,
            content,
            attachments,
        })
    }
}
