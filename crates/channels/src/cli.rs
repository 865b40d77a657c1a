//! CLI channel — interactive terminal-based chat.
//!
//! Reads lines from stdin and streams answers to stdout. A terminal can't edit
//! what it already printed, so each update writes only the new suffix.
//! Used for `parley chat`.

use std::io::Write;

use async_trait::async_trait;
use dashmap::DashMap;
use parley_core::channel::{Channel, ChannelId, ChannelMessage, RenderSink};
use parley_core::error::ChannelError;
use parley_core::message::ConversationId;
use tokio::io::{self, AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

/// Conversation id used for the single local session.
pub const CLI_CONVERSATION: &str = "cli:local";

/// Interactive CLI channel for terminal-based chat.
pub struct CliChannel {
    id: ChannelId,
    user_id: String,
    printed: DashMap<ConversationId, String>,
}

impl CliChannel {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            id: ChannelId("cli".into()),
            user_id: user_id.into(),
            printed: DashMap::new(),
        }
    }

    pub fn conversation_id() -> ConversationId {
        ConversationId::from(CLI_CONVERSATION)
    }

    fn write_out(text: &str) -> Result<(), ChannelError> {
        let mut stdout = std::io::stdout().lock();
        stdout
            .write_all(text.as_bytes())
            .and_then(|_| stdout.flush())
            .map_err(|e| ChannelError::DeliveryFailed {
                channel: "cli".into(),
                reason: e.to_string(),
            })
    }
}

impl Default for CliChannel {
    fn default() -> Self {
        Self::new("local_user")
    }
}

/// What to print so the terminal shows `next` after having shown `shown`.
///
/// Appends when `next` extends `shown`; otherwise the snapshot was rewritten
/// (a status line replaced by text) and it is printed again on a new line.
pub fn terminal_delta<'a>(shown: &str, next: &'a str) -> std::borrow::Cow<'a, str> {
    match next.strip_prefix(shown) {
        Some(suffix) => std::borrow::Cow::Borrowed(suffix),
        None => std::borrow::Cow::Owned(format!("\n{next}")),
    }
}

#[async_trait]
impl Channel for CliChannel {
    fn name(&self) -> &str {
        "cli"
    }

    async fn start(
        &self,
    ) -> Result<mpsc::Receiver<Result<ChannelMessage, ChannelError>>, ChannelError> {
        let (tx, rx) = mpsc::channel(32);
        let channel_id = self.id.clone();
        let user_id = self.user_id.clone();

        tokio::spawn(async move {
            let stdin = io::stdin();
            let reader = BufReader::new(stdin);
            let mut lines = reader.lines();

            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let line = line.trim().to_string();
                        if line.is_empty() {
                            continue;
                        }

                        if matches!(line.as_str(), "exit" | "quit" | "/exit" | "/quit" | ":q") {
                            break;
                        }

                        let msg = ChannelMessage {
                            channel_id: channel_id.clone(),
                            conversation_id: CliChannel::conversation_id(),
                            sender_id: user_id.clone(),
                            sender_name: Some("User".into()),
                            sender_language: None,
                            content: line,
                            attachments: vec![],
                        };

                        if tx.send(Ok(msg)).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => break, // EOF (Ctrl+D)
                    Err(e) => {
                        let _ = tx.send(Err(ChannelError::ConnectionLost(e.to_string()))).await;
                        break;
                    }
                }
            }
        });

        Ok(rx)
    }

    async fn send(&self, _conversation_id: &ConversationId, content: &str) -> Result<(), ChannelError> {
        Self::write_out(&format!("{content}\n"))
    }
}

#[async_trait]
impl RenderSink for CliChannel {
    async fn push_update(&self, conversation_id: &ConversationId, text: &str) -> Result<(), ChannelError> {
        let mut shown = self.printed.entry(conversation_id.clone()).or_default();
        let delta = terminal_delta(shown.as_str(), text);
        if !delta.is_empty() {
            Self::write_out(&delta)?;
        }
        *shown = text.to_string();
        Ok(())
    }

    async fn seal(&self, conversation_id: &ConversationId) -> Result<(), ChannelError> {
        if self.printed.remove(conversation_id).is_some() {
            Self::write_out("\n")?;
        }
        Ok(())
    }

    fn max_payload(&self) -> usize {
        usize::MAX
    }
}
