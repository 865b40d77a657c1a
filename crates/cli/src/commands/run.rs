//! `parley run` — Serve the Telegram bot.

use std::sync::Arc;

use dashmap::DashMap;
use parley_agent::{Orchestrator, RedoRequest, TurnOutcome, TurnRequest};
use parley_channels::TelegramChannel;
use parley_config::AppConfig;
use parley_core::access::AccessGate;
use parley_core::channel::{Channel, ChannelMessage};
use parley_security::AllowlistGate;
use tracing::{debug, info, warn};

const HELP: &str = "\
Hi! Send me a message, a photo or a PDF and I'll answer, searching the web when needed.

/thinking [on|off] — show or hide my reasoning
/redo — regenerate the last answer
/edit <text> — replace your last message and answer again
/cancel — stop the answer in progress
/help — this message";

/// A slash command understood by the bot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BotCommand {
    Help,
    /// `None` flips the current setting.
    Thinking(Option<bool>),
    Redo,
    Edit(String),
    Cancel,
    Unknown(String),
}

impl BotCommand {
    /// Parse `message` as a command; `None` for ordinary messages.
    pub fn parse(message: &ChannelMessage) -> Option<Self> {
        let name = message.command()?;
        let arg = message
            .content
            .trim()
            .split_once(char::is_whitespace)
            .map(|(_, rest)| rest.trim())
            .unwrap_or("");

        Some(match name {
            "start" | "help" => Self::Help,
            "thinking" => Self::Thinking(match arg {
                "on" => Some(true),
                "off" => Some(false),
                _ => None,
            }),
            "redo" => Self::Redo,
            "edit" => Self::Edit(arg.to_string()),
            "cancel" => Self::Cancel,
            other => Self::Unknown(other.to_string()),
        })
    }
}

struct Bot {
    orchestrator: Arc<Orchestrator>,
    channel: Arc<TelegramChannel>,
    gate: Arc<AllowlistGate>,
    /// Per-user `/thinking` setting.
    reasoning: DashMap<String, bool>,
    default_reasoning: bool,
}

impl Bot {
    async fn handle(&self, message: ChannelMessage) {
        let conversation_id = message.conversation_id.clone();
        if !self.gate.is_authorized(&message.sender_id) {
            info!(sender = %message.sender_id, "Ignoring message from unauthorized user");
            self.reply(&message, "⛔ Sorry, you are not allowed to use this bot.").await;
            return;
        }

        let show_reasoning = self.reasoning.get(&message.sender_id).map(|r| *r);
        let outcome = match BotCommand::parse(&message) {
            Some(BotCommand::Help) => {
                self.reply(&message, HELP).await;
                return;
            }
            Some(BotCommand::Thinking(setting)) => {
                let current = show_reasoning.unwrap_or(self.default_reasoning);
                let enabled = setting.unwrap_or(!current);
                self.reasoning.insert(message.sender_id.clone(), enabled);
                let state = if enabled { "on" } else { "off" };
                self.reply(&message, &format!("💭 Reasoning display is now {state}.")).await;
                return;
            }
            Some(BotCommand::Cancel) => {
                let text = if self.orchestrator.cancel_turn(&conversation_id) {
                    "⏹ Cancelling..."
                } else {
                    "Nothing to cancel."
                };
                self.reply(&message, text).await;
                return;
            }
            Some(BotCommand::Edit(text)) if text.is_empty() => {
                self.reply(&message, "Usage: /edit <new message>").await;
                return;
            }
            Some(BotCommand::Unknown(name)) => {
                self.reply(&message, &format!("Unknown command /{name}. Try /help.")).await;
                return;
            }
            Some(BotCommand::Redo) => {
                self.typing(&message).await;
                self.orchestrator.redo_turn(redo_request(&message, None, show_reasoning)).await
            }
            Some(BotCommand::Edit(text)) => {
                self.typing(&message).await;
                self.orchestrator
                    .redo_turn(redo_request(&message, Some(text), show_reasoning))
                    .await
            }
            None => {
                self.typing(&message).await;
                let request = TurnRequest {
                    conversation_id: conversation_id.clone(),
                    user_id: message.sender_id.clone(),
                    user_name: message.sender_name.clone(),
                    user_language: message.sender_language.clone(),
                    input: message.to_blocks(),
                    show_reasoning,
                };
                self.orchestrator.process_turn(request).await
            }
        };

        debug!(conversation_id = %conversation_id, outcome = outcome_label(&outcome), "Message handled");
        if let Some(reply) = super::outcome_reply(&outcome) {
            self.reply(&message, reply).await;
        }
    }

    async fn reply(&self, message: &ChannelMessage, text: &str) {
        if let Err(e) = self.channel.send(&message.conversation_id, text).await {
            warn!(conversation_id = %message.conversation_id, error = %e, "Reply failed");
        }
    }

    async fn typing(&self, message: &ChannelMessage) {
        if let Err(e) = self.channel.send_typing(&message.conversation_id).await {
            debug!(error = %e, "Typing indicator failed");
        }
    }
}

fn redo_request(message: &ChannelMessage, replacement: Option<String>, show_reasoning: Option<bool>) -> RedoRequest {
    RedoRequest {
        conversation_id: message.conversation_id.clone(),
        user_id: message.sender_id.clone(),
        user_name: message.sender_name.clone(),
        user_language: message.sender_language.clone(),
        replacement,
        show_reasoning,
    }
}

fn outcome_label(outcome: &TurnOutcome) -> &'static str {
    match outcome {
        TurnOutcome::Completed(_) => "completed",
        TurnOutcome::Cancelled => "cancelled",
        TurnOutcome::Failed(_) => "failed",
    }
}

pub async fn run(config: AppConfig) -> anyhow::Result<()> {
    let channel = Arc::new(TelegramChannel::new(&config.telegram, config.render.max_payload_chars)?);
    let username = channel.username().await?;

    let store = super::open_store(&config).await?;
    let gate = Arc::new(AllowlistGate::from_config(&config.access));
    let orchestrator = super::build_orchestrator(&config, store, channel.clone(), gate.clone())?
        .with_media(channel.clone());

    let bot = Arc::new(Bot {
        orchestrator: Arc::new(orchestrator),
        channel: channel.clone(),
        gate,
        reasoning: DashMap::new(),
        default_reasoning: config.turn.show_reasoning,
    });

    println!("🤖 Parley is running as @{username}");
    println!("   Model:  {}", config.provider.model);
    println!("   Store:  {}", config.store.database_url);
    println!("   Press Ctrl+C to stop.");

    let mut rx = channel.start().await?;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown requested");
                break;
            }
            incoming = rx.recv() => match incoming {
                Some(Ok(message)) => {
                    let bot = bot.clone();
                    tokio::spawn(async move { bot.handle(message).await });
                }
                Some(Err(e)) => warn!(error = %e, "Telegram update failed"),
                None => {
                    warn!("Telegram update stream closed");
                    break;
                }
            },
        }
    }

    channel.stop().await?;
    Ok(())
}
