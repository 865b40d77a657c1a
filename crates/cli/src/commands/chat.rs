//! `parley chat` — Interactive or single-message chat in the terminal.

use std::io::Write;
use std::sync::Arc;

use parley_agent::{Orchestrator, RedoRequest, TurnOutcome, TurnRequest};
use parley_channels::CliChannel;
use parley_config::AppConfig;
use parley_core::access::AllowAll;
use parley_core::channel::Channel;
use parley_core::message::ConversationId;

const USER_ID: &str = "local_user";

pub async fn run(config: AppConfig, message: Option<String>) -> anyhow::Result<()> {
    let channel = Arc::new(CliChannel::new(USER_ID));
    let store = super::open_store(&config).await?;
    let orchestrator = super::build_orchestrator(&config, store, channel.clone(), Arc::new(AllowAll))?;
    let conversation_id = CliChannel::conversation_id();

    if let Some(message) = message {
        let outcome = run_turn(&orchestrator, &conversation_id, Input::Message(message)).await;
        report(&outcome);
        return Ok(());
    }

    println!();
    println!("  Parley — interactive chat");
    println!("  Model:  {}", config.provider.model);
    println!("  Store:  {}", config.store.database_url);
    println!();
    println!("  /redo regenerates the last answer, /edit <text> replaces your last message.");
    println!("  Ctrl+C cancels an answer; 'exit' or Ctrl+D quits.");
    println!();
    prompt()?;

    let mut rx = channel.start().await?;
    while let Some(incoming) = rx.recv().await {
        let message = match incoming {
            Ok(message) => message,
            Err(e) => {
                eprintln!("  [Channel error] {e}");
                break;
            }
        };

        let command = message.command().map(str::to_string);
        let input = match command.as_deref() {
            Some("redo") => Input::Redo(None),
            Some("edit") => {
                let text = message
                    .content
                    .split_once(char::is_whitespace)
                    .map(|(_, rest)| rest.trim().to_string())
                    .unwrap_or_default();
                if text.is_empty() {
                    println!("  Usage: /edit <new message>");
                    prompt()?;
                    continue;
                }
                Input::Redo(Some(text))
            }
            _ => Input::Message(message.content),
        };

        println!();
        let outcome = run_turn(&orchestrator, &conversation_id, input).await;
        report(&outcome);
        println!();
        prompt()?;
    }

    println!();
    println!("  Goodbye!");
    Ok(())
}

enum Input {
    Message(String),
    Redo(Option<String>),
}

/// Run one turn; Ctrl+C cancels it and waits for it to be saved.
async fn run_turn(orchestrator: &Orchestrator, conversation_id: &ConversationId, input: Input) -> TurnOutcome {
    let turn = async {
        match input {
            Input::Message(text) => {
                orchestrator
                    .process_turn(TurnRequest::text(conversation_id.clone(), USER_ID, text))
                    .await
            }
            Input::Redo(replacement) => {
                orchestrator
                    .redo_turn(RedoRequest {
                        conversation_id: conversation_id.clone(),
                        user_id: USER_ID.into(),
                        user_name: None,
                        user_language: None,
                        replacement,
                        show_reasoning: None,
                    })
                    .await
            }
        }
    };
    tokio::pin!(turn);

    tokio::select! {
        outcome = &mut turn => outcome,
        _ = tokio::signal::ctrl_c() => {
            orchestrator.cancel_turn(conversation_id);
            turn.await
        }
    }
}

fn report(outcome: &TurnOutcome) {
    if let Some(reply) = super::outcome_reply(outcome) {
        println!("  {reply}");
    } else if let TurnOutcome::Cancelled = outcome {
        println!("  ⏹ Cancelled.");
    }
}

fn prompt() -> std::io::Result<()> {
    print!("  You > ");
    std::io::stdout().flush()
}
