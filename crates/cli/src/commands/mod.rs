pub mod chat;
pub mod config_cmd;
pub mod doctor;
pub mod run;

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use parley_agent::{ContextBudget, ContextBuilder, Orchestrator, OrchestratorSettings, SystemPrompt, TurnFailure, TurnOutcome};
use parley_config::AppConfig;
use parley_core::access::AccessGate;
use parley_core::channel::RenderSink;
use parley_core::event::{DomainEvent, EventBus};
use parley_core::store::TurnStore;
use parley_providers::OpenAiCompatProvider;
use parley_store::SqliteTurnStore;
use parley_tools::TavilyClient;
use tracing::{debug, warn};

/// Load config from `path` (or the default location), apply environment
/// overrides and validate.
pub fn load_config(path: Option<&Path>) -> anyhow::Result<AppConfig> {
    let config = match path {
        Some(path) => {
            let mut config = AppConfig::load_from(path)?;
            config.apply_env(|key| std::env::var(key).ok());
            config.validate()?;
            config
        }
        None => AppConfig::load()?,
    };
    Ok(config)
}

pub async fn open_store(config: &AppConfig) -> anyhow::Result<Arc<dyn TurnStore>> {
    let store = SqliteTurnStore::new(&config.store.database_url)
        .await
        .with_context(|| format!("opening turn store at {}", config.store.database_url))?;
    Ok(Arc::new(store))
}

/// Wire an orchestrator from config. The caller supplies the render sink
/// and access gate of its channel.
pub fn build_orchestrator(
    config: &AppConfig,
    store: Arc<dyn TurnStore>,
    sink: Arc<dyn RenderSink>,
    access: Arc<dyn AccessGate>,
) -> anyhow::Result<Orchestrator> {
    let provider = OpenAiCompatProvider::from_config(&config.provider).context("configuring model backend")?;
    let search = TavilyClient::from_config(&config.tools).context("configuring web search")?;
    let tools = parley_tools::default_registry(Arc::new(search), &config.tools);
    let prompt = SystemPrompt::new(config.system_prompt_template()?);
    let context = ContextBuilder::new(
        store.clone(),
        ContextBudget::from_config(&config.context),
        config.context.history_fetch_limit,
    );

    let events = Arc::new(EventBus::default());
    spawn_event_log(&events);

    Ok(Orchestrator::new(
        Arc::new(provider),
        Arc::new(tools),
        store,
        sink,
        OrchestratorSettings::from_config(config),
    )
    .with_access(access)
    .with_system_prompt(prompt)
    .with_context(context)
    .with_events(events))
}

/// Log domain events at debug level.
fn spawn_event_log(events: &EventBus) {
    let mut rx = events.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => match event.as_ref() {
                    DomainEvent::PersistenceFailed { conversation_id, turn_id, error_message, .. } => {
                        warn!(%conversation_id, %turn_id, error = %error_message, "Persistence failed");
                    }
                    other => debug!(event = ?other, "Domain event"),
                },
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "Event log lagging");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

/// A short reply for outcomes the renderer did not already show.
pub fn outcome_reply(outcome: &TurnOutcome) -> Option<&'static str> {
    match outcome {
        TurnOutcome::Failed(TurnFailure::NothingToRedo) => Some("Nothing to redo yet."),
        TurnOutcome::Failed(TurnFailure::Unauthorized) => Some("⛔ Sorry, you are not allowed to use this bot."),
        TurnOutcome::Failed(TurnFailure::Persistence(_)) => {
            Some("⚠️ This answer could not be saved and will not be remembered.")
        }
        _ => None,
    }
}
