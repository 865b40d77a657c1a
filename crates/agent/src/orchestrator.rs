//! The turn orchestrator.
//!
//! One call to [`Orchestrator::process_turn`] takes a user message through the
//! whole pipeline: access check, context building, streaming with tool
//! rounds, incremental rendering and a single atomic commit of the finished
//! turn.
//!
//! # Concurrency
//!
//! At most one turn runs per conversation. A new message for a conversation
//! with a turn in flight **cancels** that turn, waits for it to be persisted
//! as [`TurnStatus::Incomplete`], then starts. Turns in different
//! conversations never wait on each other.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use parley_config::AppConfig;
use parley_core::access::{AccessGate, AllowAll};
use parley_core::channel::{MediaResolver, RenderSink};
use parley_core::error::{ChannelError, ProviderError, StoreError};
use parley_core::event::{DomainEvent, EventBus};
use parley_core::message::{ContentBlock, ConversationId, NoticeKind, Role, Turn, TurnId, TurnStatus};
use parley_core::provider::{Provider, Usage};
use parley_core::store::{CommitStatus, TurnStore};
use parley_core::tool::ToolRegistry;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::context::{ContextBudget, ContextBuilder};
use crate::executor::ToolExecutor;
use crate::multiplexer::{MuxEnd, MuxFailure, MuxOutcome, MuxSettings, StreamMultiplexer};
use crate::prompt::{PromptVars, SystemPrompt};
use crate::renderer::{IncrementalRenderer, RenderSettings};

const CONTEXT_UNAVAILABLE: &str = "⚠️ Conversation history is unavailable right now. Please try again later.";
const CANCELLED: &str = "⏹ Cancelled.";

/// A user message to answer.
#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub conversation_id: ConversationId,
    pub user_id: String,
    pub user_name: Option<String>,
    pub user_language: Option<String>,
    pub input: Vec<ContentBlock>,
    /// Per-user reasoning display override.
    pub show_reasoning: Option<bool>,
}

impl TurnRequest {
    pub fn text(conversation_id: ConversationId, user_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            conversation_id,
            user_id: user_id.into(),
            user_name: None,
            user_language: None,
            input: vec![ContentBlock::text(text)],
            show_reasoning: None,
        }
    }
}

/// Regenerate the latest turn of a conversation, optionally with new text.
#[derive(Debug, Clone)]
pub struct RedoRequest {
    pub conversation_id: ConversationId,
    pub user_id: String,
    pub user_name: Option<String>,
    pub user_language: Option<String>,
    /// Replaces the text of the original input; its media is kept.
    pub replacement: Option<String>,
    pub show_reasoning: Option<bool>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TurnOutcome {
    Completed(Turn),
    Cancelled,
    Failed(TurnFailure),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum TurnFailure {
    #[error("user is not authorized")]
    Unauthorized,

    #[error("message has no content")]
    EmptyInput,

    #[error("conversation history unavailable: {0}")]
    ContextUnavailable(StoreError),

    #[error("model backend failed: {0}")]
    Backend(ProviderError),

    #[error("turn exceeded {0}s")]
    TurnTimeout(u64),

    #[error("final render failed: {0}")]
    Render(ChannelError),

    #[error("turn could not be saved: {0}")]
    Persistence(StoreError),

    #[error("nothing to redo")]
    NothingToRedo,
}

/// Turn limits and model parameters.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
    pub max_tool_rounds: u32,
    pub turn_timeout: Duration,
    pub tool_timeout: Duration,
    pub min_render_interval: Duration,
    pub show_reasoning: bool,
    pub bot_name: String,
    pub timezone: String,
}

impl OrchestratorSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            model: config.provider.model.clone(),
            temperature: config.provider.temperature,
            max_tokens: config.provider.max_tokens,
            max_tool_rounds: config.turn.max_tool_rounds,
            turn_timeout: Duration::from_secs(config.turn.timeout_secs),
            tool_timeout: Duration::from_secs(config.tools.timeout_secs),
            min_render_interval: Duration::from_millis(config.render.min_interval_ms),
            show_reasoning: config.turn.show_reasoning,
            bot_name: config.identity.bot_name.clone(),
            timezone: config.identity.timezone.clone(),
        }
    }
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

/// The in-flight turn of one conversation.
struct ActiveTurn {
    generation: u64,
    cancel: CancellationToken,
}

/// Held for the lifetime of a turn; releases the conversation on drop.
struct ConversationSlot<'a> {
    active: &'a DashMap<ConversationId, ActiveTurn>,
    locks: &'a DashMap<ConversationId, Arc<Mutex<()>>>,
    conversation_id: ConversationId,
    generation: u64,
    cancel: CancellationToken,
    guard: Option<OwnedMutexGuard<()>>,
}

impl ConversationSlot<'_> {
    /// Cancelled before the turn got to run.
    fn superseded(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for ConversationSlot<'_> {
    fn drop(&mut self) {
        self.active
            .remove_if(&self.conversation_id, |_, a| a.generation == self.generation);
        drop(self.guard.take());
        self.locks
            .remove_if(&self.conversation_id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

/// What `run_turn` needs beyond the request.
struct TurnPlan {
    conversation_id: ConversationId,
    user_id: String,
    user_name: Option<String>,
    user_language: Option<String>,
    input: Vec<ContentBlock>,
    show_reasoning: bool,
    /// The turn this one replaces (redo/edit); excluded from its context.
    supersedes: Option<TurnId>,
}

pub struct Orchestrator {
    provider: Arc<dyn Provider>,
    tools: Arc<ToolRegistry>,
    store: Arc<dyn TurnStore>,
    sink: Arc<dyn RenderSink>,
    access: Arc<dyn AccessGate>,
    media: Option<Arc<dyn MediaResolver>>,
    events: Arc<EventBus>,
    prompt: SystemPrompt,
    context: ContextBuilder,
    settings: OrchestratorSettings,
    active: DashMap<ConversationId, ActiveTurn>,
    locks: DashMap<ConversationId, Arc<Mutex<()>>>,
    generations: AtomicU64,
}

impl Orchestrator {
    pub fn new(
        provider: Arc<dyn Provider>,
        tools: Arc<ToolRegistry>,
        store: Arc<dyn TurnStore>,
        sink: Arc<dyn RenderSink>,
        settings: OrchestratorSettings,
    ) -> Self {
        let context_config = parley_config::ContextConfig::default();
        let context = ContextBuilder::new(
            store.clone(),
            ContextBudget::from_config(&context_config),
            context_config.history_fetch_limit,
        );
        Self {
            provider,
            tools,
            store,
            sink,
            access: Arc::new(AllowAll),
            media: None,
            events: Arc::new(EventBus::default()),
            prompt: SystemPrompt::new(parley_config::DEFAULT_SYSTEM_PROMPT),
            context,
            settings,
            active: DashMap::new(),
            locks: DashMap::new(),
            generations: AtomicU64::new(0),
        }
    }

    pub fn with_access(mut self, access: Arc<dyn AccessGate>) -> Self {
        self.access = access;
        self
    }

    pub fn with_media(mut self, media: Arc<dyn MediaResolver>) -> Self {
        self.media = Some(media);
        self
    }

    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = events;
        self
    }

    pub fn with_system_prompt(mut self, prompt: SystemPrompt) -> Self {
        self.prompt = prompt;
        self
    }

    /// Replace the context builder, e.g. to change the token budget.
    pub fn with_context(mut self, context: ContextBuilder) -> Self {
        self.context = context;
        self
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn store(&self) -> &Arc<dyn TurnStore> {
        &self.store
    }

    /// Whether a turn is running (or waiting to run) in `conversation_id`.
    pub fn is_active(&self, conversation_id: &ConversationId) -> bool {
        self.active.contains_key(conversation_id)
    }

    /// Cancel the in-flight turn of `conversation_id`, if any.
    ///
    /// The turn stops at its next suspension point and is persisted as
    /// incomplete. Returns `false` when nothing was running.
    pub fn cancel_turn(&self, conversation_id: &ConversationId) -> bool {
        match self.active.get(conversation_id) {
            Some(turn) => {
                info!(conversation_id = %conversation_id, "Cancelling turn");
                turn.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Answer one user message.
    pub async fn process_turn(&self, request: TurnRequest) -> TurnOutcome {
        if !self.access.is_authorized(&request.user_id) {
            warn!(user_id = %request.user_id, "Unauthorized turn rejected");
            return TurnOutcome::Failed(TurnFailure::Unauthorized);
        }
        if request.input.is_empty() {
            return TurnOutcome::Failed(TurnFailure::EmptyInput);
        }

        let slot = self.claim(&request.conversation_id).await;
        if slot.superseded() {
            return self.persist_superseded(request).await;
        }

        let plan = TurnPlan {
            show_reasoning: request.show_reasoning.unwrap_or(self.settings.show_reasoning),
            conversation_id: request.conversation_id,
            user_id: request.user_id,
            user_name: request.user_name,
            user_language: request.user_language,
            input: request.input,
            supersedes: None,
        };
        self.run_turn(plan, &slot.cancel).await
    }

    /// Regenerate the latest turn, replacing it atomically on commit.
    pub async fn redo_turn(&self, request: RedoRequest) -> TurnOutcome {
        if !self.access.is_authorized(&request.user_id) {
            warn!(user_id = %request.user_id, "Unauthorized redo rejected");
            return TurnOutcome::Failed(TurnFailure::Unauthorized);
        }

        let slot = self.claim(&request.conversation_id).await;
        if slot.superseded() {
            return TurnOutcome::Cancelled;
        }

        let latest = match self.store.recent_turns(&request.conversation_id, 1).await {
            Ok(mut turns) => turns.pop(),
            Err(e) => {
                error!(conversation_id = %request.conversation_id, error = %e, "Cannot load turn to redo");
                return TurnOutcome::Failed(TurnFailure::ContextUnavailable(e));
            }
        };
        let Some(latest) = latest else {
            return TurnOutcome::Failed(TurnFailure::NothingToRedo);
        };

        let mut input = latest.user_input();
        if let Some(replacement) = request.replacement {
            input.retain(ContentBlock::is_media);
            input.push(ContentBlock::text(replacement));
        }
        if input.is_empty() {
            return TurnOutcome::Failed(TurnFailure::NothingToRedo);
        }
        debug!(conversation_id = %request.conversation_id, previous = %latest.id, "Redoing turn");

        let plan = TurnPlan {
            show_reasoning: request.show_reasoning.unwrap_or(self.settings.show_reasoning),
            conversation_id: request.conversation_id,
            user_id: request.user_id,
            user_name: request.user_name,
            user_language: request.user_language,
            input,
            supersedes: Some(latest.id),
        };
        self.run_turn(plan, &slot.cancel).await
    }

    /// Take over `conversation_id`: cancel whatever runs there and wait for it.
    async fn claim(&self, conversation_id: &ConversationId) -> ConversationSlot<'_> {
        let generation = self.generations.fetch_add(1, Ordering::SeqCst);
        let cancel = CancellationToken::new();
        let previous = self.active.insert(
            conversation_id.clone(),
            ActiveTurn {
                generation,
                cancel: cancel.clone(),
            },
        );
        if let Some(previous) = previous {
            debug!(conversation_id = %conversation_id, "Newer message cancels in-flight turn");
            previous.cancel.cancel();
        }

        let lock = self.locks.entry(conversation_id.clone()).or_default().clone();
        let mut slot = ConversationSlot {
            active: &self.active,
            locks: &self.locks,
            conversation_id: conversation_id.clone(),
            generation,
            cancel,
            guard: None,
        };
        slot.guard = Some(lock.lock_owned().await);
        slot
    }

    /// A message cancelled before it started is kept as input only.
    async fn persist_superseded(&self, request: TurnRequest) -> TurnOutcome {
        let turn = Turn::builder(request.conversation_id.clone(), request.user_id)
            .extend(Role::User, request.input)
            .with_status(TurnStatus::Incomplete)
            .build();
        debug!(conversation_id = %turn.conversation_id, turn_id = %turn.id, "Turn superseded before start");
        if let Err(e) = self.store.commit_turn(&turn).await {
            self.report_persistence_failure(&turn, &e);
            return TurnOutcome::Failed(TurnFailure::Persistence(e));
        }
        self.events.publish(DomainEvent::TurnCancelled {
            conversation_id: turn.conversation_id.to_string(),
            turn_id: turn.id.to_string(),
            timestamp: Utc::now(),
        });
        TurnOutcome::Cancelled
    }

    async fn run_turn(&self, plan: TurnPlan, cancel: &CancellationToken) -> TurnOutcome {
        let deadline = Instant::now() + self.settings.turn_timeout;
        let conversation_id = plan.conversation_id.clone();
        let turn_id = TurnId::new();
        info!(conversation_id = %conversation_id, turn_id = %turn_id, "Turn started");
        self.events.publish(DomainEvent::TurnStarted {
            conversation_id: conversation_id.to_string(),
            turn_id: turn_id.to_string(),
            timestamp: Utc::now(),
        });

        let mut renderer = IncrementalRenderer::new(
            self.sink.clone(),
            conversation_id.clone(),
            RenderSettings {
                min_interval: self.settings.min_render_interval,
                show_reasoning: plan.show_reasoning,
            },
        );

        let system_prompt = self.prompt.render(&PromptVars {
            bot_name: &self.settings.bot_name,
            model_name: &self.settings.model,
            timezone: &self.settings.timezone,
            user_name: plan.user_name.as_deref(),
            user_lang: plan.user_language.as_deref(),
            now: Utc::now(),
        });

        let window = match self
            .context
            .build(&conversation_id, system_prompt, plan.input.clone(), plan.supersedes.as_ref())
            .await
        {
            Ok(window) => window,
            Err(e) => {
                error!(conversation_id = %conversation_id, error = %e, "Context unavailable");
                if let Err(render) = renderer.finish(Some(CONTEXT_UNAVAILABLE)).await {
                    warn!(error = %render, "Could not show context failure notice");
                }
                self.publish_failure(&conversation_id, &turn_id, "context", &e.to_string());
                return TurnOutcome::Failed(TurnFailure::ContextUnavailable(e));
            }
        };
        if window.truncated_incoming {
            warn!(conversation_id = %conversation_id, budget = window.budget, "Incoming message truncated to fit context");
        }
        // Media downloads count against the turn budget and stop on cancel.
        let messages = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(MuxEnd::Cancelled),
            _ = tokio::time::sleep_until(deadline) => {
                warn!(conversation_id = %conversation_id, "Turn timed out while resolving media");
                Err(MuxEnd::Failed(MuxFailure::Timeout))
            }
            messages = window.to_messages(self.media.as_deref()) => Ok(messages),
        };

        let outcome = match messages {
            Ok(messages) => {
                let mux = self.multiplexer(plan.show_reasoning);
                mux.run(&conversation_id, messages, &mut renderer, cancel, deadline).await
            }
            Err(end) => MuxOutcome {
                blocks: Vec::new(),
                usage: Usage::default(),
                rounds: 0,
                end,
            },
        };

        let mut builder = Turn::builder(conversation_id.clone(), plan.user_id)
            .with_id(turn_id.clone())
            .with_supersedes(plan.supersedes)
            .with_usage(outcome.usage)
            .extend(Role::User, plan.input)
            .extend_blocks(outcome.blocks);

        let render_result = match &outcome.end {
            MuxEnd::Done { truncated } => {
                let notice = truncated.then(|| truncation_notice(outcome.rounds));
                if let Some(text) = &notice {
                    builder = builder.push(Role::Assistant, ContentBlock::notice(NoticeKind::Truncation, text));
                }
                builder = builder.with_status(TurnStatus::Complete);
                renderer.finish(notice.as_deref()).await
            }
            MuxEnd::Failed(failure) => {
                let notice = failure_notice(failure);
                builder = builder
                    .push(Role::Assistant, ContentBlock::notice(NoticeKind::Failure, &notice))
                    .with_status(TurnStatus::Failed);
                renderer.finish(Some(&notice)).await
            }
            MuxEnd::Cancelled => {
                renderer.abandon().await;
                builder = builder
                    .push(Role::Assistant, ContentBlock::notice(NoticeKind::Cancelled, CANCELLED))
                    .with_status(TurnStatus::Incomplete);
                Ok(())
            }
        };

        let mut turn = builder.build();
        turn.token_count = self.context.turn_cost(&turn);

        match self.store.commit_turn(&turn).await {
            Ok(CommitStatus::Committed) => {
                debug!(turn_id = %turn.id, status = turn.status.as_str(), blocks = turn.blocks.len(), "Turn committed");
            }
            Ok(CommitStatus::AlreadyCommitted) => {
                debug!(turn_id = %turn.id, "Turn was already committed");
            }
            Err(e) => {
                self.report_persistence_failure(&turn, &e);
                return TurnOutcome::Failed(TurnFailure::Persistence(e));
            }
        }

        if let Err(e) = render_result {
            error!(conversation_id = %conversation_id, error = %e, "Final render failed");
            self.publish_failure(&conversation_id, &turn_id, "render", &e.to_string());
            return TurnOutcome::Failed(TurnFailure::Render(e));
        }

        match outcome.end {
            MuxEnd::Done { .. } => {
                info!(
                    conversation_id = %conversation_id,
                    turn_id = %turn_id,
                    tool_rounds = outcome.rounds,
                    tokens = turn.usage.total_tokens,
                    "Turn completed"
                );
                self.events.publish(DomainEvent::TurnCompleted {
                    conversation_id: conversation_id.to_string(),
                    turn_id: turn_id.to_string(),
                    tool_rounds: outcome.rounds,
                    tokens_used: turn.usage.total_tokens,
                    timestamp: Utc::now(),
                });
                TurnOutcome::Completed(turn)
            }
            MuxEnd::Failed(MuxFailure::Backend(e)) => {
                self.publish_failure(&conversation_id, &turn_id, "backend", &e.to_string());
                TurnOutcome::Failed(TurnFailure::Backend(e))
            }
            MuxEnd::Failed(MuxFailure::Timeout) => {
                let secs = self.settings.turn_timeout.as_secs();
                self.publish_failure(&conversation_id, &turn_id, "timeout", &format!("exceeded {secs}s"));
                TurnOutcome::Failed(TurnFailure::TurnTimeout(secs))
            }
            MuxEnd::Cancelled => {
                info!(conversation_id = %conversation_id, turn_id = %turn_id, "Turn cancelled");
                self.events.publish(DomainEvent::TurnCancelled {
                    conversation_id: conversation_id.to_string(),
                    turn_id: turn_id.to_string(),
                    timestamp: Utc::now(),
                });
                TurnOutcome::Cancelled
            }
        }
    }

    fn multiplexer(&self, include_reasoning: bool) -> StreamMultiplexer {
        let executor = ToolExecutor::new(self.tools.clone(), self.settings.tool_timeout, self.events.clone());
        StreamMultiplexer::new(
            self.provider.clone(),
            Arc::new(executor),
            MuxSettings {
                model: self.settings.model.clone(),
                temperature: self.settings.temperature,
                max_tokens: self.settings.max_tokens,
                max_tool_rounds: self.settings.max_tool_rounds,
                include_reasoning,
            },
        )
    }

    fn publish_failure(&self, conversation_id: &ConversationId, turn_id: &TurnId, stage: &str, message: &str) {
        self.events.publish(DomainEvent::TurnFailed {
            conversation_id: conversation_id.to_string(),
            turn_id: turn_id.to_string(),
            stage: stage.into(),
            error_message: message.into(),
            timestamp: Utc::now(),
        });
    }

    fn report_persistence_failure(&self, turn: &Turn, e: &StoreError) {
        error!(
            conversation_id = %turn.conversation_id,
            turn_id = %turn.id,
            error = %e,
            "Turn was shown but could not be persisted"
        );
        self.events.publish(DomainEvent::PersistenceFailed {
            conversation_id: turn.conversation_id.to_string(),
            turn_id: turn.id.to_string(),
            error_message: e.to_string(),
            timestamp: Utc::now(),
        });
    }
}

fn truncation_notice(rounds: u32) -> String {
    format!("⚠️ Stopped after {rounds} tool rounds; the answer may be incomplete.")
}

fn failure_notice(failure: &MuxFailure) -> String {
    let reason = match failure {
        MuxFailure::Timeout => {
            return "⚠️ The response took too long and was stopped. Use /redo to try again.".into();
        }
        MuxFailure::Backend(ProviderError::StreamInterrupted(_) | ProviderError::Network(_)) => "connection lost",
        MuxFailure::Backend(ProviderError::RateLimited { .. }) => "the model is rate limited",
        MuxFailure::Backend(ProviderError::Timeout(_)) => "the model did not respond",
        MuxFailure::Backend(ProviderError::MalformedStream(_)) => "the model sent an unreadable reply",
        MuxFailure::Backend(_) => "the model backend returned an error",
    };
    format!("⚠️ The response was interrupted: {reason}. Use /redo to try again.")
}
