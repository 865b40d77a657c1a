//! Context Builder — fits conversation history into a token budget.
//!
//! The window is rebuilt from storage for every turn:
//!
//! ```text
//! budget = max_tokens - completion_headroom
//!        ≥ system prompt + prior turns + incoming input
//! ```
//!
//! Prior turns are taken newest-first and whole: the first turn that does not
//! fit ends the walk, so older turns are always the ones dropped. The incoming
//! input is mandatory; if it alone is over budget its text is truncated.

use std::collections::HashMap;
use std::sync::Arc;

use parley_config::ContextConfig;
use parley_core::channel::MediaResolver;
use parley_core::error::StoreError;
use parley_core::message::{ContentBlock, ConversationId, MediaPart, Message, Role, Turn, TurnId};
use parley_core::store::TurnStore;
use tracing::{debug, warn};

/// Smallest share of the budget the incoming input is cut down to.
const MIN_INCOMING_TOKENS: u32 = 32;

/// Estimates prompt tokens.
pub trait TokenCounter: Send + Sync {
    fn count_text(&self, text: &str) -> u32;

    /// Per-message framing cost (role, delimiters).
    fn message_overhead(&self) -> u32 {
        4
    }
}

/// ~4 characters per token, rounded up.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicCounter;

impl TokenCounter for HeuristicCounter {
    fn count_text(&self, text: &str) -> u32 {
        (text.chars().count() as u32).div_ceil(4)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextBudget {
    pub max_tokens: u32,
    pub completion_headroom: u32,
    /// Fixed cost charged for each image or document block.
    pub media_block_tokens: u32,
}

impl ContextBudget {
    pub fn from_config(config: &ContextConfig) -> Self {
        Self {
            max_tokens: config.token_limit,
            completion_headroom: config.completion_headroom,
            media_block_tokens: config.media_block_tokens,
        }
    }

    /// Tokens available to the prompt.
    pub fn prompt_budget(&self) -> u32 {
        self.max_tokens.saturating_sub(self.completion_headroom)
    }
}

/// The prompt for one turn: system prompt, selected history, incoming input.
#[derive(Debug, Clone)]
pub struct ContextWindow {
    pub system_prompt: String,
    /// Prior turns, oldest first.
    pub turns: Vec<Turn>,
    pub incoming: Vec<ContentBlock>,
    pub token_count: u32,
    pub budget: u32,
    pub truncated_incoming: bool,
}

impl ContextWindow {
    /// Provider messages for this window.
    ///
    /// Media blocks are resolved through `resolver`; any that fail keep their
    /// textual placeholder.
    pub async fn to_messages(&self, resolver: Option<&dyn MediaResolver>) -> Vec<Message> {
        let mut resolved: HashMap<String, MediaPart> = HashMap::new();
        if let Some(resolver) = resolver {
            // Owned so the future stays `Send` across the awaits below.
            let media: Vec<ContentBlock> = self
                .turns
                .iter()
                .flat_map(|t| t.blocks.iter().map(|b| &b.content))
                .chain(self.incoming.iter())
                .filter(|c| c.is_media())
                .cloned()
                .collect();
            for block in &media {
                let Some(key) = media_key(block) else { continue };
                if resolved.contains_key(key) {
                    continue;
                }
                match resolver.resolve(block).await {
                    Ok(part) => {
                        resolved.insert(key.to_string(), part);
                    }
                    Err(e) => warn!(file_id = key, error = %e, "Media unavailable, using placeholder"),
                }
            }
        }
        let lookup = |block: &ContentBlock| media_key(block).and_then(|k| resolved.get(k).cloned());

        let mut messages = vec![Message::system(self.system_prompt.clone())];
        for turn in &self.turns {
            messages.extend(turn.replay(&lookup));
        }
        messages.extend(incoming_turn(&self.incoming).replay(&lookup));
        messages
    }
}

fn media_key(block: &ContentBlock) -> Option<&str> {
    match block {
        ContentBlock::Image { file_id, .. } | ContentBlock::Document { file_id, .. } => Some(file_id),
        _ => None,
    }
}

fn incoming_turn(blocks: &[ContentBlock]) -> Turn {
    Turn::builder(ConversationId::from(""), "")
        .extend(Role::User, blocks.iter().cloned())
        .build()
}

pub struct ContextBuilder {
    store: Arc<dyn TurnStore>,
    counter: Arc<dyn TokenCounter>,
    budget: ContextBudget,
    fetch_limit: usize,
}

impl ContextBuilder {
    pub fn new(store: Arc<dyn TurnStore>, budget: ContextBudget, fetch_limit: usize) -> Self {
        Self {
            store,
            counter: Arc::new(HeuristicCounter),
            budget,
            fetch_limit,
        }
    }

    pub fn with_counter(mut self, counter: Arc<dyn TokenCounter>) -> Self {
        self.counter = counter;
        self
    }

    pub fn budget(&self) -> ContextBudget {
        self.budget
    }

    /// Build the window for `incoming` in `conversation_id`.
    ///
    /// `exclude` skips one stored turn (the turn being regenerated).
    /// Storage errors are returned as-is; there is no retry.
    pub async fn build(
        &self,
        conversation_id: &ConversationId,
        system_prompt: String,
        incoming: Vec<ContentBlock>,
        exclude: Option<&TurnId>,
    ) -> Result<ContextWindow, StoreError> {
        let history = self
            .store
            .recent_turns(conversation_id, self.fetch_limit)
            .await?;

        let budget = self.budget.prompt_budget();
        let system_cost = self.counter.count_text(&system_prompt) + self.counter.message_overhead();
        let mut remaining = budget.saturating_sub(system_cost);

        let (incoming, incoming_cost, truncated_incoming) =
            self.fit_incoming(incoming, remaining.max(MIN_INCOMING_TOKENS));
        remaining = remaining.saturating_sub(incoming_cost);

        let mut selected = Vec::new();
        let mut history_cost = 0;
        for turn in history {
            if exclude == Some(&turn.id) {
                continue;
            }
            let cost = self.turn_cost(&turn);
            if cost > remaining {
                break;
            }
            remaining -= cost;
            history_cost += cost;
            selected.push(turn);
        }
        selected.reverse();

        let token_count = system_cost + incoming_cost + history_cost;
        debug!(
            conversation_id = %conversation_id,
            turns = selected.len(),
            token_count,
            budget,
            truncated_incoming,
            "Context window built"
        );

        Ok(ContextWindow {
            system_prompt,
            turns: selected,
            incoming,
            token_count,
            budget,
            truncated_incoming,
        })
    }

    /// Estimated cost of replaying `turn` into the prompt.
    pub fn turn_cost(&self, turn: &Turn) -> u32 {
        let blocks: u32 = turn
            .blocks
            .iter()
            .map(|b| self.block_cost(&b.content))
            .sum();
        let messages = turn.replay(&|_| None).len() as u32;
        blocks + messages * self.counter.message_overhead()
    }

    fn block_cost(&self, block: &ContentBlock) -> u32 {
        match block {
            ContentBlock::Text { text } => self.counter.count_text(text),
            ContentBlock::Image { .. } | ContentBlock::Document { .. } => self.budget.media_block_tokens,
            ContentBlock::ToolCallRequest { name, arguments, .. } => {
                self.counter.count_text(name) + self.counter.count_text(&arguments.to_string())
            }
            ContentBlock::ToolCallResult { output, .. } => self.counter.count_text(&output.to_string()),
            // Never replayed
            ContentBlock::Reasoning { .. } | ContentBlock::Notice { .. } => 0,
        }
    }

    fn incoming_cost(&self, blocks: &[ContentBlock]) -> u32 {
        blocks.iter().map(|b| self.block_cost(b)).sum::<u32>() + self.counter.message_overhead()
    }

    /// Shrink the incoming text until it fits `allowed`; media is never dropped.
    fn fit_incoming(&self, mut blocks: Vec<ContentBlock>, allowed: u32) -> (Vec<ContentBlock>, u32, bool) {
        let mut cost = self.incoming_cost(&blocks);
        let mut truncated = false;

        while cost > allowed {
            // Cut the longest text block proportionally to the overshoot.
            let longest = blocks
                .iter_mut()
                .filter_map(|b| match b {
                    ContentBlock::Text { text } if !text.is_empty() => Some(text),
                    _ => None,
                })
                .max_by_key(|t| t.chars().count());
            let Some(text) = longest else { break };

            let chars = text.chars().count();
            let over = cost - allowed;
            let text_cost = self.counter.count_text(text).max(1);
            let keep = chars.saturating_sub((chars * over as usize).div_ceil(text_cost as usize).max(1));
            let cut = text.char_indices().nth(keep).map(|(i, _)| i).unwrap_or(text.len());
            text.truncate(cut);
            truncated = true;
            cost = self.incoming_cost(&blocks);
        }

        (blocks, cost, truncated)
    }
}
