//! In-memory turn store — useful for testing and ephemeral sessions.

use std::sync::Arc;

use async_trait::async_trait;
use parley_core::error::StoreError;
use parley_core::message::{ConversationId, Turn, TurnId, TurnStatus};
use parley_core::store::{CommitStatus, TurnStore};
use tokio::sync::RwLock;

/// Stores turns in commit order inside a Vec.
#[derive(Clone, Default)]
pub struct InMemoryTurnStore {
    turns: Arc<RwLock<Vec<Turn>>>,
}

impl InMemoryTurnStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every stored turn, oldest first, superseded ones included.
    pub async fn snapshot(&self) -> Vec<Turn> {
        self.turns.read().await.clone()
    }
}

#[async_trait]
impl TurnStore for InMemoryTurnStore {
    fn name(&self) -> &str {
        "in_memory"
    }

    async fn recent_turns(
        &self,
        conversation_id: &ConversationId,
        limit: usize,
    ) -> Result<Vec<Turn>, StoreError> {
        let turns = self.turns.read().await;
        Ok(turns
            .iter()
            .rev()
            .filter(|t| &t.conversation_id == conversation_id && t.status != TurnStatus::Superseded)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn commit_turn(&self, turn: &Turn) -> Result<CommitStatus, StoreError> {
        turn.validate().map_err(|reason| StoreError::Corrupt {
            turn_id: turn.id.0.clone(),
            reason,
        })?;

        // Single write guard: the existence check, the insert and the
        // supersede update are one unit.
        let mut turns = self.turns.write().await;
        if turns.iter().any(|t| t.id == turn.id) {
            return Ok(CommitStatus::AlreadyCommitted);
        }
        if let Some(previous) = &turn.supersedes {
            if let Some(old) = turns
                .iter_mut()
                .find(|t| &t.id == previous && t.conversation_id == turn.conversation_id)
            {
                old.status = TurnStatus::Superseded;
            }
        }
        turns.push(turn.clone());
        Ok(CommitStatus::Committed)
    }

    async fn get_turn(&self, id: &TurnId) -> Result<Option<Turn>, StoreError> {
        Ok(self.turns.read().await.iter().find(|t| &t.id == id).cloned())
    }

    async fn count_turns(&self, conversation_id: &ConversationId) -> Result<usize, StoreError> {
        Ok(self
            .turns
            .read()
            .await
            .iter()
            .filter(|t| &t.conversation_id == conversation_id)
            .count())
    }
}
