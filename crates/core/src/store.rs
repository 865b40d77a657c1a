//! TurnStore trait — the persistence interface for conversation history.

use async_trait::async_trait;

use crate::error::StoreError;
use crate::message::{ConversationId, Turn, TurnId};

/// Outcome of a commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitStatus {
    /// The turn was written.
    Committed,
    /// A turn with this id already exists; nothing was written.
    AlreadyCommitted,
}

/// Durable turn storage.
///
/// `commit_turn` is atomic: either every block of the turn is stored or none
/// is. Committing the same turn id twice stores it once. When a turn names a
/// `supersedes` predecessor, that predecessor is marked superseded in the
/// same unit of work.
#[async_trait]
pub trait TurnStore: Send + Sync {
    /// Backend name (e.g., "sqlite", "in_memory").
    fn name(&self) -> &str;

    /// Most recent turns of a conversation, newest first, excluding superseded ones.
    async fn recent_turns(
        &self,
        conversation_id: &ConversationId,
        limit: usize,
    ) -> std::result::Result<Vec<Turn>, StoreError>;

    async fn commit_turn(&self, turn: &Turn) -> std::result::Result<CommitStatus, StoreError>;

    async fn get_turn(&self, id: &TurnId) -> std::result::Result<Option<Turn>, StoreError>;

    /// Number of stored turns in a conversation, superseded ones included.
    async fn count_turns(&self, conversation_id: &ConversationId) -> std::result::Result<usize, StoreError>;

    async fn health_check(&self) -> std::result::Result<bool, StoreError> {
        Ok(true)
    }
}
