//! SQLite turn store.
//!
//! Two tables:
//! - `turns` — one row per turn; `id` is unique and doubles as the idempotency key
//! - `turn_blocks` — the turn's content blocks, keyed by `(turn_id, ordinal)`
//!
//! A commit writes the turn row, every block and (for a regeneration) the
//! superseded marker on the previous turn inside one transaction.

use std::collections::HashMap;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parley_core::error::StoreError;
use parley_core::message::{Block, ContentBlock, ConversationId, Role, Turn, TurnId, TurnStatus};
use parley_core::provider::Usage;
use parley_core::store::{CommitStatus, TurnStore};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use tracing::{debug, info};

/// A SQLite-backed [`TurnStore`].
pub struct SqliteTurnStore {
    pool: SqlitePool,
}

impl SqliteTurnStore {
    /// Open (or create) the database at `url` and run migrations.
    ///
    /// Pass `"sqlite::memory:"` for an ephemeral database (useful for tests).
    pub async fn new(url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| StoreError::Unavailable(format!("Invalid SQLite URL: {e}")))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .pragma("foreign_keys", "ON");

        // Every connection to `:memory:` is a separate database.
        let max_connections = if url.contains(":memory:") { 1 } else { 4 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Unavailable(format!("Failed to open SQLite: {e}")))?;

        let store = Self { pool };
        store.run_migrations().await?;
        info!("SQLite turn store initialized at {url}");
        Ok(store)
    }

    /// Create from an existing pool.
    pub async fn from_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS turns (
                iid               INTEGER PRIMARY KEY AUTOINCREMENT,
                id                TEXT UNIQUE NOT NULL,
                conversation_id   TEXT NOT NULL,
                user_id           TEXT NOT NULL,
                status            TEXT NOT NULL,
                token_count       INTEGER NOT NULL DEFAULT 0,
                prompt_tokens     INTEGER NOT NULL DEFAULT 0,
                completion_tokens INTEGER NOT NULL DEFAULT 0,
                total_tokens      INTEGER NOT NULL DEFAULT 0,
                supersedes        TEXT,
                created_at        TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::MigrationFailed(format!("turns table: {e}")))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS turn_blocks (
                turn_id  TEXT NOT NULL REFERENCES turns(id) ON DELETE CASCADE,
                ordinal  INTEGER NOT NULL,
                role     TEXT NOT NULL,
                kind     TEXT NOT NULL,
                payload  TEXT NOT NULL,
                PRIMARY KEY (turn_id, ordinal)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::MigrationFailed(format!("turn_blocks table: {e}")))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_turns_conversation ON turns(conversation_id, iid DESC)",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::MigrationFailed(format!("conversation index: {e}")))?;

        debug!("SQLite migrations complete");
        Ok(())
    }

    /// Load blocks for a set of turns, grouped by turn id and ordered by ordinal.
    async fn load_blocks(&self, turn_ids: &[String]) -> Result<HashMap<String, Vec<Block>>, StoreError> {
        let mut grouped: HashMap<String, Vec<Block>> = HashMap::new();
        if turn_ids.is_empty() {
            return Ok(grouped);
        }

        let placeholders = vec!["?"; turn_ids.len()].join(", ");
        let sql = format!(
            "SELECT turn_id, ordinal, role, payload FROM turn_blocks \
             WHERE turn_id IN ({placeholders}) ORDER BY turn_id, ordinal"
        );
        let mut query = sqlx::query(&sql);
        for id in turn_ids {
            query = query.bind(id);
        }
        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::QueryFailed(format!("load blocks: {e}")))?;

        for row in &rows {
            let (turn_id, block) = row_to_block(row)?;
            grouped.entry(turn_id).or_default().push(block);
        }
        Ok(grouped)
    }
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::QueryFailed(format!("invalid datetime: {e}")))
}

fn column<'r, T>(row: &'r sqlx::sqlite::SqliteRow, name: &str) -> Result<T, StoreError>
where
    T: sqlx::Decode<'r, sqlx::Sqlite> + sqlx::Type<sqlx::Sqlite>,
{
    row.try_get(name)
        .map_err(|e| StoreError::QueryFailed(format!("{name} column: {e}")))
}

fn row_to_block(row: &sqlx::sqlite::SqliteRow) -> Result<(String, Block), StoreError> {
    let turn_id: String = column(row, "turn_id")?;
    let ordinal: i64 = column(row, "ordinal")?;
    let role: String = column(row, "role")?;
    let payload: String = column(row, "payload")?;

    let corrupt = |reason: String| StoreError::Corrupt {
        turn_id: turn_id.clone(),
        reason,
    };
    let role = Role::from_str(&role).map_err(corrupt)?;
    let content: ContentBlock = serde_json::from_str(&payload)
        .map_err(|e| corrupt(format!("block {ordinal}: {e}")))?;

    Ok((
        turn_id.clone(),
        Block {
            ordinal: ordinal as u32,
            role,
            content,
        },
    ))
}

/// Parse a turn row. Blocks are attached by the caller.
fn row_to_turn(row: &sqlx::sqlite::SqliteRow) -> Result<Turn, StoreError> {
    let id: String = column(row, "id")?;
    let status: String = column(row, "status")?;
    let created_at: String = column(row, "created_at")?;
    let supersedes: Option<String> = column(row, "supersedes")?;

    let status = TurnStatus::from_str(&status).map_err(|reason| StoreError::Corrupt {
        turn_id: id.clone(),
        reason,
    })?;

    Ok(Turn {
        conversation_id: ConversationId(column(row, "conversation_id")?),
        user_id: column(row, "user_id")?,
        status,
        blocks: Vec::new(),
        token_count: column::<i64>(row, "token_count")? as u32,
        usage: Usage {
            prompt_tokens: column::<i64>(row, "prompt_tokens")? as u32,
            completion_tokens: column::<i64>(row, "completion_tokens")? as u32,
            total_tokens: column::<i64>(row, "total_tokens")? as u32,
        },
        supersedes: supersedes.map(TurnId),
        created_at: parse_datetime(&created_at)?,
        id: TurnId(id),
    })
}

#[async_trait]
impl TurnStore for SqliteTurnStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn recent_turns(
        &self,
        conversation_id: &ConversationId,
        limit: usize,
    ) -> Result<Vec<Turn>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM turns
            WHERE conversation_id = ?1 AND status != 'superseded'
            ORDER BY iid DESC
            LIMIT ?2
            "#,
        )
        .bind(conversation_id.as_str())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Unavailable(format!("recent turns: {e}")))?;

        let mut turns = rows.iter().map(row_to_turn).collect::<Result<Vec<_>, _>>()?;
        let ids: Vec<String> = turns.iter().map(|t| t.id.0.clone()).collect();
        let mut blocks = self.load_blocks(&ids).await?;
        for turn in &mut turns {
            turn.blocks = blocks.remove(turn.id.as_str()).unwrap_or_default();
        }
        Ok(turns)
    }

    async fn commit_turn(&self, turn: &Turn) -> Result<CommitStatus, StoreError> {
        turn.validate().map_err(|reason| StoreError::Corrupt {
            turn_id: turn.id.0.clone(),
            reason,
        })?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Unavailable(format!("begin: {e}")))?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO turns (id, conversation_id, user_id, status, token_count,
                               prompt_tokens, completion_tokens, total_tokens, supersedes, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            ON CONFLICT(id) DO NOTHING
            "#,
        )
        .bind(turn.id.as_str())
        .bind(turn.conversation_id.as_str())
        .bind(&turn.user_id)
        .bind(turn.status.as_str())
        .bind(turn.token_count as i64)
        .bind(turn.usage.prompt_tokens as i64)
        .bind(turn.usage.completion_tokens as i64)
        .bind(turn.usage.total_tokens as i64)
        .bind(turn.supersedes.as_ref().map(|s| s.as_str()))
        .bind(turn.created_at.to_rfc3339())
        .execute(&mut *tx)
        .await
        .map_err(|e| StoreError::QueryFailed(format!("insert turn: {e}")))?;

        if inserted.rows_affected() == 0 {
            debug!(turn_id = %turn.id, "Turn already committed");
            return Ok(CommitStatus::AlreadyCommitted);
        }

        for block in &turn.blocks {
            let payload = serde_json::to_string(&block.content).map_err(|e| StoreError::Corrupt {
                turn_id: turn.id.0.clone(),
                reason: format!("block {}: {e}", block.ordinal),
            })?;
            sqlx::query(
                "INSERT INTO turn_blocks (turn_id, ordinal, role, kind, payload) VALUES (?1, ?2, ?3, ?4, ?5)",
            )
            .bind(turn.id.as_str())
            .bind(block.ordinal as i64)
            .bind(block.role.as_str())
            .bind(block.content.kind())
            .bind(payload)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::QueryFailed(format!("insert block {}: {e}", block.ordinal)))?;
        }

        if let Some(previous) = &turn.supersedes {
            sqlx::query("UPDATE turns SET status = 'superseded' WHERE id = ?1 AND conversation_id = ?2")
                .bind(previous.as_str())
                .bind(turn.conversation_id.as_str())
                .execute(&mut *tx)
                .await
                .map_err(|e| StoreError::QueryFailed(format!("supersede: {e}")))?;
        }

        tx.commit()
            .await
            .map_err(|e| StoreError::QueryFailed(format!("commit: {e}")))?;

        debug!(turn_id = %turn.id, blocks = turn.blocks.len(), "Turn committed");
        Ok(CommitStatus::Committed)
    }

    async fn get_turn(&self, id: &TurnId) -> Result<Option<Turn>, StoreError> {
        let row = sqlx::query("SELECT * FROM turns WHERE id = ?1")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Unavailable(format!("get turn: {e}")))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let mut turn = row_to_turn(&row)?;
        turn.blocks = self
            .load_blocks(std::slice::from_ref(&turn.id.0))
            .await?
            .remove(turn.id.as_str())
            .unwrap_or_default();
        Ok(Some(turn))
    }

    async fn count_turns(&self, conversation_id: &ConversationId) -> Result<usize, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM turns WHERE conversation_id = ?1")
            .bind(conversation_id.as_str())
            .fetch_one(&self.pool)
            .await
            .map_err(|e| StoreError::Unavailable(format!("count turns: {e}")))?;
        Ok(count as usize)
    }

    async fn health_check(&self) -> Result<bool, StoreError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_core::message::NoticeKind;
    use serde_json::json;

    async fn test_store() -> SqliteTurnStore {
        SqliteTurnStore::new("sqlite::memory:").await.unwrap()
    }

    fn make_turn(conversation: &str, question: &str, answer: &str) -> Turn {
        Turn::builder(ConversationId::from(conversation), "u1")
            .push(Role::User, ContentBlock::text(question))
            .push(Role::Assistant, ContentBlock::text(answer))
            .with_token_count(12)
            .build()
    }

    #[tokio::test]
    async fn commit_and_read_back() {
        let store = test_store().await;
        let turn = Turn::builder(ConversationId::from("c1"), "u1")
            .push(Role::User, ContentBlock::text("weather in Paris?"))
            .push(
                Role::Assistant,
                ContentBlock::ToolCallRequest {
                    call_id: "call_1".into(),
                    name: "web_search".into(),
                    arguments: json!({"query": "paris weather"}),
                },
            )
            .push(
                Role::Tool,
                ContentBlock::ToolCallResult {
                    call_id: "call_1".into(),
                    name: "web_search".into(),
                    output: json!({"results": []}),
                    is_error: false,
                    latency_ms: 40,
                },
            )
            .push(Role::Assistant, ContentBlock::text("Sunny."))
            .with_usage(Usage { prompt_tokens: 100, completion_tokens: 20, total_tokens: 120 })
            .build();

        assert_eq!(store.commit_turn(&turn).await.unwrap(), CommitStatus::Committed);

        let loaded = store.get_turn(&turn.id).await.unwrap().unwrap();
        assert_eq!(loaded.blocks, turn.blocks);
        assert_eq!(loaded.usage.total_tokens, 120);
        assert_eq!(loaded.status, TurnStatus::Complete);
    }

    #[tokio::test]
    async fn commit_is_idempotent() {
        let store = test_store().await;
        let turn = make_turn("c1", "hi", "hello");

        assert_eq!(store.commit_turn(&turn).await.unwrap(), CommitStatus::Committed);
        assert_eq!(store.commit_turn(&turn).await.unwrap(), CommitStatus::AlreadyCommitted);
        assert_eq!(store.count_turns(&turn.conversation_id).await.unwrap(), 1);
        assert_eq!(store.get_turn(&turn.id).await.unwrap().unwrap().blocks.len(), 2);
    }

    #[tokio::test]
    async fn recent_turns_newest_first_and_scoped() {
        let store = test_store().await;
        for i in 0..5 {
            store.commit_turn(&make_turn("c1", &format!("q{i}"), &format!("a{i}"))).await.unwrap();
        }
        store.commit_turn(&make_turn("other", "x", "y")).await.unwrap();

        let recent = store.recent_turns(&ConversationId::from("c1"), 3).await.unwrap();
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].user_input(), vec![ContentBlock::text("q4")]);
        assert_eq!(recent[2].user_input(), vec![ContentBlock::text("q2")]);
    }

    #[tokio::test]
    async fn superseding_hides_previous_turn_atomically() {
        let store = test_store().await;
        let first = make_turn("c1", "q", "first answer");
        store.commit_turn(&first).await.unwrap();

        let mut redo = make_turn("c1", "q", "second answer");
        redo.supersedes = Some(first.id.clone());
        store.commit_turn(&redo).await.unwrap();

        let recent = store.recent_turns(&ConversationId::from("c1"), 10).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].id, redo.id);
        let old = store.get_turn(&first.id).await.unwrap().unwrap();
        assert_eq!(old.status, TurnStatus::Superseded);
    }

    #[tokio::test]
    async fn invalid_turn_is_rejected_without_writing() {
        let store = test_store().await;
        let turn = Turn::builder(ConversationId::from("c1"), "u1")
            .push(
                Role::Tool,
                ContentBlock::ToolCallResult {
                    call_id: "orphan".into(),
                    name: "web_search".into(),
                    output: json!({}),
                    is_error: true,
                    latency_ms: 0,
                },
            )
            .build();
        assert!(matches!(
            store.commit_turn(&turn).await,
            Err(StoreError::Corrupt { .. })
        ));
        assert_eq!(store.count_turns(&turn.conversation_id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn incomplete_turns_are_listed_with_status() {
        let store = test_store().await;
        let turn = Turn::builder(ConversationId::from("c1"), "u1")
            .push(Role::User, ContentBlock::text("long question"))
            .push(Role::Assistant, ContentBlock::text("partial"))
            .push(Role::Assistant, ContentBlock::notice(NoticeKind::Cancelled, "cancelled"))
            .with_status(TurnStatus::Incomplete)
            .build();
        store.commit_turn(&turn).await.unwrap();

        let recent = store.recent_turns(&turn.conversation_id, 10).await.unwrap();
        assert_eq!(recent[0].status, TurnStatus::Incomplete);
        assert_eq!(recent[0].count_blocks("notice"), 1);
    }

    #[tokio::test]
    async fn file_backed_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("turns.db").display());
        let turn = make_turn("c1", "persist me", "ok");
        {
            let store = SqliteTurnStore::new(&url).await.unwrap();
            store.commit_turn(&turn).await.unwrap();
        }
        let reopened = SqliteTurnStore::new(&url).await.unwrap();
        assert!(reopened.get_turn(&turn.id).await.unwrap().is_some());
        assert!(reopened.health_check().await.unwrap());
    }
}
