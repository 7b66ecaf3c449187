//! SQLite-backed `MessageStore` (spec §3, §4.3).

use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use tracing::{debug, warn};

use super::{Attachment, Message, MessageStore, StoreError, StoreResult, StoreStats};

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
    db_path: std::path::PathBuf,
}

impl SqliteStore {
    pub async fn new(db_path: &Path) -> StoreResult<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let opts = SqliteConnectOptions::from_str(&format!("sqlite://{}", db_path.display()))
            .map_err(sqlx::Error::from)?
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            .create_if_missing(true);

        let pool = SqlitePool::connect_with(opts).await?;
        Self::migrate(&pool).await?;
        Ok(Self {
            pool,
            db_path: db_path.to_path_buf(),
        })
    }

    /// Runs the whole migration file as one multi-statement batch (the
    /// trigger bodies below contain their own internal `;`-separated
    /// statements, so splitting the file naively on `;` would cut a
    /// `CREATE TRIGGER ... BEGIN ... END;` block apart).
    async fn migrate(pool: &SqlitePool) -> StoreResult<()> {
        sqlx::raw_sql(include_str!("migrations/001_init.sql"))
            .execute(pool)
            .await?;
        Ok(())
    }

    /// Run SQLite's integrity check. Bulk-copy tooling that temporarily
    /// relaxes foreign keys must call this before committing (spec §3).
    pub async fn check_integrity(&self) -> StoreResult<()> {
        let row: (String,) = sqlx::query_as("PRAGMA integrity_check")
            .fetch_one(&self.pool)
            .await?;
        if row.0 != "ok" {
            return Err(StoreError::Corrupt(row.0));
        }
        Ok(())
    }

    pub fn pool(&self) -> SqlitePool {
        self.pool.clone()
    }

    async fn count_fts_rows(&self) -> StoreResult<i64> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM messages_fts")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0)
    }

    /// Explicitly (re)index one message's searchable text. The schema
    /// triggers on `messages`/`message_bodies`/`message_recipients` insert
    /// keep `messages_fts` current on their own; this is for callers that
    /// need to force a reindex outside that path (bulk reimport, a restored
    /// backup predating the triggers, manual repair).
    pub async fn index_message_for_search(
        &self,
        message_id: i64,
        subject: &str,
        body: &str,
        sender: &str,
        recipients: &str,
    ) -> StoreResult<()> {
        sqlx::query("DELETE FROM messages_fts WHERE rowid = ?")
            .bind(message_id)
            .execute(&self.pool)
            .await?;
        sqlx::query(
            "INSERT INTO messages_fts (rowid, subject, body, sender, recipients) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(message_id)
        .bind(subject)
        .bind(body)
        .bind(sender)
        .bind(recipients)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_messages_by_ids(&self, ids: &[i64]) -> StoreResult<Vec<Message>> {
        let mut out = Vec::with_capacity(ids.len());
        for &id in ids {
            if let Some(m) = self.get_summary(id).await? {
                out.push(m);
            }
        }
        Ok(out)
    }

    async fn get_summary(&self, id: i64) -> StoreResult<Option<Message>> {
        let row = sqlx::query(
            "SELECT m.id, m.subject, m.snippet, m.sent_at, m.size_bytes, m.has_attachments, \
                    COALESCE(p.email, p.display_name, '') AS from_addr \
             FROM messages m \
             LEFT JOIN participants p ON p.id = m.from_participant_id \
             WHERE m.id = ? AND m.deleted_from_source_at IS NULL",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let to = self.recipients_for(id).await?;
        let labels = self.labels_for(id).await?;
        let sent_at: Option<String> = row.try_get("sent_at").ok();

        Ok(Some(Message {
            id: row.try_get("id")?,
            subject: row.try_get("subject")?,
            from: row.try_get("from_addr")?,
            to,
            sent_at: sent_at.and_then(|s| DateTime::parse_from_rfc3339(&s).ok().map(|d| d.with_timezone(&Utc))),
            snippet: row.try_get("snippet")?,
            labels,
            has_attachments: row.try_get::<i64, _>("has_attachments")? != 0,
            size_bytes: row.try_get("size_bytes")?,
            body: String::new(),
            attachments: Vec::new(),
        }))
    }

    async fn recipients_for(&self, message_id: i64) -> StoreResult<Vec<String>> {
        let rows = sqlx::query(
            "SELECT COALESCE(p.email, p.display_name, '') AS addr \
             FROM message_recipients mr \
             JOIN participants p ON p.id = mr.participant_id \
             WHERE mr.message_id = ? \
             ORDER BY mr.ordinal ASC",
        )
        .bind(message_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|r| r.try_get::<String, _>("addr").map_err(StoreError::from))
            .collect()
    }

    async fn labels_for(&self, message_id: i64) -> StoreResult<Vec<String>> {
        let rows = sqlx::query(
            "SELECT l.name FROM message_labels ml \
             JOIN labels l ON l.id = ml.label_id \
             WHERE ml.message_id = ? ORDER BY l.name ASC",
        )
        .bind(message_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|r| r.try_get::<String, _>("name").map_err(StoreError::from))
            .collect()
    }

    async fn attachments_for(&self, message_id: i64) -> StoreResult<Vec<Attachment>> {
        let rows = sqlx::query(
            "SELECT filename, mime_type, size_bytes FROM attachments \
             WHERE message_id = ? ORDER BY ordinal ASC",
        )
        .bind(message_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|r| {
                Ok(Attachment {
                    filename: r.try_get("filename")?,
                    mime_type: r.try_get("mime_type")?,
                    size_bytes: r.try_get("size_bytes")?,
                })
            })
            .collect()
    }
}

#[async_trait]
impl MessageStore for SqliteStore {
    async fn get_stats(&self) -> StoreResult<StoreStats> {
        let (total_messages,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM messages WHERE deleted_from_source_at IS NULL")
                .fetch_one(&self.pool)
                .await?;
        let (total_threads,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM conversations")
            .fetch_one(&self.pool)
            .await?;
        let (total_sources,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM sources")
            .fetch_one(&self.pool)
            .await?;
        let (total_labels,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM labels")
            .fetch_one(&self.pool)
            .await?;
        let (total_attachments,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM attachments")
            .fetch_one(&self.pool)
            .await?;

        let database_size_bytes = std::fs::metadata(&self.db_path)
            .map(|m| m.len() as i64)
            .unwrap_or_else(|e| {
                debug!(path = %self.db_path.display(), err = %e, "could not stat database file");
                0
            });

        Ok(StoreStats {
            total_messages,
            total_threads,
            total_sources,
            total_labels,
            total_attachments,
            database_size_bytes,
        })
    }

    async fn list_messages(&self, offset: i64, limit: i64) -> StoreResult<(Vec<Message>, i64)> {
        let (total,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM messages WHERE deleted_from_source_at IS NULL")
                .fetch_one(&self.pool)
                .await?;

        let rows = sqlx::query(
            "SELECT id FROM messages WHERE deleted_from_source_at IS NULL \
             ORDER BY sent_at DESC, id DESC LIMIT ? OFFSET ?",
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        let ids: Vec<i64> = rows
            .into_iter()
            .map(|r| r.try_get::<i64, _>("id"))
            .collect::<Result<_, _>>()?;

        let messages = self.load_messages_by_ids(&ids).await?;
        Ok((messages, total))
    }

    async fn get_message(&self, id: i64) -> StoreResult<Option<Message>> {
        let Some(mut message) = self.get_summary(id).await? else {
            return Ok(None);
        };

        let body: Option<(String,)> = sqlx::query_as("SELECT body FROM message_bodies WHERE message_id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        message.body = body.map(|(b,)| b).unwrap_or_default();
        message.attachments = self.attachments_for(id).await?;

        Ok(Some(message))
    }

    async fn search_messages(
        &self,
        query: &str,
        offset: i64,
        limit: i64,
    ) -> StoreResult<(Vec<Message>, i64)> {
        let fts_rows = self.count_fts_rows().await?;

        if fts_rows > 0 {
            let escaped = escape_fts_query(query);
            let total: (i64,) = sqlx::query_as(
                "SELECT COUNT(*) FROM messages_fts JOIN messages ON messages.id = messages_fts.rowid \
                 WHERE messages_fts MATCH ? AND messages.deleted_from_source_at IS NULL",
            )
            .bind(&escaped)
            .fetch_one(&self.pool)
            .await?;

            let rows = sqlx::query(
                "SELECT messages.id FROM messages_fts \
                 JOIN messages ON messages.id = messages_fts.rowid \
                 WHERE messages_fts MATCH ? AND messages.deleted_from_source_at IS NULL \
                 ORDER BY messages.sent_at DESC, messages.id DESC LIMIT ? OFFSET ?",
            )
            .bind(&escaped)
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await?;

            let ids: Vec<i64> = rows
                .into_iter()
                .map(|r| r.try_get::<i64, _>("id"))
                .collect::<Result<_, _>>()?;
            let messages = self.load_messages_by_ids(&ids).await?;
            return Ok((messages, total.0));
        }

        warn!("FTS index empty — falling back to LIKE scan for search");
        let like = format!("%{}%", like_escape(query));
        let total: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM messages \
             LEFT JOIN message_bodies ON message_bodies.message_id = messages.id \
             WHERE deleted_from_source_at IS NULL \
               AND (messages.subject LIKE ? ESCAPE '\\' OR message_bodies.body LIKE ? ESCAPE '\\')",
        )
        .bind(&like)
        .bind(&like)
        .fetch_one(&self.pool)
        .await?;

        let rows = sqlx::query(
            "SELECT messages.id FROM messages \
             LEFT JOIN message_bodies ON message_bodies.message_id = messages.id \
             WHERE deleted_from_source_at IS NULL \
               AND (messages.subject LIKE ? ESCAPE '\\' OR message_bodies.body LIKE ? ESCAPE '\\') \
             ORDER BY messages.sent_at DESC, messages.id DESC LIMIT ? OFFSET ?",
        )
        .bind(&like)
        .bind(&like)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        let ids: Vec<i64> = rows
            .into_iter()
            .map(|r| r.try_get::<i64, _>("id"))
            .collect::<Result<_, _>>()?;
        let messages = self.load_messages_by_ids(&ids).await?;
        Ok((messages, total.0))
    }
}

/// Quote each term so that FTS5 special characters in user input (`"`, `-`,
/// `*`, ...) are never interpreted as query syntax.
fn escape_fts_query(query: &str) -> String {
    query
        .split_whitespace()
        .map(|term| format!("\"{}\"", term.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Escape `%`, `_`, and `\` for a `LIKE ... ESCAPE '\'` clause.
fn like_escape(s: &str) -> String {
    s.replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn seeded_store() -> (tempfile::TempDir, SqliteStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::new(&dir.path().join("test.db")).await.unwrap();

        sqlx::query("INSERT INTO sources (id, email, provider, created_at) VALUES (1, 'a@example.com', 'gmail', '2024-01-01T00:00:00Z')")
            .execute(&store.pool)
            .await
            .unwrap();
        sqlx::query(
            "INSERT INTO conversations (id, source_id, thread_key) VALUES (1, 1, 't1')",
        )
        .execute(&store.pool)
        .await
        .unwrap();
        sqlx::query(
            "INSERT INTO participants (id, source_id, email) VALUES (1, 1, 'sender@example.com')",
        )
        .execute(&store.pool)
        .await
        .unwrap();
        sqlx::query(
            "INSERT INTO messages (id, conversation_id, source_id, source_message_id, subject, \
             from_participant_id, sent_at, snippet) \
             VALUES (1, 1, 1, 'm1', 'Test Subject', 1, '2024-01-15T10:30:00Z', 'hello there')",
        )
        .execute(&store.pool)
        .await
        .unwrap();
        sqlx::query("INSERT INTO message_bodies (message_id, body) VALUES (1, 'hello there world')")
            .execute(&store.pool)
            .await
            .unwrap();

        (dir, store)
    }

    #[tokio::test]
    async fn list_messages_normalizes_empty_collections() {
        let (_dir, store) = seeded_store().await;
        let (messages, total) = store.list_messages(0, 10).await.unwrap();
        assert_eq!(total, 1);
        assert_eq!(messages[0].subject, "Test Subject");
        assert!(messages[0].to.is_empty());
        assert!(messages[0].labels.is_empty());
    }

    #[tokio::test]
    async fn get_message_unknown_id_is_none_not_error() {
        let (_dir, store) = seeded_store().await;
        let result = store.get_message(99999).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn get_message_includes_body_and_attachments() {
        let (_dir, store) = seeded_store().await;
        sqlx::query(
            "INSERT INTO attachments (message_id, filename, mime_type, size_bytes, ordinal) \
             VALUES (1, 'a.pdf', 'application/pdf', 1024, 0)",
        )
        .execute(&store.pool)
        .await
        .unwrap();

        let message = store.get_message(1).await.unwrap().unwrap();
        assert_eq!(message.body, "hello there world");
        assert_eq!(message.attachments.len(), 1);
        assert_eq!(message.attachments[0].filename, "a.pdf");
    }

    #[tokio::test]
    async fn fts_index_is_maintained_by_triggers_without_manual_indexing() {
        let (_dir, store) = seeded_store().await;
        // Nothing here calls `index_message_for_search` — the schema
        // triggers on `messages`/`message_bodies`/`message_recipients`
        // insert are solely responsible for keeping `messages_fts` current.
        assert_eq!(store.count_fts_rows().await.unwrap(), 1);

        let (messages, total) = store.search_messages("world", 0, 10).await.unwrap();
        assert_eq!(total, 1);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].id, 1);
    }

    #[tokio::test]
    async fn search_falls_back_to_like_for_rows_the_fts_index_never_saw() {
        let (_dir, store) = seeded_store().await;
        // Simulate data that predates the FTS triggers (e.g. a restored
        // backup taken before this schema version): wipe the index the
        // triggers built and confirm search still finds the message via
        // the `LIKE` fallback.
        sqlx::query("DELETE FROM messages_fts")
            .execute(&store.pool)
            .await
            .unwrap();
        assert_eq!(store.count_fts_rows().await.unwrap(), 0);

        let (messages, total) = store.search_messages("hello", 0, 10).await.unwrap();
        assert_eq!(total, 1);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].id, 1);
    }

    #[tokio::test]
    async fn index_message_for_search_supports_explicit_reindex() {
        let (_dir, store) = seeded_store().await;
        sqlx::query("DELETE FROM messages_fts")
            .execute(&store.pool)
            .await
            .unwrap();

        store
            .index_message_for_search(1, "Test Subject", "hello there world", "sender@example.com", "")
            .await
            .unwrap();

        assert_eq!(store.count_fts_rows().await.unwrap(), 1);
        let (messages, total) = store.search_messages("world", 0, 10).await.unwrap();
        assert_eq!(total, 1);
        assert_eq!(messages.len(), 1);
    }

    #[tokio::test]
    async fn search_query_is_never_interpolated() {
        let (_dir, store) = seeded_store().await;
        // An FTS-special character and a SQL-special character should not
        // break the query or match everything.
        let (messages, _total) = store.search_messages("'; DROP TABLE messages; --", 0, 10).await.unwrap();
        assert!(messages.is_empty());

        let (messages, _total) = store.search_messages("\"hello", 0, 10).await.unwrap();
        // Quoted input is escaped, not treated as FTS syntax; a literal
        // substring match against the LIKE fallback still finds nothing
        // odd and does not panic or error.
        let _ = messages;
    }

    #[tokio::test]
    async fn integrity_check_passes_on_fresh_db() {
        let (_dir, store) = seeded_store().await;
        store.check_integrity().await.unwrap();
    }
}
