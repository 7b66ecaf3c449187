//! The store-facing contract (spec §4.3): the read/write surface the API
//! and scheduler consume. `MessageStore` is implemented by [`sqlite::SqliteStore`]
//! (the real backend) and [`memory::MemoryStore`] (an in-memory test double) —
//! handler and scheduler code depends only on the trait.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// An attachment as it crosses the API boundary (spec §3, §6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub filename: String,
    pub mime_type: String,
    pub size_bytes: i64,
}

/// A message as it crosses the API boundary (spec §3). `body` and
/// `attachments` are only populated by `get_message`; `list_messages` and
/// `search_messages` return summaries with these left empty.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    pub id: i64,
    pub subject: String,
    pub from: String,
    pub to: Vec<String>,
    pub sent_at: Option<DateTime<Utc>>,
    pub snippet: String,
    pub labels: Vec<String>,
    pub has_attachments: bool,
    pub size_bytes: i64,
    pub body: String,
    pub attachments: Vec<Attachment>,
}

/// Aggregate counts for the whole archive (spec §3, §4.3).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub total_messages: i64,
    pub total_threads: i64,
    pub total_sources: i64,
    pub total_labels: i64,
    pub total_attachments: i64,
    pub database_size_bytes: i64,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(#[from] sqlx::Error),
    #[error("store integrity error: {0}")]
    Corrupt(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// The read/write surface the HTTP API and scheduler consume.
///
/// `GetMessage` returns `Ok(None)` — never an error — when the id does not
/// exist (spec §4.3). Implementations must never interpolate user input
/// into SQL text; all queries go through bind parameters.
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn get_stats(&self) -> StoreResult<StoreStats>;

    /// Messages ordered by `sent_at` descending, tie-broken by id descending.
    /// `total` is the unpaginated count. `limit`/`offset` are honored as-is;
    /// clamping to sane ranges is the API layer's job (spec §4.5).
    async fn list_messages(&self, offset: i64, limit: i64) -> StoreResult<(Vec<Message>, i64)>;

    /// `None` (not an error) when `id` does not exist. Includes body text and
    /// attachments in insertion order.
    async fn get_message(&self, id: i64) -> StoreResult<Option<Message>>;

    /// Full-text search over subject, body, sender, and recipient address
    /// bags, ordered by recency. Falls back to a `LIKE` scan over subject
    /// and body when the FTS index has no rows yet.
    async fn search_messages(
        &self,
        query: &str,
        offset: i64,
        limit: i64,
    ) -> StoreResult<(Vec<Message>, i64)>;
}
