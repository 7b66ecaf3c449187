//! In-memory `MessageStore` test double (spec §9: "Store polymorphism").
//!
//! Used by handler and scheduler tests so neither depends on the concrete
//! SQL backend's vocabulary.

use async_trait::async_trait;
use std::sync::Mutex;

use super::{Message, MessageStore, StoreResult, StoreStats};

#[derive(Default)]
pub struct MemoryStore {
    messages: Mutex<Vec<Message>>,
    stats: Mutex<StoreStats>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a message, keeping the store sorted by `sent_at` descending (the
    /// same order the SQL backend returns).
    pub fn seed(&self, message: Message) {
        let mut messages = self.messages.lock().unwrap();
        messages.push(message);
        messages.sort_by(|a, b| b.sent_at.cmp(&a.sent_at).then(b.id.cmp(&a.id)));

        let mut stats = self.stats.lock().unwrap();
        stats.total_messages = messages.len() as i64;
    }

    pub fn set_stats(&self, stats: StoreStats) {
        *self.stats.lock().unwrap() = stats;
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn get_stats(&self) -> StoreResult<StoreStats> {
        Ok(*self.stats.lock().unwrap())
    }

    async fn list_messages(&self, offset: i64, limit: i64) -> StoreResult<(Vec<Message>, i64)> {
        let messages = self.messages.lock().unwrap();
        let total = messages.len() as i64;
        let page = page_slice(&messages, offset, limit)
            .into_iter()
            .map(summarize)
            .collect();
        Ok((page, total))
    }

    async fn get_message(&self, id: i64) -> StoreResult<Option<Message>> {
        let messages = self.messages.lock().unwrap();
        Ok(messages.iter().find(|m| m.id == id).cloned())
    }

    async fn search_messages(
        &self,
        query: &str,
        offset: i64,
        limit: i64,
    ) -> StoreResult<(Vec<Message>, i64)> {
        let q = query.to_lowercase();
        let messages = self.messages.lock().unwrap();
        let matches: Vec<Message> = messages
            .iter()
            .filter(|m| {
                m.subject.to_lowercase().contains(&q)
                    || m.body.to_lowercase().contains(&q)
                    || m.from.to_lowercase().contains(&q)
                    || m.to.iter().any(|t| t.to_lowercase().contains(&q))
            })
            .cloned()
            .collect();
        let total = matches.len() as i64;
        let page = page_slice(&matches, offset, limit)
            .into_iter()
            .map(summarize)
            .collect();
        Ok((page, total))
    }
}

fn page_slice(messages: &[Message], offset: i64, limit: i64) -> Vec<Message> {
    if limit <= 0 || offset < 0 {
        return Vec::new();
    }
    let offset = offset as usize;
    let limit = limit as usize;
    messages
        .iter()
        .skip(offset)
        .take(limit)
        .cloned()
        .collect()
}

/// `list_messages`/`search_messages` return summaries: body and attachments
/// are left empty, matching the SQL backend's two-tier fetch.
fn summarize(mut m: Message) -> Message {
    m.body.clear();
    m.attachments.clear();
    m
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn msg(id: i64, subject: &str, minutes_ago: i64) -> Message {
        Message {
            id,
            subject: subject.to_string(),
            from: "a@example.com".to_string(),
            sent_at: Some(Utc.timestamp_opt(1_700_000_000 - minutes_ago * 60, 0).unwrap()),
            body: format!("body of {subject}"),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn list_messages_orders_by_recency() {
        let store = MemoryStore::new();
        store.seed(msg(1, "older", 10));
        store.seed(msg(2, "newer", 0));

        let (messages, total) = store.list_messages(0, 10).await.unwrap();
        assert_eq!(total, 2);
        assert_eq!(messages[0].subject, "newer");
        assert_eq!(messages[1].subject, "older");
    }

    #[tokio::test]
    async fn summaries_omit_body() {
        let store = MemoryStore::new();
        store.seed(msg(1, "x", 0));
        let (messages, _) = store.list_messages(0, 10).await.unwrap();
        assert!(messages[0].body.is_empty());
    }

    #[tokio::test]
    async fn get_message_returns_full_body() {
        let store = MemoryStore::new();
        store.seed(msg(1, "x", 0));
        let message = store.get_message(1).await.unwrap().unwrap();
        assert_eq!(message.body, "body of x");
    }

    #[tokio::test]
    async fn get_message_unknown_id_is_none() {
        let store = MemoryStore::new();
        assert!(store.get_message(42).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn search_matches_subject_and_body() {
        let store = MemoryStore::new();
        store.seed(msg(1, "Invoice", 0));
        store.seed(msg(2, "Newsletter", 1));

        let (messages, total) = store.search_messages("invoice", 0, 10).await.unwrap();
        assert_eq!(total, 1);
        assert_eq!(messages[0].id, 1);
    }
}
