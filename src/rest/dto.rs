//! JSON request/response shapes (spec §6).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::store::Message;

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub total_messages: i64,
    pub total_threads: i64,
    pub total_accounts: i64,
    pub total_labels: i64,
    pub total_attachments: i64,
    pub database_size_bytes: i64,
}

#[derive(Debug, Serialize)]
pub struct AttachmentSummary {
    pub filename: String,
    pub mime_type: String,
    pub size_bytes: i64,
}

#[derive(Debug, Serialize)]
pub struct MessageSummary {
    pub id: i64,
    pub subject: String,
    pub from: String,
    pub to: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sent_at: Option<DateTime<Utc>>,
    pub snippet: String,
    pub labels: Vec<String>,
    pub has_attachments: bool,
    pub size_bytes: i64,
}

impl From<Message> for MessageSummary {
    fn from(m: Message) -> Self {
        Self {
            id: m.id,
            subject: m.subject,
            from: m.from,
            to: m.to,
            sent_at: m.sent_at,
            snippet: m.snippet,
            labels: m.labels,
            has_attachments: m.has_attachments,
            size_bytes: m.size_bytes,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct MessageDetail {
    #[serde(flatten)]
    pub summary: MessageSummary,
    pub body: String,
    pub attachments: Vec<AttachmentSummary>,
}

impl From<Message> for MessageDetail {
    fn from(m: Message) -> Self {
        let attachments = m
            .attachments
            .iter()
            .map(|a| AttachmentSummary {
                filename: a.filename.clone(),
                mime_type: a.mime_type.clone(),
                size_bytes: a.size_bytes,
            })
            .collect();
        let body = m.body.clone();
        Self {
            attachments,
            body,
            summary: MessageSummary::from(m),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ListMessagesResponse {
    pub total: i64,
    pub page: i64,
    pub page_size: i64,
    pub messages: Vec<MessageSummary>,
}

#[derive(Debug, Serialize)]
pub struct SearchResult {
    pub query: String,
    pub total: i64,
    pub page: i64,
    pub page_size: i64,
    pub messages: Vec<MessageSummary>,
}

#[derive(Debug, Serialize)]
pub struct AccountInfo {
    pub email: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_sync_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_sync_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schedule: Option<String>,
    pub enabled: bool,
}

#[derive(Debug, Serialize)]
pub struct AccountsResponse {
    pub accounts: Vec<AccountInfo>,
}

#[derive(Debug, Serialize)]
pub struct AccountStatus {
    pub email: String,
    pub running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_run: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_run: Option<DateTime<Utc>>,
    pub schedule: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SchedulerStatusResponse {
    pub running: bool,
    pub accounts: Vec<AccountStatus>,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SyncAcceptedResponse {
    pub status: String,
    pub message: String,
}

#[derive(Debug, Deserialize, Default)]
pub struct ListMessagesQuery {
    pub page: Option<i64>,
    pub page_size: Option<i64>,
}

#[derive(Debug, Deserialize, Default)]
pub struct SearchQuery {
    pub q: Option<String>,
    pub page: Option<i64>,
    pub page_size: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct AddAccountRequest {
    pub email: String,
    pub schedule: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

/// `page ≤ 0` becomes 1; `page_size` outside `[1, 100]` becomes 20 (spec §4.5, §8).
pub fn clamp_pagination(page: Option<i64>, page_size: Option<i64>) -> (i64, i64) {
    let page = match page {
        Some(p) if p > 0 => p,
        _ => 1,
    };
    let page_size = match page_size {
        Some(s) if (1..=100).contains(&s) => s,
        _ => 20,
    };
    (page, page_size)
}
