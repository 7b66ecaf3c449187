//! JSON endpoint handlers (spec §4.5).

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;

use crate::config::AccountEntry;
use crate::rest::dto::*;
use crate::rest::error::ApiError;
use crate::rest::AppState;
use crate::scheduler::SchedulerError;
use crate::security;

pub async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

pub async fn get_stats(
    State(state): State<Arc<AppState>>,
) -> Result<Json<StatsResponse>, ApiError> {
    let stats = state.store.get_stats().await?;
    Ok(Json(StatsResponse {
        total_messages: stats.total_messages,
        total_threads: stats.total_threads,
        total_accounts: stats.total_sources,
        total_labels: stats.total_labels,
        total_attachments: stats.total_attachments,
        database_size_bytes: stats.database_size_bytes,
    }))
}

pub async fn list_messages(
    State(state): State<Arc<AppState>>,
    Query(q): Query<ListMessagesQuery>,
) -> Result<Json<ListMessagesResponse>, ApiError> {
    let (page, page_size) = clamp_pagination(q.page, q.page_size);
    let offset = (page - 1) * page_size;
    let (messages, total) = state.store.list_messages(offset, page_size).await?;
    Ok(Json(ListMessagesResponse {
        total,
        page,
        page_size,
        messages: messages.into_iter().map(MessageSummary::from).collect(),
    }))
}

pub async fn get_message(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<MessageDetail>, ApiError> {
    let id: i64 = id.parse().map_err(|_| ApiError::InvalidId)?;
    let message = state
        .store
        .get_message(id)
        .await?
        .ok_or(ApiError::NotFound)?;
    Ok(Json(MessageDetail::from(message)))
}

pub async fn search_messages(
    State(state): State<Arc<AppState>>,
    Query(q): Query<SearchQuery>,
) -> Result<Json<SearchResult>, ApiError> {
    let query = q.q.unwrap_or_default();
    if query.trim().is_empty() {
        return Err(ApiError::MissingQuery);
    }
    let (page, page_size) = clamp_pagination(q.page, q.page_size);
    let offset = (page - 1) * page_size;
    let (messages, total) = state.store.search_messages(&query, offset, page_size).await?;
    Ok(Json(SearchResult {
        query,
        total,
        page,
        page_size,
        messages: messages.into_iter().map(MessageSummary::from).collect(),
    }))
}

pub async fn list_accounts(State(state): State<Arc<AppState>>) -> Json<AccountsResponse> {
    let accounts = state.accounts.lock().await.clone();
    let statuses: HashMap<String, _> = state
        .scheduler
        .status()
        .into_iter()
        .map(|s| (s.email.clone(), s))
        .collect();

    let accounts = accounts
        .into_iter()
        .map(|a| {
            let status = statuses.get(&a.email);
            AccountInfo {
                email: a.email,
                // No display-name concept exists for a scheduled account in
                // this system (`AddAccount` takes only email + cron
                // expression) — always absent, like the spec's optional
                // field table implies when nothing populates it.
                display_name: None,
                last_sync_at: status.and_then(|s| s.last_run),
                next_sync_at: status.and_then(|s| s.next_run),
                schedule: Some(a.schedule),
                enabled: a.enabled,
            }
        })
        .collect();

    Json(AccountsResponse { accounts })
}

pub async fn trigger_sync(
    State(state): State<Arc<AppState>>,
    Path(account): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    if account.trim().is_empty() {
        return Err(ApiError::MissingAccount);
    }

    match state.scheduler.trigger_sync(&account) {
        Ok(()) => Ok((
            StatusCode::ACCEPTED,
            Json(SyncAcceptedResponse {
                status: "accepted".to_string(),
                message: format!("sync triggered for {account}"),
            }),
        )),
        Err(SchedulerError::UnknownAccount(email)) => Err(ApiError::UnknownAccount(email)),
        Err(SchedulerError::AlreadyRunning(email)) => Err(ApiError::SyncAlreadyRunning(email)),
        Err(SchedulerError::ShuttingDown) => Err(ApiError::SchedulerUnavailable),
        Err(e) => Err(ApiError::Internal(e.to_string())),
    }
}

pub async fn scheduler_status(
    State(state): State<Arc<AppState>>,
) -> Json<SchedulerStatusResponse> {
    let running = state.scheduler.is_running();
    let accounts = state
        .scheduler
        .status()
        .into_iter()
        .map(|s| AccountStatus {
            email: s.email,
            running: s.running,
            last_run: s.last_run,
            next_run: s.next_run,
            schedule: s.schedule,
            last_error: if s.last_error.is_empty() {
                None
            } else {
                Some(s.last_error)
            },
        })
        .collect();
    Json(SchedulerStatusResponse { running, accounts })
}

pub async fn upload_token(
    State(state): State<Arc<AppState>>,
    Path(email): Path<String>,
    body: axum::body::Bytes,
) -> Result<impl IntoResponse, ApiError> {
    security::validate_email(&email).map_err(|e| ApiError::InvalidEmail(e.to_string()))?;

    let value: serde_json::Value =
        serde_json::from_slice(&body).map_err(|e| ApiError::InvalidJson(e.to_string()))?;
    let has_refresh_token = value
        .get("refresh_token")
        .and_then(|v| v.as_str())
        .is_some_and(|s| !s.is_empty());
    if !has_refresh_token {
        return Err(ApiError::InvalidToken(
            "missing non-empty refresh_token".to_string(),
        ));
    }

    let path = security::token_path_for_email(&state.config.tokens_dir, &email)
        .map_err(|e| ApiError::InvalidToken(e.to_string()))?;
    security::atomic_write(&path, &body).map_err(|e| ApiError::Internal(e.to_string()))?;

    Ok(StatusCode::CREATED)
}

pub async fn add_account(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AddAccountRequest>,
) -> Result<impl IntoResponse, ApiError> {
    security::validate_email(&req.email).map_err(|e| ApiError::InvalidEmail(e.to_string()))?;
    security::validate_cron_expr(&req.schedule)
        .map_err(|e| ApiError::InvalidSchedule(e.to_string()))?;

    let mut accounts = state.accounts.lock().await;
    if accounts.iter().any(|a| a.email == req.email) {
        return Ok((StatusCode::OK, Json(json!({"status": "exists"}))));
    }

    state
        .scheduler
        .add_account(&req.email, &req.schedule)
        .map_err(|e| ApiError::InvalidSchedule(e.to_string()))?;

    let mut candidate = accounts.clone();
    candidate.push(AccountEntry {
        email: req.email.clone(),
        schedule: req.schedule.clone(),
        enabled: req.enabled,
    });

    let mut to_persist = state.config.clone();
    to_persist.accounts = candidate.clone();

    if let Err(e) = to_persist.persist_accounts() {
        state.scheduler.remove_account(&req.email);
        return Err(ApiError::Internal(e.to_string()));
    }

    *accounts = candidate;
    Ok((StatusCode::CREATED, Json(json!({"status": "created"}))))
}
