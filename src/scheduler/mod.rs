//! Cron-driven, per-account sync scheduler (spec §4.4).
//!
//! Guarantees at-most-one concurrent `run_sync` per account, supports a
//! manual trigger, and cooperates with graceful shutdown by cancelling
//! in-flight syncs through a [`CancellationToken`].

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use cron::Schedule;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::AccountEntry;

/// `(context, email) -> Result<(), error>` — the provider-specific sync
/// implementation injected by the caller (spec §1, §9). Kept external so the
/// scheduler is testable with stubs and independent of any provider SDK.
pub type SyncCallback = Arc<
    dyn Fn(CancellationToken, String) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>
        + Send
        + Sync,
>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CronError {
    #[error("cron expression must have exactly 5 fields, got {0}")]
    InvalidFieldCount(usize),
    #[error("cron expression parse error: {0}")]
    Parse(String),
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("invalid cron expression: {0}")]
    InvalidCron(#[from] CronError),
    #[error("sync already running for {0}")]
    AlreadyRunning(String),
    #[error("unknown account: {0}")]
    UnknownAccount(String),
    #[error("scheduler is shutting down")]
    ShuttingDown,
}

/// Pure parser check used by the "add account" endpoint and by `AddAccount`
/// itself (spec §4.4, §4.7).
pub fn validate_cron_expr(expr: &str) -> Result<(), CronError> {
    parse_schedule(expr).map(|_| ())
}

fn parse_schedule(expr: &str) -> Result<Schedule, CronError> {
    let field_count = expr.split_whitespace().count();
    if field_count != 5 {
        return Err(CronError::InvalidFieldCount(field_count));
    }
    // The `cron` crate parses a 6-field "sec min hour dom month dow" grammar;
    // a 5-field crontab expression is a seconds-less synonym, so prefix a
    // literal "0" seconds field.
    let six_field = format!("0 {expr}");
    Schedule::from_str(&six_field).map_err(|e| CronError::Parse(e.to_string()))
}

/// Snapshot of one scheduled email (spec §4.4, §4.5 `AccountStatus`).
#[derive(Debug, Clone)]
pub struct JobStatus {
    pub email: String,
    pub running: bool,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
    pub schedule: String,
    pub last_error: String,
}

struct JobEntry {
    cron_expr: String,
    schedule: Schedule,
    running: bool,
    last_run: Option<DateTime<Utc>>,
    last_error: String,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

enum Claim {
    Granted,
    AlreadyRunning,
    Unknown,
}

struct Inner {
    callback: SyncCallback,
    jobs: Mutex<HashMap<String, JobEntry>>,
    root_token: CancellationToken,
    started: AtomicBool,
    stopped: AtomicBool,
    inflight: Mutex<Vec<JoinHandle<()>>>,
}

/// Cron-scheduled per-account sync jobs, manual trigger, status, graceful
/// stop (spec §4.4).
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn new(callback: SyncCallback) -> Self {
        Self {
            inner: Arc::new(Inner {
                callback,
                jobs: Mutex::new(HashMap::new()),
                root_token: CancellationToken::new(),
                started: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                inflight: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Parse `cron_expr`; on failure return an error without touching state.
    /// If an entry already exists for `email`, cancel and remove it first.
    pub fn add_account(&self, email: &str, cron_expr: &str) -> Result<(), SchedulerError> {
        let schedule = parse_schedule(cron_expr)?;

        let mut jobs = self.inner.jobs.lock().unwrap();
        if let Some(mut old) = jobs.remove(email) {
            old.cancel.cancel();
            if let Some(handle) = old.handle.take() {
                handle.abort();
            }
        }

        let cancel = self.inner.root_token.child_token();
        let entry = JobEntry {
            cron_expr: cron_expr.to_string(),
            schedule: schedule.clone(),
            running: false,
            last_run: None,
            last_error: String::new(),
            cancel: cancel.clone(),
            handle: None,
        };
        jobs.insert(email.to_string(), entry);
        drop(jobs);

        if self.inner.started.load(Ordering::SeqCst) {
            self.spawn_entry_loop(email.to_string(), schedule, cancel);
        }

        Ok(())
    }

    /// Cancel the cron entry and forget the record. Safe on unknown emails.
    pub fn remove_account(&self, email: &str) {
        let mut jobs = self.inner.jobs.lock().unwrap();
        if let Some(mut entry) = jobs.remove(email) {
            entry.cancel.cancel();
            if let Some(handle) = entry.handle.take() {
                handle.abort();
            }
        }
    }

    /// Register every account where `enabled` is true and `schedule` is
    /// non-empty. Never aborts on the first error. Returns the count
    /// scheduled and the list of per-email errors.
    pub fn add_accounts_from_config(
        &self,
        accounts: &[AccountEntry],
    ) -> (usize, Vec<(String, String)>) {
        let mut scheduled = 0;
        let mut errors = Vec::new();
        for account in accounts {
            if !account.enabled || account.schedule.trim().is_empty() {
                continue;
            }
            match self.add_account(&account.email, &account.schedule) {
                Ok(()) => scheduled += 1,
                Err(e) => errors.push((account.email.clone(), e.to_string())),
            }
        }
        (scheduled, errors)
    }

    fn spawn_entry_loop(&self, email: String, schedule: Schedule, cancel: CancellationToken) {
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            loop {
                let Some(next_fire) = schedule.upcoming(Utc).next() else {
                    return;
                };
                let sleep_for = (next_fire - Utc::now())
                    .to_std()
                    .unwrap_or(std::time::Duration::from_secs(0));

                tokio::select! {
                    _ = tokio::time::sleep(sleep_for) => {
                        run_sync(Arc::clone(&inner), &email).await;
                    }
                    _ = cancel.cancelled() => {
                        return;
                    }
                }
            }
        });

        let mut jobs = self.inner.jobs.lock().unwrap();
        if let Some(entry) = jobs.get_mut(&email) {
            entry.handle = Some(handle);
        }
    }

    /// Begin cron execution: spawn the firing loop for every already
    /// registered account.
    pub fn start(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let entries: Vec<(String, Schedule, CancellationToken)> = {
            let jobs = self.inner.jobs.lock().unwrap();
            jobs.iter()
                .map(|(email, entry)| (email.clone(), entry.schedule.clone(), entry.cancel.clone()))
                .collect()
        };
        for (email, schedule, cancel) in entries {
            self.spawn_entry_loop(email, schedule, cancel);
        }
    }

    /// Stop the cron (no new fires) and wait for all in-flight sync
    /// callbacks to return.
    pub async fn stop(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        self.inner.root_token.cancel();

        let entry_handles: Vec<JoinHandle<()>> = {
            let mut jobs = self.inner.jobs.lock().unwrap();
            jobs.values_mut().filter_map(|e| e.handle.take()).collect()
        };
        for handle in entry_handles {
            let _ = handle.await;
        }

        let inflight: Vec<JoinHandle<()>> = self.inner.inflight.lock().unwrap().drain(..).collect();
        for handle in inflight {
            let _ = handle.await;
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.started.load(Ordering::SeqCst) && !self.inner.stopped.load(Ordering::SeqCst)
    }

    /// If the running flag is set, return `AlreadyRunning` (surfaced by the
    /// API as 409). Otherwise start `run_sync` asynchronously and return
    /// immediately. Fails after `stop` has been called.
    pub fn trigger_sync(&self, email: &str) -> Result<(), SchedulerError> {
        if self.inner.stopped.load(Ordering::SeqCst) {
            return Err(SchedulerError::ShuttingDown);
        }

        match claim(&self.inner, email) {
            Claim::Unknown => return Err(SchedulerError::UnknownAccount(email.to_string())),
            Claim::AlreadyRunning => return Err(SchedulerError::AlreadyRunning(email.to_string())),
            Claim::Granted => {}
        }

        let inner = Arc::clone(&self.inner);
        let email_owned = email.to_string();
        let handle = tokio::spawn(async move {
            run_claimed(inner, &email_owned).await;
        });
        self.inner.inflight.lock().unwrap().push(handle);
        Ok(())
    }

    /// Snapshot of every scheduled email's status.
    pub fn status(&self) -> Vec<JobStatus> {
        let jobs = self.inner.jobs.lock().unwrap();
        let mut out: Vec<JobStatus> = jobs
            .iter()
            .map(|(email, entry)| JobStatus {
                email: email.clone(),
                running: entry.running,
                last_run: entry.last_run,
                next_run: entry.schedule.upcoming(Utc).next(),
                schedule: entry.cron_expr.clone(),
                last_error: entry.last_error.clone(),
            })
            .collect();
        out.sort_by(|a, b| a.email.cmp(&b.email));
        out
    }

    /// `true` if `email` is a known scheduled account.
    pub fn has_account(&self, email: &str) -> bool {
        self.inner.jobs.lock().unwrap().contains_key(email)
    }
}

fn claim(inner: &Inner, email: &str) -> Claim {
    let mut jobs = inner.jobs.lock().unwrap();
    let Some(entry) = jobs.get_mut(email) else {
        return Claim::Unknown;
    };
    if entry.running {
        return Claim::AlreadyRunning;
    }
    entry.running = true;
    Claim::Granted
}

/// Used by the cron firing loop, which must not fire twice concurrently for
/// the same email (a manual trigger may already be running it).
async fn run_sync(inner: Arc<Inner>, email: &str) {
    match claim(&inner, email) {
        Claim::Granted => run_claimed(inner, email).await,
        Claim::AlreadyRunning => {
            warn!(%email, "cron fire skipped — sync already running");
        }
        Claim::Unknown => {}
    }
}

/// Runs the callback for an email whose `running` flag has already been
/// claimed by the caller, then records the outcome and releases the flag.
async fn run_claimed(inner: Arc<Inner>, email: &str) {
    info!(%email, "sync starting");
    let token = inner.root_token.clone();
    let result = (inner.callback)(token, email.to_string()).await;

    let mut jobs = inner.jobs.lock().unwrap();
    if let Some(entry) = jobs.get_mut(email) {
        entry.running = false;
        match result {
            Ok(()) => {
                entry.last_run = Some(Utc::now());
                entry.last_error.clear();
                info!(%email, "sync completed");
            }
            Err(e) => {
                entry.last_error = e.to_string();
                warn!(%email, error = %e, "sync failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn noop_callback() -> SyncCallback {
        Arc::new(|_token, _email| Box::pin(async { Ok(()) }))
    }

    fn counting_callback(calls: Arc<AtomicUsize>, sleep_ms: u64) -> SyncCallback {
        Arc::new(move |_token, _email| {
            let calls = Arc::clone(&calls);
            Box::pin(async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(sleep_ms)).await;
                Ok(())
            })
        })
    }

    #[test]
    fn validate_cron_requires_five_fields() {
        assert!(validate_cron_expr("* * * * *").is_ok());
        assert!(validate_cron_expr("* * * *").is_err());
        assert!(validate_cron_expr("not a cron").is_err());
    }

    #[tokio::test]
    async fn add_account_replaces_existing_entry() {
        let scheduler = Scheduler::new(noop_callback());
        scheduler.add_account("a@example.com", "* * * * *").unwrap();
        scheduler.add_account("a@example.com", "0 * * * *").unwrap();

        let statuses = scheduler.status();
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].schedule, "0 * * * *");
    }

    #[tokio::test]
    async fn add_account_rejects_bad_cron_without_mutating_state() {
        let scheduler = Scheduler::new(noop_callback());
        scheduler.add_account("a@example.com", "* * * * *").unwrap();
        assert!(scheduler.add_account("a@example.com", "bogus").is_err());

        let statuses = scheduler.status();
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].schedule, "* * * * *");
    }

    #[tokio::test]
    async fn remove_account_is_safe_on_unknown_email() {
        let scheduler = Scheduler::new(noop_callback());
        scheduler.remove_account("nobody@example.com");
    }

    #[tokio::test]
    async fn add_then_remove_clears_status() {
        let scheduler = Scheduler::new(noop_callback());
        scheduler.add_account("a@example.com", "* * * * *").unwrap();
        scheduler.remove_account("a@example.com");
        assert!(scheduler.status().is_empty());
    }

    #[tokio::test]
    async fn trigger_sync_runs_once_and_second_concurrent_call_conflicts() {
        let calls = Arc::new(AtomicUsize::new(0));
        let scheduler = Scheduler::new(counting_callback(Arc::clone(&calls), 50));
        scheduler.add_account("test@gmail.com", "* * * * *").unwrap();

        scheduler.trigger_sync("test@gmail.com").unwrap();
        let second = scheduler.trigger_sync("test@gmail.com");
        assert!(matches!(second, Err(SchedulerError::AlreadyRunning(_))));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let status = scheduler.status();
        assert_eq!(status[0].email, "test@gmail.com");
        assert!(status[0].last_run.is_some());
        assert_eq!(status[0].last_error, "");
        assert!(!status[0].running);
    }

    #[tokio::test]
    async fn trigger_sync_unknown_account_errors() {
        let scheduler = Scheduler::new(noop_callback());
        let result = scheduler.trigger_sync("nobody@example.com");
        assert!(matches!(result, Err(SchedulerError::UnknownAccount(_))));
    }

    #[tokio::test]
    async fn failed_sync_records_last_error() {
        let scheduler = Scheduler::new(Arc::new(|_token, _email| {
            Box::pin(async { Err(anyhow::anyhow!("boom")) })
        }));
        scheduler.add_account("a@example.com", "* * * * *").unwrap();
        scheduler.trigger_sync("a@example.com").unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let status = scheduler.status();
        assert_eq!(status[0].last_error, "boom");
    }

    #[tokio::test]
    async fn trigger_sync_fails_after_stop() {
        let scheduler = Scheduler::new(noop_callback());
        scheduler.add_account("a@example.com", "* * * * *").unwrap();
        scheduler.start();
        scheduler.stop().await;

        let result = scheduler.trigger_sync("a@example.com");
        assert!(matches!(result, Err(SchedulerError::ShuttingDown)));
    }

    #[tokio::test]
    async fn stop_waits_for_in_flight_trigger() {
        let calls = Arc::new(AtomicUsize::new(0));
        let scheduler = Scheduler::new(counting_callback(Arc::clone(&calls), 50));
        scheduler.add_account("a@example.com", "* * * * *").unwrap();
        scheduler.start();
        scheduler.trigger_sync("a@example.com").unwrap();

        scheduler.stop().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn add_accounts_from_config_skips_disabled_and_empty_schedule() {
        let scheduler = Scheduler::new(noop_callback());
        let accounts = vec![
            AccountEntry {
                email: "a@example.com".into(),
                schedule: "* * * * *".into(),
                enabled: true,
            },
            AccountEntry {
                email: "b@example.com".into(),
                schedule: "* * * * *".into(),
                enabled: false,
            },
            AccountEntry {
                email: "c@example.com".into(),
                schedule: "".into(),
                enabled: true,
            },
            AccountEntry {
                email: "d@example.com".into(),
                schedule: "bogus".into(),
                enabled: true,
            },
        ];

        let (scheduled, errors) = scheduler.add_accounts_from_config(&accounts);
        assert_eq!(scheduled, 1);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].0, "d@example.com");
        assert!(scheduler.has_account("a@example.com"));
        assert!(!scheduler.has_account("b@example.com"));
    }

    #[tokio::test]
    async fn is_running_reflects_start_and_stop() {
        let scheduler = Scheduler::new(noop_callback());
        assert!(!scheduler.is_running());
        scheduler.start();
        assert!(scheduler.is_running());
        scheduler.stop().await;
        assert!(!scheduler.is_running());
    }
}
