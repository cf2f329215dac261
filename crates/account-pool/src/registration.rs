//! Pool replenishment through automated registration
//!
//! When the number of Active accounts drops below the low-water mark, the
//! orchestrator registers new accounts: provision a disposable mailbox,
//! register on it, store the account, then log it in through the validator.
//!
//! Registrations already in flight count toward the deficit, so repeated
//! triggers while work is running start nothing extra. Excess triggers are
//! dropped rather than queued.
//!
//! Every registration runs as a tracked task with its own id. The most recent
//! `MAX_TRACKED_TASKS` records are kept for status queries; a running task
//! can be cancelled, which frees its concurrency slot.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use account_store::{Account, AccountFilter, AccountStatus, AccountStore, now_millis};
use automation::{MailboxProvider, RegistrationAutomation};
use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::validator::{RefreshResult, SessionValidator};

/// Finished task records kept for status queries. Running tasks are never
/// evicted.
const MAX_TRACKED_TASKS: usize = 100;

#[derive(Debug, Clone)]
pub struct RegistrationConfig {
    /// Minimum number of Active accounts before replenishment starts
    pub low_water_mark: usize,
    /// Registrations allowed to run at once
    pub max_concurrent: usize,
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        Self {
            low_water_mark: 3,
            max_concurrent: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Running => "running",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

/// One registration attempt as seen by operators.
#[derive(Debug, Clone, Serialize)]
pub struct RegistrationTask {
    pub id: String,
    pub status: TaskStatus,
    /// Unix millis
    pub started_at: u64,
    pub finished_at: Option<u64>,
    /// Set once the task has stored its account
    pub account_id: Option<String>,
    pub error: Option<String>,
}

#[derive(Default)]
struct TaskTable {
    /// Oldest first
    records: VecDeque<RegistrationTask>,
    handles: HashMap<String, AbortHandle>,
}

impl TaskTable {
    fn get_mut(&mut self, id: &str) -> Option<&mut RegistrationTask> {
        self.records.iter_mut().find(|t| t.id == id)
    }

    fn push(&mut self, task: RegistrationTask) {
        self.records.push_back(task);
        while self.records.len() > MAX_TRACKED_TASKS {
            match self
                .records
                .iter()
                .position(|t| t.status != TaskStatus::Running)
            {
                Some(oldest) => {
                    self.records.remove(oldest);
                }
                None => break,
            }
        }
    }
}

pub struct RegistrationOrchestrator {
    store: Arc<AccountStore>,
    mailboxes: Arc<dyn MailboxProvider>,
    registrar: Arc<dyn RegistrationAutomation>,
    validator: Arc<SessionValidator>,
    config: RegistrationConfig,
    in_flight: Mutex<usize>,
    tasks: Mutex<TaskTable>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Decrements the in-flight count when a registration task ends, including
/// when it is aborted.
struct InFlight(Arc<RegistrationOrchestrator>);

impl Drop for InFlight {
    fn drop(&mut self) {
        let mut in_flight = lock(&self.0.in_flight);
        *in_flight = in_flight.saturating_sub(1);
    }
}

impl RegistrationOrchestrator {
    pub fn new(
        store: Arc<AccountStore>,
        mailboxes: Arc<dyn MailboxProvider>,
        registrar: Arc<dyn RegistrationAutomation>,
        validator: Arc<SessionValidator>,
        config: RegistrationConfig,
    ) -> Self {
        Self {
            store,
            mailboxes,
            registrar,
            validator,
            config,
            in_flight: Mutex::new(0),
            tasks: Mutex::new(TaskTable::default()),
        }
    }

    /// Registrations currently running.
    pub fn in_flight(&self) -> usize {
        *lock(&self.in_flight)
    }

    /// Reserve up to `wanted` registration slots, bounded by the concurrency
    /// limit. Returns how many were reserved.
    fn reserve(&self, wanted: impl FnOnce(usize) -> usize) -> usize {
        let mut in_flight = lock(&self.in_flight);
        let slots = self.config.max_concurrent.saturating_sub(*in_flight);
        let start = wanted(*in_flight).min(slots);
        *in_flight += start;
        start
    }

    /// Start registrations if the Active count is below the low-water mark.
    /// Returns the ids of the tasks started.
    pub async fn check_low_water(self: &Arc<Self>) -> Vec<String> {
        let active = self
            .store
            .list(&AccountFilter::status(AccountStatus::Active))
            .await
            .len();
        if active >= self.config.low_water_mark {
            return Vec::new();
        }

        let deficit = self.config.low_water_mark - active;
        let started = self.reserve(|in_flight| deficit.saturating_sub(in_flight));
        if started == 0 {
            debug!(
                active,
                in_flight = self.in_flight(),
                "pool below low-water mark, registrations already running"
            );
            return Vec::new();
        }
        info!(
            active,
            low_water_mark = self.config.low_water_mark,
            started,
            "pool below low-water mark, registering accounts"
        );
        self.spawn_registrations(started)
    }

    /// Start up to `count` registrations regardless of the low-water mark.
    /// The concurrency limit still applies. Returns the ids of the tasks
    /// started.
    pub fn register_batch(self: &Arc<Self>, count: usize) -> Vec<String> {
        let started = self.reserve(|_| count);
        if started == 0 {
            return Vec::new();
        }
        info!(requested = count, started, "starting registration batch");
        self.spawn_registrations(started)
    }

    /// Each spawned task owns one reserved slot through its `InFlight` guard.
    fn spawn_registrations(self: &Arc<Self>, count: usize) -> Vec<String> {
        let mut ids = Vec::with_capacity(count);
        for _ in 0..count {
            let id = uuid::Uuid::new_v4().to_string();
            let guard = InFlight(self.clone());
            let task_id = id.clone();

            // The table lock is held across the spawn so the task cannot
            // finish before its abort handle is recorded.
            let mut tasks = lock(&self.tasks);
            tasks.push(RegistrationTask {
                id: id.clone(),
                status: TaskStatus::Running,
                started_at: now_millis(),
                finished_at: None,
                account_id: None,
                error: None,
            });
            let handle = tokio::spawn(async move {
                let orchestrator = guard.0.clone();
                let result = orchestrator.register_one().await;
                orchestrator.finish(&task_id, result);
                drop(guard);
            });
            tasks.handles.insert(id.clone(), handle.abort_handle());
            drop(tasks);

            debug!(task_id = %id, "registration task started");
            ids.push(id);
        }
        ids
    }

    /// Record a task's result unless it was cancelled first.
    fn finish(&self, id: &str, result: Result<String>) {
        let mut tasks = lock(&self.tasks);
        tasks.handles.remove(id);
        let Some(task) = tasks.get_mut(id) else {
            return;
        };
        if task.status != TaskStatus::Running {
            return;
        }
        task.finished_at = Some(now_millis());
        match result {
            Ok(account_id) => {
                task.status = TaskStatus::Succeeded;
                task.account_id = Some(account_id.clone());
                metrics::counter!("pool_registrations_total", "result" => "success").increment(1);
                info!(task_id = %id, account_id = %account_id, "registration completed");
            }
            Err(e) => {
                task.status = TaskStatus::Failed;
                task.error = Some(e.to_string());
                metrics::counter!("pool_registrations_total", "result" => "failure").increment(1);
                warn!(task_id = %id, error = %e, "registration failed");
            }
        }
    }

    /// Cancel a running registration. Aborting the task drops its in-flight
    /// guard, which frees the slot for the next trigger. An account the task
    /// already stored stays in the store.
    pub fn cancel(&self, id: &str) -> Result<RegistrationTask> {
        let mut tasks = lock(&self.tasks);
        let handle = tasks.handles.remove(id);
        let task = tasks
            .get_mut(id)
            .ok_or_else(|| Error::TaskNotFound(id.to_string()))?;
        if task.status != TaskStatus::Running {
            return Err(Error::TaskNotRunning(id.to_string()));
        }
        if let Some(handle) = handle {
            handle.abort();
        }
        task.status = TaskStatus::Cancelled;
        task.finished_at = Some(now_millis());
        metrics::counter!("pool_registrations_total", "result" => "cancelled").increment(1);
        info!(task_id = %id, "registration cancelled");
        Ok(task.clone())
    }

    pub fn task(&self, id: &str) -> Result<RegistrationTask> {
        lock(&self.tasks)
            .records
            .iter()
            .find(|t| t.id == id)
            .cloned()
            .ok_or_else(|| Error::TaskNotFound(id.to_string()))
    }

    /// Tracked tasks, newest first.
    pub fn tasks(&self) -> Vec<RegistrationTask> {
        lock(&self.tasks).records.iter().rev().cloned().collect()
    }

    /// Run one registration end to end. Returns the new account id.
    pub async fn register_one(&self) -> Result<String> {
        let mailbox = self
            .mailboxes
            .provision_mailbox()
            .await
            .map_err(|e| Error::Registration(format!("provisioning mailbox: {e}")))?;
        debug!(mailbox = %mailbox.address, "mailbox provisioned");

        let registered = self
            .registrar
            .register_account(&mailbox)
            .await
            .map_err(|e| Error::Registration(format!("registering {}: {e}", mailbox.address)))?;

        let account = Account::new(registered.email, registered.credential)
            .with_mailbox(mailbox.address);
        let stored = match self.store.insert_unique(account).await {
            Ok(stored) => stored,
            Err(account_store::Error::DuplicateEmail(email)) => {
                return Err(Error::Registration(format!(
                    "registered email {email} is already in the pool"
                )));
            }
            Err(e) => return Err(e.into()),
        };
        info!(account_id = %stored.id, email = %stored.email, "registered account stored");

        match self.validator.refresh(&stored.id).await {
            RefreshResult::Success => Ok(stored.id),
            RefreshResult::Failure(reason) => Err(Error::Registration(format!(
                "account {} registered but first login failed: {reason}",
                stored.id
            ))),
        }
    }
}

/// Spawn the replenishment loop.
///
/// Checks the low-water mark every `interval` and whenever `signal` is
/// raised by the scheduler.
pub fn spawn_registration_task(
    orchestrator: Arc<RegistrationOrchestrator>,
    signal: Arc<Notify>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = signal.notified() => debug!("replenish signal received"),
            }
            orchestrator.check_low_water().await;
        }
    })
}
