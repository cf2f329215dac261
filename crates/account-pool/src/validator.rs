//! Session validation and background refresh
//!
//! `SessionValidator::refresh` runs login automation for one account and
//! records the result. Work arrives two ways: account ids pushed onto the
//! refresh queue (by the scheduler on auth failures, and by the admin API),
//! and a periodic sweep over accounts that need or will soon need a login.
//!
//! Login automation always runs outside store locks. A refresh makes a
//! bounded number of attempts and disables the account when all of them fail,
//! unless the account is Active and its current session is still valid.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use account_store::{Account, AccountFilter, AccountStatus, AccountStore, now_millis};
use automation::LoginAutomation;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::Error;
use crate::scheduler::modify;

/// Sending side of the refresh queue.
///
/// Enqueueing never blocks. When the queue is full the request is dropped;
/// the periodic sweep picks the account up later.
#[derive(Clone)]
pub struct RefreshQueue {
    sender: mpsc::Sender<String>,
}

impl RefreshQueue {
    /// Ask the validator to refresh `account_id`. Returns whether it was queued.
    pub fn enqueue(&self, account_id: &str) -> bool {
        match self.sender.try_send(account_id.to_string()) {
            Ok(()) => {
                debug!(account_id, "queued session refresh");
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(account_id, "refresh queue full, leaving account for the next sweep");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(account_id, "refresh queue closed, dropping request");
                false
            }
        }
    }
}

/// Create a bounded refresh queue.
pub fn refresh_channel(capacity: usize) -> (RefreshQueue, mpsc::Receiver<String>) {
    let (sender, receiver) = mpsc::channel(capacity.max(1));
    (RefreshQueue { sender }, receiver)
}

#[derive(Debug, Clone)]
pub struct ValidatorConfig {
    /// Login attempts per refresh before the account is disabled
    pub max_attempts: u32,
    /// Pause between failed attempts
    pub retry_delay: Duration,
    /// Active sessions expiring within this window are refreshed by the sweep
    pub refresh_window: Duration,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_delay: Duration::from_secs(5),
            refresh_window: Duration::from_secs(60 * 60),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshResult {
    Success,
    Failure(String),
}

impl RefreshResult {
    pub fn is_success(&self) -> bool {
        matches!(self, RefreshResult::Success)
    }
}

pub struct SessionValidator {
    store: Arc<AccountStore>,
    login: Arc<dyn LoginAutomation>,
    config: ValidatorConfig,
    in_progress: Mutex<HashSet<String>>,
}

/// Removes an account from the in-progress set when the refresh ends.
struct InProgress<'a> {
    set: &'a Mutex<HashSet<String>>,
    account_id: String,
}

impl Drop for InProgress<'_> {
    fn drop(&mut self) {
        let mut set = match self.set.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        set.remove(&self.account_id);
    }
}

impl SessionValidator {
    pub fn new(
        store: Arc<AccountStore>,
        login: Arc<dyn LoginAutomation>,
        config: ValidatorConfig,
    ) -> Self {
        Self {
            store,
            login,
            config,
            in_progress: Mutex::new(HashSet::new()),
        }
    }

    fn begin(&self, account_id: &str) -> Option<InProgress<'_>> {
        let mut set = match self.in_progress.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if !set.insert(account_id.to_string()) {
            return None;
        }
        Some(InProgress {
            set: &self.in_progress,
            account_id: account_id.to_string(),
        })
    }

    /// Log in again and store the new session.
    ///
    /// Unknown and disabled accounts fail without calling login automation.
    /// A second refresh of an account already being refreshed fails
    /// immediately.
    pub async fn refresh(&self, account_id: &str) -> RefreshResult {
        let result = self.refresh_inner(account_id).await;
        let label = if result.is_success() {
            "success"
        } else {
            "failure"
        };
        metrics::counter!("pool_refresh_total", "result" => label).increment(1);
        result
    }

    async fn refresh_inner(&self, account_id: &str) -> RefreshResult {
        let Some(account) = self.store.get(account_id).await else {
            return RefreshResult::Failure(format!("account {account_id} not found"));
        };
        if account.status == AccountStatus::Disabled {
            return RefreshResult::Failure("account is disabled".into());
        }

        let Some(_guard) = self.begin(account_id) else {
            debug!(account_id, "refresh already in progress");
            return RefreshResult::Failure("refresh already in progress".into());
        };

        let attempts = self.config.max_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            match self.login.login(&account.email, &account.credential).await {
                Ok(token) => {
                    let stored = modify(&self.store, account_id, |a| {
                        if a.status == AccountStatus::Disabled {
                            return Err(Error::Ineligible {
                                id: a.id.clone(),
                                reason: crate::policy::BlockReason::Disabled,
                            });
                        }
                        // Cooldowns are upstream rate limits; a renewed
                        // session on an Active account does not lift them.
                        if a.status == AccountStatus::AuthExpired {
                            a.next_eligible.clear();
                        }
                        a.session = Some(token.token.clone());
                        a.session_expires_at = token.expires_at;
                        a.status = AccountStatus::Active;
                        a.disabled_reason = None;
                        a.consecutive_failures = 0;
                        Ok(())
                    })
                    .await;

                    return match stored {
                        Ok(_) => {
                            info!(account_id, attempt, "session refreshed");
                            RefreshResult::Success
                        }
                        Err(e) => {
                            warn!(account_id, error = %e, "could not store refreshed session");
                            RefreshResult::Failure(e.to_string())
                        }
                    };
                }
                Err(e) => {
                    warn!(account_id, attempt, max_attempts = attempts, error = %e, "login attempt failed");
                    last_error = e.to_string();
                    if attempt < attempts {
                        tokio::time::sleep(self.config.retry_delay).await;
                    }
                }
            }
        }

        let reason = format!("login failed after {attempts} attempts: {last_error}");

        // An Active account whose current session still works stays in
        // rotation; acquire expires it once the session actually lapses.
        if let Some(current) = self.store.get(account_id).await
            && has_live_session(&current, now_millis())
        {
            warn!(account_id, reason = %reason, "session renewal failed, keeping current session");
            return RefreshResult::Failure(reason);
        }

        let disabled = modify(&self.store, account_id, |a| {
            a.status = AccountStatus::Disabled;
            a.disabled_reason = Some(reason.clone());
            a.session = None;
            a.session_expires_at = None;
            Ok(())
        })
        .await;
        match disabled {
            Ok(_) => warn!(account_id, reason = %reason, "account disabled"),
            Err(e) => warn!(account_id, error = %e, "could not disable account after failed refresh"),
        }
        RefreshResult::Failure(reason)
    }

    /// Accounts the sweep should refresh at `now` (unix millis).
    async fn sweep_candidates(&self, now: u64) -> Vec<Account> {
        let window = self.config.refresh_window.as_millis() as u64;
        let horizon = now.saturating_add(window);
        self.store
            .list(&AccountFilter::all())
            .await
            .into_iter()
            .filter(|account| match account.status {
                AccountStatus::AuthExpired => true,
                AccountStatus::Active => {
                    account.session.is_none()
                        || account
                            .session_expires_at
                            .is_some_and(|expires| expires != 0 && expires <= horizon)
                }
                AccountStatus::Disabled => false,
            })
            .collect()
    }

    /// Refresh every account that needs a login or whose session expires
    /// within the refresh window. Returns how many refreshes succeeded.
    pub async fn sweep(&self) -> usize {
        let candidates = self.sweep_candidates(now_millis()).await;
        if candidates.is_empty() {
            return 0;
        }
        debug!(accounts = candidates.len(), "refresh sweep");

        let mut refreshed = 0;
        for account in candidates {
            if self.refresh(&account.id).await.is_success() {
                refreshed += 1;
            }
        }
        refreshed
    }
}

fn has_live_session(account: &Account, now: u64) -> bool {
    account.status == AccountStatus::Active
        && account.session.as_deref().is_some_and(|s| !s.is_empty())
        && account
            .session_expires_at
            .is_none_or(|expires| expires == 0 || expires > now)
}

/// Spawn the validator loop: drain the refresh queue and sweep every
/// `sweep_interval`.
///
/// Each queued refresh runs on its own task so a slow login does not hold up
/// the queue; duplicate ids are absorbed by the in-progress check.
pub fn spawn_validator(
    validator: Arc<SessionValidator>,
    mut receiver: mpsc::Receiver<String>,
    sweep_interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(sweep_interval);
        let mut queue_open = true;

        loop {
            tokio::select! {
                maybe_id = receiver.recv(), if queue_open => match maybe_id {
                    Some(account_id) => {
                        let validator = validator.clone();
                        tokio::spawn(async move {
                            validator.refresh(&account_id).await;
                        });
                    }
                    None => {
                        debug!("refresh queue closed, continuing with periodic sweeps");
                        queue_open = false;
                    }
                },
                _ = ticker.tick() => {
                    let validator = validator.clone();
                    tokio::spawn(async move {
                        validator.sweep().await;
                    });
                }
            }
        }
    })
}
