//! Account scheduler: leases, outcomes and pool status
//!
//! The scheduler hands out exclusive, time-bounded leases on accounts. One
//! tokio Mutex guards the lease table, and both the acquire scan and the
//! release transition run while holding it, so two callers can never lease
//! the same account. Account state lives in the store; the scheduler only
//! keeps the lease table in memory.
//!
//! Selection is least-recently-used among accounts the rate-limit policy
//! allows, ties broken by the lower id.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use account_store::{Account, AccountFilter, AccountStatus, AccountStore, Cooldowns, now_millis};
use automation::RequestError;
use common::{Capability, Secret};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::policy::{self, BlockReason, CooldownPolicy, Eligibility};
use crate::validator::RefreshQueue;

const MODIFY_ATTEMPTS: u32 = 5;

/// Read-modify-write one account, retrying on revision conflicts.
///
/// `f` runs against a fresh copy on every attempt and may abort by
/// returning an error.
pub async fn modify<F>(store: &AccountStore, id: &str, mut f: F) -> Result<Account>
where
    F: FnMut(&mut Account) -> Result<()>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        let mut account = store
            .get(id)
            .await
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        f(&mut account)?;
        match store.upsert(account).await {
            Ok(stored) => return Ok(stored),
            Err(account_store::Error::VersionConflict { .. }) if attempt < MODIFY_ATTEMPTS => {
                debug!(account_id = id, attempt, "revision conflict, retrying");
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// How a leased request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    RateLimited,
    AuthExpired,
    TransientError,
}

impl Outcome {
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::RateLimited => "rate_limited",
            Outcome::AuthExpired => "auth_expired",
            Outcome::TransientError => "transient_error",
        }
    }
}

impl From<&RequestError> for Outcome {
    fn from(error: &RequestError) -> Self {
        match error {
            RequestError::RateLimited(_) => Outcome::RateLimited,
            RequestError::AuthExpired(_) => Outcome::AuthExpired,
            RequestError::Transient(_) => Outcome::TransientError,
        }
    }
}

/// Exclusive claim on one account for one request.
#[derive(Debug, Clone)]
pub struct Lease {
    pub lease_id: String,
    pub account_id: String,
    pub email: String,
    pub capability: Capability,
    pub acquired_at: Instant,
    pub session: Secret<String>,
}

#[derive(Debug, Clone)]
struct OpenLease {
    lease_id: String,
    capability: Capability,
    acquired_at: Instant,
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub cooldowns: CooldownPolicy,
    /// Leases older than this are reclaimed as `TransientError`
    pub lease_timeout: Duration,
    /// Consecutive transient failures tolerated before disabling an account
    pub disable_after_failures: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            cooldowns: CooldownPolicy::default(),
            lease_timeout: Duration::from_secs(10 * 60),
            disable_after_failures: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn label(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
        }
    }
}

/// Per-capability account counts. Every account lands in exactly one bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CapabilityStatus {
    pub available: usize,
    pub cooling: usize,
    pub busy: usize,
    pub auth_expired: usize,
    pub disabled: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    pub status: HealthStatus,
    pub total: usize,
    pub active: usize,
    pub auth_expired: usize,
    pub disabled: usize,
    pub busy: usize,
    pub capabilities: BTreeMap<Capability, CapabilityStatus>,
}

/// Account view for operators. Carries no credential or session.
#[derive(Debug, Clone, Serialize)]
pub struct AccountSummary {
    pub id: String,
    pub email: String,
    pub status: AccountStatus,
    pub disabled_reason: Option<String>,
    pub busy: bool,
    pub has_session: bool,
    pub session_expires_at: Option<u64>,
    pub next_eligible: Cooldowns,
    pub last_used_at: Option<u64>,
    pub consecutive_failures: u32,
    pub total_requests: u64,
    pub total_failures: u64,
    pub mailbox: Option<String>,
    pub created_at: u64,
}

pub struct Scheduler {
    store: Arc<AccountStore>,
    config: SchedulerConfig,
    /// Open leases keyed by account id
    leases: Mutex<HashMap<String, OpenLease>>,
    refresh: RefreshQueue,
    replenish: Arc<Notify>,
}

impl Scheduler {
    pub fn new(
        store: Arc<AccountStore>,
        config: SchedulerConfig,
        refresh: RefreshQueue,
        replenish: Arc<Notify>,
    ) -> Self {
        info!(
            chat_cooldown_secs = config.cooldowns.chat.as_secs(),
            image_cooldown_secs = config.cooldowns.image.as_secs(),
            video_cooldown_secs = config.cooldowns.video.as_secs(),
            lease_timeout_secs = config.lease_timeout.as_secs(),
            "scheduler initialized"
        );
        Self {
            store,
            config,
            leases: Mutex::new(HashMap::new()),
            refresh,
            replenish,
        }
    }

    pub fn store(&self) -> &Arc<AccountStore> {
        &self.store
    }

    /// Lease the least-recently-used account eligible for `capability`.
    ///
    /// Timed-out leases are reclaimed first. Active accounts found without a
    /// usable session are moved to `AuthExpired` and queued for refresh.
    pub async fn acquire(&self, capability: Capability) -> Result<Lease> {
        let mut leases = self.leases.lock().await;
        self.reclaim_locked(&mut leases).await;

        let now = now_millis();
        let accounts = self.store.list(&AccountFilter::all()).await;

        let mut candidates: Vec<&Account> = Vec::new();
        let mut needs_login: Vec<&Account> = Vec::new();
        let mut retry_after: Option<Duration> = None;

        for account in accounts.iter().filter(|a| !leases.contains_key(&a.id)) {
            match policy::eligible(account, capability, now) {
                Eligibility::Eligible => candidates.push(account),
                Eligibility::Blocked {
                    reason: BlockReason::CoolingDown,
                    retry_after: Some(wait),
                } => {
                    retry_after = Some(retry_after.map_or(wait, |current| current.min(wait)));
                }
                Eligibility::Blocked { reason, .. }
                    if reason.needs_login() && account.status == AccountStatus::Active =>
                {
                    needs_login.push(account);
                }
                Eligibility::Blocked { .. } => {}
            }
        }

        for account in needs_login {
            self.expire_session(&account.id, "session missing or expired")
                .await;
        }

        // Missing last_used_at sorts first (never used = oldest)
        candidates.sort_by(|a, b| {
            a.last_used_at
                .unwrap_or(0)
                .cmp(&b.last_used_at.unwrap_or(0))
                .then_with(|| a.id.cmp(&b.id))
        });

        for candidate in candidates {
            let stamped = modify(&self.store, &candidate.id, |a| {
                if let Eligibility::Blocked { reason, .. } = policy::eligible(a, capability, now) {
                    return Err(Error::Ineligible {
                        id: a.id.clone(),
                        reason,
                    });
                }
                a.last_used_at = Some(now);
                Ok(())
            })
            .await;

            let account = match stamped {
                Ok(account) => account,
                Err(e) => {
                    debug!(account_id = %candidate.id, error = %e, "candidate changed during acquire, trying next");
                    continue;
                }
            };
            let Some(session) = account.session.clone() else {
                continue;
            };

            let lease = Lease {
                lease_id: uuid::Uuid::new_v4().to_string(),
                account_id: account.id.clone(),
                email: account.email.clone(),
                capability,
                acquired_at: Instant::now(),
                session: Secret::new(session),
            };
            leases.insert(
                account.id.clone(),
                OpenLease {
                    lease_id: lease.lease_id.clone(),
                    capability,
                    acquired_at: lease.acquired_at,
                },
            );

            metrics::counter!("pool_acquire_total", "capability" => capability.as_str(), "result" => "leased")
                .increment(1);
            debug!(account_id = %lease.account_id, lease_id = %lease.lease_id, %capability, "account leased");
            return Ok(lease);
        }

        metrics::counter!("pool_acquire_total", "capability" => capability.as_str(), "result" => "no_eligible_account")
            .increment(1);
        debug!(%capability, ?retry_after, "no eligible account");
        Err(Error::NoEligibleAccount {
            capability,
            retry_after,
        })
    }

    /// Close `lease` and record how the request ended.
    pub async fn release(&self, lease: &Lease, outcome: Outcome) -> Result<()> {
        self.release_by_id(&lease.lease_id, outcome).await
    }

    /// Close the lease with id `lease_id`. Fails with `StaleLease` when the
    /// lease was already released or reclaimed; nothing changes in that case.
    pub async fn release_by_id(&self, lease_id: &str, outcome: Outcome) -> Result<()> {
        let mut leases = self.leases.lock().await;
        let Some(account_id) = leases
            .iter()
            .find(|(_, open)| open.lease_id == lease_id)
            .map(|(account_id, _)| account_id.clone())
        else {
            debug!(lease_id, "release of a lease that is no longer open");
            return Err(Error::StaleLease(lease_id.to_string()));
        };

        let Some(open) = leases.remove(&account_id) else {
            return Err(Error::StaleLease(lease_id.to_string()));
        };
        self.apply_outcome(&account_id, &open, outcome).await
    }

    /// Force-release every lease older than the lease timeout as
    /// `TransientError`. Returns how many were reclaimed.
    pub async fn reclaim_expired(&self) -> usize {
        let mut leases = self.leases.lock().await;
        self.reclaim_locked(&mut leases).await
    }

    async fn reclaim_locked(&self, leases: &mut HashMap<String, OpenLease>) -> usize {
        let timeout = self.config.lease_timeout;
        let expired: Vec<String> = leases
            .iter()
            .filter(|(_, open)| open.acquired_at.elapsed() >= timeout)
            .map(|(account_id, _)| account_id.clone())
            .collect();

        for account_id in &expired {
            if let Some(open) = leases.remove(account_id) {
                warn!(
                    account_id = %account_id,
                    lease_id = %open.lease_id,
                    held_secs = open.acquired_at.elapsed().as_secs(),
                    "lease timed out, reclaiming"
                );
                metrics::counter!("pool_leases_reclaimed_total").increment(1);
                if let Err(e) = self
                    .apply_outcome(account_id, &open, Outcome::TransientError)
                    .await
                {
                    warn!(account_id = %account_id, error = %e, "failed to record reclaimed lease");
                }
            }
        }
        expired.len()
    }

    async fn apply_outcome(
        &self,
        account_id: &str,
        open: &OpenLease,
        outcome: Outcome,
    ) -> Result<()> {
        let capability = open.capability;
        metrics::counter!("pool_release_total", "capability" => capability.as_str(), "outcome" => outcome.label())
            .increment(1);

        let now = now_millis();
        let next_eligible = self.config.cooldowns.next_eligible_at(capability, now);
        let disable_after = self.config.disable_after_failures;

        let stored = modify(&self.store, account_id, |a| {
            match outcome {
                Outcome::Success => {
                    a.next_eligible.set(capability, Some(next_eligible));
                    a.consecutive_failures = 0;
                    a.total_requests += 1;
                }
                Outcome::RateLimited => {
                    a.next_eligible.set(capability, Some(next_eligible));
                }
                Outcome::AuthExpired => {
                    if a.status != AccountStatus::Disabled {
                        a.status = AccountStatus::AuthExpired;
                    }
                    a.session = None;
                    a.session_expires_at = None;
                }
                Outcome::TransientError => {
                    a.consecutive_failures += 1;
                    a.total_failures += 1;
                    if a.consecutive_failures > disable_after && a.status != AccountStatus::Disabled
                    {
                        a.status = AccountStatus::Disabled;
                        a.disabled_reason =
                            Some(format!("{} consecutive failures", a.consecutive_failures));
                    }
                }
            }
            Ok(())
        })
        .await?;

        debug!(account_id, %capability, outcome = outcome.label(), "lease released");

        match outcome {
            Outcome::AuthExpired => {
                info!(account_id, "session expired, queued for refresh");
                self.refresh.enqueue(account_id);
                self.replenish.notify_one();
            }
            Outcome::TransientError if stored.status == AccountStatus::Disabled => {
                warn!(
                    account_id,
                    failures = stored.consecutive_failures,
                    "account disabled after repeated failures"
                );
                self.replenish.notify_one();
            }
            _ => {}
        }
        Ok(())
    }

    /// Move an Active account to AuthExpired and queue it for refresh.
    async fn expire_session(&self, account_id: &str, reason: &str) {
        let result = modify(&self.store, account_id, |a| {
            if a.status == AccountStatus::Active {
                a.status = AccountStatus::AuthExpired;
                a.session = None;
                a.session_expires_at = None;
            }
            Ok(())
        })
        .await;
        match result {
            Ok(_) => {
                info!(account_id, reason, "account needs login, queued for refresh");
                self.refresh.enqueue(account_id);
                self.replenish.notify_one();
            }
            Err(e) => warn!(account_id, error = %e, "failed to mark account for refresh"),
        }
    }

    /// Aggregate counts for health reporting.
    ///
    /// `healthy` when every account can serve chat (leased accounts count as
    /// usable), `degraded` when some can, `unhealthy` when none can.
    pub async fn pool_status(&self) -> PoolStatus {
        let leases = self.leases.lock().await;
        let accounts = self.store.list(&AccountFilter::all()).await;
        let now = now_millis();

        let mut status = PoolStatus {
            status: HealthStatus::Unhealthy,
            total: accounts.len(),
            active: 0,
            auth_expired: 0,
            disabled: 0,
            busy: leases.len(),
            capabilities: BTreeMap::new(),
        };

        for account in &accounts {
            match account.status {
                AccountStatus::Active => status.active += 1,
                AccountStatus::AuthExpired => status.auth_expired += 1,
                AccountStatus::Disabled => status.disabled += 1,
            }
        }

        for capability in Capability::ALL {
            let mut counts = CapabilityStatus::default();
            for account in &accounts {
                let busy = leases.contains_key(&account.id);
                match policy::eligible(account, capability, now) {
                    Eligibility::Blocked {
                        reason: BlockReason::Disabled,
                        ..
                    } => counts.disabled += 1,
                    Eligibility::Blocked { reason, .. } if reason.needs_login() => {
                        counts.auth_expired += 1
                    }
                    _ if busy => counts.busy += 1,
                    Eligibility::Blocked { .. } => counts.cooling += 1,
                    Eligibility::Eligible => counts.available += 1,
                }
            }
            status.capabilities.insert(capability, counts);
        }

        let chat = status
            .capabilities
            .get(&Capability::Chat)
            .copied()
            .unwrap_or_default();
        let usable = chat.available + chat.busy;
        status.status = if status.total > 0 && usable == status.total {
            HealthStatus::Healthy
        } else if usable > 0 {
            HealthStatus::Degraded
        } else {
            HealthStatus::Unhealthy
        };
        status
    }

    /// Every account, sorted by id, without secrets.
    pub async fn accounts(&self) -> Vec<AccountSummary> {
        let leases = self.leases.lock().await;
        self.store
            .list(&AccountFilter::all())
            .await
            .into_iter()
            .map(|a| AccountSummary {
                busy: leases.contains_key(&a.id),
                has_session: a.session.is_some(),
                id: a.id,
                email: a.email,
                status: a.status,
                disabled_reason: a.disabled_reason,
                session_expires_at: a.session_expires_at,
                next_eligible: a.next_eligible,
                last_used_at: a.last_used_at,
                consecutive_failures: a.consecutive_failures,
                total_requests: a.total_requests,
                total_failures: a.total_failures,
                mailbox: a.mailbox,
                created_at: a.created_at,
            })
            .collect()
    }

    /// Add an account by hand. It starts `AuthExpired` and is queued for login.
    pub async fn add_account(&self, email: &str, credential: &str) -> Result<Account> {
        let stored = match self.store.insert_unique(Account::new(email, credential)).await {
            Ok(stored) => stored,
            Err(account_store::Error::DuplicateEmail(email)) => {
                return Err(Error::AlreadyExists(email));
            }
            Err(e) => return Err(e.into()),
        };
        info!(account_id = %stored.id, email, "account added");
        self.refresh.enqueue(&stored.id);
        Ok(stored)
    }

    /// Delete an account. An open lease on it is dropped.
    pub async fn remove_account(&self, account_id: &str) -> Result<Account> {
        let mut leases = self.leases.lock().await;
        let removed = self
            .store
            .remove(account_id)
            .await?
            .ok_or_else(|| Error::NotFound(account_id.to_string()))?;
        leases.remove(account_id);
        info!(account_id, "account removed");
        self.replenish.notify_one();
        Ok(removed)
    }

    /// Take an account out of rotation until re-enabled.
    pub async fn disable_account(
        &self,
        account_id: &str,
        reason: Option<String>,
    ) -> Result<Account> {
        let reason = reason.unwrap_or_else(|| "disabled by operator".to_string());
        let stored = modify(&self.store, account_id, |a| {
            a.status = AccountStatus::Disabled;
            a.disabled_reason = Some(reason.clone());
            Ok(())
        })
        .await?;
        info!(account_id, reason = %reason, "account disabled");
        self.replenish.notify_one();
        Ok(stored)
    }

    /// Return a disabled account to rotation. It needs a fresh login first.
    pub async fn enable_account(&self, account_id: &str) -> Result<Account> {
        let stored = modify(&self.store, account_id, |a| {
            if a.status == AccountStatus::Disabled {
                a.status = AccountStatus::AuthExpired;
                a.disabled_reason = None;
                a.consecutive_failures = 0;
                a.session = None;
                a.session_expires_at = None;
            }
            Ok(())
        })
        .await?;
        info!(account_id, "account enabled, queued for login");
        self.refresh.enqueue(account_id);
        Ok(stored)
    }

    /// Queue a session refresh for an account.
    pub async fn request_refresh(&self, account_id: &str) -> Result<bool> {
        if self.store.get(account_id).await.is_none() {
            return Err(Error::NotFound(account_id.to_string()));
        }
        Ok(self.refresh.enqueue(account_id))
    }
}

/// Spawn a task that reclaims timed-out leases every `interval`.
pub fn spawn_lease_reaper(
    scheduler: Arc<Scheduler>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // Nothing can have timed out at startup
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let reclaimed = scheduler.reclaim_expired().await;
            if reclaimed > 0 {
                info!(reclaimed, "reclaimed timed-out leases");
            }
        }
    })
}
