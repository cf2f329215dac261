//! Account record and its lifecycle state
//!
//! All timestamps are unix milliseconds. Cooldowns are not statuses: an
//! `Active` account carries one next-eligible timestamp per capability and
//! each clock runs independently.

use std::fmt;

use common::Capability;
use serde::{Deserialize, Serialize};

/// Current unix time in milliseconds.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Lifecycle status of an account.
///
/// Transitions:
/// - AuthExpired → Active (login succeeded)
/// - Active → AuthExpired (request failed with an auth error, or session missing)
/// - Active → Disabled (too many consecutive failures, or admin action)
/// - AuthExpired → Disabled (login kept failing)
/// - Disabled → AuthExpired (admin re-enable)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    Active,
    AuthExpired,
    Disabled,
}

impl AccountStatus {
    pub const ALL: [AccountStatus; 3] = [
        AccountStatus::Active,
        AccountStatus::AuthExpired,
        AccountStatus::Disabled,
    ];

    /// Status label for health/logging.
    pub fn label(&self) -> &'static str {
        match self {
            AccountStatus::Active => "active",
            AccountStatus::AuthExpired => "auth_expired",
            AccountStatus::Disabled => "disabled",
        }
    }
}

/// Per-capability next-eligible timestamps. `None` or `0` means eligible now.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cooldowns {
    #[serde(default)]
    pub chat: Option<u64>,
    #[serde(default)]
    pub image: Option<u64>,
    #[serde(default)]
    pub video: Option<u64>,
}

impl Cooldowns {
    pub fn get(&self, capability: Capability) -> Option<u64> {
        match capability {
            Capability::Chat => self.chat,
            Capability::Image => self.image,
            Capability::Video => self.video,
        }
    }

    pub fn set(&mut self, capability: Capability, until: Option<u64>) {
        let slot = match capability {
            Capability::Chat => &mut self.chat,
            Capability::Image => &mut self.image,
            Capability::Video => &mut self.video,
        };
        *slot = until;
    }

    pub fn clear(&mut self) {
        *self = Cooldowns::default();
    }
}

/// A pooled account as persisted by the store.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub email: String,
    /// Opaque blob handed to login automation
    pub credential: String,
    /// Current session token; `None` means the account needs a login
    #[serde(default)]
    pub session: Option<String>,
    #[serde(default)]
    pub session_expires_at: Option<u64>,
    pub status: AccountStatus,
    #[serde(default)]
    pub disabled_reason: Option<String>,
    #[serde(default)]
    pub next_eligible: Cooldowns,
    #[serde(default)]
    pub last_used_at: Option<u64>,
    #[serde(default)]
    pub consecutive_failures: u32,
    #[serde(default)]
    pub total_requests: u64,
    #[serde(default)]
    pub total_failures: u64,
    /// Disposable mailbox the account was registered with
    #[serde(default)]
    pub mailbox: Option<String>,
    pub created_at: u64,
    /// Bumped by the store on every successful upsert
    #[serde(default)]
    pub revision: u64,
}

impl Account {
    /// A fresh account with a generated id. It starts `AuthExpired` and
    /// becomes `Active` after its first successful login.
    pub fn new(email: impl Into<String>, credential: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            email: email.into(),
            credential: credential.into(),
            session: None,
            session_expires_at: None,
            status: AccountStatus::AuthExpired,
            disabled_reason: None,
            next_eligible: Cooldowns::default(),
            last_used_at: None,
            consecutive_failures: 0,
            total_requests: 0,
            total_failures: 0,
            mailbox: None,
            created_at: now_millis(),
            revision: 0,
        }
    }

    pub fn with_mailbox(mut self, mailbox: impl Into<String>) -> Self {
        self.mailbox = Some(mailbox.into());
        self
    }
}

// Manual Debug so credentials and sessions never reach the logs.
impl fmt::Debug for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Account")
            .field("id", &self.id)
            .field("email", &self.email)
            .field("credential", &"[REDACTED]")
            .field("session", &self.session.as_ref().map(|_| "[REDACTED]"))
            .field("session_expires_at", &self.session_expires_at)
            .field("status", &self.status)
            .field("disabled_reason", &self.disabled_reason)
            .field("next_eligible", &self.next_eligible)
            .field("last_used_at", &self.last_used_at)
            .field("consecutive_failures", &self.consecutive_failures)
            .field("revision", &self.revision)
            .finish_non_exhaustive()
    }
}

/// Selects accounts in `AccountStore::list`. Empty filter matches everything.
#[derive(Debug, Clone, Default)]
pub struct AccountFilter {
    pub status: Option<AccountStatus>,
    pub email: Option<String>,
}

impl AccountFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn status(status: AccountStatus) -> Self {
        Self {
            status: Some(status),
            email: None,
        }
    }

    pub fn email(email: impl Into<String>) -> Self {
        Self {
            status: None,
            email: Some(email.into()),
        }
    }

    pub fn matches(&self, account: &Account) -> bool {
        if let Some(status) = self.status
            && account.status != status
        {
            return false;
        }
        if let Some(email) = &self.email
            && !account.email.eq_ignore_ascii_case(email)
        {
            return false;
        }
        true
    }
}
