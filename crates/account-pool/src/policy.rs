//! Rate-limit policy
//!
//! Pure functions over an account snapshot and a clock reading. Nothing here
//! touches the store.

use std::fmt;
use std::time::Duration;

use account_store::{Account, AccountStatus};
use common::Capability;
use serde::Serialize;

/// Cooldown applied to a capability after each use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CooldownPolicy {
    pub chat: Duration,
    pub image: Duration,
    pub video: Duration,
}

impl Default for CooldownPolicy {
    fn default() -> Self {
        Self {
            chat: Duration::from_secs(2 * 60 * 60),
            image: Duration::from_secs(4 * 60 * 60),
            video: Duration::from_secs(4 * 60 * 60),
        }
    }
}

impl CooldownPolicy {
    pub fn cooldown(&self, capability: Capability) -> Duration {
        match capability {
            Capability::Chat => self.chat,
            Capability::Image => self.image,
            Capability::Video => self.video,
        }
    }

    /// Timestamp (unix millis) at which `capability` becomes usable again
    /// after a use at `now`.
    pub fn next_eligible_at(&self, capability: Capability, now: u64) -> u64 {
        now.saturating_add(self.cooldown(capability).as_millis() as u64)
    }
}

/// Why an account cannot serve a capability right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockReason {
    Disabled,
    AuthExpired,
    SessionMissing,
    SessionExpired,
    CoolingDown,
}

impl BlockReason {
    pub fn label(&self) -> &'static str {
        match self {
            BlockReason::Disabled => "disabled",
            BlockReason::AuthExpired => "auth_expired",
            BlockReason::SessionMissing => "session_missing",
            BlockReason::SessionExpired => "session_expired",
            BlockReason::CoolingDown => "cooling_down",
        }
    }

    /// Whether a fresh login would clear this block.
    pub fn needs_login(&self) -> bool {
        matches!(
            self,
            BlockReason::AuthExpired | BlockReason::SessionMissing | BlockReason::SessionExpired
        )
    }
}

impl fmt::Display for BlockReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eligibility {
    Eligible,
    Blocked {
        reason: BlockReason,
        /// Only set for `CoolingDown`
        retry_after: Option<Duration>,
    },
}

impl Eligibility {
    pub fn is_eligible(&self) -> bool {
        matches!(self, Eligibility::Eligible)
    }
}

/// Decide whether `account` may serve `capability` at `now` (unix millis).
///
/// A missing or zero timestamp never blocks.
pub fn eligible(account: &Account, capability: Capability, now: u64) -> Eligibility {
    let blocked = |reason| Eligibility::Blocked {
        reason,
        retry_after: None,
    };

    match account.status {
        AccountStatus::Disabled => return blocked(BlockReason::Disabled),
        AccountStatus::AuthExpired => return blocked(BlockReason::AuthExpired),
        AccountStatus::Active => {}
    }

    if account.session.as_deref().is_none_or(str::is_empty) {
        return blocked(BlockReason::SessionMissing);
    }

    if let Some(expires_at) = account.session_expires_at
        && expires_at != 0
        && now >= expires_at
    {
        return blocked(BlockReason::SessionExpired);
    }

    match account.next_eligible.get(capability) {
        Some(until) if until != 0 && now < until => Eligibility::Blocked {
            reason: BlockReason::CoolingDown,
            retry_after: Some(Duration::from_millis(until - now)),
        },
        _ => Eligibility::Eligible,
    }
}
