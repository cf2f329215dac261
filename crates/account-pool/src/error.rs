//! Error types for pool operations

use std::time::Duration;

use common::Capability;

use crate::policy::BlockReason;

/// Errors from pool operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Every account is busy, cooling down, or unusable. `retry_after` is the
    /// shortest remaining cooldown when one is known.
    #[error("no eligible account for {capability}")]
    NoEligibleAccount {
        capability: Capability,
        retry_after: Option<Duration>,
    },

    /// The lease was already released or reclaimed.
    #[error("lease {0} is no longer open")]
    StaleLease(String),

    #[error("account not found: {0}")]
    NotFound(String),

    #[error("account already exists: {0}")]
    AlreadyExists(String),

    #[error("account {id} is not eligible: {reason}")]
    Ineligible { id: String, reason: BlockReason },

    #[error("account store error: {0}")]
    Store(#[from] account_store::Error),

    #[error("registration failed: {0}")]
    Registration(String),

    #[error("registration task not found: {0}")]
    TaskNotFound(String),

    /// The registration task already finished or was cancelled.
    #[error("registration task {0} is not running")]
    TaskNotRunning(String),

    #[error("gave up after {attempts} attempts: {last_error}")]
    AttemptsExhausted { attempts: u32, last_error: String },
}

/// Result alias for pool operations.
pub type Result<T> = std::result::Result<T, Error>;
