//! Account pool scheduling for rotating AI-service accounts
//!
//! Tracks per-account health and per-capability cooldowns, leases the best
//! eligible account for each request, and keeps the pool stocked. The pool
//! reads and writes accounts only through `AccountStore` (single source of
//! truth); the scheduler's lease table is the only in-memory state.
//!
//! Account lifecycle:
//! 1. Registered or added by an operator → `AuthExpired`
//! 2. `SessionValidator` logs in → `Active`
//! 3. `Scheduler::acquire` leases the least-recently-used eligible account
//! 4. Release with `Success`/`RateLimited` → that capability cools down
//! 5. Release with `AuthExpired` → queued for the validator
//! 6. Repeated transient failures or failed logins → `Disabled`
//! 7. `RegistrationOrchestrator` replaces lost accounts when the Active
//!    count drops below the low-water mark

pub mod dispatch;
pub mod error;
pub mod policy;
pub mod registration;
pub mod scheduler;
pub mod validator;

pub use dispatch::Dispatcher;
pub use error::{Error, Result};
pub use policy::{BlockReason, CooldownPolicy, Eligibility, eligible};
pub use registration::{
    RegistrationConfig, RegistrationOrchestrator, RegistrationTask, TaskStatus,
    spawn_registration_task,
};
pub use scheduler::{
    AccountSummary, CapabilityStatus, HealthStatus, Lease, Outcome, PoolStatus, Scheduler,
    SchedulerConfig, modify, spawn_lease_reaper,
};
pub use validator::{
    RefreshQueue, RefreshResult, SessionValidator, ValidatorConfig, refresh_channel,
    spawn_validator,
};
