//! Durable account records for the pool
//!
//! `AccountStore` owns every `Account` the pool knows about. Writes are
//! serialized by a tokio Mutex and checked against the record's revision, so
//! a background task holding a stale copy gets `VersionConflict` instead of
//! silently overwriting newer state. Persistence goes through a `Backend`:
//! a JSON file in production, memory in tests.

pub mod account;
pub mod backend;
pub mod error;
pub mod store;

pub use account::{Account, AccountFilter, AccountStatus, Cooldowns, now_millis};
pub use backend::{Backend, JsonFileBackend, MemoryBackend};
pub use error::{Error, Result};
pub use store::AccountStore;
