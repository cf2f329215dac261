//! External automation capabilities consumed by the account pool
//!
//! The pool never drives a browser or a mail server itself. Everything that
//! touches the network goes through the traits defined here:
//! - `LoginAutomation` turns an account credential into a session token
//! - `MailboxProvider` hands out disposable mailboxes for new accounts
//! - `RegistrationAutomation` creates an account on the upstream service
//! - `AiExecutor` runs the actual chat/image/video request with a session
//!
//! `HttpAutomation` implements all four against a JSON automation backend.
//! Trait methods return `Pin<Box<dyn Future>>` so the pool can hold them as
//! `Arc<dyn Trait>`.

pub mod classify;
pub mod error;
pub mod http;

pub use classify::{classify_status, is_quota_exhausted};
pub use error::{AutomationError, RequestError, Result};
pub use http::HttpAutomation;

use common::Capability;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;

/// Session issued by login automation.
///
/// `expires_at` is a unix timestamp in milliseconds when the backend knows it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionToken {
    pub token: String,
    #[serde(default)]
    pub expires_at: Option<u64>,
}

/// Disposable mailbox used to register a new account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mailbox {
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
}

/// Result of a successful registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisteredAccount {
    pub email: String,
    /// Opaque credential blob understood by `LoginAutomation`
    pub credential: String,
}

/// Output of an AI request (chat reply, image or video reference).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub capability: Capability,
    pub content: serde_json::Value,
}

/// Obtains a fresh session for an account.
pub trait LoginAutomation: Send + Sync {
    fn login<'a>(
        &'a self,
        email: &'a str,
        credential: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<SessionToken>> + Send + 'a>>;
}

/// Provisions disposable mailboxes.
pub trait MailboxProvider: Send + Sync {
    fn provision_mailbox(&self) -> Pin<Box<dyn Future<Output = Result<Mailbox>> + Send + '_>>;
}

/// Registers a new upstream account on a provisioned mailbox.
pub trait RegistrationAutomation: Send + Sync {
    fn register_account<'a>(
        &'a self,
        mailbox: &'a Mailbox,
    ) -> Pin<Box<dyn Future<Output = Result<RegisteredAccount>> + Send + 'a>>;
}

/// Performs an AI request using a leased account's session.
pub trait AiExecutor: Send + Sync {
    fn perform<'a>(
        &'a self,
        session: &'a str,
        capability: Capability,
        prompt: &'a str,
        params: &'a serde_json::Value,
    ) -> Pin<Box<dyn Future<Output = std::result::Result<Artifact, RequestError>> + Send + 'a>>;
}
