//! Error types for automation backend calls

/// Errors from login, mailbox and registration automation.
#[derive(Debug, thiserror::Error)]
pub enum AutomationError {
    #[error("automation request failed: {0}")]
    Http(String),

    #[error("automation rejected the request: {0}")]
    Rejected(String),

    #[error("invalid automation response: {0}")]
    InvalidResponse(String),
}

/// Result alias for automation operations.
pub type Result<T> = std::result::Result<T, AutomationError>;

/// Failure of an AI request, classified by what it means for the account.
///
/// - RateLimited: the account hit its per-capability limit, cool it down
/// - AuthExpired: the session is no longer accepted, re-login needed
/// - Transient: anything else (timeouts, 5xx, malformed replies)
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RequestError {
    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("session expired: {0}")]
    AuthExpired(String),

    #[error("transient failure: {0}")]
    Transient(String),
}

impl RequestError {
    /// Short label for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            RequestError::RateLimited(_) => "rate_limited",
            RequestError::AuthExpired(_) => "auth_expired",
            RequestError::Transient(_) => "transient",
        }
    }
}
