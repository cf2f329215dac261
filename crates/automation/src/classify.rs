//! Classification of failed AI requests
//!
//! Maps the upstream HTTP status and body onto the three outcomes the
//! scheduler understands. Only `RateLimited` starts a cooldown and only
//! `AuthExpired` sends the account back through login.

use crate::error::RequestError;

/// Body phrases that mean the account ran out of quota for this capability,
/// whatever status code the upstream chose to wrap them in.
const QUOTA_PATTERNS: &[&str] = &[
    "resource_exhausted",
    "resource exhausted",
    "quota",
    "rate limit",
    "too many requests",
];

/// Longest body excerpt carried into the error message.
const BODY_EXCERPT_CHARS: usize = 200;

/// Whether a response body reports quota exhaustion. Case-insensitive.
pub fn is_quota_exhausted(body: &str) -> bool {
    let lower = body.to_lowercase();
    QUOTA_PATTERNS.iter().any(|pattern| lower.contains(pattern))
}

/// Classify a failed upstream response.
///
/// 429 is always a rate limit and 401/403 always an expired session. Any
/// other status is a rate limit when the body says so, otherwise transient
/// (400 parameter errors included, they say nothing about the account).
pub fn classify_status(status: u16, body: &str) -> RequestError {
    let detail = format!("upstream returned {status}: {}", excerpt(body));
    match status {
        429 => RequestError::RateLimited(detail),
        401 | 403 => RequestError::AuthExpired(detail),
        _ if is_quota_exhausted(body) => RequestError::RateLimited(detail),
        _ => RequestError::Transient(detail),
    }
}

fn excerpt(body: &str) -> String {
    if body.chars().count() <= BODY_EXCERPT_CHARS {
        return body.to_string();
    }
    let cut: String = body.chars().take(BODY_EXCERPT_CHARS).collect();
    format!("{cut}...")
}
