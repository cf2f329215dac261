//! Error types for account storage

/// Errors from account store operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("account file parse error: {0}")]
    Parse(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("an account with email {0} already exists")]
    DuplicateEmail(String),

    /// The caller's copy of the record is older than the stored one.
    #[error("version conflict on account {id}: expected revision {expected}, found {actual}")]
    VersionConflict {
        id: String,
        expected: u64,
        actual: u64,
    },
}

/// Result alias for store operations.
pub type Result<T> = std::result::Result<T, Error>;
