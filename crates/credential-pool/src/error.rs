//! Error types for pool operations

/// Errors from pool operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("credential not found: {0}")]
    NotFound(String),

    #[error("invalid credential input: {0}")]
    InvalidInput(String),

    #[error("refresh token rejected: {0}")]
    RefreshRejected(String),

    #[error("credential {0} has no refresh token")]
    MissingRefreshToken(String),

    #[error("token refresh failed: {0}")]
    RefreshFailed(String),

    #[error("credential store error: {0}")]
    Store(String),
}

impl Error {
    /// Whether this error left the credential `Invalid`.
    pub fn invalidated_credential(&self) -> bool {
        matches!(self, Error::RefreshRejected(_) | Error::MissingRefreshToken(_))
    }
}

/// Result alias for pool operations.
pub type Result<T> = std::result::Result<T, Error>;
