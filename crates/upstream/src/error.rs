//! Raw upstream failure as reported by an adapter

use std::fmt;

use serde::Serialize;

/// A failed call to the platform (or to the media converter).
///
/// `http_status` is `None` when no response was received (DNS, connect,
/// timeout). `credential_rejected` is set only by an adapter that recognised
/// an explicit invalid-token signal in the response; a plain 401/403 on a
/// publish call does not set it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpstreamError {
    pub http_status: Option<u16>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub credential_rejected: bool,
}

impl UpstreamError {
    /// Error response with a status code.
    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self {
            http_status: Some(status),
            message: message.into(),
            retry_after_secs: None,
            credential_rejected: false,
        }
    }

    /// Failure without a response (connection refused, timeout, bad body).
    pub fn network(message: impl Into<String>) -> Self {
        Self {
            http_status: None,
            message: message.into(),
            retry_after_secs: None,
            credential_rejected: false,
        }
    }

    pub fn with_retry_after(mut self, secs: u64) -> Self {
        self.retry_after_secs = Some(secs);
        self
    }

    pub fn rejecting_credential(mut self) -> Self {
        self.credential_rejected = true;
        self
    }

    /// Whether a refresh endpoint refused the refresh token itself, as opposed
    /// to failing transiently.
    pub fn is_refresh_rejection(&self) -> bool {
        self.credential_rejected || matches!(self.http_status, Some(401 | 403))
    }
}

impl fmt::Display for UpstreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.http_status {
            Some(status) => write!(f, "upstream returned {status}: {}", self.message),
            None => write!(f, "upstream unreachable: {}", self.message),
        }
    }
}

impl std::error::Error for UpstreamError {}
