//! Credential record and its health state machine
//!
//! Status transitions:
//! - Active → RateLimited (`Outcome::RateLimited`)
//! - Active | RateLimited → Invalid (rejected refresh, or `Outcome::Invalid`)
//! - RateLimited → Active (sweep after `reset_at`)
//! - any → Active (successful refresh, or re-registration of the account)
//!
//! Publishing failures other than rate limits never reach this module.

use std::time::Duration;

use common::Secret;
use tokio::time::Instant;
use upstream::TokenGrant;

use crate::error::{Error, Result};
use crate::store::StoredCredential;

/// Health of one credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialStatus {
    Active,
    RateLimited { reset_at: Instant },
    Invalid,
}

impl CredentialStatus {
    /// Status label for stats and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            CredentialStatus::Active => "active",
            CredentialStatus::RateLimited { .. } => "rate_limited",
            CredentialStatus::Invalid => "invalid",
        }
    }
}

/// Result of using a credential, reported back by the publisher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    RateLimited { retry_after: Duration },
    Invalid,
}

/// Input for registering a connected account.
#[derive(Debug, Clone)]
pub struct NewCredential {
    pub workspace_id: String,
    pub account_id: String,
    pub token: Secret<String>,
    pub refresh_token: Option<Secret<String>>,
    /// Unix timestamp in milliseconds.
    pub expires_at: Option<u64>,
}

impl NewCredential {
    pub fn new(
        workspace_id: impl Into<String>,
        account_id: impl Into<String>,
        token: impl Into<Secret<String>>,
    ) -> Self {
        Self {
            workspace_id: workspace_id.into(),
            account_id: account_id.into(),
            token: token.into(),
            refresh_token: None,
            expires_at: None,
        }
    }

    pub fn with_refresh_token(mut self, refresh_token: impl Into<Secret<String>>) -> Self {
        self.refresh_token = Some(refresh_token.into());
        self
    }

    pub fn expiring_at(mut self, expires_at_millis: u64) -> Self {
        self.expires_at = Some(expires_at_millis);
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.workspace_id.trim().is_empty() {
            return Err(Error::InvalidInput("workspace_id is empty".into()));
        }
        if self.account_id.trim().is_empty() {
            return Err(Error::InvalidInput("account_id is empty".into()));
        }
        if self.token.is_blank() {
            return Err(Error::InvalidInput("token is empty".into()));
        }
        Ok(())
    }
}

/// An access token plus the usage and health metadata the pool keeps for it.
///
/// Only the owning `Pool` mutates a record, always under the record's own lock.
#[derive(Debug, Clone)]
pub struct CredentialRecord {
    pub credential_id: String,
    pub workspace_id: String,
    pub account_id: String,
    pub token: Secret<String>,
    pub refresh_token: Option<Secret<String>>,
    /// Unix timestamp in milliseconds.
    pub expires_at: Option<u64>,
    pub(crate) status: CredentialStatus,
    pub(crate) last_used_at: Option<Instant>,
    pub(crate) call_count: u64,
    /// Bumped every time a refresh completes (either way); lets a waiting
    /// refresher notice that the work was already done.
    pub(crate) refresh_epoch: u64,
}

impl CredentialRecord {
    pub(crate) fn new(credential_id: String, new: NewCredential) -> Self {
        Self {
            credential_id,
            workspace_id: new.workspace_id,
            account_id: new.account_id,
            token: new.token,
            refresh_token: new.refresh_token,
            expires_at: new.expires_at,
            status: CredentialStatus::Active,
            last_used_at: None,
            call_count: 0,
            refresh_epoch: 0,
        }
    }

    pub(crate) fn from_stored(credential_id: String, stored: StoredCredential) -> Self {
        Self::new(
            credential_id,
            NewCredential {
                workspace_id: stored.workspace_id,
                account_id: stored.account_id,
                token: stored.token.into(),
                refresh_token: stored.refresh_token.map(Into::into),
                expires_at: stored.expires_at,
            },
        )
    }

    pub(crate) fn to_stored(&self) -> StoredCredential {
        StoredCredential {
            workspace_id: self.workspace_id.clone(),
            account_id: self.account_id.clone(),
            token: self.token.expose().clone(),
            refresh_token: self.refresh_token.as_ref().map(|t| t.expose().clone()),
            expires_at: self.expires_at,
        }
    }

    pub fn status(&self) -> CredentialStatus {
        self.status
    }

    pub fn last_used_at(&self) -> Option<Instant> {
        self.last_used_at
    }

    pub fn call_count(&self) -> u64 {
        self.call_count
    }

    /// Set only while the credential is rate limited.
    pub fn rate_limit_reset_at(&self) -> Option<Instant> {
        match self.status {
            CredentialStatus::RateLimited { reset_at } => Some(reset_at),
            _ => None,
        }
    }

    /// Only `Active` credentials are handed out. A `RateLimited` record whose
    /// reset has passed stays ineligible until the sweep reactivates it.
    pub(crate) fn is_eligible(&self) -> bool {
        self.status == CredentialStatus::Active
    }

    /// Ordering used by `acquire`: oldest use first (never used sorts first),
    /// then fewest calls, then credential id.
    pub(crate) fn selection_key(&self) -> (Option<Instant>, u64, String) {
        (self.last_used_at, self.call_count, self.credential_id.clone())
    }

    pub(crate) fn touch(&mut self, now: Instant) {
        self.last_used_at = Some(now);
        self.call_count += 1;
    }

    /// Apply a reported outcome. Returns the new status when it changed.
    pub(crate) fn apply_outcome(&mut self, outcome: Outcome, now: Instant) -> Option<CredentialStatus> {
        let next = match outcome {
            Outcome::Success => return None,
            Outcome::RateLimited { retry_after } => CredentialStatus::RateLimited {
                reset_at: now + retry_after,
            },
            Outcome::Invalid => CredentialStatus::Invalid,
        };
        // A later rate limit on an invalid credential must not resurrect it.
        if self.status == CredentialStatus::Invalid {
            return None;
        }
        self.status = next;
        Some(next)
    }

    /// Flip a rate-limited record back to `Active` once its reset has passed.
    pub(crate) fn reactivate_if_due(&mut self, now: Instant) -> bool {
        match self.status {
            CredentialStatus::RateLimited { reset_at } if now >= reset_at => {
                self.status = CredentialStatus::Active;
                true
            }
            _ => false,
        }
    }

    /// Whether the sweep should refresh this record proactively.
    pub(crate) fn needs_refresh(&self, now_millis: u64, lookahead: Duration) -> bool {
        let lookahead_millis = lookahead.as_millis() as u64;
        self.status != CredentialStatus::Invalid
            && self.refresh_token.is_some()
            && self
                .expires_at
                .is_some_and(|expires| expires <= now_millis.saturating_add(lookahead_millis))
    }

    pub(crate) fn apply_grant(&mut self, grant: TokenGrant, now_millis: u64) {
        self.token = grant.access_token;
        if let Some(refresh) = grant.refresh_token {
            self.refresh_token = Some(refresh);
        }
        self.expires_at = grant
            .expires_in
            .map(|secs| now_millis.saturating_add(secs.saturating_mul(1000)));
        self.status = CredentialStatus::Active;
        self.refresh_epoch += 1;
    }

    pub(crate) fn invalidate(&mut self) {
        self.status = CredentialStatus::Invalid;
        self.refresh_epoch += 1;
    }

    /// Replace token material on re-registration of the same account.
    /// Usage counters survive so rotation stays fair.
    pub(crate) fn replace_material(&mut self, new: NewCredential) {
        self.token = new.token;
        self.refresh_token = new.refresh_token;
        self.expires_at = new.expires_at;
        self.status = CredentialStatus::Active;
        self.refresh_epoch += 1;
    }

    /// What a caller that joined an already completed refresh observes.
    pub(crate) fn refresh_result(&self) -> Result<Secret<String>> {
        match self.status {
            CredentialStatus::Invalid => Err(Error::RefreshRejected(self.credential_id.clone())),
            _ => Ok(self.token.clone()),
        }
    }
}

/// Current wall-clock time as unix milliseconds.
pub(crate) fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
