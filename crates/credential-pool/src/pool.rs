//! Per-workspace credential pool
//!
//! The pool holds one record per connected account. Each record lives behind
//! its own `tokio::sync::Mutex`, so `acquire`, `report_outcome`, `refresh` and
//! the sweep serialize per credential without a pool-wide lock. The record list
//! itself sits in a `RwLock` and is only write-locked to add or remove
//! accounts.
//!
//! Selection is least-recently-used among `Active` records. The pool never
//! checks a credential out exclusively: the upstream tolerates concurrent use
//! of one token, so recency is tracked only for fair rotation.
//!
//! No lock is held across a network call. A refresh holds only the record's
//! refresh gate while waiting on the upstream, so publishers can keep
//! acquiring the other credentials (and this one).

use std::sync::Arc;
use std::time::Duration;

use common::Secret;
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use upstream::Upstream;

use crate::error::{Error, Result};
use crate::record::{CredentialRecord, CredentialStatus, NewCredential, Outcome, now_millis};
use crate::store::CredentialStore;
use crate::sweep::SweepReport;

/// A credential handed out by `acquire`, ready for one publish attempt.
#[derive(Debug, Clone)]
pub struct AcquiredCredential {
    pub credential_id: String,
    pub workspace_id: String,
    pub account_id: String,
    pub token: Secret<String>,
}

/// Token-free view of one credential for dashboards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CredentialSummary {
    pub credential_id: String,
    pub account_id: String,
    pub status: &'static str,
    pub call_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limit_remaining_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<u64>,
}

/// Pool counts for one workspace.
///
/// `status` mapping: all active → healthy, some active → degraded, none
/// active (or no credentials) → unhealthy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub workspace_id: String,
    pub status: &'static str,
    pub total_credentials: usize,
    pub active: usize,
    pub rate_limited: usize,
    pub invalid: usize,
    pub total_calls: u64,
    pub credentials: Vec<CredentialSummary>,
}

impl PoolStats {
    /// Stats for a workspace with no credentials.
    pub fn empty(workspace_id: &str) -> Self {
        Self {
            workspace_id: workspace_id.to_string(),
            status: "unhealthy",
            total_credentials: 0,
            active: 0,
            rate_limited: 0,
            invalid: 0,
            total_calls: 0,
            credentials: Vec::new(),
        }
    }
}

struct Slot {
    credential_id: String,
    record: Mutex<CredentialRecord>,
    /// Held for the duration of an upstream refresh of this credential.
    refresh_gate: Mutex<()>,
}

impl Slot {
    fn new(record: CredentialRecord) -> Self {
        Self {
            credential_id: record.credential_id.clone(),
            record: Mutex::new(record),
            refresh_gate: Mutex::new(()),
        }
    }
}

/// Credential pool for one workspace.
pub struct Pool {
    workspace_id: String,
    slots: RwLock<Vec<Arc<Slot>>>,
    upstream: Arc<dyn Upstream>,
    store: Option<Arc<CredentialStore>>,
}

impl Pool {
    /// Create an empty pool. `store`, when given, receives every registration,
    /// revocation and refreshed token.
    pub fn new(
        workspace_id: impl Into<String>,
        upstream: Arc<dyn Upstream>,
        store: Option<Arc<CredentialStore>>,
    ) -> Self {
        Self {
            workspace_id: workspace_id.into(),
            slots: RwLock::new(Vec::new()),
            upstream,
            store,
        }
    }

    pub fn workspace_id(&self) -> &str {
        &self.workspace_id
    }

    /// Register a connected account, or replace the token material of an
    /// already registered one (which also brings it back to `Active`).
    ///
    /// Returns the credential id.
    pub async fn register(&self, new: NewCredential) -> Result<String> {
        self.register_as(new, new_credential_id()).await
    }

    /// `register`, with `fresh_id` as the id if the account is new.
    pub(crate) async fn register_as(&self, new: NewCredential, fresh_id: String) -> Result<String> {
        new.validate()?;
        if new.workspace_id != self.workspace_id {
            return Err(Error::InvalidInput(format!(
                "credential for workspace {} registered in pool {}",
                new.workspace_id, self.workspace_id
            )));
        }

        let mut slots = self.slots.write().await;
        for slot in slots.iter() {
            let mut record = slot.record.lock().await;
            if record.account_id == new.account_id {
                let mut updated = record.clone();
                updated.replace_material(new);
                if let Some(store) = &self.store {
                    store.upsert(&slot.credential_id, updated.to_stored()).await?;
                }
                *record = updated;
                drop(record);
                info!(
                    workspace_id = %self.workspace_id,
                    credential_id = %slot.credential_id,
                    "credential re-registered"
                );
                return Ok(slot.credential_id.clone());
            }
        }

        let credential_id = fresh_id;
        let record = CredentialRecord::new(credential_id.clone(), new);
        if let Some(store) = &self.store {
            store.upsert(&credential_id, record.to_stored()).await?;
        }
        info!(
            workspace_id = %self.workspace_id,
            credential_id = %credential_id,
            account_id = %record.account_id,
            "credential registered"
        );
        slots.push(Arc::new(Slot::new(record)));
        Ok(credential_id)
    }

    /// Insert a record loaded from the store without writing it back.
    pub(crate) async fn restore(&self, record: CredentialRecord) {
        self.slots.write().await.push(Arc::new(Slot::new(record)));
    }

    /// Remove a credential. Returns whether it existed.
    pub async fn remove(&self, credential_id: &str) -> Result<bool> {
        let mut slots = self.slots.write().await;
        let Some(idx) = slots.iter().position(|s| s.credential_id == credential_id) else {
            return Ok(false);
        };
        if let Some(store) = &self.store {
            store.remove(credential_id).await?;
        }
        slots.remove(idx);
        info!(workspace_id = %self.workspace_id, credential_id, "credential removed");
        Ok(true)
    }

    /// Hand out the least recently used `Active` credential.
    ///
    /// Ties on `last_used_at` are broken by lowest `call_count`, then by
    /// credential id. `None` means no capacity right now; it is not an error.
    pub async fn acquire(&self) -> Option<AcquiredCredential> {
        let slots = self.slots.read().await.clone();

        // A candidate can change status between the scan and the lock; rescan
        // at most once per slot.
        for _ in 0..=slots.len() {
            let candidate = pick_least_recently_used(&slots).await?;
            let mut record = candidate.record.lock().await;
            if !record.is_eligible() {
                continue;
            }
            record.touch(Instant::now());
            metrics::counter!("credential_pool_acquisitions_total", "result" => "acquired")
                .increment(1);
            debug!(
                workspace_id = %self.workspace_id,
                credential_id = %record.credential_id,
                call_count = record.call_count,
                "credential acquired"
            );
            return Some(AcquiredCredential {
                credential_id: record.credential_id.clone(),
                workspace_id: record.workspace_id.clone(),
                account_id: record.account_id.clone(),
                token: record.token.clone(),
            });
        }

        metrics::counter!("credential_pool_acquisitions_total", "result" => "empty").increment(1);
        debug!(workspace_id = %self.workspace_id, "no eligible credential");
        None
    }

    /// Apply the outcome of using a credential.
    ///
    /// - Success → no change (usage was counted at acquire time)
    /// - RateLimited → `RateLimited` until now + retry_after
    /// - Invalid → `Invalid` until refreshed or re-registered
    pub async fn report_outcome(&self, credential_id: &str, outcome: Outcome) -> Result<()> {
        let slot = self
            .slot(credential_id)
            .await
            .ok_or_else(|| Error::NotFound(credential_id.to_string()))?;
        let mut record = slot.record.lock().await;
        if let Some(status) = record.apply_outcome(outcome, Instant::now()) {
            record_transition(status);
            match outcome {
                Outcome::RateLimited { retry_after } => info!(
                    credential_id,
                    retry_after_secs = retry_after.as_secs(),
                    "credential rate limited"
                ),
                _ => warn!(credential_id, "credential marked invalid"),
            }
        }
        Ok(())
    }

    /// Exchange the credential's refresh token for a new access token.
    ///
    /// Concurrent calls for one credential collapse: whoever arrives while a
    /// refresh is in flight waits for it and returns its result instead of
    /// calling the upstream again. A rejected or missing refresh token marks
    /// the credential `Invalid`; a transient failure leaves it untouched.
    pub async fn refresh(&self, credential_id: &str) -> Result<Secret<String>> {
        let slot = self
            .slot(credential_id)
            .await
            .ok_or_else(|| Error::NotFound(credential_id.to_string()))?;

        let seen_epoch = slot.record.lock().await.refresh_epoch;
        let _gate = slot.refresh_gate.lock().await;

        let refresh_token = {
            let record = slot.record.lock().await;
            if record.refresh_epoch != seen_epoch {
                debug!(credential_id, "joined completed refresh");
                return record.refresh_result();
            }
            record.refresh_token.clone()
        };

        let Some(refresh_token) = refresh_token else {
            slot.record.lock().await.invalidate();
            record_transition(CredentialStatus::Invalid);
            metrics::counter!("credential_refresh_total", "result" => "missing").increment(1);
            warn!(credential_id, "refresh needed but no refresh token, credential invalid");
            return Err(Error::MissingRefreshToken(credential_id.to_string()));
        };

        match self.upstream.refresh_token(refresh_token.expose()).await {
            Ok(grant) => {
                let (token, stored) = {
                    let mut record = slot.record.lock().await;
                    record.apply_grant(grant, now_millis());
                    (record.token.clone(), record.to_stored())
                };
                record_transition(CredentialStatus::Active);
                metrics::counter!("credential_refresh_total", "result" => "success").increment(1);
                if let Some(store) = &self.store {
                    let persisted = store
                        .update_token(
                            credential_id,
                            stored.token,
                            stored.refresh_token,
                            stored.expires_at,
                        )
                        .await;
                    if let Err(e) = persisted {
                        warn!(credential_id, error = %e, "failed to persist refreshed token");
                    }
                }
                info!(credential_id, "token refresh succeeded");
                Ok(token)
            }
            Err(e) if e.is_refresh_rejection() => {
                slot.record.lock().await.invalidate();
                record_transition(CredentialStatus::Invalid);
                metrics::counter!("credential_refresh_total", "result" => "rejected").increment(1);
                warn!(credential_id, error = %e, "refresh token rejected, credential invalid");
                Err(Error::RefreshRejected(format!("{credential_id}: {e}")))
            }
            Err(e) => {
                metrics::counter!("credential_refresh_total", "result" => "failed").increment(1);
                warn!(credential_id, error = %e, "token refresh failed (transient)");
                Err(Error::RefreshFailed(format!("{credential_id}: {e}")))
            }
        }
    }

    /// One sweep pass: reactivate rate-limited records whose reset has
    /// passed, then refresh records expiring within `lookahead`.
    pub async fn sweep(&self, lookahead: Duration) -> SweepReport {
        let slots = self.slots.read().await.clone();
        let now = Instant::now();
        let now_ms = now_millis();
        let mut report = SweepReport::default();
        let mut expiring = Vec::new();

        for slot in &slots {
            let mut record = slot.record.lock().await;
            if record.reactivate_if_due(now) {
                record_transition(CredentialStatus::Active);
                info!(credential_id = %slot.credential_id, "rate limit expired, credential active again");
                report.reactivated += 1;
            }
            if record.needs_refresh(now_ms, lookahead) {
                expiring.push(slot.credential_id.clone());
            }
        }

        for credential_id in expiring {
            debug!(credential_id = %credential_id, "token expiring within lookahead, refreshing");
            match self.refresh(&credential_id).await {
                Ok(_) => report.refreshed += 1,
                Err(e) if e.invalidated_credential() => report.invalidated += 1,
                Err(_) => report.failed += 1,
            }
        }
        report
    }

    /// Counts and per-credential summaries. Never exposes tokens.
    pub async fn stats(&self) -> PoolStats {
        let slots = self.slots.read().await.clone();
        let now = Instant::now();
        let mut stats = PoolStats::empty(&self.workspace_id);

        for slot in &slots {
            let record = slot.record.lock().await;
            let status = record.status();
            match status {
                CredentialStatus::Active => stats.active += 1,
                CredentialStatus::RateLimited { .. } => stats.rate_limited += 1,
                CredentialStatus::Invalid => stats.invalid += 1,
            }
            stats.total_calls += record.call_count();
            stats.credentials.push(CredentialSummary {
                credential_id: record.credential_id.clone(),
                account_id: record.account_id.clone(),
                status: status.label(),
                call_count: record.call_count(),
                rate_limit_remaining_secs: record
                    .rate_limit_reset_at()
                    .map(|reset| whole_secs_until(reset, now)),
                expires_at: record.expires_at,
            });
        }

        stats.total_credentials = slots.len();
        stats.status = if stats.total_credentials > 0 && stats.active == stats.total_credentials {
            "healthy"
        } else if stats.active > 0 {
            "degraded"
        } else {
            "unhealthy"
        };
        stats
    }

    /// Snapshot of one record.
    pub async fn record(&self, credential_id: &str) -> Option<CredentialRecord> {
        let slot = self.slot(credential_id).await?;
        let record = slot.record.lock().await;
        Some(record.clone())
    }

    pub async fn credential_ids(&self) -> Vec<String> {
        self.slots
            .read()
            .await
            .iter()
            .map(|s| s.credential_id.clone())
            .collect()
    }

    pub async fn is_empty(&self) -> bool {
        self.slots.read().await.is_empty()
    }

    async fn slot(&self, credential_id: &str) -> Option<Arc<Slot>> {
        self.slots
            .read()
            .await
            .iter()
            .find(|s| s.credential_id == credential_id)
            .cloned()
    }
}

pub(crate) fn new_credential_id() -> String {
    format!("cred_{}", uuid::Uuid::new_v4().as_simple())
}

/// Scan `slots` for the eligible record with the smallest selection key.
async fn pick_least_recently_used(slots: &[Arc<Slot>]) -> Option<Arc<Slot>> {
    let mut best: Option<((Option<Instant>, u64, String), &Arc<Slot>)> = None;
    for slot in slots {
        let record = slot.record.lock().await;
        if !record.is_eligible() {
            continue;
        }
        let key = record.selection_key();
        if best.as_ref().is_none_or(|(best_key, _)| key < *best_key) {
            best = Some((key, slot));
        }
    }
    best.map(|(_, slot)| slot.clone())
}

/// Seconds from `now` until `at`, rounded up. Zero once `at` has passed.
fn whole_secs_until(at: Instant, now: Instant) -> u64 {
    let remaining = at.saturating_duration_since(now);
    remaining.as_secs() + u64::from(remaining.subsec_nanos() > 0)
}

fn record_transition(status: CredentialStatus) {
    metrics::counter!("credential_status_transitions_total", "status" => status.label())
        .increment(1);
}
