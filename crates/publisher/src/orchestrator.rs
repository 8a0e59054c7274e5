//! Publish orchestration
//!
//! One `publish` call acquires one credential and runs strategies strictly in
//! sequence with it. Pool state changes only on two signals:
//!
//! - a rate limit → `RateLimited` outcome, and the call ends (every remaining
//!   strategy would spend the same exhausted credential)
//! - an explicit invalid-token response → the credential is refreshed; a
//!   rejected refresh is what marks it `Invalid`
//!
//! The deadline covers every await of the call, including that refresh. A
//! refresh cut off by the deadline keeps running in its own task so a rotated
//! refresh token is still stored.
//!
//! Permission, format, reachability and transient failures are about the
//! content, not the credential, and only move the strategy chain forward.

use std::sync::Arc;
use std::time::Duration;

use credential_pool::{CredentialPools, Outcome};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{info, warn};
use upstream::{Content, MediaConverter, Upstream};

use crate::classify::{Classifier, FailureReason};
use crate::error::Result;
use crate::executor::{Attempt, RetryPolicy, StrategyExecutor};
use crate::strategy::Strategy;
use crate::trace::{StepOutcome, StrategyTrace, TraceEntry};

/// Why a publish call did not publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PublishFailure {
    /// No healthy credential in the workspace right now.
    NoCapacity,
    /// The credential used was rate limited and has been quarantined.
    RateLimited { retry_after_secs: u64 },
    /// The platform rejected the credential's token.
    InvalidCredential,
    /// The deadline passed before a strategy succeeded.
    Timeout,
    /// Every applicable strategy failed for this content.
    Exhausted {
        #[serde(skip_serializing_if = "Option::is_none")]
        last_reason: Option<FailureReason>,
    },
}

impl PublishFailure {
    /// Whether the same content may be submitted again later. Exhausted
    /// content needs changes first (another media asset, another caption).
    pub fn is_retryable(&self) -> bool {
        !matches!(self, PublishFailure::Exhausted { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            PublishFailure::NoCapacity => "no_capacity",
            PublishFailure::RateLimited { .. } => "rate_limited",
            PublishFailure::InvalidCredential => "invalid_credential",
            PublishFailure::Timeout => "timeout",
            PublishFailure::Exhausted { .. } => "exhausted",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PublishOutcome {
    Published { content_id: String, strategy: Strategy },
    Failed(PublishFailure),
}

/// Result of one publish call, success or not.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PublishReport {
    pub outcome: PublishOutcome,
    pub trace: StrategyTrace,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential_id: Option<String>,
}

impl PublishReport {
    pub fn is_published(&self) -> bool {
        matches!(self.outcome, PublishOutcome::Published { .. })
    }

    pub fn failure(&self) -> Option<PublishFailure> {
        match self.outcome {
            PublishOutcome::Failed(failure) => Some(failure),
            PublishOutcome::Published { .. } => None,
        }
    }

    fn label(&self) -> &'static str {
        match &self.outcome {
            PublishOutcome::Published { .. } => "published",
            PublishOutcome::Failed(failure) => failure.label(),
        }
    }
}

/// Call-level settings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishPolicy {
    /// Deadline applied by `publish`. `None` lets a call run until its
    /// strategy chain ends.
    pub deadline: Option<Duration>,
}

/// Publishes content through a workspace's credential pool.
pub struct Publisher {
    pools: Arc<CredentialPools>,
    executor: StrategyExecutor,
    policy: PublishPolicy,
}

impl Publisher {
    /// Publisher with the default classifier, retry delays and no deadline.
    pub fn new(
        pools: Arc<CredentialPools>,
        upstream: Arc<dyn Upstream>,
        converter: Arc<dyn MediaConverter>,
    ) -> Self {
        Self::with_settings(
            pools,
            upstream,
            converter,
            Classifier::default(),
            RetryPolicy::default(),
            PublishPolicy::default(),
        )
    }

    pub fn with_settings(
        pools: Arc<CredentialPools>,
        upstream: Arc<dyn Upstream>,
        converter: Arc<dyn MediaConverter>,
        classifier: Classifier,
        retry: RetryPolicy,
        policy: PublishPolicy,
    ) -> Self {
        Self {
            pools,
            executor: StrategyExecutor::new(upstream, converter, classifier, retry),
            policy,
        }
    }

    pub fn pools(&self) -> &Arc<CredentialPools> {
        &self.pools
    }

    /// Publish `content` for `workspace_id` under the policy's deadline.
    pub async fn publish(&self, workspace_id: &str, content: &Content) -> Result<PublishReport> {
        let deadline = self.policy.deadline.map(|d| Instant::now() + d);
        self.run(workspace_id, content, deadline).await
    }

    /// Publish with an explicit deadline for the whole call.
    pub async fn publish_with_deadline(
        &self,
        workspace_id: &str,
        content: &Content,
        deadline: Duration,
    ) -> Result<PublishReport> {
        self.run(workspace_id, content, Some(Instant::now() + deadline))
            .await
    }

    async fn run(
        &self,
        workspace_id: &str,
        content: &Content,
        deadline: Option<Instant>,
    ) -> Result<PublishReport> {
        content.validate()?;

        let Some(credential) = self.pools.acquire(workspace_id).await else {
            info!(workspace_id, "no credential available, publish deferred");
            return Ok(finish(PublishFailure::NoCapacity.into(), StrategyTrace::new(), None));
        };
        let credential_id = credential.credential_id.clone();
        let token = credential.token.expose();

        let mut trace = StrategyTrace::new();
        let mut strategy = Strategy::initial(content.media_kind);
        let mut last_reason = None;
        // What the most recent strategy sent upstream, when it differs from
        // `content`. Retry strategies repeat it.
        let mut last_attempted: Option<Content> = None;

        loop {
            let target = match &last_attempted {
                Some(attempted) if strategy.repeats_last_attempt() => attempted,
                _ => content,
            };
            let run = self.executor.execute(strategy, token, target);
            let step = match deadline {
                Some(deadline) => match tokio::time::timeout_at(deadline, run).await {
                    Ok(step) => step,
                    Err(_) => {
                        warn!(
                            workspace_id,
                            credential_id = %credential_id,
                            strategy = strategy.name(),
                            "publish deadline exceeded"
                        );
                        trace.push(TraceEntry::new(strategy, StepOutcome::TimedOut));
                        return Ok(finish(
                            PublishFailure::Timeout.into(),
                            trace,
                            Some(credential_id),
                        ));
                    }
                },
                None => run.await,
            };
            trace.push(step.entry);
            if step.attempted.is_some() {
                last_attempted = step.attempted;
            }

            match step.attempt {
                Attempt::Published { content_id } => {
                    self.report(&credential_id, Outcome::Success).await;
                    info!(
                        workspace_id,
                        credential_id = %credential_id,
                        strategy = strategy.name(),
                        content_id = %content_id,
                        "content published"
                    );
                    let outcome = PublishOutcome::Published {
                        content_id,
                        strategy,
                    };
                    return Ok(finish(outcome, trace, Some(credential_id)));
                }
                Attempt::Redirect(next) => strategy = next,
                Attempt::Skipped => {
                    return Ok(finish(
                        PublishFailure::Exhausted { last_reason }.into(),
                        trace,
                        Some(credential_id),
                    ));
                }
                Attempt::Failed { reason, error } => {
                    if error.as_ref().is_some_and(|e| e.credential_rejected) {
                        warn!(
                            workspace_id,
                            credential_id = %credential_id,
                            "upstream rejected token, refreshing credential"
                        );
                        let pools = self.pools.clone();
                        let refreshing = credential_id.clone();
                        let refresh =
                            tokio::spawn(async move { pools.refresh(&refreshing).await });
                        let joined = match deadline {
                            Some(deadline) => {
                                match tokio::time::timeout_at(deadline, refresh).await {
                                    Ok(joined) => joined,
                                    Err(_) => {
                                        warn!(
                                            workspace_id,
                                            credential_id = %credential_id,
                                            "publish deadline exceeded while refreshing credential"
                                        );
                                        return Ok(finish(
                                            PublishFailure::Timeout.into(),
                                            trace,
                                            Some(credential_id),
                                        ));
                                    }
                                }
                            }
                            None => refresh.await,
                        };
                        match joined {
                            Ok(Ok(_)) => {}
                            Ok(Err(e)) => {
                                warn!(credential_id = %credential_id, error = %e, "refresh after token rejection failed");
                            }
                            Err(e) => {
                                warn!(credential_id = %credential_id, error = %e, "refresh task failed");
                            }
                        }
                        return Ok(finish(
                            PublishFailure::InvalidCredential.into(),
                            trace,
                            Some(credential_id),
                        ));
                    }

                    if let FailureReason::RateLimit { retry_after_secs } = reason {
                        let retry_after = Duration::from_secs(retry_after_secs);
                        self.report(&credential_id, Outcome::RateLimited { retry_after })
                            .await;
                        return Ok(finish(
                            PublishFailure::RateLimited { retry_after_secs }.into(),
                            trace,
                            Some(credential_id),
                        ));
                    }

                    last_reason = Some(reason);
                    match strategy.next(reason.kind()) {
                        Some(next) => {
                            info!(
                                workspace_id,
                                from = strategy.name(),
                                to = next.name(),
                                reason = reason.label(),
                                "falling back to next strategy"
                            );
                            strategy = next;
                        }
                        None => {
                            warn!(
                                workspace_id,
                                credential_id = %credential_id,
                                trace = %trace,
                                reason = reason.label(),
                                "all publishing strategies exhausted"
                            );
                            return Ok(finish(
                                PublishFailure::Exhausted { last_reason }.into(),
                                trace,
                                Some(credential_id),
                            ));
                        }
                    }
                }
            }
        }
    }

    async fn report(&self, credential_id: &str, outcome: Outcome) {
        // The credential may have been revoked while the publish was running.
        if let Err(e) = self.pools.report_outcome(credential_id, outcome).await {
            warn!(credential_id, error = %e, "failed to report credential outcome");
        }
    }
}

impl From<PublishFailure> for PublishOutcome {
    fn from(failure: PublishFailure) -> Self {
        PublishOutcome::Failed(failure)
    }
}

fn finish(
    outcome: PublishOutcome,
    trace: StrategyTrace,
    credential_id: Option<String>,
) -> PublishReport {
    let report = PublishReport {
        outcome,
        trace,
        credential_id,
    };
    metrics::counter!("publish_results_total", "result" => report.label()).increment(1);
    report
}
