//! Background health sweep
//!
//! A periodic task that reactivates rate-limited credentials whose reset has
//! passed and refreshes tokens approaching expiry, so most publishes never pay
//! refresh latency.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info};

use crate::registry::CredentialPools;

/// Counts from one sweep pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub reactivated: usize,
    pub refreshed: usize,
    pub invalidated: usize,
    pub failed: usize,
}

impl SweepReport {
    pub fn merge(&mut self, other: SweepReport) {
        self.reactivated += other.reactivated;
        self.refreshed += other.refreshed;
        self.invalidated += other.invalidated;
        self.failed += other.failed;
    }

    pub fn is_empty(&self) -> bool {
        *self == SweepReport::default()
    }
}

/// Spawn the sweep loop.
///
/// Runs every `interval`; tokens expiring within `lookahead` are refreshed.
/// Transient refresh failures leave the credential as it was and are retried
/// on the next pass.
pub fn spawn_sweep_task(
    pools: Arc<CredentialPools>,
    interval: Duration,
    lookahead: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // Skip the immediate first tick, credentials were just loaded
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let report = pools.sweep(lookahead).await;
            if report.is_empty() {
                debug!("credential sweep: nothing to do");
            } else {
                info!(
                    reactivated = report.reactivated,
                    refreshed = report.refreshed,
                    invalidated = report.invalidated,
                    failed = report.failed,
                    "credential sweep completed"
                );
            }
        }
    })
}
