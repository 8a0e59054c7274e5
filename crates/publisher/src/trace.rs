//! Strategy trace returned with every publish result
//!
//! The trace records which strategies ran, how each ended and why. Callers
//! persist it next to the content row, so it serializes to stable JSON.

use std::fmt;

use serde::Serialize;
use upstream::UpstreamError;

use crate::classify::FailureReason;
use crate::strategy::Strategy;

/// How one strategy attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    Succeeded,
    Failed,
    /// Handed over to another strategy without a publish call of its own.
    Redirected,
    /// Not applicable to this content (no real media to fall back to).
    Skipped,
    /// The publish deadline expired while this strategy was running.
    TimedOut,
}

impl StepOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            StepOutcome::Succeeded => "succeeded",
            StepOutcome::Failed => "failed",
            StepOutcome::Redirected => "redirected",
            StepOutcome::Skipped => "skipped",
            StepOutcome::TimedOut => "timed_out",
        }
    }
}

/// One delayed re-attempt inside a retry strategy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubAttempt {
    pub delay_secs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<UpstreamError>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TraceEntry {
    pub strategy: Strategy,
    pub outcome: StepOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<FailureReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upstream_error: Option<UpstreamError>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub sub_attempts: Vec<SubAttempt>,
}

impl TraceEntry {
    pub fn new(strategy: Strategy, outcome: StepOutcome) -> Self {
        Self {
            strategy,
            outcome,
            reason: None,
            upstream_error: None,
            sub_attempts: Vec::new(),
        }
    }

    pub fn failed(strategy: Strategy, reason: FailureReason, error: UpstreamError) -> Self {
        Self {
            reason: Some(reason),
            upstream_error: Some(error),
            ..Self::new(strategy, StepOutcome::Failed)
        }
    }
}

/// Ordered list of strategy attempts for one publish call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct StrategyTrace(Vec<TraceEntry>);

impl StrategyTrace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: TraceEntry) {
        self.0.push(entry);
    }

    pub fn entries(&self) -> &[TraceEntry] {
        &self.0
    }

    pub fn last(&self) -> Option<&TraceEntry> {
        self.0.last()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Strategies in execution order.
    pub fn strategies(&self) -> Vec<Strategy> {
        self.0.iter().map(|e| e.strategy).collect()
    }
}

/// `PermissionAwarePublish -> PermissionFallback`
impl fmt::Display for StrategyTrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, entry) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(" -> ")?;
            }
            f.write_str(entry.strategy.name())?;
        }
        Ok(())
    }
}
