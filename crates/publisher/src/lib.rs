//! Adaptive publishing engine
//!
//! Given one publish request, the `Publisher` acquires a credential from the
//! workspace's pool and walks a chain of strategies until one succeeds or the
//! chain is exhausted:
//!
//! 1. `PermissionAwarePublish` (video/reel/story) or `DirectPublish` (photo)
//! 2. On failure the upstream error is classified (`Classifier`)
//! 3. The classification picks the next strategy (`Strategy::next`)
//! 4. Rate limits and rejected tokens are reported back to the pool; every
//!    other failure is content-scoped and leaves the credential alone
//!
//! Every result carries a `StrategyTrace` describing each step and why it
//! failed.

pub mod classify;
pub mod error;
pub mod executor;
pub mod orchestrator;
pub mod strategy;
pub mod trace;

pub use classify::{Classifier, FailureReason, ReasonKind};
pub use error::{Error, Result};
pub use executor::{Attempt, RetryPolicy, Step, StrategyExecutor};
pub use orchestrator::{PublishFailure, PublishOutcome, PublishPolicy, PublishReport, Publisher};
pub use strategy::Strategy;
pub use trace::{StepOutcome, StrategyTrace, SubAttempt, TraceEntry};
