//! Credential pools for publishing workspaces
//!
//! Each workspace owns a `Pool` of OAuth credentials for its connected
//! accounts. The pool hands out the least recently used healthy credential,
//! quarantines rate-limited ones, and refreshes tokens before they expire.
//! `CredentialPools` is the multi-tenant registry the publisher and the
//! gateway talk to.
//!
//! Credential lifecycle:
//! 1. Account connected → `register_credential`, status `Active`
//! 2. Publish → `acquire` picks the oldest `last_used_at` among `Active` records
//! 3. Upstream rate limit → `report_outcome(RateLimited)` → `RateLimited` until reset
//! 4. Sweep after reset → back to `Active`
//! 5. Sweep near expiry → `refresh`; a rejected refresh token → `Invalid`
//! 6. Account disconnected → `revoke_credential`

pub mod error;
pub mod pool;
pub mod record;
pub mod registry;
pub mod store;
pub mod sweep;

pub use error::{Error, Result};
pub use pool::{AcquiredCredential, CredentialSummary, Pool, PoolStats};
pub use record::{CredentialRecord, CredentialStatus, NewCredential, Outcome};
pub use registry::CredentialPools;
pub use store::{CredentialStore, StoredCredential};
pub use sweep::{SweepReport, spawn_sweep_task};
