//! Multi-tenant registry of per-workspace pools
//!
//! Workspaces are isolated: a credential registered for one workspace is never
//! handed out for another. The registry also keeps a credential id → workspace
//! index so outcomes and refreshes can be reported by credential id alone.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use common::Secret;
use tokio::sync::RwLock;
use tracing::info;
use upstream::Upstream;

use crate::error::{Error, Result};
use crate::pool::{AcquiredCredential, Pool, PoolStats, new_credential_id};
use crate::record::{CredentialRecord, NewCredential, Outcome};
use crate::store::CredentialStore;
use crate::sweep::SweepReport;

/// All credential pools, keyed by workspace id.
pub struct CredentialPools {
    pools: RwLock<HashMap<String, Arc<Pool>>>,
    index: RwLock<HashMap<String, String>>,
    upstream: Arc<dyn Upstream>,
    store: Option<Arc<CredentialStore>>,
}

impl CredentialPools {
    /// In-memory pools with no persistence.
    pub fn new(upstream: Arc<dyn Upstream>) -> Self {
        Self {
            pools: RwLock::new(HashMap::new()),
            index: RwLock::new(HashMap::new()),
            upstream,
            store: None,
        }
    }

    /// Empty pools that write through to `store`.
    pub fn with_store(upstream: Arc<dyn Upstream>, store: Arc<CredentialStore>) -> Self {
        Self {
            store: Some(store),
            ..Self::new(upstream)
        }
    }

    /// Rebuild pools from every credential in `store`. Restored credentials
    /// start `Active` with no usage history.
    pub async fn restore(upstream: Arc<dyn Upstream>, store: Arc<CredentialStore>) -> Result<Self> {
        let pools = Self::with_store(upstream, store.clone());
        let entries = store.entries().await;
        let restored = entries.len();

        for (credential_id, stored) in entries {
            let record = CredentialRecord::from_stored(credential_id.clone(), stored);
            let pool = pools.pool_or_create(&record.workspace_id).await;
            pools
                .index
                .write()
                .await
                .insert(credential_id, record.workspace_id.clone());
            pool.restore(record).await;
        }

        info!(
            credentials = restored,
            workspaces = pools.pools.read().await.len(),
            "credential pools restored"
        );
        Ok(pools)
    }

    /// Register a credential in its workspace's pool, creating the pool on
    /// first use. Returns the credential id.
    pub async fn register_credential(&self, new: NewCredential) -> Result<String> {
        new.validate()?;
        let workspace_id = new.workspace_id.clone();
        let pool = self.pool_or_create(&workspace_id).await;

        // A new credential is acquirable as soon as the pool holds it, so its
        // id must already resolve for outcome reports by then.
        let fresh_id = new_credential_id();
        self.index
            .write()
            .await
            .insert(fresh_id.clone(), workspace_id);
        let registered = pool.register_as(new, fresh_id.clone()).await;
        if registered.as_ref().ok() != Some(&fresh_id) {
            self.index.write().await.remove(&fresh_id);
        }
        registered
    }

    /// Remove a credential from a workspace. A credential belonging to a
    /// different workspace is reported as not found.
    pub async fn revoke_credential(&self, workspace_id: &str, credential_id: &str) -> Result<()> {
        let owner = self.index.read().await.get(credential_id).cloned();
        if owner.as_deref() != Some(workspace_id) {
            return Err(Error::NotFound(credential_id.to_string()));
        }
        let pool = self
            .pool(workspace_id)
            .await
            .ok_or_else(|| Error::NotFound(credential_id.to_string()))?;
        if !pool.remove(credential_id).await? {
            return Err(Error::NotFound(credential_id.to_string()));
        }
        self.index.write().await.remove(credential_id);
        Ok(())
    }

    /// Least recently used healthy credential of `workspace_id`, or `None`
    /// when the workspace has no capacity (or no pool at all).
    pub async fn acquire(&self, workspace_id: &str) -> Option<AcquiredCredential> {
        match self.pool(workspace_id).await {
            Some(pool) => pool.acquire().await,
            None => {
                metrics::counter!("credential_pool_acquisitions_total", "result" => "empty")
                    .increment(1);
                None
            }
        }
    }

    pub async fn report_outcome(&self, credential_id: &str, outcome: Outcome) -> Result<()> {
        self.owning_pool(credential_id)
            .await?
            .report_outcome(credential_id, outcome)
            .await
    }

    pub async fn refresh(&self, credential_id: &str) -> Result<Secret<String>> {
        self.owning_pool(credential_id)
            .await?
            .refresh(credential_id)
            .await
    }

    /// Stats for one workspace; an unknown workspace reports an empty,
    /// unhealthy pool.
    pub async fn stats(&self, workspace_id: &str) -> PoolStats {
        match self.pool(workspace_id).await {
            Some(pool) => pool.stats().await,
            None => PoolStats::empty(workspace_id),
        }
    }

    /// Sweep every pool once and sum the results.
    pub async fn sweep(&self, lookahead: Duration) -> SweepReport {
        let pools: Vec<Arc<Pool>> = self.pools.read().await.values().cloned().collect();
        let mut report = SweepReport::default();
        for pool in pools {
            report.merge(pool.sweep(lookahead).await);
        }
        report
    }

    /// Known workspace ids, sorted.
    pub async fn workspace_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.pools.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Snapshot of one credential record.
    pub async fn record(&self, credential_id: &str) -> Option<CredentialRecord> {
        let pool = self.owning_pool(credential_id).await.ok()?;
        pool.record(credential_id).await
    }

    async fn pool(&self, workspace_id: &str) -> Option<Arc<Pool>> {
        self.pools.read().await.get(workspace_id).cloned()
    }

    async fn pool_or_create(&self, workspace_id: &str) -> Arc<Pool> {
        if let Some(pool) = self.pool(workspace_id).await {
            return pool;
        }
        let mut pools = self.pools.write().await;
        pools
            .entry(workspace_id.to_string())
            .or_insert_with(|| {
                info!(workspace_id, "creating credential pool");
                Arc::new(Pool::new(
                    workspace_id,
                    self.upstream.clone(),
                    self.store.clone(),
                ))
            })
            .clone()
    }

    async fn owning_pool(&self, credential_id: &str) -> Result<Arc<Pool>> {
        let workspace_id = self
            .index
            .read()
            .await
            .get(credential_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(credential_id.to_string()))?;
        self.pool(&workspace_id)
            .await
            .ok_or_else(|| Error::NotFound(credential_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::CredentialStatus;
    use upstream::mock::MockUpstream;

    fn pools() -> CredentialPools {
        CredentialPools::new(Arc::new(MockUpstream::new()))
    }

    #[tokio::test]
    async fn workspaces_are_isolated() {
        let pools = pools();
        let a = pools
            .register_credential(NewCredential::new("ws-a", "page-1", "at_a"))
            .await
            .unwrap();
        pools
            .register_credential(NewCredential::new("ws-b", "page-2", "at_b"))
            .await
            .unwrap();

        for _ in 0..3 {
            let acquired = pools.acquire("ws-a").await.unwrap();
            assert_eq!(acquired.credential_id, a);
            assert_eq!(acquired.workspace_id, "ws-a");
        }
        assert!(pools.acquire("ws-unknown").await.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn new_credential_is_reportable_once_acquirable() {
        let pools = Arc::new(pools());
        let reporter = {
            let pools = pools.clone();
            tokio::spawn(async move {
                let mut reported = 0;
                while reported < 50 {
                    match pools.acquire("ws-1").await {
                        Some(acquired) => {
                            pools
                                .report_outcome(
                                    &acquired.credential_id,
                                    Outcome::RateLimited {
                                        retry_after: Duration::from_secs(3600),
                                    },
                                )
                                .await
                                .unwrap();
                            reported += 1;
                        }
                        None => tokio::task::yield_now().await,
                    }
                }
            })
        };

        for i in 0..50 {
            pools
                .register_credential(NewCredential::new(
                    "ws-1",
                    format!("page-{i}"),
                    format!("at_{i}"),
                ))
                .await
                .unwrap();
        }
        reporter.await.unwrap();
        assert_eq!(pools.stats("ws-1").await.rate_limited, 50);
    }

    #[tokio::test]
    async fn reregistration_keeps_single_index_entry() {
        let pools = pools();
        let first = pools
            .register_credential(NewCredential::new("ws-1", "page-1", "at_a"))
            .await
            .unwrap();
        let second = pools
            .register_credential(NewCredential::new("ws-1", "page-1", "at_b"))
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(pools.index.read().await.len(), 1);
    }

    #[tokio::test]
    async fn outcome_is_routed_by_credential_id() {
        let pools = pools();
        let a = pools
            .register_credential(NewCredential::new("ws-a", "page-1", "at_a"))
            .await
            .unwrap();

        pools.report_outcome(&a, Outcome::Invalid).await.unwrap();
        assert_eq!(
            pools.record(&a).await.unwrap().status(),
            CredentialStatus::Invalid
        );
        assert!(pools.acquire("ws-a").await.is_none());
    }

    #[tokio::test]
    async fn unknown_credential_is_not_found() {
        let pools = pools();
        assert!(matches!(
            pools.report_outcome("cred_x", Outcome::Success).await,
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            pools.refresh("cred_x").await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn revoke_checks_owning_workspace() {
        let pools = pools();
        let a = pools
            .register_credential(NewCredential::new("ws-a", "page-1", "at_a"))
            .await
            .unwrap();

        assert!(matches!(
            pools.revoke_credential("ws-b", &a).await,
            Err(Error::NotFound(_))
        ));
        pools.revoke_credential("ws-a", &a).await.unwrap();
        assert!(pools.acquire("ws-a").await.is_none());
        assert!(matches!(
            pools.revoke_credential("ws-a", &a).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn stats_for_unknown_workspace_are_empty() {
        let stats = pools().stats("ws-none").await;
        assert_eq!(stats.total_credentials, 0);
        assert_eq!(stats.status, "unhealthy");
    }

    #[tokio::test]
    async fn register_rejects_blank_workspace() {
        let err = pools()
            .register_credential(NewCredential::new(" ", "page-1", "at"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[tokio::test]
    async fn restore_rebuilds_pools_from_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");
        let upstream: Arc<dyn Upstream> = Arc::new(MockUpstream::new());

        let (a, b) = {
            let store = Arc::new(CredentialStore::load(path.clone()).await.unwrap());
            let pools = CredentialPools::with_store(upstream.clone(), store);
            let a = pools
                .register_credential(NewCredential::new("ws-a", "page-1", "at_a"))
                .await
                .unwrap();
            let b = pools
                .register_credential(NewCredential::new("ws-b", "page-2", "at_b"))
                .await
                .unwrap();
            pools.report_outcome(&b, Outcome::Invalid).await.unwrap();
            (a, b)
        };

        let store = Arc::new(CredentialStore::load(path).await.unwrap());
        let pools = CredentialPools::restore(upstream, store).await.unwrap();
        assert_eq!(pools.workspace_ids().await, vec!["ws-a", "ws-b"]);
        assert_eq!(pools.acquire("ws-a").await.unwrap().credential_id, a);
        // Health is not persisted: the invalid credential comes back active.
        assert_eq!(pools.acquire("ws-b").await.unwrap().credential_id, b);
    }

    #[tokio::test]
    async fn sweep_covers_every_workspace() {
        let pools = pools();
        let expiring = crate::record::now_millis();
        for ws in ["ws-a", "ws-b"] {
            pools
                .register_credential(
                    NewCredential::new(ws, "page-1", "at")
                        .with_refresh_token("rt")
                        .expiring_at(expiring),
                )
                .await
                .unwrap();
        }

        let report = pools.sweep(Duration::from_secs(60)).await;
        assert_eq!(report.refreshed, 2);
    }
}
