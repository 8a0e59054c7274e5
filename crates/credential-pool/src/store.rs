//! Persistent credential storage
//!
//! A JSON file mapping credential ids to token material. All writes use
//! temp-file + rename so a crash mid-write never leaves a truncated file, and a
//! tokio Mutex serializes writers (registration, revocation, refresh). The
//! in-memory map only changes once the file write succeeded.
//!
//! Only token material is persisted. Rate-limit and invalid status are runtime
//! health: after a restart every stored credential starts `Active` and the next
//! refresh or rate limit re-establishes its state.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{Error, Result};

/// One credential as stored on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredCredential {
    pub workspace_id: String,
    pub account_id: String,
    pub token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// Unix timestamp in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<u64>,
}

/// Thread-safe credential file manager.
pub struct CredentialStore {
    path: PathBuf,
    state: Mutex<HashMap<String, StoredCredential>>,
}

impl CredentialStore {
    /// Load credentials from `path`, creating an empty `{}` file on cold start.
    pub async fn load(path: PathBuf) -> Result<Self> {
        let state = if path.exists() {
            let contents = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| Error::Store(format!("reading credential file: {e}")))?;
            let credentials: HashMap<String, StoredCredential> = serde_json::from_str(&contents)
                .map_err(|e| Error::Store(format!("parsing credential file: {e}")))?;
            info!(path = %path.display(), credentials = credentials.len(), "loaded credentials");
            credentials
        } else {
            info!(path = %path.display(), "credential file not found, starting with empty store");
            let store = HashMap::new();
            write_atomic(&path, &store).await?;
            store
        };

        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    pub async fn get(&self, credential_id: &str) -> Option<StoredCredential> {
        self.state.lock().await.get(credential_id).cloned()
    }

    /// Snapshot of every stored credential, sorted by credential id.
    pub async fn entries(&self) -> Vec<(String, StoredCredential)> {
        let state = self.state.lock().await;
        let mut entries: Vec<_> = state
            .iter()
            .map(|(id, c)| (id.clone(), c.clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    /// Add or replace a credential and persist.
    pub async fn upsert(&self, credential_id: &str, credential: StoredCredential) -> Result<()> {
        let mut state = self.state.lock().await;
        let mut next = state.clone();
        next.insert(credential_id.to_string(), credential);
        write_atomic(&self.path, &next).await?;
        *state = next;
        debug!(credential_id, "stored credential");
        Ok(())
    }

    /// Remove a credential and persist. Returns the removed entry if any.
    pub async fn remove(&self, credential_id: &str) -> Result<Option<StoredCredential>> {
        let mut state = self.state.lock().await;
        if !state.contains_key(credential_id) {
            return Ok(None);
        }
        let mut next = state.clone();
        let removed = next.remove(credential_id);
        write_atomic(&self.path, &next).await?;
        *state = next;
        debug!(credential_id, "removed credential");
        Ok(removed)
    }

    /// Replace token material after a refresh.
    pub async fn update_token(
        &self,
        credential_id: &str,
        token: String,
        refresh_token: Option<String>,
        expires_at: Option<u64>,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        let mut next = state.clone();
        let credential = next
            .get_mut(credential_id)
            .ok_or_else(|| Error::NotFound(credential_id.to_string()))?;
        credential.token = token;
        credential.refresh_token = refresh_token;
        credential.expires_at = expires_at;
        write_atomic(&self.path, &next).await?;
        *state = next;
        debug!(credential_id, "updated stored token");
        Ok(())
    }
}

/// Write the credential map atomically with 0600 permissions.
async fn write_atomic(path: &Path, data: &HashMap<String, StoredCredential>) -> Result<()> {
    let json = serde_json::to_string_pretty(data)
        .map_err(|e| Error::Store(format!("serializing credentials: {e}")))?;

    let dir = path
        .parent()
        .ok_or_else(|| Error::Store("credential path has no parent directory".into()))?;
    let tmp_path = dir.join(format!(".credentials.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| Error::Store(format!("writing temp credential file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Store(format!("setting credential file permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Store(format!("renaming temp credential file: {e}")))?;

    debug!(path = %path.display(), "persisted credentials");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stored(account: &str) -> StoredCredential {
        StoredCredential {
            workspace_id: "ws-1".into(),
            account_id: account.into(),
            token: format!("at_{account}"),
            refresh_token: Some(format!("rt_{account}")),
            expires_at: Some(1_735_500_000_000),
        }
    }

    #[tokio::test]
    async fn upsert_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");

        let store = CredentialStore::load(path.clone()).await.unwrap();
        store.upsert("cred_1", stored("page-1")).await.unwrap();

        let reloaded = CredentialStore::load(path).await.unwrap();
        assert_eq!(reloaded.get("cred_1").await, Some(stored("page-1")));
    }

    #[tokio::test]
    async fn cold_start_creates_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");

        let store = CredentialStore::load(path.clone()).await.unwrap();
        assert!(store.entries().await.is_empty());
        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(contents.trim(), "{}");
    }

    #[tokio::test]
    async fn failed_write_leaves_entries_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::load(dir.path().join("credentials.json"))
            .await
            .unwrap();
        store.upsert("cred_a", stored("page-a")).await.unwrap();

        std::fs::remove_dir_all(dir.path()).unwrap();

        let mut changed = stored("page-a");
        changed.token = "at_changed".into();
        assert!(store.upsert("cred_a", changed).await.is_err());
        assert!(store.upsert("cred_b", stored("page-b")).await.is_err());
        assert!(store.remove("cred_a").await.is_err());

        let entries = store.entries().await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].1, stored("page-a"));
    }

    #[tokio::test]
    async fn corrupt_file_is_a_store_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");
        tokio::fs::write(&path, "not json").await.unwrap();

        let err = CredentialStore::load(path).await.err().unwrap();
        assert!(matches!(err, Error::Store(_)), "got: {err}");
    }

    #[tokio::test]
    async fn remove_is_reported_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::load(dir.path().join("c.json")).await.unwrap();
        store.upsert("cred_1", stored("page-1")).await.unwrap();

        assert!(store.remove("cred_1").await.unwrap().is_some());
        assert!(store.remove("cred_1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn update_token_replaces_material() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::load(dir.path().join("c.json")).await.unwrap();
        store.upsert("cred_1", stored("page-1")).await.unwrap();

        store
            .update_token("cred_1", "at_new".into(), None, Some(42))
            .await
            .unwrap();
        let c = store.get("cred_1").await.unwrap();
        assert_eq!(c.token, "at_new");
        assert_eq!(c.refresh_token, None);
        assert_eq!(c.expires_at, Some(42));
    }

    #[tokio::test]
    async fn update_missing_credential_errors() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::load(dir.path().join("c.json")).await.unwrap();
        let err = store
            .update_token("nope", "at".into(), None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn entries_are_sorted_by_id() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::load(dir.path().join("c.json")).await.unwrap();
        store.upsert("cred_b", stored("b")).await.unwrap();
        store.upsert("cred_a", stored("a")).await.unwrap();

        let ids: Vec<_> = store.entries().await.into_iter().map(|(id, _)| id).collect();
        assert_eq!(ids, vec!["cred_a", "cred_b"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn file_permissions_are_0600() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");
        let store = CredentialStore::load(path.clone()).await.unwrap();
        store.upsert("cred_1", stored("page-1")).await.unwrap();

        let mode = tokio::fs::metadata(&path).await.unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600, "credential file must be 0600, got {mode:o}");
    }

    #[tokio::test]
    async fn concurrent_upserts_dont_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");
        let store = std::sync::Arc::new(CredentialStore::load(path.clone()).await.unwrap());

        let mut handles = vec![];
        for i in 0..10 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .upsert(&format!("cred_{i}"), stored(&format!("page-{i}")))
                    .await
                    .unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        let parsed: HashMap<String, StoredCredential> = serde_json::from_str(&contents).unwrap();
        assert_eq!(parsed.len(), 10);
    }
}
