//! Organization plugin allowlist.
//!
//! Platform admins maintain a list of pre-approved plugin names and lock it
//! so that operators cannot install or run anything outside the list. While
//! unlocked (the default) the list is advisory and has no effect.
//!
//! Enforcement is deliberately asymmetric: a lock violation fails closed,
//! but a file that fails to *load* fails open with a warning, because a
//! corrupt allowlist file must not silently brick every plugin on the
//! machine.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::warn;

use crate::paths::StatePaths;

use super::error::{PluginError, Result};
use super::manifest::dedupe;

/// Persisted allowlist document (`plugin-allowlist.json`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllowlistFile {
    /// Sorted, deduplicated list of permitted plugin names.
    #[serde(default)]
    pub plugins: Vec<String>,
    /// When false the allowlist is advisory only.
    #[serde(default)]
    pub locked: bool,
}

pub struct AllowlistStore {
    path: PathBuf,
}

impl AllowlistStore {
    pub fn new(paths: &StatePaths) -> Self {
        Self {
            path: paths.allowlist_file(),
        }
    }

    /// Load the allowlist. Missing or empty file is an unlocked empty
    /// store; a corrupt file is a parse error for the caller to decide on.
    pub async fn load(&self) -> Result<AllowlistFile> {
        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(AllowlistFile::default())
            }
            Err(e) => return Err(e.into()),
        };
        if bytes.is_empty() {
            return Ok(AllowlistFile::default());
        }
        let mut file: AllowlistFile =
            serde_json::from_slice(&bytes).map_err(|e| PluginError::Parse {
                path: self.path.clone(),
                message: e.to_string(),
            })?;
        file.plugins = dedupe(&file.plugins);
        file.plugins.sort();
        Ok(file)
    }

    /// Save the allowlist, re-deduplicating and sorting first.
    pub async fn save(&self, file: &AllowlistFile) -> Result<()> {
        let mut normalized = file.clone();
        normalized.plugins = dedupe(&normalized.plugins);
        normalized.plugins.sort();
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let bytes = serde_json::to_vec_pretty(&normalized).map_err(|e| PluginError::Parse {
            path: self.path.clone(),
            message: e.to_string(),
        })?;
        fs::write(&self.path, bytes).await?;
        Ok(())
    }

    pub async fn add(&self, names: &[String]) -> Result<AllowlistFile> {
        let mut file = self.load().await?;
        file.plugins.extend(names.iter().cloned());
        self.save(&file).await?;
        self.load().await
    }

    pub async fn remove(&self, names: &[String]) -> Result<AllowlistFile> {
        let mut file = self.load().await?;
        file.plugins.retain(|p| !names.contains(p));
        self.save(&file).await?;
        self.load().await
    }

    pub async fn set_locked(&self, locked: bool) -> Result<AllowlistFile> {
        let mut file = self.load().await?;
        file.locked = locked;
        self.save(&file).await?;
        self.load().await
    }

    /// Whether `name` may be installed or run.
    ///
    /// Unlocked always permits. Locked permits only listed names and
    /// otherwise returns `NotAllowed`, whose message carries the
    /// remediation command. Load failures permit with a warning; the lock
    /// cannot be enforced from a file that does not parse.
    pub async fn is_allowed(&self, name: &str) -> Result<()> {
        let file = match self.load().await {
            Ok(file) => file,
            Err(e) => {
                warn!(error = %e, "allowlist load failed; failing open");
                return Ok(());
            }
        };
        if !file.locked {
            return Ok(());
        }
        if file.plugins.iter().any(|p| p == name) {
            return Ok(());
        }
        Err(PluginError::NotAllowed(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn save_load_round_trips_locked_and_normalizes() {
        let tmp = tempdir().expect("tempdir");
        let store = AllowlistStore::new(&StatePaths::with_root(tmp.path()));
        store
            .save(&AllowlistFile {
                plugins: names(&["zeta", "argocd", "zeta", " argocd "]),
                locked: true,
            })
            .await
            .expect("save");
        let loaded = store.load().await.expect("load");
        assert_eq!(loaded.plugins, names(&["argocd", "zeta"]));
        assert!(loaded.locked);
    }

    #[tokio::test]
    async fn missing_file_behaves_unlocked() {
        let tmp = tempdir().expect("tempdir");
        let store = AllowlistStore::new(&StatePaths::with_root(tmp.path()));
        let loaded = store.load().await.expect("load");
        assert!(!loaded.locked);
        assert!(loaded.plugins.is_empty());
        store.is_allowed("anything").await.expect("fail open");
    }

    #[tokio::test]
    async fn unlocked_permits_any_name() {
        let tmp = tempdir().expect("tempdir");
        let store = AllowlistStore::new(&StatePaths::with_root(tmp.path()));
        store.add(&names(&["argocd"])).await.expect("add");
        store.is_allowed("not-listed").await.expect("advisory only");
    }

    #[tokio::test]
    async fn locked_permits_only_listed_names() {
        let tmp = tempdir().expect("tempdir");
        let store = AllowlistStore::new(&StatePaths::with_root(tmp.path()));
        store.add(&names(&["argocd"])).await.expect("add");
        store.set_locked(true).await.expect("lock");

        store.is_allowed("argocd").await.expect("listed");
        let err = store.is_allowed("backup").await.expect_err("unlisted");
        assert!(matches!(err, PluginError::NotAllowed(_)));
        assert!(err.to_string().contains("kpilot plugin allowlist add backup"));
    }

    #[tokio::test]
    async fn corrupt_file_is_parse_error_but_enforcement_fails_open() {
        let tmp = tempdir().expect("tempdir");
        let paths = StatePaths::with_root(tmp.path());
        tokio::fs::create_dir_all(paths.root()).await.expect("root");
        tokio::fs::write(paths.allowlist_file(), b"{not json")
            .await
            .expect("corrupt");
        let store = AllowlistStore::new(&paths);

        assert!(matches!(
            store.load().await.expect_err("corrupt"),
            PluginError::Parse { .. }
        ));
        store.is_allowed("anything").await.expect("fail open");
    }

    #[tokio::test]
    async fn remove_and_unlock() {
        let tmp = tempdir().expect("tempdir");
        let store = AllowlistStore::new(&StatePaths::with_root(tmp.path()));
        store.add(&names(&["a", "b"])).await.expect("add");
        store.set_locked(true).await.expect("lock");
        let file = store.remove(&names(&["a"])).await.expect("remove");
        assert_eq!(file.plugins, names(&["b"]));
        let file = store.set_locked(false).await.expect("unlock");
        assert!(!file.locked);
    }
}
