//! Per-plugin permission policy store and the consent capability.
//!
//! The store is a whole-file JSON document mapping plugin name to the set
//! of permission strings the operator has approved. Approvals persist until
//! revoked. Concurrent writers from two processes race and the later write
//! wins; there is deliberately no cross-process locking here.

use std::collections::BTreeMap;
use std::io::IsTerminal;
use std::io::Write as _;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::paths::StatePaths;

use super::error::{PluginError, Result};
use super::manifest::dedupe;

/// Persisted policy document (`plugin-policy.json`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyFile {
    #[serde(default)]
    pub allowed: BTreeMap<String, Vec<String>>,
}

/// Durable set of permissions the operator has approved per plugin.
pub struct PolicyStore {
    path: PathBuf,
}

impl PolicyStore {
    pub fn new(paths: &StatePaths) -> Self {
        Self {
            path: paths.policy_file(),
        }
    }

    /// Load the policy document. A missing or empty file means "nothing
    /// approved yet", not an error.
    pub async fn load(&self) -> Result<PolicyFile> {
        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(PolicyFile::default()),
            Err(e) => return Err(e.into()),
        };
        if bytes.is_empty() {
            return Ok(PolicyFile::default());
        }
        serde_json::from_slice(&bytes).map_err(|e| PluginError::Parse {
            path: self.path.clone(),
            message: e.to_string(),
        })
    }

    pub async fn save(&self, file: &PolicyFile) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let bytes = serde_json::to_vec_pretty(file).map_err(|e| PluginError::Parse {
            path: self.path.clone(),
            message: e.to_string(),
        })?;
        fs::write(&self.path, bytes).await?;
        Ok(())
    }

    /// Union `permissions` into the plugin's approved set. Idempotent.
    pub async fn allow(&self, plugin: &str, permissions: &[String]) -> Result<()> {
        let plugin = require_name(plugin)?;
        let mut file = self.load().await?;
        let entry = file.allowed.entry(plugin).or_default();
        let mut merged = entry.clone();
        merged.extend_from_slice(permissions);
        *entry = dedupe(&merged);
        self.save(&file).await
    }

    /// Remove specific permissions, or the plugin's entire approval record
    /// when `permissions` is empty.
    pub async fn revoke(&self, plugin: &str, permissions: &[String]) -> Result<()> {
        let plugin = require_name(plugin)?;
        let mut file = self.load().await?;
        if permissions.is_empty() {
            file.allowed.remove(&plugin);
            return self.save(&file).await;
        }
        let remove = dedupe(permissions);
        if let Some(current) = file.allowed.get_mut(&plugin) {
            current.retain(|p| !remove.contains(p));
            if current.is_empty() {
                file.allowed.remove(&plugin);
            }
        }
        self.save(&file).await
    }

    /// Sorted, deduplicated set difference `required - approved`. An empty
    /// result means nothing blocks execution.
    pub async fn missing(&self, plugin: &str, required: &[String]) -> Result<Vec<String>> {
        let required = dedupe(required);
        if required.is_empty() {
            return Ok(Vec::new());
        }
        let file = self.load().await?;
        let approved = file
            .allowed
            .get(plugin)
            .map(|perms| dedupe(perms))
            .unwrap_or_default();
        let mut missing: Vec<String> = required
            .into_iter()
            .filter(|p| !approved.contains(p))
            .collect();
        missing.sort();
        Ok(missing)
    }
}

fn require_name(plugin: &str) -> Result<String> {
    let plugin = plugin.trim();
    if plugin.is_empty() {
        return Err(PluginError::InvalidName(plugin.to_string()));
    }
    Ok(plugin.to_string())
}

/// Capability the orchestrator uses to ask the operator for permission
/// consent. The default implementation talks to the terminal; tests inject
/// a fixed answer so the fail-closed-when-non-interactive policy is
/// testable without a tty.
pub trait ConsentPrompt: Send + Sync {
    /// Whether a prompt can be answered at all. When false the orchestrator
    /// must fail closed instead of blocking on input nobody will provide.
    fn is_interactive(&self) -> bool;

    /// Present the missing permissions and return whether the operator
    /// approved. Any read failure counts as a decline.
    fn ask(&self, plugin: &str, missing: &[String]) -> bool;
}

/// Default prompt: writes to stderr, reads `y`/`yes` from stdin.
pub struct TerminalPrompt;

impl ConsentPrompt for TerminalPrompt {
    fn is_interactive(&self) -> bool {
        std::io::stdin().is_terminal()
    }

    fn ask(&self, plugin: &str, missing: &[String]) -> bool {
        let mut stderr = std::io::stderr();
        let _ = writeln!(stderr, "Plugin {plugin:?} requests permissions:");
        for p in missing {
            let _ = writeln!(stderr, "  - {p}");
        }
        let _ = write!(stderr, "Approve and continue? [y/N]: ");
        let _ = stderr.flush();
        let mut line = String::new();
        if std::io::stdin().read_line(&mut line).is_err() {
            return false;
        }
        matches!(line.trim().to_lowercase().as_str(), "y" | "yes")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn perms(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn absent_file_means_nothing_approved() {
        let tmp = tempdir().expect("tempdir");
        let store = PolicyStore::new(&StatePaths::with_root(tmp.path()));
        let missing = store
            .missing("argocd", &perms(&["network:api-server"]))
            .await
            .expect("missing");
        assert_eq!(missing, perms(&["network:api-server"]));
    }

    #[tokio::test]
    async fn allow_then_missing_round_trips_to_empty() {
        let tmp = tempdir().expect("tempdir");
        let store = PolicyStore::new(&StatePaths::with_root(tmp.path()));
        let required = perms(&["network:api-server", "fs-read:kubeconfig"]);
        store.allow("argocd", &required).await.expect("allow");
        let missing = store.missing("argocd", &required).await.expect("missing");
        assert!(missing.is_empty());
    }

    #[tokio::test]
    async fn missing_is_sorted_and_deduplicated() {
        let tmp = tempdir().expect("tempdir");
        let store = PolicyStore::new(&StatePaths::with_root(tmp.path()));
        store
            .allow("argocd", &perms(&["read:pods"]))
            .await
            .expect("allow");
        let missing = store
            .missing(
                "argocd",
                &perms(&["write:secrets", "network:api-server", "write:secrets", "read:pods"]),
            )
            .await
            .expect("missing");
        assert_eq!(missing, perms(&["network:api-server", "write:secrets"]));
    }

    #[tokio::test]
    async fn allow_is_idempotent() {
        let tmp = tempdir().expect("tempdir");
        let store = PolicyStore::new(&StatePaths::with_root(tmp.path()));
        store.allow("a", &perms(&["read:pods"])).await.expect("first");
        store.allow("a", &perms(&["read:pods"])).await.expect("second");
        let file = store.load().await.expect("load");
        assert_eq!(file.allowed["a"], perms(&["read:pods"]));
    }

    #[tokio::test]
    async fn revoke_specific_then_all() {
        let tmp = tempdir().expect("tempdir");
        let store = PolicyStore::new(&StatePaths::with_root(tmp.path()));
        store
            .allow("a", &perms(&["read:pods", "write:secrets"]))
            .await
            .expect("allow");
        store
            .revoke("a", &perms(&["write:secrets"]))
            .await
            .expect("revoke one");
        let file = store.load().await.expect("load");
        assert_eq!(file.allowed["a"], perms(&["read:pods"]));

        store.revoke("a", &[]).await.expect("revoke all");
        let file = store.load().await.expect("load");
        assert!(!file.allowed.contains_key("a"));
    }
}
