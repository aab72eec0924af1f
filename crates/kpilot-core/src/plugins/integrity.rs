//! Install registry and binary integrity verification.
//!
//! The registry records each installed plugin's provenance, including the
//! SHA-256 of the binary at install time. Verification recomputes the live
//! digest before every run so a binary swapped or corrupted after install
//! is caught even when its permissions were already approved.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncReadExt;
use tracing::warn;

use crate::paths::StatePaths;

use super::error::{PluginError, Result};

/// One installed plugin's provenance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryEntry {
    pub name: String,
    pub source: String,
    pub source_type: String,
    pub installed_at: DateTime<Utc>,
    /// Hex SHA-256 of the binary recorded at install time. Empty for
    /// legacy installs that predate checksum recording.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sha256: String,
}

/// Persisted registry document (`plugin-registry.json`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryFile {
    #[serde(default)]
    pub plugins: BTreeMap<String, RegistryEntry>,
}

pub struct Registry {
    path: PathBuf,
}

impl Registry {
    pub fn new(paths: &StatePaths) -> Self {
        Self {
            path: paths.registry_file(),
        }
    }

    pub async fn load(&self) -> Result<RegistryFile> {
        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(RegistryFile::default())
            }
            Err(e) => return Err(e.into()),
        };
        if bytes.is_empty() {
            return Ok(RegistryFile::default());
        }
        serde_json::from_slice(&bytes).map_err(|e| PluginError::Parse {
            path: self.path.clone(),
            message: e.to_string(),
        })
    }

    pub async fn save(&self, file: &RegistryFile) -> Result<()> {
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

    pub async fn record(&self, entry: RegistryEntry) -> Result<()> {
        let mut file = self.load().await?;
        file.plugins.insert(entry.name.clone(), entry);
        self.save(&file).await
    }

    pub async fn remove(&self, name: &str) -> Result<()> {
        let mut file = self.load().await?;
        file.plugins.remove(name);
        self.save(&file).await
    }

    /// Verify the live binary against the digest recorded at install time.
    ///
    /// Plugins with no registry entry (manually placed) or no recorded
    /// digest (legacy install) pass silently; enforcing a hash that was
    /// never recorded would break existing installs. A recorded digest that
    /// does not match the live file is a hard failure naming both digests.
    pub async fn verify(&self, name: &str, binary_path: &Path) -> Result<()> {
        let file = match self.load().await {
            Ok(file) => file,
            Err(e) => {
                warn!(plugin = name, error = %e, "registry load failed; skipping integrity check");
                return Ok(());
            }
        };
        let Some(entry) = file.plugins.get(name) else {
            return Ok(());
        };
        if entry.sha256.trim().is_empty() {
            warn!(plugin = name, "no checksum recorded at install time; integrity not verified");
            return Ok(());
        }
        let actual = file_sha256(binary_path).await?;
        if actual != entry.sha256 {
            return Err(PluginError::ChecksumMismatch {
                name: name.to_string(),
                expected: entry.sha256.clone(),
                actual,
            });
        }
        Ok(())
    }
}

/// Streaming hex SHA-256 of the file at `path`.
pub async fn file_sha256(path: &Path) -> Result<String> {
    let mut file = fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn entry(name: &str, sha256: &str) -> RegistryEntry {
        RegistryEntry {
            name: name.to_string(),
            source: format!("github.com/org/kpilot-{name}"),
            source_type: "github".to_string(),
            installed_at: Utc::now(),
            sha256: sha256.to_string(),
        }
    }

    #[tokio::test]
    async fn sha256_matches_known_digest() {
        let tmp = tempdir().expect("tempdir");
        let path = tmp.path().join("blob");
        fs::write(&path, b"abc").await.expect("write");
        assert_eq!(
            file_sha256(&path).await.expect("digest"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[tokio::test]
    async fn verify_passes_without_registry_entry() {
        let tmp = tempdir().expect("tempdir");
        let registry = Registry::new(&StatePaths::with_root(tmp.path()));
        let bin = tmp.path().join("bin");
        fs::write(&bin, b"payload").await.expect("bin");
        registry.verify("ghost", &bin).await.expect("advisory pass");
    }

    #[tokio::test]
    async fn verify_passes_with_empty_recorded_digest() {
        let tmp = tempdir().expect("tempdir");
        let registry = Registry::new(&StatePaths::with_root(tmp.path()));
        registry.record(entry("legacy", "")).await.expect("record");
        let bin = tmp.path().join("bin");
        fs::write(&bin, b"payload").await.expect("bin");
        registry.verify("legacy", &bin).await.expect("legacy pass");
    }

    #[tokio::test]
    async fn verify_round_trip_and_mismatch_names_both_digests() {
        let tmp = tempdir().expect("tempdir");
        let registry = Registry::new(&StatePaths::with_root(tmp.path()));
        let bin = tmp.path().join("bin");
        fs::write(&bin, b"original").await.expect("bin");
        let recorded = file_sha256(&bin).await.expect("digest");
        registry
            .record(entry("demo", &recorded))
            .await
            .expect("record");

        registry.verify("demo", &bin).await.expect("match");

        fs::write(&bin, b"tampered").await.expect("tamper");
        let err = registry.verify("demo", &bin).await.expect_err("mismatch");
        match &err {
            PluginError::ChecksumMismatch { expected, actual, .. } => {
                assert_eq!(expected, &recorded);
                assert_ne!(actual, &recorded);
            }
            other => panic!("unexpected error: {other}"),
        }
        let msg = err.to_string();
        assert!(msg.contains(&recorded));
        assert!(msg.contains("checksum mismatch"));
    }
}
