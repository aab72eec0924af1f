//! Install boundary.
//!
//! Fetching plugin bytes from a remote source is someone else's job; by the
//! time this module runs, the executable and manifest exist on local disk.
//! Installation copies them into the managed directory, re-validates the
//! manifest in place, and records a registry entry with the fresh binary
//! checksum so later runs can detect tampering.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::Utc;
use tokio::fs;

use crate::paths::{StatePaths, PLUGIN_PREFIX};

use super::allowlist::AllowlistStore;
use super::discover::resolve;
use super::error::PluginError;
use super::integrity::{file_sha256, Registry, RegistryEntry};
use super::manifest::{find_manifest_path, load_for_resolved, VALID_PLUGIN_NAME};

/// Best-effort plugin name extraction from an install source string, used
/// to consult the allowlist before any filesystem work. Unrecognized shapes
/// yield `None` and skip the early check; this is a fail-fast convenience,
/// not a security boundary. The authoritative check runs again once the
/// real name is known.
///
/// `github.com/org/kpilot-argocd` -> `argocd`
/// `/local/path/kpilot-backup`    -> `backup`
/// `argocd`                       -> `argocd`
pub fn extract_name_from_source(source: &str) -> Option<String> {
    if VALID_PLUGIN_NAME.is_match(source) {
        return Some(source.to_string());
    }
    if let Some(rest) = source.strip_prefix("github.com/") {
        let last = rest.trim_end_matches(".git").rsplit('/').next()?.trim();
        let name = last.strip_prefix(PLUGIN_PREFIX)?;
        return VALID_PLUGIN_NAME.is_match(name).then(|| name.to_string());
    }
    let base = Path::new(source).file_name()?.to_str()?;
    let name = base.strip_prefix(PLUGIN_PREFIX)?;
    VALID_PLUGIN_NAME.is_match(name).then(|| name.to_string())
}

/// Install a plugin whose executable and manifest are already on local
/// disk. `source` is either the executable itself or a directory holding a
/// `kpilot-*` executable with its manifest alongside.
pub async fn install_from_local(paths: &StatePaths, source: &str) -> Result<RegistryEntry> {
    let source = source.trim();
    if source.is_empty() {
        bail!("plugin source is required");
    }

    let allowlist = AllowlistStore::new(paths);
    if let Some(candidate) = extract_name_from_source(source) {
        allowlist.is_allowed(&candidate).await?;
    }

    let (name, exec_path, manifest_path) = locate_artifacts(source).await?;
    load_for_resolved(&name, &exec_path)
        .await
        .with_context(|| format!("validating manifest for plugin {name:?}"))?;
    // Authoritative check now that the real name is known.
    allowlist.is_allowed(&name).await?;

    let installed_bin = copy_artifacts(paths, &name, &exec_path, &manifest_path).await?;
    let sha256 = file_sha256(&installed_bin)
        .await
        .with_context(|| format!("computing checksum for {name:?}"))?;

    let entry = RegistryEntry {
        name: name.clone(),
        source: source.to_string(),
        source_type: "local".to_string(),
        installed_at: Utc::now(),
        sha256,
    };
    Registry::new(paths).record(entry.clone()).await?;
    Ok(entry)
}

/// Remove an installed plugin's artifacts and registry entry.
pub async fn remove_installed(paths: &StatePaths, name: &str) -> super::error::Result<()> {
    let name = name.trim();
    if name.is_empty() {
        return Err(PluginError::InvalidName(name.to_string()));
    }
    let bin = resolve(paths, name).await?;
    let manifest_path = find_manifest_path(&bin).ok();
    match fs::remove_file(&bin).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    if let Some(manifest_path) = manifest_path {
        let _ = fs::remove_file(manifest_path).await;
    }
    Registry::new(paths).remove(name).await
}

async fn locate_artifacts(source: &str) -> Result<(String, PathBuf, PathBuf)> {
    let abs = fs::canonicalize(source)
        .await
        .with_context(|| format!("plugin source {source:?} not found"))?;
    let meta = fs::metadata(&abs).await?;
    let exec_path = if meta.is_dir() {
        let mut entries = fs::read_dir(&abs).await?;
        let mut found = None;
        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name().to_string_lossy().to_string();
            if file_name.starts_with(PLUGIN_PREFIX)
                && !file_name.ends_with(".yaml")
                && !file_name.ends_with(".yml")
                && entry.metadata().await.map(|m| m.is_file()).unwrap_or(false)
            {
                found = Some(abs.join(file_name));
                break;
            }
        }
        found.with_context(|| {
            format!("no plugin executable found in {abs:?} (expected {PLUGIN_PREFIX}*)")
        })?
    } else {
        abs
    };

    let base = exec_path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let Some(name) = base.strip_prefix(PLUGIN_PREFIX) else {
        bail!("plugin executable name must start with {PLUGIN_PREFIX:?}");
    };
    if !VALID_PLUGIN_NAME.is_match(name) {
        bail!("invalid plugin name {name:?}");
    }
    let manifest_path = find_manifest_path(&exec_path)?;
    Ok((name.to_string(), exec_path, manifest_path))
}

async fn copy_artifacts(
    paths: &StatePaths,
    name: &str,
    exec_path: &Path,
    manifest_path: &Path,
) -> Result<PathBuf> {
    let dir = paths.plugin_dir();
    fs::create_dir_all(&dir).await?;
    let dst_bin = dir.join(format!("{PLUGIN_PREFIX}{name}"));
    let dst_manifest = dir.join(format!("{PLUGIN_PREFIX}{name}.yaml"));
    fs::copy(exec_path, &dst_bin).await?;
    fs::copy(manifest_path, &dst_manifest).await?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&dst_bin, std::fs::Permissions::from_mode(0o755)).await?;
        fs::set_permissions(&dst_manifest, std::fs::Permissions::from_mode(0o644)).await?;
    }
    load_for_resolved(name, &dst_bin)
        .await
        .context("validating installed manifest")?;
    Ok(dst_bin)
}
