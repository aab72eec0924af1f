//! Plugin resolution and discovery.
//!
//! Plugins are executables named `kpilot-<name>` in the managed plugin
//! directory. Binaries found on `$PATH` are resolvable only when the
//! operator opted in, since a writable `$PATH` entry is a binary
//! substitution risk.

use std::path::{Path, PathBuf};

use tokio::fs;

use crate::paths::{StatePaths, PLUGIN_PREFIX};

use super::error::{PluginError, Result};
use super::manifest::{load_for_resolved, Manifest, VALID_PLUGIN_NAME};

/// One discovered plugin with its manifest status. A broken manifest shows
/// up as `validation_error` instead of hiding the plugin entirely, which
/// matters when listing many plugins at once.
#[derive(Debug)]
pub struct PluginInfo {
    pub name: String,
    pub path: PathBuf,
    pub manifest: Option<Manifest>,
    pub validation_error: Option<PluginError>,
}

/// Resolve a plugin name to its executable path, enforcing the name
/// grammar and binary placement rules.
pub async fn resolve(paths: &StatePaths, name: &str) -> Result<PathBuf> {
    let name = name.trim();
    if !VALID_PLUGIN_NAME.is_match(name) {
        return Err(PluginError::InvalidName(name.to_string()));
    }
    let candidate = paths.plugin_dir().join(format!("{PLUGIN_PREFIX}{name}"));
    match fs::metadata(&candidate).await {
        Ok(meta) => {
            if meta.is_dir() {
                return Err(PluginError::UnsafeBinary(format!(
                    "plugin {name:?} must be an executable file, not a directory"
                )));
            }
            if !is_executable(&meta) {
                return Err(PluginError::UnsafeBinary(format!(
                    "plugin {name:?} is not executable"
                )));
            }
            validate_placement(paths, &candidate).await?;
            return Ok(candidate);
        }
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e.into()),
        Err(_) => {}
    }

    if let Ok(from_path) = which::which(format!("{PLUGIN_PREFIX}{name}")) {
        let meta = fs::metadata(&from_path).await?;
        if !is_executable(&meta) {
            return Err(PluginError::UnsafeBinary(format!(
                "plugin {name:?} is not executable"
            )));
        }
        validate_placement(paths, &from_path).await?;
        return Ok(from_path);
    }
    Err(PluginError::NotFound(name.to_string()))
}

/// List every plugin in the managed directory, sorted by name.
pub async fn discover(paths: &StatePaths) -> Result<Vec<PluginInfo>> {
    let dir = paths.plugin_dir();
    let mut entries = match fs::read_dir(&dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut out = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let file_name = entry.file_name().to_string_lossy().to_string();
        let Some(name) = file_name.strip_prefix(PLUGIN_PREFIX) else {
            continue;
        };
        if name.is_empty() || file_name.ends_with(".yaml") || file_name.ends_with(".yml") {
            continue;
        }
        let Ok(meta) = entry.metadata().await else {
            continue;
        };
        if meta.is_dir() || !is_executable(&meta) {
            continue;
        }
        let path = dir.join(&file_name);
        let mut info = PluginInfo {
            name: name.to_string(),
            path,
            manifest: None,
            validation_error: None,
        };
        match load_for_resolved(&info.name, &info.path).await {
            Ok(manifest) => info.manifest = Some(manifest),
            Err(e) => info.validation_error = Some(e),
        }
        out.push(info);
    }
    out.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(out)
}

/// Placement rules for a resolved binary: no symlinks, not group/world
/// writable, and inside the managed directory unless PATH plugins were
/// explicitly allowed.
async fn validate_placement(paths: &StatePaths, binary_path: &Path) -> Result<()> {
    let meta = fs::symlink_metadata(binary_path).await?;
    if meta.file_type().is_symlink() {
        return Err(PluginError::UnsafeBinary(format!(
            "plugin binary {:?} must not be a symlink",
            binary_path.display()
        )));
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if meta.permissions().mode() & 0o022 != 0 {
            return Err(PluginError::UnsafeBinary(format!(
                "plugin binary {:?} must not be group/world-writable",
                binary_path.display()
            )));
        }
    }
    let plugin_dir = paths.plugin_dir();
    if binary_path.starts_with(&plugin_dir) {
        return Ok(());
    }
    if paths.path_plugins_allowed() {
        return Ok(());
    }
    Err(PluginError::UnsafeBinary(format!(
        "plugin binary {:?} is outside {:?} (set KPILOT_PLUGIN_ALLOW_PATH=1 to allow PATH plugins)",
        binary_path.display(),
        plugin_dir.display()
    )))
}

#[cfg(unix)]
fn is_executable(meta: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_meta: &std::fs::Metadata) -> bool {
    true
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::tempdir;

    async fn write_plugin(paths: &StatePaths, name: &str, mode: u32) -> PathBuf {
        let dir = paths.plugin_dir();
        fs::create_dir_all(&dir).await.expect("plugin dir");
        let bin = dir.join(format!("{PLUGIN_PREFIX}{name}"));
        fs::write(&bin, b"#!/bin/sh\nexit 0\n").await.expect("bin");
        fs::set_permissions(&bin, std::fs::Permissions::from_mode(mode))
            .await
            .expect("chmod");
        bin
    }

    #[tokio::test]
    async fn resolves_managed_plugin() {
        let tmp = tempdir().expect("tempdir");
        let paths = StatePaths::with_root(tmp.path());
        let bin = write_plugin(&paths, "demo", 0o755).await;
        assert_eq!(resolve(&paths, "demo").await.expect("resolve"), bin);
    }

    #[tokio::test]
    async fn rejects_invalid_name_before_touching_disk() {
        let paths = StatePaths::with_root("/nonexistent");
        let err = resolve(&paths, "Bad Name").await.expect_err("invalid");
        assert!(matches!(err, PluginError::InvalidName(_)));
    }

    #[tokio::test]
    async fn rejects_non_executable_binary() {
        let tmp = tempdir().expect("tempdir");
        let paths = StatePaths::with_root(tmp.path());
        write_plugin(&paths, "demo", 0o644).await;
        let err = resolve(&paths, "demo").await.expect_err("not executable");
        assert!(err.to_string().contains("not executable"));
    }

    #[tokio::test]
    async fn rejects_world_writable_binary() {
        let tmp = tempdir().expect("tempdir");
        let paths = StatePaths::with_root(tmp.path());
        write_plugin(&paths, "demo", 0o777).await;
        let err = resolve(&paths, "demo").await.expect_err("world writable");
        assert!(err.to_string().contains("group/world-writable"));
    }

    #[tokio::test]
    async fn binary_outside_managed_dir_needs_opt_in() {
        let tmp = tempdir().expect("tempdir");
        let outside = tempdir().expect("outside dir");
        let bin = outside.path().join("kpilot-demo");
        fs::write(&bin, b"#!/bin/sh\nexit 0\n").await.expect("bin");
        fs::set_permissions(&bin, std::fs::Permissions::from_mode(0o755))
            .await
            .expect("chmod");

        let paths = StatePaths::with_root(tmp.path());
        let err = validate_placement(&paths, &bin)
            .await
            .expect_err("outside managed dir");
        assert!(matches!(err, PluginError::UnsafeBinary(_)));
        assert!(err.to_string().contains("KPILOT_PLUGIN_ALLOW_PATH"));

        let opted_in = StatePaths::with_root(tmp.path()).allow_path_plugins(true);
        validate_placement(&opted_in, &bin)
            .await
            .expect("opt-in permits binaries outside the managed dir");
    }

    #[tokio::test]
    async fn missing_plugin_is_not_found() {
        let tmp = tempdir().expect("tempdir");
        let paths = StatePaths::with_root(tmp.path());
        let err = resolve(&paths, "ghost").await.expect_err("missing");
        assert!(matches!(err, PluginError::NotFound(_)));
    }

    #[tokio::test]
    async fn discovery_reports_broken_manifests_per_plugin() {
        let tmp = tempdir().expect("tempdir");
        let paths = StatePaths::with_root(tmp.path());
        let good = write_plugin(&paths, "good", 0o755).await;
        fs::write(
            good.with_file_name("kpilot-good.yaml"),
            "name: good\nversion: 1.0.0\n",
        )
        .await
        .expect("good manifest");
        let bad = write_plugin(&paths, "bad", 0o755).await;
        fs::write(bad.with_file_name("kpilot-bad.yaml"), "name: other\nversion: 1\n")
            .await
            .expect("bad manifest");

        let infos = discover(&paths).await.expect("discover");
        assert_eq!(infos.len(), 2);
        assert!(infos[0].name == "bad" && infos[0].validation_error.is_some());
        assert!(infos[1].name == "good" && infos[1].manifest.is_some());
    }
}
