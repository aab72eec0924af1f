//! Plugin manifest model and validator.
//!
//! A manifest is a YAML file stored next to the plugin executable
//! (`kpilot-<name>.yaml` or `plugin.yaml`). It is parsed fresh on every
//! resolution and never cached across invocations.

use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::fs;

use super::error::{PluginError, Result};

/// Grammar shared by plugin names and command aliases.
pub static VALID_PLUGIN_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new("^[a-z0-9][a-z0-9-]*$").expect("static regex"));

/// A plugin's declared contract: identity, version floor, command aliases,
/// and the permissions it needs the operator to approve.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub name: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_kpilot_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub commands: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub permissions: Vec<String>,
}

impl Manifest {
    /// Validate in order and normalize in place. `plugin_name` is the name
    /// the plugin was resolved under; a manifest whose own name differs is
    /// rejected so a copied manifest cannot attach to the wrong binary.
    pub fn validate(&mut self, plugin_name: &str) -> Result<()> {
        self.name = self.name.trim().to_string();
        if self.name.is_empty() {
            return Err(PluginError::Validation("manifest.name is required".into()));
        }
        if !VALID_PLUGIN_NAME.is_match(&self.name) {
            return Err(PluginError::Validation(format!(
                "manifest.name {:?} is invalid",
                self.name
            )));
        }
        if self.name != plugin_name {
            return Err(PluginError::Validation(format!(
                "manifest.name {:?} does not match plugin name {:?}",
                self.name, plugin_name
            )));
        }
        self.version = self.version.trim().to_string();
        if self.version.is_empty() {
            return Err(PluginError::Validation(
                "manifest.version is required".into(),
            ));
        }
        self.permissions = dedupe(&self.permissions);
        for p in &self.permissions {
            validate_permission(p)?;
        }
        self.commands = dedupe(&self.commands);
        for c in &self.commands {
            if !VALID_PLUGIN_NAME.is_match(c) {
                return Err(PluginError::Validation(format!(
                    "invalid manifest.commands entry {:?}",
                    c
                )));
            }
        }
        Ok(())
    }
}

/// Trim, drop empties, and deduplicate while preserving first-seen order.
pub(crate) fn dedupe(values: &[String]) -> Vec<String> {
    let mut out = Vec::with_capacity(values.len());
    for v in values {
        let v = v.trim();
        if v.is_empty() || out.iter().any(|seen| seen == v) {
            continue;
        }
        out.push(v.to_string());
    }
    out
}

fn validate_permission(p: &str) -> Result<()> {
    let mut parts = p.splitn(2, ':');
    let action = parts.next().unwrap_or_default().trim();
    let resource = parts.next().unwrap_or_default().trim();
    if action.is_empty() || resource.is_empty() {
        return Err(PluginError::Validation(format!(
            "invalid permission {:?}: expected format <action>:<resource>",
            p
        )));
    }
    Ok(())
}

/// Locate the manifest for a resolved binary: `<binary>.yaml` first, then
/// `plugin.yaml` in the same directory.
pub(crate) fn find_manifest_path(binary_path: &Path) -> Result<PathBuf> {
    let dir = binary_path.parent().unwrap_or_else(|| Path::new("."));
    let base = binary_path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let candidates = [dir.join(format!("{base}.yaml")), dir.join("plugin.yaml")];
    for candidate in &candidates {
        if candidate.is_file() {
            return Ok(candidate.clone());
        }
    }
    Err(PluginError::Validation(format!(
        "manifest not found (expected plugin.yaml or {base}.yaml near executable)"
    )))
}

/// Load and validate the manifest for a plugin that has already been
/// resolved to `binary_path`. A manifest that fails validation is a typed
/// error, never "absent": callers must be able to tell a missing plugin
/// apart from a present-but-misconfigured one.
pub async fn load_for_resolved(plugin_name: &str, binary_path: &Path) -> Result<Manifest> {
    let manifest_path = find_manifest_path(binary_path)?;
    let bytes = fs::read(&manifest_path).await?;
    let mut manifest: Manifest =
        serde_yaml::from_slice(&bytes).map_err(|e| PluginError::Parse {
            path: manifest_path.clone(),
            message: format!("invalid manifest format: {e}"),
        })?;
    manifest.validate(plugin_name)?;
    Ok(manifest)
}
