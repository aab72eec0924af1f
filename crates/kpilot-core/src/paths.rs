//! Centralized state-directory configuration.
//!
//! All file locations derive from one `StatePaths` value that is built from
//! the environment exactly once at process entry and threaded into each
//! component at construction. Components never read environment variables
//! themselves, which keeps them unit-testable with an injected root.

use std::path::{Path, PathBuf};

/// Every plugin executable is named `kpilot-<name>`.
pub const PLUGIN_PREFIX: &str = "kpilot-";

/// Resolved locations of all kpilot state files.
#[derive(Debug, Clone)]
pub struct StatePaths {
    root: PathBuf,
    allowlist_override: Option<PathBuf>,
    audit_override: Option<PathBuf>,
    allow_path_plugins: bool,
}

impl StatePaths {
    /// Build from the environment. Call once in `main`.
    ///
    /// - `KPILOT_HOME_DIR` overrides the state root (default `~/.kpilot`).
    /// - `KPILOT_PLUGIN_ALLOWLIST` / `KPILOT_PLUGIN_AUDIT_LOG` relocate the
    ///   allowlist file and audit log (test and operability escape hatches).
    /// - `KPILOT_PLUGIN_ALLOW_PATH=1` permits running plugin binaries found
    ///   on `$PATH` outside the managed plugin directory.
    pub fn from_env() -> Self {
        let root = match env_path("KPILOT_HOME_DIR") {
            Some(custom) => custom,
            None => dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".kpilot"),
        };
        Self {
            root,
            allowlist_override: env_path("KPILOT_PLUGIN_ALLOWLIST"),
            audit_override: env_path("KPILOT_PLUGIN_AUDIT_LOG"),
            allow_path_plugins: std::env::var("KPILOT_PLUGIN_ALLOW_PATH")
                .map(|v| v.trim() == "1")
                .unwrap_or(false),
        }
    }

    /// Build from an explicit root with no overrides. Used by tests.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            allowlist_override: None,
            audit_override: None,
            allow_path_plugins: false,
        }
    }

    pub fn allow_path_plugins(mut self, allow: bool) -> Self {
        self.allow_path_plugins = allow;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Managed plugin directory (`<root>/plugins`).
    pub fn plugin_dir(&self) -> PathBuf {
        self.root.join("plugins")
    }

    /// Per-plugin approved-permission store.
    pub fn policy_file(&self) -> PathBuf {
        self.root.join("plugin-policy.json")
    }

    /// Install registry with recorded checksums.
    pub fn registry_file(&self) -> PathBuf {
        self.root.join("plugin-registry.json")
    }

    /// Organization allowlist.
    pub fn allowlist_file(&self) -> PathBuf {
        self.allowlist_override
            .clone()
            .unwrap_or_else(|| self.root.join("plugin-allowlist.json"))
    }

    /// Append-only plugin execution audit log.
    pub fn audit_log(&self) -> PathBuf {
        self.audit_override
            .clone()
            .unwrap_or_else(|| self.root.join("audit.jsonl"))
    }

    /// Whether plugin binaries outside the managed directory may run.
    pub fn path_plugins_allowed(&self) -> bool {
        self.allow_path_plugins
    }
}

fn env_path(key: &str) -> Option<PathBuf> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}
