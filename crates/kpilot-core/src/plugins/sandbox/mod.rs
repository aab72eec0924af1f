//! OS-level plugin sandboxing.
//!
//! Every plugin execution is wrapped in an isolation boundary generated
//! from the manifest's `permissions:` declarations. The policy model is the
//! same on every platform: reads open, writes restricted to scratch space
//! plus (conditionally) the kpilot state directory, network loopback-only
//! unless the manifest declares a `network:*` permission.
//!
//! Platform support:
//! - macOS: `sandbox-exec` with a generated Seatbelt profile.
//! - Linux: `unshare` namespace isolation, plus a read-only remount of the
//!   state directory for plugins without a filesystem-write permission.
//! - Everything else: advisory only; the plugin runs unsandboxed with an
//!   operator-visible warning.
//!
//! Strategies are selected once at startup from the host OS rather than at
//! compile time, so every builder compiles and is testable everywhere.

mod darwin;
mod linux;
mod unsupported;

use std::path::Path;

use tokio::process::Command;

use crate::paths::StatePaths;

use super::manifest::Manifest;

pub use darwin::DarwinSeatbelt;
pub use linux::LinuxNamespaces;
pub use unsupported::Unsupported;

/// The isolation policy computed for one invocation. Never persisted.
#[derive(Debug, Clone)]
pub struct SandboxProfile {
    /// Host platform label this profile was generated for.
    pub platform: &'static str,
    /// False when no isolation can be applied; the plugin still runs.
    pub available: bool,
    /// Human-readable policy (Seatbelt text on macOS, a summary on Linux).
    pub policy_text: String,
    /// Tokens prepended to the plugin invocation. Empty when unavailable.
    pub wrap_args: Vec<String>,
}

impl SandboxProfile {
    /// Label recorded in the audit log.
    pub fn label(&self) -> &str {
        if self.available {
            self.platform
        } else {
            "none"
        }
    }

    pub(crate) fn unavailable(platform: &'static str, policy_text: String) -> Self {
        Self {
            platform,
            available: false,
            policy_text,
            wrap_args: Vec::new(),
        }
    }
}

/// One platform's way of turning a manifest into an isolation boundary.
/// Builders perform no I/O beyond probing for their helper binary (and, on
/// Linux, materializing the read-only wrapper script).
pub trait SandboxStrategy: Send + Sync {
    fn build(&self, name: &str, binary_path: &Path, manifest: &Manifest) -> SandboxProfile;
}

/// Select the strategy for the host platform. Called once at startup.
pub fn platform_strategy(paths: &StatePaths) -> Box<dyn SandboxStrategy> {
    match std::env::consts::OS {
        "macos" => Box::new(DarwinSeatbelt::new(paths)),
        "linux" => Box::new(LinuxNamespaces::new(paths)),
        other => Box::new(Unsupported::new(other)),
    }
}

/// Wrap `bin args…` inside the profile's launch prefix. When the profile is
/// unavailable this is a plain command, so callers never branch.
pub fn sandboxed_command(bin: &Path, args: &[String], profile: &SandboxProfile) -> Command {
    if !profile.available || profile.wrap_args.is_empty() {
        let mut cmd = Command::new(bin);
        cmd.args(args);
        return cmd;
    }
    let bin_str = bin.to_string_lossy().to_string();
    let mut argv = profile.wrap_args.clone();
    // The Linux read-only wrapper already ends with the plugin path.
    if argv.last() != Some(&bin_str) {
        argv.push(bin_str);
    }
    let mut cmd = Command::new(&argv[0]);
    cmd.args(&argv[1..]);
    cmd.args(args);
    cmd
}

/// Whether any permission's action or resource starts with `prefix`.
/// `permissions_contain(perms, "network:")` is true for "network:api-server".
pub(crate) fn permissions_contain(perms: &[String], prefix: &str) -> bool {
    let prefix = prefix.to_lowercase();
    let bare = prefix.trim_end_matches(':');
    perms.iter().any(|p| {
        let p_lower = p.to_lowercase();
        if p_lower.starts_with(&prefix) {
            return true;
        }
        match p_lower.split_once(':') {
            Some((_, resource)) => resource.starts_with(bare),
            None => false,
        }
    })
}

/// Whether the plugin may write to the kpilot state directory. Plugins
/// with only read-oriented permissions must not be able to modify the host
/// tool's configuration, registry, or audit log.
pub(crate) fn permissions_allow_state_write(perms: &[String]) -> bool {
    permissions_contain(perms, "fs-write") || permissions_contain(perms, "fs:write")
}
