//! Linux namespace isolation via unshare(1).
//!
//! user/pid/mount/ipc/uts namespaces always; the network namespace is added
//! exactly when the plugin declares no `network:*` permission, which leaves
//! it loopback-only. unshare offers no read-only-subtree flag, so plugins
//! without a filesystem-write permission are exec'd through a small wrapper
//! script that bind-remounts the state directory read-only inside the new
//! mount namespace first.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use crate::paths::StatePaths;

use super::super::manifest::Manifest;
use super::{permissions_allow_state_write, permissions_contain, SandboxProfile, SandboxStrategy};

const PLATFORM: &str = "linux";

const RO_WRAPPER_SCRIPT: &str = r#"#!/bin/sh
# Remount the kpilot state directory read-only before exec'ing the plugin.
STATE_DIR="$1"
PLUGIN="$2"
shift 2
if [ -n "$STATE_DIR" ] && [ -d "$STATE_DIR" ]; then
  mount --bind "$STATE_DIR" "$STATE_DIR" 2>/dev/null && mount -o remount,ro "$STATE_DIR" 2>/dev/null
fi
exec "$PLUGIN" "$@"
"#;

pub struct LinuxNamespaces {
    state_root: PathBuf,
}

impl LinuxNamespaces {
    pub fn new(paths: &StatePaths) -> Self {
        Self {
            state_root: paths.root().to_path_buf(),
        }
    }
}

impl SandboxStrategy for LinuxNamespaces {
    fn build(&self, _name: &str, binary_path: &Path, manifest: &Manifest) -> SandboxProfile {
        let Ok(unshare_path) = which::which("unshare") else {
            return SandboxProfile::unavailable(
                PLATFORM,
                "unshare(1) not found in PATH; OS sandboxing unavailable.\nInstall util-linux to enable plugin sandboxing.".into(),
            );
        };

        let perms = &manifest.permissions;
        let allow_write = permissions_allow_state_write(perms);
        let flags = namespace_flags(perms);
        let policy_text = policy_summary(&unshare_path, &flags, perms);

        let mut wrap_args: Vec<String> = Vec::with_capacity(flags.len() + 5);
        wrap_args.push(unshare_path.to_string_lossy().to_string());
        wrap_args.extend(flags.iter().map(|f| f.to_string()));
        wrap_args.push("--".into());

        if !allow_write {
            match ensure_ro_wrapper(&self.state_root) {
                Ok(wrapper_path) => {
                    wrap_args.push(wrapper_path.to_string_lossy().to_string());
                    wrap_args.push(self.state_root.to_string_lossy().to_string());
                    wrap_args.push(binary_path.to_string_lossy().to_string());
                }
                Err(e) => {
                    // No wrapper means the namespaces still apply but the
                    // state directory stays writable.
                    wrap_args.push(binary_path.to_string_lossy().to_string());
                    return SandboxProfile {
                        platform: PLATFORM,
                        available: true,
                        policy_text: format!(
                            "{policy_text}\nWARNING: could not create read-only wrapper: {e}\n"
                        ),
                        wrap_args,
                    };
                }
            }
        } else {
            wrap_args.push(binary_path.to_string_lossy().to_string());
        }

        SandboxProfile {
            platform: PLATFORM,
            available: true,
            policy_text,
            wrap_args,
        }
    }
}

/// unshare flags for the given permission set.
pub(crate) fn namespace_flags(perms: &[String]) -> Vec<&'static str> {
    let mut flags = vec![
        "--user",
        "--map-root-user",
        "--pid",
        "--fork",
        "--mount-proc",
        "--ipc",
        "--uts",
    ];
    if !permissions_contain(perms, "network:") {
        flags.push("--net");
    }
    flags
}

fn policy_summary(unshare_path: &Path, flags: &[&str], perms: &[String]) -> String {
    let net_isolated = flags.contains(&"--net");
    let mut sb = String::new();
    let _ = writeln!(sb, "Platform:    {PLATFORM}");
    let _ = writeln!(sb, "Wrapper:     {}", unshare_path.display());
    let _ = writeln!(sb, "Flags:       {}\n", flags.join(" "));
    sb.push_str("Isolation:\n");
    sb.push_str("  user        - plugin runs as a mapped unprivileged user\n");
    sb.push_str("  pid         - private PID namespace, host processes invisible\n");
    sb.push_str("  mount       - private mount namespace\n");
    sb.push_str("  ipc         - host IPC primitives unreachable\n");
    sb.push_str("  uts         - hostname cannot be changed\n");
    if net_isolated {
        sb.push_str("  net         - no external network (loopback only)\n");
        sb.push_str("                Declare `network:<endpoint>` in the plugin manifest to grant access.\n");
    } else {
        sb.push_str("  net         - full network access (declared by plugin manifest)\n");
    }
    if !permissions_allow_state_write(perms) {
        sb.push_str("  state dir   - read-only (plugin did not declare fs-write)\n");
    }
    sb
}

/// Write the read-only wrapper script under the state root and return its
/// path. The content is fixed, so rewriting on every build is harmless.
fn ensure_ro_wrapper(state_root: &Path) -> std::io::Result<PathBuf> {
    std::fs::create_dir_all(state_root)?;
    let wrapper_path = state_root.join("plugin-ro-wrapper.sh");
    std::fs::write(&wrapper_path, RO_WRAPPER_SCRIPT)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&wrapper_path, std::fs::Permissions::from_mode(0o755))?;
    }
    Ok(wrapper_path)
}
