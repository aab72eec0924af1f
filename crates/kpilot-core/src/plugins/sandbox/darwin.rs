//! macOS Seatbelt profile generation.
//!
//! The policy is passed inline to `sandbox-exec -p`, so nothing is written
//! to disk. Default-deny, then: reads allowed everywhere (plugins need
//! system interpreters, libraries, and kubeconfig), writes restricted to
//! scratch space plus conditionally the kpilot state directory, loopback
//! networking always, outbound networking only when declared.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use crate::paths::StatePaths;

use super::super::manifest::Manifest;
use super::{permissions_allow_state_write, permissions_contain, SandboxProfile, SandboxStrategy};

const PLATFORM: &str = "darwin";

pub struct DarwinSeatbelt {
    state_root: PathBuf,
}

impl DarwinSeatbelt {
    pub fn new(paths: &StatePaths) -> Self {
        Self {
            state_root: paths.root().to_path_buf(),
        }
    }
}

impl SandboxStrategy for DarwinSeatbelt {
    fn build(&self, _name: &str, _binary_path: &Path, manifest: &Manifest) -> SandboxProfile {
        if which::which("sandbox-exec").is_err() {
            return SandboxProfile::unavailable(
                PLATFORM,
                "sandbox-exec not found in PATH; OS sandboxing unavailable on this system".into(),
            );
        }
        let policy = seatbelt_policy(&self.state_root, &manifest.permissions);
        SandboxProfile {
            platform: PLATFORM,
            available: true,
            wrap_args: vec!["sandbox-exec".into(), "-p".into(), policy.clone()],
            policy_text: policy,
        }
    }
}

/// Generate the Seatbelt policy text for the given permission set.
pub(crate) fn seatbelt_policy(state_root: &Path, perms: &[String]) -> String {
    let allow_network = permissions_contain(perms, "network:");
    let mut sb = String::new();

    sb.push_str("(version 1)\n");
    sb.push_str("(deny default)\n\n");

    sb.push_str("; File reads: allowed everywhere\n");
    sb.push_str("(allow file-read*)\n\n");

    sb.push_str("; File writes: restricted to safe locations\n");
    sb.push_str("(allow file-write*\n");
    sb.push_str("  (subpath \"/tmp\")\n");
    sb.push_str("  (subpath \"/private/tmp\")\n");
    sb.push_str("  (subpath \"/var/folders\")\n");
    sb.push_str("  (subpath \"/private/var/folders\")\n");
    sb.push_str("  (literal \"/dev/null\")\n");
    sb.push_str("  (literal \"/dev/stdin\")\n");
    sb.push_str("  (literal \"/dev/stdout\")\n");
    sb.push_str("  (literal \"/dev/stderr\")\n");
    sb.push_str("  (literal \"/dev/tty\")\n");

    // The state directory is writable only for plugins that declared a
    // filesystem-write permission; read-only plugins must not be able to
    // touch kpilot's own config, registry, or audit log.
    if permissions_allow_state_write(perms) {
        let _ = writeln!(sb, "  (subpath {:?})", state_root.display().to_string());
        if let Ok(real) = state_root.canonicalize() {
            if real != state_root {
                let _ = writeln!(sb, "  (subpath {:?})", real.display().to_string());
            }
        }
    }

    let tmp = std::env::temp_dir();
    let tmp_str = tmp.display().to_string();
    if !tmp_str.is_empty()
        && tmp_str != "/tmp"
        && tmp_str != "/private/tmp"
        && !tmp_str.starts_with("/var/folders")
        && !tmp_str.starts_with("/private/var/folders")
    {
        let _ = writeln!(sb, "  (subpath {:?})", tmp_str.trim_end_matches('/'));
    }
    sb.push_str(")\n\n");

    sb.push_str("; Process management\n");
    sb.push_str("(allow process-exec (subpath \"/\"))\n");
    sb.push_str("(allow process-fork)\n");
    sb.push_str("(allow signal (target self))\n");
    sb.push_str("(allow sysctl-read)\n");
    sb.push_str("(allow mach-lookup)\n\n");

    sb.push_str("; Loopback networking, always permitted\n");
    sb.push_str("(allow network-outbound (local tcp))\n");
    sb.push_str("(allow network-inbound (local tcp))\n");
    sb.push_str("(allow network-bind (local tcp))\n\n");

    if allow_network {
        sb.push_str("; External network outbound (declared by plugin manifest)\n");
        sb.push_str("(allow network-outbound\n");
        sb.push_str("  (remote tcp \"*:80\")\n");
        sb.push_str("  (remote tcp \"*:443\")\n");
        sb.push_str("  (remote tcp \"*:6443\")\n");
        sb.push_str("  (remote tcp \"*:8443\"))\n");
    } else {
        sb.push_str("; External network outbound: DENIED\n");
        sb.push_str("; (plugin did not declare network:* permission)\n");
    }
    sb
}

#[cfg(test)]
mod tests {
    use super::*;

    fn perms(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn network_permission_opens_outbound_ports() {
        let policy = seatbelt_policy(Path::new("/home/u/.kpilot"), &perms(&["network:api-server"]));
        assert!(policy.contains("(allow network-outbound\n  (remote tcp \"*:80\")"));
        assert!(policy.contains("\"*:6443\""));
        assert!(!policy.contains("DENIED"));
    }

    #[test]
    fn no_network_permission_denies_outbound() {
        let policy = seatbelt_policy(Path::new("/home/u/.kpilot"), &perms(&["read:pods"]));
        assert!(policy.contains("; External network outbound: DENIED"));
        assert!(!policy.contains("remote tcp"));
        // Loopback stays open either way.
        assert!(policy.contains("(allow network-outbound (local tcp))"));
    }

    #[test]
    fn default_deny_with_open_reads() {
        let policy = seatbelt_policy(Path::new("/home/u/.kpilot"), &[]);
        assert!(policy.starts_with("(version 1)\n(deny default)"));
        assert!(policy.contains("(allow file-read*)"));
    }

    #[test]
    fn state_dir_writable_only_with_fs_write_permission() {
        let root = Path::new("/home/u/.kpilot");
        let readonly = seatbelt_policy(root, &perms(&["read:pods", "fs-read:kubeconfig"]));
        assert!(!readonly.contains(".kpilot"));

        let writable = seatbelt_policy(root, &perms(&["fs-write:kpilot"]));
        assert!(writable.contains("(subpath \"/home/u/.kpilot\")"));
    }

    #[test]
    fn scratch_and_stdio_always_writable() {
        let policy = seatbelt_policy(Path::new("/home/u/.kpilot"), &[]);
        assert!(policy.contains("(subpath \"/private/tmp\")"));
        assert!(policy.contains("(literal \"/dev/tty\")"));
    }
}
