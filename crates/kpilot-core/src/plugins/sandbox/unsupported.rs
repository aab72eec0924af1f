//! Fallback for platforms without an isolation mechanism.
//!
//! Advisory only: the profile is always unavailable and says so, the plugin
//! runs with full user privileges, and the orchestrator surfaces the
//! warning to the operator.

use std::path::Path;

use super::super::manifest::Manifest;
use super::{SandboxProfile, SandboxStrategy};

pub struct Unsupported {
    platform: &'static str,
}

impl Unsupported {
    pub fn new(platform: &'static str) -> Self {
        Self { platform }
    }
}

impl SandboxStrategy for Unsupported {
    fn build(&self, name: &str, _binary_path: &Path, _manifest: &Manifest) -> SandboxProfile {
        SandboxProfile::unavailable(
            self.platform,
            format!(
                "OS sandboxing is not supported on {}; plugin {:?} will run with full user privileges.\nOnly run plugins from trusted sources.",
                self.platform, name
            ),
        )
    }
}
