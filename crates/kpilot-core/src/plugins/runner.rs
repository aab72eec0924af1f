//! Execution orchestrator.
//!
//! `run` sequences the pipeline stages strictly: resolve, allowlist check,
//! manifest load, permission consent, minimum-version check, integrity
//! verify, sandbox build, spawn, audit. Any fail-closed stage error stops
//! the run before a process is spawned; fail-open stages (allowlist load,
//! audit append, sandbox unavailability) warn and continue. The audit
//! record is written even when the spawn itself fails.

use std::path::PathBuf;
use std::time::Instant;

use tokio::process::Command;
use tracing::warn;

use crate::paths::StatePaths;

use super::allowlist::AllowlistStore;
use super::audit::{AuditEntry, AuditLog};
use super::discover::{discover, resolve};
use super::error::{PluginError, Result};
use super::integrity::Registry;
use super::manifest::{load_for_resolved, VALID_PLUGIN_NAME};
use super::policy::{ConsentPrompt, PolicyStore, TerminalPrompt};
use super::sandbox::{platform_strategy, sandboxed_command, SandboxProfile, SandboxStrategy};

/// Composes the trust pipeline into the single entry point all callers use.
pub struct PluginRunner {
    paths: StatePaths,
    host_version: String,
    consent: Box<dyn ConsentPrompt>,
    sandbox: Box<dyn SandboxStrategy>,
}

impl PluginRunner {
    /// Production wiring: terminal consent and the host platform's sandbox
    /// strategy, both fixed at startup.
    pub fn new(paths: StatePaths, host_version: &str) -> Self {
        let sandbox = platform_strategy(&paths);
        Self {
            paths,
            host_version: host_version.to_string(),
            consent: Box::new(TerminalPrompt),
            sandbox,
        }
    }

    pub fn with_consent(mut self, consent: Box<dyn ConsentPrompt>) -> Self {
        self.consent = consent;
        self
    }

    pub fn with_sandbox(mut self, sandbox: Box<dyn SandboxStrategy>) -> Self {
        self.sandbox = sandbox;
        self
    }

    /// Run a plugin by name or manifest command alias, returning the child
    /// process exit code.
    pub async fn run(&self, invocation: &str, args: &[String]) -> Result<i32> {
        let (name, bin) = self.resolve_for_invocation(invocation).await?;

        // Lock violations fail closed; load errors fail open inside
        // is_allowed so a corrupt allowlist file cannot brick every plugin.
        AllowlistStore::new(&self.paths).is_allowed(&name).await?;

        let manifest = load_for_resolved(&name, &bin).await?;
        self.ensure_permissions(&name, &manifest.permissions).await?;
        self.check_min_version(manifest.min_kpilot_version.as_deref())?;

        // Integrity runs after consent so an already-approved plugin is
        // still blocked if its bytes changed since install.
        Registry::new(&self.paths).verify(&name, &bin).await?;

        let profile = self.sandbox.build(&name, &bin, &manifest);
        if !profile.available {
            warn!(plugin = %name, platform = profile.platform, "running without OS sandbox");
            eprintln!(
                "warning: plugin {name:?} will run without OS-level sandboxing: {}",
                profile.policy_text.lines().next().unwrap_or_default()
            );
        }

        let mut cmd = sandboxed_command(&bin, args, &profile);
        cmd.stdin(std::process::Stdio::inherit())
            .stdout(std::process::Stdio::inherit())
            .stderr(std::process::Stdio::inherit());

        let start = Instant::now();
        let status = cmd.status().await;
        let exit_code = match &status {
            Ok(status) => status.code().unwrap_or(1),
            Err(_) => 1,
        };
        // Audited regardless of whether the spawn succeeded.
        AuditLog::new(&self.paths)
            .append(&AuditEntry::for_run(&name, args, exit_code, start, &profile))
            .await;

        status?;
        Ok(exit_code)
    }

    /// CLI fallthrough: try the first non-flag, non-builtin token as a
    /// plugin name or alias. Returns `None` when no plugin handled it.
    pub async fn try_run_for_args(
        &self,
        args: &[String],
        is_builtin: impl Fn(&str) -> bool,
    ) -> Result<Option<i32>> {
        let Some(first) = args.first().map(|a| a.trim()) else {
            return Ok(None);
        };
        if first.is_empty() || first.starts_with('-') || is_builtin(first) {
            return Ok(None);
        }
        match self.run(first, &args[1..]).await {
            Ok(code) => Ok(Some(code)),
            Err(PluginError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Resolve a plugin and return the profile that would be applied on
    /// execution, without running anything.
    pub async fn inspect_sandbox(&self, name: &str) -> Result<SandboxProfile> {
        let bin = resolve(&self.paths, name).await?;
        let manifest = load_for_resolved(name, &bin).await?;
        Ok(self.sandbox.build(name, &bin, &manifest))
    }

    async fn resolve_for_invocation(&self, invocation: &str) -> Result<(String, PathBuf)> {
        let invocation = invocation.trim();
        if invocation.is_empty() {
            return Err(PluginError::InvalidName(invocation.to_string()));
        }
        if VALID_PLUGIN_NAME.is_match(invocation) {
            if let Ok(bin) = resolve(&self.paths, invocation).await {
                return Ok((invocation.to_string(), bin));
            }
        }
        // Fall back to manifest command aliases across valid plugins.
        for info in discover(&self.paths).await? {
            let Some(manifest) = &info.manifest else {
                continue;
            };
            if invocation == info.name || manifest.commands.iter().any(|c| c == invocation) {
                let bin = resolve(&self.paths, &info.name).await?;
                return Ok((info.name, bin));
            }
        }
        Err(PluginError::NotFound(invocation.to_string()))
    }

    /// Consent algorithm: nothing missing proceeds; non-interactive fails
    /// closed with the pre-approval command; a declined or failed prompt
    /// aborts without persisting; approval persists before proceeding.
    async fn ensure_permissions(&self, name: &str, permissions: &[String]) -> Result<()> {
        let policy = PolicyStore::new(&self.paths);
        let missing = policy.missing(name, permissions).await?;
        if missing.is_empty() {
            return Ok(());
        }
        if !self.consent.is_interactive() {
            return Err(PluginError::PermissionDenied(format!(
                "plugin {name:?} requires unapproved permissions: {} (approve first with: kpilot plugin allow {name} ...)",
                missing.join(", ")
            )));
        }
        if !self.consent.ask(name, &missing) {
            return Err(PluginError::PermissionDenied(
                "plugin execution aborted".to_string(),
            ));
        }
        policy.allow(name, &missing).await
    }

    fn check_min_version(&self, required: Option<&str>) -> Result<()> {
        let Some(required) = required.map(str::trim).filter(|r| !r.is_empty()) else {
            return Ok(());
        };
        let current = self.host_version.trim();
        if current.is_empty() || !version_less(current, required) {
            return Ok(());
        }
        Err(PluginError::VersionTooOld {
            required: required.to_string(),
            current: current.to_string(),
        })
    }
}

/// True when `a < b`. Prefers strict semver; falls back to a lenient
/// major.minor.patch reading so `v1.2`-style manifests still compare.
fn version_less(a: &str, b: &str) -> bool {
    let parse = |s: &str| semver::Version::parse(s.trim().trim_start_matches('v')).ok();
    if let (Some(a), Some(b)) = (parse(a), parse(b)) {
        return a < b;
    }
    version_triple(a) < version_triple(b)
}

fn version_triple(s: &str) -> (u64, u64, u64) {
    let mut parts = s
        .trim()
        .trim_start_matches('v')
        .splitn(3, '.')
        .map(|p| p.trim().parse::<u64>().unwrap_or(0));
    (
        parts.next().unwrap_or(0),
        parts.next().unwrap_or(0),
        parts.next().unwrap_or(0),
    )
}
