//! Append-only plugin execution audit log.
//!
//! Every invocation appends one compact JSON line to `audit.jsonl`. Writes
//! go through an append-mode handle: a record is well under the POSIX
//! atomic-append threshold, so concurrent appenders from independent runs
//! cannot interleave or truncate each other. The log is never mutated or
//! deleted by this system.

use std::path::PathBuf;
use std::time::Instant;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::warn;

use crate::paths::StatePaths;

use super::error::Result;
use super::sandbox::SandboxProfile;

/// One immutable record per plugin invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// RFC3339 UTC completion timestamp.
    pub ts: String,
    /// Record type discriminator, always "plugin" for now.
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
    pub args: Vec<String>,
    #[serde(rename = "exit")]
    pub exit_code: i32,
    pub duration_ms: i64,
    /// Sandbox platform applied, or "none" when isolation was unavailable.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sandbox: String,
}

impl AuditEntry {
    /// Build the record for a completed (or failed-to-spawn) invocation.
    pub fn for_run(
        name: &str,
        args: &[String],
        exit_code: i32,
        start: Instant,
        profile: &SandboxProfile,
    ) -> Self {
        Self {
            ts: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            kind: "plugin".to_string(),
            name: name.to_string(),
            args: args.to_vec(),
            exit_code,
            duration_ms: start.elapsed().as_millis() as i64,
            sandbox: profile.label().to_string(),
        }
    }
}

pub struct AuditLog {
    path: PathBuf,
}

impl AuditLog {
    pub fn new(paths: &StatePaths) -> Self {
        Self {
            path: paths.audit_log(),
        }
    }

    /// Append one entry. Failures are logged and swallowed: a full disk or
    /// unwritable audit file is a lesser harm than blocking every plugin.
    pub async fn append(&self, entry: &AuditEntry) {
        if let Err(e) = self.try_append(entry).await {
            warn!(path = %self.path.display(), error = %e, "audit append failed");
        }
    }

    async fn try_append(&self, entry: &AuditEntry) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut line = serde_json::to_vec(entry).map_err(std::io::Error::other)?;
        line.push(b'\n');
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&line).await?;
        Ok(())
    }

    /// Read every parseable entry. An absent file is an empty log; lines
    /// that fail to parse are skipped so a corrupted log stays mostly
    /// readable instead of becoming entirely unusable.
    pub async fn read_all(&self) -> Result<Vec<AuditEntry>> {
        let data = match fs::read(&self.path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut entries = Vec::new();
        for line in data.split(|&b| b == b'\n') {
            if line.is_empty() {
                continue;
            }
            if let Ok(entry) = serde_json::from_slice::<AuditEntry>(line) {
                entries.push(entry);
            }
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn profile(available: bool) -> SandboxProfile {
        SandboxProfile {
            platform: "linux",
            available,
            policy_text: String::new(),
            wrap_args: Vec::new(),
        }
    }

    #[tokio::test]
    async fn absent_log_reads_empty() {
        let tmp = tempdir().expect("tempdir");
        let log = AuditLog::new(&StatePaths::with_root(tmp.path()));
        assert!(log.read_all().await.expect("read").is_empty());
    }

    #[tokio::test]
    async fn appends_in_order_and_skips_corrupt_lines() {
        let tmp = tempdir().expect("tempdir");
        let paths = StatePaths::with_root(tmp.path());
        let log = AuditLog::new(&paths);
        let start = Instant::now();

        log.append(&AuditEntry::for_run("argocd", &["sync".into()], 0, start, &profile(true)))
            .await;
        log.append(&AuditEntry::for_run("argocd", &[], 1, start, &profile(true)))
            .await;

        // Corrupt the log between valid entries and append a third.
        let mut raw = fs::read(paths.audit_log()).await.expect("raw");
        raw.extend_from_slice(b"{\"ts\": not-json\n");
        fs::write(paths.audit_log(), raw).await.expect("corrupt");
        log.append(&AuditEntry::for_run("backup", &[], 0, start, &profile(false)))
            .await;

        let entries = log.read_all().await.expect("read");
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].name, "argocd");
        assert_eq!(entries[0].args, vec!["sync".to_string()]);
        assert_eq!(entries[1].exit_code, 1);
        assert_eq!(entries[2].name, "backup");
    }

    #[tokio::test]
    async fn sandbox_label_is_none_when_unavailable() {
        let start = Instant::now();
        let entry = AuditEntry::for_run("demo", &[], 0, start, &profile(false));
        assert_eq!(entry.sandbox, "none");
        let entry = AuditEntry::for_run("demo", &[], 0, start, &profile(true));
        assert_eq!(entry.sandbox, "linux");
    }

    #[tokio::test]
    async fn entries_are_single_compact_json_lines() {
        let tmp = tempdir().expect("tempdir");
        let paths = StatePaths::with_root(tmp.path());
        let log = AuditLog::new(&paths);
        log.append(&AuditEntry::for_run("demo", &[], 0, Instant::now(), &profile(true)))
            .await;
        let raw = fs::read_to_string(paths.audit_log()).await.expect("raw");
        assert_eq!(raw.lines().count(), 1);
        let parsed: serde_json::Value = serde_json::from_str(raw.trim()).expect("json line");
        assert_eq!(parsed["type"], "plugin");
        assert!(parsed["ts"].as_str().expect("ts").ends_with('Z'));
    }
}
