use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, PluginError>;

/// Error kinds surfaced by the plugin trust pipeline.
///
/// Fail-closed stages (allowlist lock violations, manifest validation,
/// consent denial, version floor, checksum mismatch) map to dedicated
/// variants so callers can tell them apart; fail-open stages never surface
/// here at all, they are logged and bypassed.
#[derive(Debug, Error)]
pub enum PluginError {
    #[error("plugin {0:?} not found")]
    NotFound(String),

    #[error("invalid plugin name {0:?}: allowed pattern is [a-z0-9-]")]
    InvalidName(String),

    #[error("{0}")]
    Validation(String),

    /// Binary exists but its placement or mode makes it unsafe to run.
    #[error("{0}")]
    UnsafeBinary(String),

    #[error(
        "plugin {0:?} is not in the organization allowlist\n  add it with: kpilot plugin allowlist add {0}"
    )]
    NotAllowed(String),

    #[error("{0}")]
    PermissionDenied(String),

    #[error("plugin requires kpilot >= {required} (current: {current})")]
    VersionTooOld { required: String, current: String },

    #[error(
        "plugin {name}: binary checksum mismatch; the binary changed since install, re-install it or run 'kpilot plugin verify'\n  expected: {expected}\n  actual:   {actual}"
    )]
    ChecksumMismatch {
        name: String,
        expected: String,
        actual: String,
    },

    #[error("failed to parse {}: {message}", path.display())]
    Parse { path: PathBuf, message: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
