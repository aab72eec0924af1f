//! kpilot-core - the plugin trust pipeline behind the kpilot CLI.
//!
//! Everything that happens between "the operator typed a plugin name" and
//! "a child process ran" lives here: manifest validation, the organization
//! allowlist, permission consent, binary integrity verification, OS-level
//! sandbox construction, and the append-only audit log.

pub mod paths;
pub mod plugins;

pub use paths::StatePaths;
