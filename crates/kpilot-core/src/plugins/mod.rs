//! Plugin trust pipeline.
//!
//! Each submodule is one stage of the pipeline; `runner` composes them into
//! the single `run` entry point that every caller goes through.

mod allowlist;
mod audit;
mod discover;
mod error;
mod install;
mod integrity;
mod manifest;
mod policy;
mod runner;
pub mod sandbox;

pub use allowlist::{AllowlistFile, AllowlistStore};
pub use audit::{AuditEntry, AuditLog};
pub use discover::{discover, resolve, PluginInfo};
pub use error::{PluginError, Result};
pub use install::{extract_name_from_source, install_from_local, remove_installed};
pub use integrity::{file_sha256, Registry, RegistryEntry, RegistryFile};
pub use manifest::{load_for_resolved, Manifest, VALID_PLUGIN_NAME};
pub use policy::{ConsentPrompt, PolicyFile, PolicyStore, TerminalPrompt};
pub use runner::PluginRunner;
pub use sandbox::{platform_strategy, SandboxProfile, SandboxStrategy};
