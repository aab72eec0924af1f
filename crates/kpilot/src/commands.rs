//! Plugin management subcommands.

use anyhow::Result;
use clap::Subcommand;
use kpilot_core::plugins::{
    discover, file_sha256, install_from_local, remove_installed, resolve, AllowlistStore,
    AuditLog, PluginRunner, PolicyStore, Registry,
};
use kpilot_core::StatePaths;

use crate::HOST_VERSION;

#[derive(Subcommand)]
pub enum PluginCommands {
    /// Run a plugin through the full trust pipeline
    Run {
        name: String,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },

    /// List installed plugins and their manifest status
    List,

    /// Show a plugin's manifest and provenance
    Inspect { name: String },

    /// Install a plugin from a local executable or directory
    Install { source: String },

    /// Remove an installed plugin
    Remove { name: String },

    /// Pre-approve permissions for a plugin
    Allow {
        name: String,
        #[arg(required = true)]
        permissions: Vec<String>,
    },

    /// Revoke permissions (all of them when none are given)
    Revoke {
        name: String,
        permissions: Vec<String>,
    },

    /// Verify a plugin binary against its install-time checksum
    Verify { name: String },

    /// Show the sandbox profile that would apply on execution
    Sandbox { name: String },

    /// Manage the organization allowlist
    Allowlist {
        #[command(subcommand)]
        command: AllowlistCommands,
    },

    /// Print the plugin execution audit log
    Audit,
}

#[derive(Subcommand)]
pub enum AllowlistCommands {
    /// Print the allowlist and its lock state
    Show,
    /// Add plugin names
    Add {
        #[arg(required = true)]
        names: Vec<String>,
    },
    /// Remove plugin names
    Rm {
        #[arg(required = true)]
        names: Vec<String>,
    },
    /// Enforce the allowlist
    Lock,
    /// Stop enforcing the allowlist
    Unlock,
}

pub async fn dispatch(paths: StatePaths, command: PluginCommands) -> Result<()> {
    match command {
        PluginCommands::Run { name, args } => {
            let runner = PluginRunner::new(paths, HOST_VERSION);
            match runner.run(&name, &args).await {
                Ok(code) => std::process::exit(code),
                Err(e) => crate::fail(e),
            }
        }
        PluginCommands::List => {
            let infos = discover(&paths).await?;
            if infos.is_empty() {
                println!("no plugins installed");
                return Ok(());
            }
            for info in infos {
                match (&info.manifest, &info.validation_error) {
                    (Some(m), _) => {
                        let aliases = if m.commands.is_empty() {
                            String::new()
                        } else {
                            format!("  aliases: {}", m.commands.join(", "))
                        };
                        println!("{}  v{}{aliases}", info.name, m.version);
                    }
                    (None, Some(e)) => println!("{}  INVALID: {e}", info.name),
                    (None, None) => println!("{}", info.name),
                }
            }
            Ok(())
        }
        PluginCommands::Inspect { name } => {
            let bin = resolve(&paths, &name).await?;
            println!("name:    {name}");
            println!("binary:  {}", bin.display());
            match kpilot_core::plugins::load_for_resolved(&name, &bin).await {
                Ok(m) => {
                    println!("version: {}", m.version);
                    if let Some(min) = &m.min_kpilot_version {
                        println!("minimum host version: {min}");
                    }
                    if let Some(desc) = &m.description {
                        println!("description: {desc}");
                    }
                    if !m.commands.is_empty() {
                        println!("commands: {}", m.commands.join(", "));
                    }
                    if !m.permissions.is_empty() {
                        println!("permissions:");
                        for p in &m.permissions {
                            println!("  - {p}");
                        }
                    }
                }
                Err(e) => println!("manifest: INVALID: {e}"),
            }
            let registry = Registry::new(&paths).load().await?;
            if let Some(entry) = registry.plugins.get(&name) {
                println!("source:  {} ({})", entry.source, entry.source_type);
                println!("installed: {}", entry.installed_at.to_rfc3339());
                if !entry.sha256.is_empty() {
                    println!("sha256:  {}", entry.sha256);
                }
            }
            Ok(())
        }
        PluginCommands::Install { source } => {
            let entry = install_from_local(&paths, &source).await?;
            println!("installed plugin {:?} (sha256 {})", entry.name, entry.sha256);
            Ok(())
        }
        PluginCommands::Remove { name } => {
            remove_installed(&paths, &name).await?;
            println!("removed plugin {name:?}");
            Ok(())
        }
        PluginCommands::Allow { name, permissions } => {
            PolicyStore::new(&paths).allow(&name, &permissions).await?;
            println!("approved {} permission(s) for {name:?}", permissions.len());
            Ok(())
        }
        PluginCommands::Revoke { name, permissions } => {
            PolicyStore::new(&paths).revoke(&name, &permissions).await?;
            if permissions.is_empty() {
                println!("revoked all permissions for {name:?}");
            } else {
                println!("revoked {} permission(s) for {name:?}", permissions.len());
            }
            Ok(())
        }
        PluginCommands::Verify { name } => {
            let bin = resolve(&paths, &name).await?;
            Registry::new(&paths).verify(&name, &bin).await?;
            println!("plugin {name:?} verified (sha256 {})", file_sha256(&bin).await?);
            Ok(())
        }
        PluginCommands::Sandbox { name } => {
            let runner = PluginRunner::new(paths, HOST_VERSION);
            let profile = runner.inspect_sandbox(&name).await?;
            println!("platform:  {}", profile.platform);
            println!("available: {}", profile.available);
            println!("---");
            println!("{}", profile.policy_text);
            Ok(())
        }
        PluginCommands::Allowlist { command } => {
            let store = AllowlistStore::new(&paths);
            let file = match command {
                AllowlistCommands::Show => store.load().await?,
                AllowlistCommands::Add { names } => store.add(&names).await?,
                AllowlistCommands::Rm { names } => store.remove(&names).await?,
                AllowlistCommands::Lock => store.set_locked(true).await?,
                AllowlistCommands::Unlock => store.set_locked(false).await?,
            };
            println!("locked: {}", file.locked);
            for name in &file.plugins {
                println!("  {name}");
            }
            Ok(())
        }
        PluginCommands::Audit => {
            for entry in AuditLog::new(&paths).read_all().await? {
                println!("{}", serde_json::to_string(&entry)?);
            }
            Ok(())
        }
    }
}
