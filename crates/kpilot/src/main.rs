//! kpilot - Kubernetes operations CLI with sandboxed third-party plugins.
//!
//! Built-in subcommands manage the plugin trust pipeline; any other first
//! token falls through to the plugin runner, so `kpilot argocd sync` runs
//! the `argocd` plugin (or a manifest command alias) through the full
//! allowlist / consent / integrity / sandbox pipeline.

use anyhow::Result;
use clap::{Parser, Subcommand};
use kpilot_core::plugins::{PluginError, PluginRunner};
use kpilot_core::StatePaths;

mod commands;

const HOST_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "kpilot", version)]
#[command(about = "Kubernetes operations CLI with sandboxed plugins", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage and run plugins
    Plugin {
        #[command(subcommand)]
        command: commands::PluginCommands,
    },

    /// Anything else is tried as a plugin name or command alias
    #[command(external_subcommand)]
    External(Vec<String>),
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    // The environment is read exactly once here; every component receives
    // the resolved paths explicitly.
    let paths = StatePaths::from_env();
    let cli = Cli::parse();

    match cli.command {
        Commands::Plugin { command } => commands::dispatch(paths, command).await,
        Commands::External(args) => run_external(paths, args).await,
    }
}

async fn run_external(paths: StatePaths, args: Vec<String>) -> Result<()> {
    let runner = PluginRunner::new(paths, HOST_VERSION);
    match runner.try_run_for_args(&args, |_| false).await {
        Ok(Some(code)) => std::process::exit(code),
        Ok(None) => {
            let first = args.first().map(String::as_str).unwrap_or_default();
            eprintln!("kpilot: unknown command or plugin {first:?}");
            std::process::exit(1);
        }
        Err(e) => fail(e),
    }
}

/// Blocked runs exit non-zero with a single actionable message.
fn fail(e: PluginError) -> ! {
    eprintln!("kpilot: {e}");
    std::process::exit(1);
}
