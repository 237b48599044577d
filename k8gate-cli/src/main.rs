//! k8gate: SSH access to cluster workloads from code-hosting collaborators.
//!
//! # Usage
//!
//! ```text
//! k8gate run
//! k8gate sync [--dry-run]
//! k8gate diff
//! k8gate status [--json]
//! k8gate apps [--json]
//! k8gate users [--json]
//! k8gate connection-string <user>
//! k8gate stop
//! ```
//!
//! Configuration comes from `K8GATE_CONFIG` (YAML) and the environment.

mod commands;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use commands::{
    daemon::{ConnectionStringArgs, ListArgs, StatusArgs},
    diff::DiffArgs,
    sync::SyncArgs,
};
use k8gate_core::Config;

#[derive(Parser, Debug)]
#[command(
    name = "k8gate",
    version,
    about = "Synchronize SSH access to cluster workloads from repository collaborators",
    long_about = None,
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the change-detecting daemon in the foreground.
    Run,

    /// Run one synchronization cycle now.
    Sync(SyncArgs),

    /// Show unified diffs of what the next cycle would write.
    Diff(DiffArgs),

    /// Query the running daemon's scheduler status.
    Status(StatusArgs),

    /// List applications from the daemon's last snapshot.
    Apps(ListArgs),

    /// List authorized logins from the daemon's last snapshot.
    Users(ListArgs),

    /// Print the `kubectl` exec arguments for an SSH user or pod.
    ConnectionString(ConnectionStringArgs),

    /// Ask the running daemon to shut down.
    Stop,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load().context("failed to load configuration")?;
    match cli.command {
        Commands::Run => k8gate_daemon::start_blocking(config).context("daemon exited with error"),
        Commands::Sync(args) => args.run(&config),
        Commands::Diff(args) => args.run(&config),
        Commands::Status(args) => args.run(&config),
        Commands::Apps(args) => commands::daemon::apps(&config, args),
        Commands::Users(args) => commands::daemon::users(&config, args),
        Commands::ConnectionString(args) => args.run(&config),
        Commands::Stop => commands::daemon::stop(&config),
    }
}
