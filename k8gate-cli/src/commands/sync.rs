//! `k8gate sync`: one cycle outside the daemon.

use anyhow::{Context, Result};
use clap::Args;

use k8gate_core::Config;
use k8gate_sync::{SnapshotPersistence, SyncOutcome, WriteResult};

/// Arguments for `k8gate sync`.
#[derive(Args, Debug)]
pub struct SyncArgs {
    /// Show what would be written without writing or persisting anything.
    #[arg(long)]
    pub dry_run: bool,
}

impl SyncArgs {
    pub fn run(self, config: &Config) -> Result<()> {
        let outcome =
            k8gate_daemon::sync_once_blocking(config, self.dry_run).context("sync failed")?;
        print_outcome(&outcome, self.dry_run);
        Ok(())
    }
}

fn print_outcome(outcome: &SyncOutcome, dry_run: bool) {
    let prefix = if dry_run { "[dry-run] " } else { "" };
    println!(
        "{prefix}✓ {} applications, {} users ({} written, {} unchanged, {} kept, {} failed)",
        outcome.snapshot.applications.len(),
        outcome.snapshot.users.len(),
        outcome.written(),
        outcome.unchanged(),
        outcome.kept_previous(),
        outcome.failed(),
    );

    for w in &outcome.writes {
        match w {
            WriteResult::Written { path } => println!("  ✎  {}", path.display()),
            WriteResult::WouldWrite { path } => println!("  ~  {}", path.display()),
            WriteResult::Unchanged { path } => println!("  ·  {}", path.display()),
            WriteResult::KeptPrevious { path } => {
                println!("  !  {} (no keys, previous kept)", path.display())
            }
            WriteResult::Failed { path, reason } => {
                eprintln!("  ✗  {}: {reason}", path.display())
            }
        }
    }

    match &outcome.persistence {
        SnapshotPersistence::Primary | SnapshotPersistence::Skipped => {}
        SnapshotPersistence::Fallback { path } => {
            println!("snapshot saved to fallback {}", path.display())
        }
        SnapshotPersistence::Failed { reason } => {
            eprintln!("warning: snapshot not persisted: {reason}")
        }
    }
}
