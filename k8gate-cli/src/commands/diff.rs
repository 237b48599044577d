//! `k8gate diff`: show unified diffs for what the next cycle would write.

use anyhow::{Context, Result};
use clap::Args;

use k8gate_core::Config;

/// Arguments for `k8gate diff`.
#[derive(Args, Debug)]
pub struct DiffArgs {
    /// Only list the paths that would change.
    #[arg(long)]
    pub name_only: bool,
}

impl DiffArgs {
    pub fn run(self, config: &Config) -> Result<()> {
        let diffs = k8gate_daemon::diff_blocking(config).context("diff failed")?;

        if diffs.is_empty() {
            println!("No differences.");
            return Ok(());
        }

        for diff in diffs {
            if self.name_only {
                println!("{}", diff.path.display());
                continue;
            }
            print!("{}", diff.unified_diff);
            if !diff.unified_diff.ends_with('\n') {
                println!();
            }
        }

        Ok(())
    }
}
