// SPDX-License-Identifier: Apache-2.0
//! Backup driver CLI.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use zsnaptool::ConfigFile;

#[derive(Parser)]
#[command(name = "zsnaptool", about = "ZFS-style incremental backup/restore planner")]
struct Cli {
    /// Path to the YAML config file.
    #[arg(short, long, default_value = "zsnaptool.yaml")]
    config: String,

    /// Log what would happen without touching any pool or target.
    #[arg(long)]
    pretend: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Snapshot every due dataset and push new snapshots to all targets.
    Backup,
    /// Push whatever history is missing from each target, without
    /// creating new snapshots.
    Repair,
    /// Pull missing history back from the targets into the local pool.
    Restore {
        /// Prefix the restored datasets are created under, so the
        /// originals are never overwritten in place. Must end in `/` to
        /// land as a sibling dataset rather than a mangled name.
        #[arg(long, default_value = "restored/")]
        restore_prefix: String,

        /// Delete locally conflicting snapshots before restoring.
        #[arg(long)]
        force: bool,
    },
    /// Recompute every target's checksum and report any mismatch.
    Verify,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();
    let config = ConfigFile::load(&cli.config).with_context(|| format!("loading config from {}", cli.config))?;
    let orchestrator = config.build_orchestrator()?;

    match cli.command {
        Command::Backup => orchestrator.backup(cli.pretend).await?,
        Command::Repair => orchestrator.repair(cli.pretend).await?,
        Command::Restore { restore_prefix, force } => orchestrator.restore(&restore_prefix, force, cli.pretend).await?,
        Command::Verify => {
            let mismatches = orchestrator.verify().await?;
            if mismatches.is_empty() {
                println!("all targets verified clean");
            } else {
                for mismatch in &mismatches {
                    println!("{}", mismatch);
                }
                anyhow::bail!("{} mismatch(es) found", mismatches.len());
            }
        }
    }

    Ok(())
}
