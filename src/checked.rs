// SPDX-License-Identifier: Apache-2.0
//! An extension to `tokio::process::Command` for checked, possibly
//! ssh-wrapped, command execution.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::process::Command;

#[async_trait]
pub trait CheckedExt {
    /// Run the command to completion, returning an error if it didn't
    /// exit successfully.
    async fn checked_run(&mut self) -> Result<()>;

    /// Run the command, collecting all of its output, returning an error
    /// if it didn't exit successfully.
    async fn checked_output(&mut self) -> Result<std::process::Output>;
}

#[async_trait]
impl CheckedExt for Command {
    async fn checked_run(&mut self) -> Result<()> {
        let status = self.status().await?;
        if !status.success() {
            return Err(anyhow!("error running command: {:?} ({:?})", self.as_std(), status));
        }
        Ok(())
    }

    async fn checked_output(&mut self) -> Result<std::process::Output> {
        let out = self.output().await?;
        if !out.status.success() {
            return Err(anyhow!(
                "error running command: {:?} ({:?})\nstderr: {}",
                self.as_std(),
                out.status,
                String::from_utf8_lossy(&out.stderr)
            ));
        }
        Ok(out)
    }
}

/// Build a `Command` for `argv`, wrapped in `ssh <host>` when `host` is
/// `Some`. Mirrors the local-vs-remote dispatch the legacy scanner used
/// for every zfs invocation.
pub fn host_command(host: Option<&str>, argv: &[&str]) -> Command {
    match host {
        None => {
            let mut cmd = Command::new(argv[0]);
            cmd.args(&argv[1..]);
            cmd
        }
        Some(host) => {
            let mut cmd = Command::new("ssh");
            cmd.arg(host);
            cmd.args(argv);
            cmd
        }
    }
}
