// SPDX-License-Identifier: Apache-2.0
//! `VolumeManager`: the boundary between the planner and an actual ZFS
//! pool, local or over ssh. `SshZfsVolumeManager` is the only production
//! implementation; tests substitute an in-memory fake.

use std::pin::Pin;
use std::process::Stdio;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use log::{debug, info};
use tokio::io::AsyncRead;
use tokio::process::Command;

use crate::checked::{host_command, CheckedExt};
use crate::core::{Dataset, PoolList, Snapshot};

static ZFS: &str = "/sbin/zfs";

/// An owned, pollable byte stream: a `zfs send` pipe on the way out, or
/// the input side of a `zfs receive` pipe on the way in.
pub type ByteStream = Pin<Box<dyn AsyncRead + Send + Unpin>>;

/// The operations the planner's orchestration layer needs from a live
/// ZFS pool. One implementation wraps real `zfs`/`ssh` invocations;
/// tests provide an in-memory fake so the orchestrator can be exercised
/// without root or a real pool.
#[async_trait]
pub trait VolumeManager: Send + Sync {
    /// Enumerate every pool, dataset, and snapshot this manager can see,
    /// with `creation_time` populated on every snapshot.
    async fn scan(&self) -> Result<PoolList>;

    /// Whether `dataset_zfs_path` (`pool/dataset`, no `@`) currently
    /// exists.
    async fn has_dataset(&self, dataset_zfs_path: &str) -> Result<bool>;

    /// `zfs snapshot -r {dataset}@{snapshot_name}`.
    async fn create_snapshot(&self, dataset_zfs_path: &str, snapshot_name: &str) -> Result<()>;

    /// `zfs destroy {snapshot_zfs_path}`.
    async fn delete_snapshot(&self, snapshot_zfs_path: &str) -> Result<()>;

    /// Estimate, in bytes, the size of the stream `send_snapshot` would
    /// produce for the same arguments (`zfs send -nP`).
    async fn estimate_send_size(&self, snapshot_zfs_path: &str, base_zfs_path: Option<&str>) -> Result<u64>;

    /// Begin streaming `snapshot_zfs_path`, incremental from
    /// `base_zfs_path` when given, full otherwise.
    async fn send_snapshot(&self, snapshot_zfs_path: &str, base_zfs_path: Option<&str>) -> Result<ByteStream>;

    /// Receive `stream` into `dataset_zfs_path` (`zfs receive -F`).
    async fn recv_snapshot(&self, dataset_zfs_path: &str, stream: ByteStream) -> Result<()>;
}

/// Talks to a single ZFS host: `None` for the local machine, `Some(host)`
/// to wrap every invocation in `ssh host`. Mirrors the dispatch the
/// original scanner used (`Zfs::new`'s `host: Option<String>`).
#[derive(Debug, Clone)]
pub struct SshZfsVolumeManager {
    host: Option<String>,
}

impl SshZfsVolumeManager {
    pub fn new(host: Option<String>) -> SshZfsVolumeManager {
        SshZfsVolumeManager { host }
    }

    pub fn local() -> SshZfsVolumeManager {
        SshZfsVolumeManager { host: None }
    }

    fn command(&self, args: &[&str]) -> Command {
        let mut argv = vec![ZFS];
        argv.extend_from_slice(args);
        host_command(self.host.as_deref(), &argv)
    }
}

#[async_trait]
impl VolumeManager for SshZfsVolumeManager {
    async fn scan(&self) -> Result<PoolList> {
        debug!("scanning zfs pools on {:?}", self.host);
        let out = self
            .command(&["list", "-Hp", "-t", "all", "-o", "name,creation"])
            .stderr(Stdio::inherit())
            .checked_output()
            .await
            .context("zfs list failed")?;

        use std::io::BufRead;
        let mut pools = PoolList::new();
        for line in std::io::BufReader::new(&out.stdout[..]).lines() {
            let line = line?;
            let mut fields = line.splitn(2, '\t');
            let name = fields.next().ok_or_else(|| anyhow!("empty zfs list line"))?;
            let creation = fields.next().ok_or_else(|| anyhow!("zfs list line missing creation: {:?}", line))?;

            if let Some((dataset_path, snapshot_name)) = name.split_once('@') {
                let (pool_name, dataset_name) = split_dataset_path(dataset_path)?;
                let epoch: i64 = creation.parse().map_err(|_| anyhow!("bad creation time: {:?}", creation))?;
                let creation_time = Utc.timestamp_opt(epoch, 0).single().ok_or_else(|| anyhow!("bad creation epoch: {}", epoch))?;
                let snapshot = Snapshot::new(&pool_name, &dataset_name, snapshot_name).with_creation_time(creation_time);
                pools.add_dataset({
                    let mut dataset = Dataset::new(&pool_name, &dataset_name);
                    dataset.add_snapshot(snapshot)?;
                    dataset
                })?;
            } else if !name.contains('#') {
                // A bare pool or dataset with no snapshots yet: register
                // it so empty datasets are still visible to the planner.
                let (pool_name, dataset_name) = split_dataset_path(name)?;
                if pools.get_dataset_by_path(name).is_err() {
                    pools.add_dataset(Dataset::new(&pool_name, &dataset_name))?;
                }
            }
        }
        Ok(pools)
    }

    async fn has_dataset(&self, dataset_zfs_path: &str) -> Result<bool> {
        let status = self
            .command(&["list", "-H", dataset_zfs_path])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await?;
        Ok(status.success())
    }

    async fn create_snapshot(&self, dataset_zfs_path: &str, snapshot_name: &str) -> Result<()> {
        let target = format!("{}@{}", dataset_zfs_path, snapshot_name);
        info!("creating snapshot {}", target);
        self.command(&["snapshot", "-r", &target]).stderr(Stdio::inherit()).checked_run().await
    }

    async fn delete_snapshot(&self, snapshot_zfs_path: &str) -> Result<()> {
        info!("destroying snapshot {}", snapshot_zfs_path);
        self.command(&["destroy", snapshot_zfs_path]).stderr(Stdio::inherit()).checked_run().await
    }

    async fn estimate_send_size(&self, snapshot_zfs_path: &str, base_zfs_path: Option<&str>) -> Result<u64> {
        let mut args = vec!["send", "-nP"];
        if let Some(base) = base_zfs_path {
            args.push("-i");
            args.push(base);
        }
        args.push(snapshot_zfs_path);
        let out = self.command(&args).stderr(Stdio::inherit()).checked_output().await?;
        use std::io::BufRead;
        for line in std::io::BufReader::new(&out.stdout[..]).lines() {
            let line = line?;
            let fields: Vec<&str> = line.split('\t').collect();
            if fields.len() == 2 && fields[0] == "size" {
                return fields[1].parse().map_err(|_| anyhow!("bad size estimate: {:?}", line));
            }
        }
        Ok(0)
    }

    async fn send_snapshot(&self, snapshot_zfs_path: &str, base_zfs_path: Option<&str>) -> Result<ByteStream> {
        let mut args = vec!["send"];
        if let Some(base) = base_zfs_path {
            args.push("-i");
            args.push(base);
        }
        args.push(snapshot_zfs_path);
        let mut cmd = self.command(&args);
        cmd.stdout(Stdio::piped()).stderr(Stdio::inherit());
        let mut child = cmd.spawn().context("failed to spawn zfs send")?;
        let stdout = child.stdout.take().ok_or_else(|| anyhow!("zfs send produced no stdout pipe"))?;
        // Keep the child alive for the lifetime of the stream by leaking
        // its wait future onto a detached task; a non-zero exit surfaces
        // as a broken pipe to the reader, which the orchestrator already
        // treats as a hard failure.
        tokio::spawn(async move {
            let _ = child.wait().await;
        });
        Ok(Box::pin(stdout))
    }

    async fn recv_snapshot(&self, dataset_zfs_path: &str, mut stream: ByteStream) -> Result<()> {
        let mut cmd = self.command(&["receive", "-F", dataset_zfs_path]);
        cmd.stdin(Stdio::piped()).stderr(Stdio::inherit());
        let mut child = cmd.spawn().context("failed to spawn zfs receive")?;
        let mut stdin = child.stdin.take().ok_or_else(|| anyhow!("zfs receive produced no stdin pipe"))?;
        tokio::io::copy(&mut stream, &mut stdin).await.context("streaming into zfs receive")?;
        drop(stdin);
        let status = child.wait().await?;
        if !status.success() {
            return Err(anyhow!("zfs receive into {} failed: {:?}", dataset_zfs_path, status));
        }
        Ok(())
    }
}

fn split_dataset_path(path: &str) -> Result<(String, String)> {
    match path.split_once('/') {
        Some((pool, dataset)) => Ok((pool.to_string(), dataset.to_string())),
        None => Ok((path.to_string(), String::new())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_dataset_path_handles_nested_names() {
        assert_eq!(split_dataset_path("tank/a/b").unwrap(), ("tank".to_string(), "a/b".to_string()));
        assert_eq!(split_dataset_path("tank").unwrap(), ("tank".to_string(), String::new()));
    }
}
