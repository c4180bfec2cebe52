// SPDX-License-Identifier: Apache-2.0
//! The façade that drives the planner against real `VolumeManager`/
//! `TargetFs` implementations: backup, repair, restore, and verify.
//!
//! Every target directory holds a mirror of `{pool}/{dataset}/{snapshot}`
//! under the scan prefix, each snapshot as a `.zstream` file plus a
//! `.zstream.sha256` checksum written alongside it as it streams, and an
//! `INITIALIZED` sentinel marking a dataset directory as claimed.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use log::{info, warn};
use sha2::{Digest, Sha256};
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};
use tokio::task::JoinSet;

use crate::core::{self, Dataset, PoolList, Snapshot, TargetGroup};
use crate::targetfs::{TargetFs, TargetHandle, EXPECTED_DIGEST_SUFFIX, FINAL_DIGEST_SUFFIX, INITIALIZED_SENTINEL, STREAM_SUFFIX};
use crate::volume::{ByteStream, VolumeManager};

/// Ties one `VolumeManager` to the set of targets it backs up to or
/// restores from. Targets are held behind `Arc` so `verify` can hand a
/// clone to each of its per-target tasks without borrowing `self`.
pub struct Orchestrator {
    volumes: Box<dyn VolumeManager>,
    targets: BTreeMap<TargetHandle, Arc<dyn TargetFs>>,
    prefix: String,
}

impl Orchestrator {
    pub fn new(volumes: Box<dyn VolumeManager>, targets: Vec<Box<dyn TargetFs>>, prefix: impl Into<String>) -> Orchestrator {
        let targets = targets.into_iter().map(|t| (t.handle().clone(), Arc::from(t))).collect();
        Orchestrator { volumes, targets, prefix: prefix.into() }
    }

    fn relative_path(&self, snapshot: &Snapshot) -> String {
        format!("{}/{}/{}{}", snapshot.pool_name, snapshot.dataset_name, snapshot.snapshot_name, STREAM_SUFFIX)
    }

    async fn ensure_dataset_claimed(&self, target: &dyn TargetFs, dataset: &Dataset) -> Result<()> {
        let dataset_dir = format!("{}/{}", dataset.pool_name, dataset.dataset_name);
        target.mkdir_p(&dataset_dir).await?;
        let sentinel = format!("{}/{}", dataset_dir, INITIALIZED_SENTINEL);
        if !target.file_exists(&sentinel).await? {
            target.write_small_text(&sentinel, &dataset.zfs_path).await?;
        }
        Ok(())
    }

    /// Snapshot every source dataset forward by one managed generation,
    /// then push each new snapshot to every target. Datasets with a
    /// pending repair (already-missing history on some target) are
    /// skipped so repair always runs before new history compounds it.
    pub async fn backup(&self, pretend: bool) -> Result<()> {
        let source = self.volumes.scan().await.context("scanning source pool")?;

        let mut pending_repair = PoolList::new();
        for target in self.targets.values() {
            let remote = self.scan_target(target.as_ref()).await?;
            let repair = core::find_repairable_snapshots(&source, &remote, true)?;
            pending_repair = PoolList::merge([&pending_repair, &repair])?;
        }

        let next = core::next_backup_view(&source, &self.prefix, Some(&pending_repair))?;
        if !next.has_snapshots() {
            info!("no dataset is due for a new snapshot");
            return Ok(());
        }

        for dataset in next.iter_datasets() {
            for snapshot in dataset.iter_snapshots() {
                if pretend {
                    info!("would create {}", snapshot.zfs_path);
                    continue;
                }
                self.volumes.create_snapshot(&dataset.zfs_path, &snapshot.snapshot_name).await?;
            }
        }
        if pretend {
            return Ok(());
        }

        // Every target is due exactly the same new generation, so this
        // groups into a single batch — but goes through the same
        // grouper `repair` does, so a target that already diverged (one
        // that missed an earlier backup) still gets its own group.
        let needs: Vec<(TargetHandle, PoolList)> = self.targets.keys().cloned().map(|h| (h, next.clone())).collect();
        self.push_groups(core::group_target_paths(&needs)).await
    }

    /// Send every snapshot present on the source but missing on a
    /// target, in chain order, so each target's incremental chain is
    /// always contiguous once repair completes. Targets whose missing
    /// sets overlap are grouped (§4.8) so the shared payload is sent
    /// once and `tee`d to every member.
    pub async fn repair(&self, pretend: bool) -> Result<()> {
        let source = self.volumes.scan().await.context("scanning source pool")?;

        let mut needs = Vec::new();
        for (handle, target) in &self.targets {
            let remote = self.scan_target(target.as_ref()).await?;
            let repair = core::find_repairable_snapshots(&source, &remote, false)?;
            if repair.has_snapshots() {
                needs.push((handle.clone(), repair));
            }
        }
        if needs.is_empty() {
            info!("no target needs repair");
            return Ok(());
        }

        let groups = core::group_target_paths(&needs);
        if pretend {
            for group in &groups {
                for snapshot in group.pools.iter_snapshots() {
                    info!("would repair {} on {:?}", snapshot.zfs_path, group.targets);
                }
            }
            return Ok(());
        }
        self.push_groups(groups).await
    }

    /// Restore from whatever targets hold the needed history into the
    /// local pool, under `restore_prefix` so the originals are never
    /// overwritten in place.
    pub async fn restore(&self, restore_prefix: &str, force: bool, pretend: bool) -> Result<()> {
        let local = self.volumes.scan().await.context("scanning local pool")?;

        let mut remote_sources = BTreeMap::new();
        for (handle, target) in &self.targets {
            remote_sources.insert(handle.clone(), self.scan_target(target.as_ref()).await?);
        }

        let plan = core::plan_restore(&remote_sources, &local, restore_prefix, force)?;

        if plan.conflicting.has_snapshots() {
            warn!("{} snapshot(s) will be deleted before restoring (force requested)", plan.conflicting.iter_snapshots().count());
            if !pretend {
                for snapshot in plan.conflicting.iter_snapshots() {
                    self.volumes.delete_snapshot(&snapshot.zfs_path).await?;
                }
            }
        }

        for (snapshot, sources) in &plan.sources {
            let handle = sources.first().ok_or_else(|| anyhow!("snapshot '{}' has no candidate source", snapshot.zfs_path))?;
            // `plan.sources` is keyed by the de-shifted (original)
            // identity, so the target's stored file and the
            // `remote_sources` lookup both resolve correctly. Only the
            // local `zfs receive` destination gets `restore_prefix`
            // re-applied, so a restore never lands on the dataset it
            // was read from.
            let destination_dataset = format!("{}{}", restore_prefix, snapshot.dataset_zfs_path);
            if pretend {
                info!("would restore {} from {} into {}", snapshot.zfs_path, handle, destination_dataset);
                continue;
            }
            let target = self.targets.get(*handle).ok_or_else(|| anyhow!("unknown target '{}'", handle))?;
            self.pull_snapshot(target.as_ref(), snapshot, &destination_dataset).await?;
        }
        Ok(())
    }

    /// Recompute every target's `.zstream` checksum from its bytes on
    /// disk and compare it against the digest recorded when it was
    /// written, catching silent corruption the write-time digest alone
    /// cannot. One task per target runs concurrently (§5); a target's
    /// scan happens here, on the orchestrator, but the (potentially
    /// slow) re-hash of every snapshot happens inside the spawned task.
    pub async fn verify(&self) -> Result<Vec<String>> {
        let mut tasks = JoinSet::new();
        for (handle, target) in &self.targets {
            let remote = self.scan_target(target.as_ref()).await?;
            let relatives: Vec<(Snapshot, String)> = remote.iter_snapshots().map(|s| (s.clone(), self.relative_path(s))).collect();

            let handle = handle.clone();
            let target = Arc::clone(target);
            tasks.spawn(async move {
                let mut mismatches = Vec::new();
                for (snapshot, relative) in relatives {
                    if let Some(reason) = verify_one_snapshot(target.as_ref(), &relative).await? {
                        mismatches.push(format!("{}: {} {}", handle, snapshot.zfs_path, reason));
                    }
                }
                Ok::<Vec<String>, anyhow::Error>(mismatches)
            });
        }

        let mut mismatches = Vec::new();
        while let Some(result) = tasks.join_next().await {
            mismatches.extend(result.context("verify task panicked")??);
        }
        mismatches.sort();
        Ok(mismatches)
    }

    async fn scan_target(&self, target: &dyn TargetFs) -> Result<PoolList> {
        let mut pools = PoolList::new();
        let pool_names = match target.list_dir("").await {
            Ok(names) => names,
            Err(_) => return Ok(pools),
        };
        for pool_name in pool_names {
            if pool_name == INITIALIZED_SENTINEL {
                continue;
            }
            let dataset_names = target.list_dir(&pool_name).await.unwrap_or_default();
            for dataset_name in dataset_names {
                let dataset_dir = format!("{}/{}", pool_name, dataset_name);
                if !target.dir_exists(&dataset_dir).await.unwrap_or(false) {
                    continue;
                }
                let mut dataset = Dataset::new(&pool_name, &dataset_name);
                for entry in target.list_dir(&dataset_dir).await.unwrap_or_default() {
                    if entry == INITIALIZED_SENTINEL || !entry.ends_with(STREAM_SUFFIX) {
                        continue;
                    }
                    let snapshot_name = entry.trim_end_matches(STREAM_SUFFIX).to_string();
                    // A snapshot is *stored* only once its final digest
                    // is in place; an in-flight one (expected_sha256
                    // only) is reported as missing so the next repair
                    // picks up its checksum phase (§6).
                    let relative = format!("{}/{}", dataset_dir, entry);
                    let final_path = relative.replacen(STREAM_SUFFIX, FINAL_DIGEST_SUFFIX, 1);
                    if target.file_exists(&final_path).await.unwrap_or(false) {
                        dataset.add_snapshot(Snapshot::new(&pool_name, &dataset_name, snapshot_name))?;
                    }
                }
                if dataset.has_snapshots() {
                    pools.add_dataset(dataset)?;
                }
            }
        }
        pools.build_incremental_snapshot_refs();
        Ok(pools)
    }

    /// Push every group's snapshots, in chain order, sending each one
    /// once per group and `tee`ing the bytes to whichever of the
    /// group's targets still need them.
    async fn push_groups(&self, groups: Vec<TargetGroup<TargetHandle>>) -> Result<()> {
        for group in &groups {
            for dataset in group.pools.iter_datasets() {
                for snapshot in dataset.iter_snapshots() {
                    self.push_to_group(dataset, snapshot, &group.targets).await?;
                }
            }
        }
        Ok(())
    }

    async fn push_to_group(&self, dataset: &Dataset, snapshot: &Snapshot, handles: &[TargetHandle]) -> Result<()> {
        let relative = self.relative_path(snapshot);
        let expected_path = relative.replacen(STREAM_SUFFIX, EXPECTED_DIGEST_SUFFIX, 1);

        let mut needs_stream = Vec::new();
        for handle in handles {
            let target = self.targets.get(handle).expect("handle came from this orchestrator's targets");
            self.ensure_dataset_claimed(target.as_ref(), dataset).await?;
            if target.file_exists(&expected_path).await.unwrap_or(false) {
                info!("resuming checksum phase for {} on {}", snapshot.zfs_path, handle);
                self.finalize_checksum(target.as_ref(), &relative, None).await?;
            } else {
                needs_stream.push(handle);
            }
        }
        if needs_stream.is_empty() {
            return Ok(());
        }

        let base = snapshot.get_incremental_base().map(|b| b.zfs_path.clone());
        let stream = self.volumes.send_snapshot(&snapshot.zfs_path, base.as_deref()).await?;
        let mut pieces = tee_stream(stream, needs_stream.len());

        for handle in needs_stream {
            let target = self.targets.get(handle).expect("handle came from this orchestrator's targets");
            let piece = pieces.remove(0);
            let digest = target.stream_digest(&relative, piece).await.with_context(|| format!("streaming {} to {}", snapshot.zfs_path, handle))?;
            target.write_small_text(&expected_path, &digest).await?;
            self.finalize_checksum(target.as_ref(), &relative, Some(digest)).await?;
            info!("wrote {} to {}", snapshot.zfs_path, handle);
        }
        Ok(())
    }

    /// Re-read `relative` back from `target` and compare its digest
    /// against `expected_digest` (or, when resuming, whatever was
    /// recorded in the expected-checksum file). On a match, promote the
    /// in-flight checksum to the final one and remove the in-flight
    /// file; a mismatch is a hard error (silent corruption).
    async fn finalize_checksum(&self, target: &dyn TargetFs, relative: &str, expected_digest: Option<String>) -> Result<()> {
        let expected_path = relative.replacen(STREAM_SUFFIX, EXPECTED_DIGEST_SUFFIX, 1);
        let expected = match expected_digest {
            Some(digest) => digest,
            None => parse_recorded_digest(&target.read_small_text(&expected_path).await?),
        };

        let actual = digest_stream(target, relative).await?;
        if actual != expected {
            return Err(anyhow!("checksum mismatch finalizing {}: expected {}, got {}", relative, expected, actual));
        }

        let final_path = relative.replacen(STREAM_SUFFIX, FINAL_DIGEST_SUFFIX, 1);
        target.write_small_text(&final_path, &actual).await?;
        target.remove_file(&expected_path).await.ok();
        Ok(())
    }

    async fn pull_snapshot(&self, target: &dyn TargetFs, snapshot: &Snapshot, destination_dataset: &str) -> Result<()> {
        let relative = self.relative_path(snapshot);
        let stream = target.open_stream(&relative).await?;
        self.volumes.recv_snapshot(destination_dataset, stream).await.with_context(|| format!("restoring {} into {}", snapshot.zfs_path, destination_dataset))
    }
}

/// Recorded digest files are normally bare hex, but tolerate the
/// `sha256sum`-style form `{hex} ./{filename}` too (§6), so a checksum
/// file produced by an external tool still verifies.
fn parse_recorded_digest(contents: &str) -> String {
    contents.trim().split_whitespace().next().unwrap_or("").to_string()
}

async fn digest_stream(target: &dyn TargetFs, relative: &str) -> Result<String> {
    let mut stream = target.open_stream(relative).await.with_context(|| format!("reopening {}", relative))?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 64 * 1024];
    loop {
        let read = stream.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Compare `relative`'s on-disk bytes against its recorded final
/// checksum. `None` if it matches, `Some(reason)` otherwise.
async fn verify_one_snapshot(target: &dyn TargetFs, relative: &str) -> Result<Option<String>> {
    let digest_path = relative.replacen(STREAM_SUFFIX, FINAL_DIGEST_SUFFIX, 1);
    let recorded = match target.read_small_text(&digest_path).await {
        Ok(text) => parse_recorded_digest(&text),
        Err(_) => return Ok(Some("is missing its checksum file".to_string())),
    };
    let actual = digest_stream(target, relative).await?;
    if actual == recorded {
        Ok(None)
    } else {
        Ok(Some(format!("checksum mismatch (recorded {}, actual {})", recorded, actual)))
    }
}

/// Fan a single incoming byte stream out to `n` independent readers, so
/// one `zfs send` can feed every target in a group without re-invoking
/// the volume manager per destination (§4.8's rationale, §6's "must be
/// tee-able to ≥1 destinations").
fn tee_stream(mut source: ByteStream, n: usize) -> Vec<ByteStream> {
    let mut readers = Vec::with_capacity(n);
    let mut writers = Vec::with_capacity(n);
    for _ in 0..n {
        let (read_half, write_half) = duplex(64 * 1024);
        readers.push(Box::pin(read_half) as ByteStream);
        writers.push(write_half);
    }

    tokio::spawn(async move {
        let mut buffer = vec![0u8; 64 * 1024];
        loop {
            let read = match source.read(&mut buffer).await {
                Ok(0) | Err(_) => break,
                Ok(read) => read,
            };
            for writer in writers.iter_mut() {
                // This destination's reader may already have been
                // dropped (its own send failed); keep feeding the rest.
                let _ = writer.write_all(&buffer[..read]).await;
            }
        }
    });

    readers
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_recorded_digest_accepts_bare_hex() {
        assert_eq!(parse_recorded_digest("deadbeef\n"), "deadbeef");
    }

    #[test]
    fn parse_recorded_digest_accepts_sha256sum_style() {
        assert_eq!(parse_recorded_digest("deadbeef  ./tank/home@p_1.zstream\n"), "deadbeef");
    }
}
