// SPDX-License-Identifier: Apache-2.0
//! A single, immutable snapshot identity plus its (mutable) incremental
//! base link.

use chrono::{DateTime, Utc};

use super::names;
use crate::error::PlanError;

/// An immutable point-in-time image of a dataset, identified by
/// `(pool, dataset, name)`.
///
/// Equality and hashing are by `zfs_path`. `incremental_base` is the one
/// mutable field: "this snapshot's contents can be reconstructed from
/// `base` plus a delta stream". It is stored as an owned clone of the
/// base (not a weak/shared back-reference into a container) — see
/// DESIGN.md for why that's a safe divergence from a literal reading of
/// "non-owning link" at this crate's scale.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub pool_name: String,
    pub dataset_name: String,
    pub snapshot_name: String,
    pub zfs_path: String,
    pub dataset_zfs_path: String,
    pub creation_time: Option<DateTime<Utc>>,
    incremental_base: Option<Box<Snapshot>>,
}

impl Snapshot {
    pub fn new(pool_name: impl Into<String>, dataset_name: impl Into<String>, snapshot_name: impl Into<String>) -> Snapshot {
        let pool_name = pool_name.into();
        let dataset_name = dataset_name.into();
        let snapshot_name = snapshot_name.into();
        let dataset_zfs_path = format!("{}/{}", pool_name, dataset_name);
        let zfs_path = format!("{}@{}", dataset_zfs_path, snapshot_name);
        Snapshot {
            pool_name,
            dataset_name,
            snapshot_name,
            zfs_path,
            dataset_zfs_path,
            creation_time: None,
            incremental_base: None,
        }
    }

    pub fn with_creation_time(mut self, creation_time: DateTime<Utc>) -> Snapshot {
        self.creation_time = Some(creation_time);
        self
    }

    pub fn has_creation_time(&self) -> bool {
        self.creation_time.is_some()
    }

    /// A deep clone with an independent identity: same `zfs_path`, no
    /// shared pointers. Used by every container's `view()`.
    pub fn view(&self) -> Snapshot {
        self.clone()
    }

    /// A clone of just this snapshot's identity, discarding any chain
    /// (incremental base). Used for "pseudo base" and hole-filler
    /// placeholders.
    pub fn bare_copy(&self) -> Snapshot {
        Snapshot::new(&self.pool_name, &self.dataset_name, &self.snapshot_name)
    }

    pub fn has_incremental_base(&self) -> bool {
        self.incremental_base.is_some()
    }

    pub fn set_incremental_base(&mut self, base: Snapshot) {
        self.incremental_base = Some(Box::new(base));
    }

    pub fn clear_incremental_base(&mut self) {
        self.incremental_base = None;
    }

    pub fn get_incremental_base(&self) -> Option<&Snapshot> {
        self.incremental_base.as_deref()
    }

    /// Parse this snapshot's name under the managed naming scheme.
    pub fn parse_backup_name(&self) -> Result<(String, u64), PlanError> {
        names::parse_backup_snapshot(&self.snapshot_name)
    }

    /// Merge snapshots that share a `zfs_path` into one. All inputs must
    /// have the same `snapshot_name` (by construction they always will,
    /// since `zfs_path` already encodes pool/dataset/name).
    pub fn merge<'a>(
        pool_name: &str,
        dataset_name: &str,
        others: impl IntoIterator<Item = &'a Snapshot>,
    ) -> Result<Snapshot, PlanError> {
        let mut names = others.into_iter().map(|s| s.snapshot_name.as_str());
        let first = names
            .next()
            .ok_or_else(|| PlanError::Invariant("merge of zero snapshots".to_string()))?;
        if names.any(|n| n != first) {
            return Err(PlanError::Invariant(
                "snapshots must have the same name to be merged".to_string(),
            ));
        }
        Ok(Snapshot::new(pool_name, dataset_name, first))
    }

    /// Return a view with any `zfs_path`-prefix shifted (or stripped, for
    /// `deshift`).
    pub fn prefixed_view(&self, prefix: &str, deshift: bool) -> Snapshot {
        let (pool_name, dataset_name) = shift_dataset_zfs_path(&self.dataset_zfs_path, prefix, deshift);
        let mut shifted = Snapshot::new(pool_name, dataset_name, &self.snapshot_name);
        shifted.creation_time = self.creation_time;
        shifted
    }
}

/// Shared by `Snapshot::prefixed_view` and `Dataset::prefixed_view`: apply
/// (or remove) a leading prefix on a `pool/dataset` path and split the
/// result back into its two components.
pub(super) fn shift_dataset_zfs_path(dataset_zfs_path: &str, prefix: &str, deshift: bool) -> (String, String) {
    let shifted = if deshift {
        dataset_zfs_path.replacen(prefix, "", 1)
    } else {
        format!("{}{}", prefix, dataset_zfs_path)
    };
    match shifted.split_once('/') {
        Some((pool, dataset)) => (pool.to_string(), dataset.to_string()),
        None => (shifted, String::new()),
    }
}

impl PartialEq for Snapshot {
    fn eq(&self, other: &Self) -> bool {
        self.zfs_path == other.zfs_path
    }
}
impl Eq for Snapshot {}

impl std::hash::Hash for Snapshot {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.zfs_path.hash(state);
    }
}

impl std::fmt::Display for Snapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Snapshot({})", self.zfs_path)
    }
}
