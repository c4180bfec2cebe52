// SPDX-License-Identifier: Apache-2.0
//! `Dataset`: identity `(pool, dataset)` plus its owned snapshots.

use std::collections::BTreeMap;

use super::names;
use super::snapshot::{shift_dataset_zfs_path, Snapshot};
use crate::error::PlanError;

/// Identity `(pool, dataset)`, holding a `zfs_path -> Snapshot` mapping.
///
/// Snapshots may only be added if their `(pool, dataset)` matches this
/// dataset's. Iteration yields snapshots in chain order (§4.1).
#[derive(Debug, Clone)]
pub struct Dataset {
    pub pool_name: String,
    pub dataset_name: String,
    pub zfs_path: String,
    pub snapshots: BTreeMap<String, Snapshot>,
    dataset_size: Option<u64>,
}

impl Dataset {
    pub fn new(pool_name: impl Into<String>, dataset_name: impl Into<String>) -> Dataset {
        let pool_name = pool_name.into();
        let dataset_name = dataset_name.into();
        let zfs_path = format!("{}/{}", pool_name, dataset_name);
        Dataset {
            pool_name,
            dataset_name,
            zfs_path,
            snapshots: BTreeMap::new(),
            dataset_size: None,
        }
    }

    pub fn dataset_size(&self) -> Option<u64> {
        self.dataset_size
    }

    pub fn set_dataset_size(&mut self, size: u64) {
        self.dataset_size = Some(size);
    }

    pub fn has_dataset_size(&self) -> bool {
        self.dataset_size.is_some()
    }

    /// A new, empty `Dataset` with the same identity and size, but no
    /// snapshots.
    pub fn copy(&self) -> Dataset {
        let mut d = Dataset::new(&self.pool_name, &self.dataset_name);
        d.dataset_size = self.dataset_size;
        d
    }

    pub fn add_snapshot(&mut self, snapshot: Snapshot) -> Result<(), PlanError> {
        if snapshot.pool_name != self.pool_name || snapshot.dataset_name != self.dataset_name {
            return Err(PlanError::Add(
                snapshot.zfs_path.clone(),
                format!("does not belong to dataset '{}'", self.zfs_path),
            ));
        }
        if self.snapshots.contains_key(&snapshot.zfs_path) {
            return Err(PlanError::Add(
                snapshot.zfs_path.clone(),
                format!("already present in dataset '{}'", self.zfs_path),
            ));
        }
        self.snapshots.insert(snapshot.zfs_path.clone(), snapshot);
        Ok(())
    }

    pub fn remove_snapshot(&mut self, zfs_path: &str) -> Result<Snapshot, PlanError> {
        self.snapshots
            .remove(zfs_path)
            .ok_or_else(|| PlanError::Resolve(zfs_path.to_string()))
    }

    pub fn contains(&self, zfs_path: &str) -> bool {
        self.snapshots.contains_key(zfs_path)
    }

    pub fn has_snapshots(&self) -> bool {
        !self.snapshots.is_empty()
    }

    pub fn get_snapshot(&self, zfs_path: &str) -> Option<&Snapshot> {
        self.snapshots.get(zfs_path)
    }

    pub fn get_snapshot_by_name(&self, snapshot_name: &str) -> Result<&Snapshot, PlanError> {
        let zfs_path = format!("{}@{}", self.zfs_path, snapshot_name);
        self.snapshots
            .get(&zfs_path)
            .ok_or_else(|| PlanError::Resolve(zfs_path))
    }

    pub fn resolve_zfs_path(&self, zfs_path: &str) -> Result<&Snapshot, PlanError> {
        self.snapshots
            .get(zfs_path)
            .ok_or_else(|| PlanError::Resolve(zfs_path.to_string()))
    }

    /// Remove every snapshot, keeping identity and size.
    pub fn drop_snapshots(&mut self) {
        self.snapshots.clear();
    }

    /// Snapshots in chain order (§4.1): by `creation_time` if every
    /// snapshot has one, otherwise initials first then the rest, each
    /// lexicographic by `zfs_path`.
    pub fn sort_snapshots(snapshots: Vec<&Snapshot>) -> Vec<&Snapshot> {
        let mut snapshots = snapshots;
        if !snapshots.is_empty() && snapshots.iter().all(|s| s.has_creation_time()) {
            snapshots.sort_by_key(|s| s.creation_time);
            return snapshots;
        }
        let (mut initial, mut rest): (Vec<_>, Vec<_>) = snapshots.drain(..).partition(|s| names::is_initial(&s.snapshot_name));
        initial.sort_by(|a, b| a.zfs_path.cmp(&b.zfs_path));
        rest.sort_by(|a, b| a.zfs_path.cmp(&b.zfs_path));
        initial.extend(rest);
        initial
    }

    /// Iterate snapshots in chain order.
    pub fn iter_snapshots(&self) -> impl Iterator<Item = &Snapshot> {
        Dataset::sort_snapshots(self.snapshots.values().collect()).into_iter()
    }

    /// Deep clone: fresh `Snapshot` instances, same `zfs_path`s, with
    /// incremental-base links rewired to the clone's own snapshots (or a
    /// pseudo-base if the original base was filtered out of this view).
    pub fn prefixed_view(&self, prefix: &str, deshift: bool) -> Dataset {
        let (pool_name, dataset_name) = shift_dataset_zfs_path(&self.zfs_path, prefix, deshift);
        let mut view = Dataset::new(pool_name, dataset_name);
        for snapshot in self.snapshots.values() {
            // add_snapshot cannot fail: identity/uniqueness preserved by construction.
            view.add_snapshot(snapshot.prefixed_view(prefix, deshift)).expect("unreachable");
        }
        // Rewire incremental-base links in chain order so a base always
        // exists (if kept) before its dependents are visited.
        let ordered_paths: Vec<String> = Dataset::sort_snapshots(self.snapshots.values().collect())
            .into_iter()
            .map(|s| s.zfs_path.clone())
            .collect();
        for original_path in ordered_paths {
            let original = &self.snapshots[&original_path];
            let base = match original.get_incremental_base() {
                Some(base) => base.clone(),
                None => continue,
            };
            let shifted_base = base.prefixed_view(prefix, deshift);
            let shifted_self_path = original.prefixed_view(prefix, deshift).zfs_path;
            let resolved_base = match view.snapshots.get(&shifted_base.zfs_path) {
                Some(shared) => shared.clone(),
                // Base was filtered out of this view: keep a pseudo base
                // carrying only the missing base's identity.
                None => shifted_base.bare_copy(),
            };
            if let Some(s) = view.snapshots.get_mut(&shifted_self_path) {
                s.set_incremental_base(resolved_base);
            }
        }
        view.dataset_size = self.dataset_size;
        view
    }

    /// Deep clone preserving `zfs_path`s unchanged.
    pub fn view(&self) -> Dataset {
        self.prefixed_view("", false)
    }

    pub fn has_incremental_snapshot_refs(&self) -> bool {
        self.snapshots.values().any(|s| s.has_incremental_base())
    }

    /// Merge datasets that share `(pool_name, dataset_name)` into one,
    /// unioning their snapshots. `dataset_size` is propagated only if all
    /// inputs agree and all snapshot sets are identical.
    pub fn merge<'a>(
        pool_name: &str,
        dataset_name: &str,
        others: impl IntoIterator<Item = &'a Dataset>,
    ) -> Result<Dataset, PlanError> {
        let mut merged = Dataset::new(pool_name, dataset_name);
        let mut by_path: BTreeMap<String, Vec<&Snapshot>> = BTreeMap::new();
        let mut all_sizes = Vec::new();
        let mut snapshot_key_sets = Vec::new();
        let mut any_missing_size = false;

        for other in others {
            snapshot_key_sets.push(other.snapshots.keys().cloned().collect::<std::collections::BTreeSet<_>>());
            match other.dataset_size {
                Some(size) => all_sizes.push(size),
                None => any_missing_size = true,
            }
            for snapshot in other.snapshots.values() {
                by_path.entry(snapshot.zfs_path.clone()).or_default().push(snapshot);
            }
        }

        for (path, snaps) in &by_path {
            let merged_snapshot = Snapshot::merge(pool_name, dataset_name, snaps.iter().copied())?;
            merged.add_snapshot(merged_snapshot).map_err(|_| {
                PlanError::Invariant(format!("duplicate snapshot '{}' during merge", path))
            })?;
        }

        if !any_missing_size && !all_sizes.is_empty() {
            let same_keys = snapshot_key_sets.windows(2).all(|w| w[0] == w[1]);
            let same_size = all_sizes.windows(2).all(|w| w[0] == w[1]);
            if same_keys && same_size {
                merged.dataset_size = Some(all_sizes[0]);
            }
        }

        Ok(merged)
    }
}

impl super::set_ops::SetOps for Dataset {
    fn difference<'a>(&self, others: impl IntoIterator<Item = &'a Dataset>) -> Dataset
    where
        Dataset: 'a,
    {
        let others: Vec<&Dataset> = others.into_iter().collect();
        let mut result = self.view();
        let keep: std::collections::BTreeSet<&String> = self
            .snapshots
            .keys()
            .filter(|path| !others.iter().any(|o| o.contains(path)))
            .collect();
        let to_remove: Vec<String> = result
            .snapshots
            .keys()
            .filter(|path| !keep.contains(path))
            .cloned()
            .collect();
        for path in to_remove {
            result.remove_snapshot(&path).expect("path came from result");
        }
        result
    }

    fn intersection<'a>(&self, others: impl IntoIterator<Item = &'a Dataset>) -> Dataset
    where
        Dataset: 'a,
    {
        let others: Vec<&Dataset> = others.into_iter().collect();
        let mut result = self.view();
        let keep: std::collections::BTreeSet<&String> = self
            .snapshots
            .keys()
            .filter(|path| others.iter().all(|o| o.contains(path)))
            .collect();
        let to_remove: Vec<String> = result
            .snapshots
            .keys()
            .filter(|path| !keep.contains(path))
            .cloned()
            .collect();
        for path in to_remove {
            result.remove_snapshot(&path).expect("path came from result");
        }
        result
    }
}

impl PartialEq for Dataset {
    fn eq(&self, other: &Self) -> bool {
        self.zfs_path == other.zfs_path && self.snapshots == other.snapshots
    }
}

#[cfg(test)]
mod tests {
    use super::super::set_ops::SetOps;
    use super::*;

    fn dataset_with(names: &[&str]) -> Dataset {
        let mut d = Dataset::new("tank", "home");
        for n in names {
            d.add_snapshot(Snapshot::new("tank", "home", *n)).unwrap();
        }
        d
    }

    #[test]
    fn add_snapshot_rejects_mismatched_identity() {
        let mut d = Dataset::new("tank", "home");
        let err = d.add_snapshot(Snapshot::new("tank", "other", "nightly_initial"));
        assert!(err.is_err());
    }

    #[test]
    fn add_snapshot_rejects_duplicates() {
        let mut d = dataset_with(&["nightly_initial"]);
        assert!(d.add_snapshot(Snapshot::new("tank", "home", "nightly_initial")).is_err());
    }

    #[test]
    fn difference_and_intersection_partition_snapshots() {
        let a = dataset_with(&["p_initial", "p_1", "p_2"]);
        let b = dataset_with(&["p_initial", "p_1"]);

        let diff = a.difference([&b]);
        assert_eq!(diff.snapshots.keys().cloned().collect::<Vec<_>>(), vec!["tank/home@p_2".to_string()]);

        let inter = a.intersection([&b]);
        assert_eq!(
            inter.snapshots.keys().cloned().collect::<Vec<_>>(),
            vec!["tank/home@p_1".to_string(), "tank/home@p_initial".to_string()]
        );
    }

    #[test]
    fn view_is_independent_of_source() {
        let a = dataset_with(&["p_initial", "p_1"]);
        let mut view = a.view();
        view.remove_snapshot("tank/home@p_1").unwrap();
        assert!(a.contains("tank/home@p_1"));
        assert!(!view.contains("tank/home@p_1"));
    }

    #[test]
    fn prefixed_view_round_trips() {
        let a = dataset_with(&["p_initial", "p_1"]);
        let shifted = a.prefixed_view("restored/", false);
        assert_eq!(shifted.zfs_path, "restored/tank/home");
        let back = shifted.prefixed_view("restored/", true);
        assert_eq!(back.zfs_path, a.zfs_path);
        assert_eq!(
            back.snapshots.keys().collect::<Vec<_>>(),
            a.snapshots.keys().collect::<Vec<_>>()
        );
    }

    #[test]
    fn merge_unions_snapshots_and_propagates_agreeing_size() {
        let mut a = dataset_with(&["p_initial"]);
        a.set_dataset_size(100);
        let mut b = dataset_with(&["p_1"]);
        b.set_dataset_size(100);

        let merged = Dataset::merge("tank", "home", [&a, &b]).unwrap();
        assert_eq!(merged.snapshots.len(), 2);
        // Sizes only propagate when all inputs share the same snapshot set too.
        assert!(!merged.has_dataset_size());
    }

    #[test]
    fn sort_snapshots_puts_initial_first_without_creation_times() {
        let d = dataset_with(&["p_2", "p_initial", "p_1"]);
        let ordered: Vec<_> = d.iter_snapshots().map(|s| s.snapshot_name.clone()).collect();
        assert_eq!(ordered, vec!["p_initial", "p_1", "p_2"]);
    }
}
