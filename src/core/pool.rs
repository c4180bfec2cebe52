// SPDX-License-Identifier: Apache-2.0
//! `Pool`: identity `pool_name` plus its owned datasets.

use std::collections::BTreeMap;

use super::dataset::Dataset;
use super::set_ops::SetOps;
use crate::error::PlanError;

#[derive(Debug, Clone)]
pub struct Pool {
    pub pool_name: String,
    pub datasets: BTreeMap<String, Dataset>,
}

impl Pool {
    pub fn new(pool_name: impl Into<String>) -> Pool {
        Pool {
            pool_name: pool_name.into(),
            datasets: BTreeMap::new(),
        }
    }

    pub fn copy(&self) -> Pool {
        Pool::new(&self.pool_name)
    }

    pub fn add_dataset(&mut self, dataset: Dataset) -> Result<(), PlanError> {
        if dataset.pool_name != self.pool_name {
            return Err(PlanError::Add(
                dataset.zfs_path.clone(),
                format!("does not belong to pool '{}'", self.pool_name),
            ));
        }
        if self.datasets.contains_key(&dataset.zfs_path) {
            return Err(PlanError::Add(
                dataset.zfs_path.clone(),
                format!("already present in pool '{}'", self.pool_name),
            ));
        }
        self.datasets.insert(dataset.zfs_path.clone(), dataset);
        Ok(())
    }

    pub fn remove_dataset(&mut self, zfs_path: &str) -> Result<Dataset, PlanError> {
        self.datasets
            .remove(zfs_path)
            .ok_or_else(|| PlanError::Resolve(zfs_path.to_string()))
    }

    pub fn contains(&self, zfs_path: &str) -> bool {
        self.datasets.contains_key(zfs_path)
    }

    pub fn has_datasets(&self) -> bool {
        !self.datasets.is_empty()
    }

    pub fn has_snapshots(&self) -> bool {
        self.datasets.values().any(|d| d.has_snapshots())
    }

    pub fn get_dataset(&self, zfs_path: &str) -> Option<&Dataset> {
        self.datasets.get(zfs_path)
    }

    pub fn get_dataset_mut(&mut self, zfs_path: &str) -> Option<&mut Dataset> {
        self.datasets.get_mut(zfs_path)
    }

    pub fn resolve_zfs_path(&self, zfs_path: &str) -> Result<&Dataset, PlanError> {
        let dataset_path = zfs_path.split('@').next().unwrap_or(zfs_path);
        self.datasets
            .get(dataset_path)
            .ok_or_else(|| PlanError::Resolve(zfs_path.to_string()))
    }

    /// Iterate datasets in lexicographic order of their `zfs_path`.
    pub fn iter_datasets(&self) -> impl Iterator<Item = &Dataset> {
        self.datasets.values()
    }

    pub fn iter_snapshots(&self) -> impl Iterator<Item = &super::snapshot::Snapshot> + '_ {
        self.datasets.values().flat_map(|d| d.iter_snapshots())
    }

    pub fn view(&self) -> Pool {
        let mut view = Pool::new(&self.pool_name);
        for dataset in self.datasets.values() {
            view.add_dataset(dataset.view()).expect("unreachable");
        }
        view
    }

    pub fn drop_snapshots(&mut self) {
        for dataset in self.datasets.values_mut() {
            dataset.drop_snapshots();
        }
    }

    pub fn drop_empty_datasets(&mut self) {
        self.datasets.retain(|_, d| d.has_snapshots());
    }

    pub fn build_incremental_snapshot_refs(&mut self) {
        for dataset in self.datasets.values_mut() {
            super::chain::build_incremental_snapshot_refs(dataset);
        }
    }

    pub fn merge<'a>(pool_name: &str, others: impl IntoIterator<Item = &'a Pool>) -> Result<Pool, PlanError> {
        let mut merged = Pool::new(pool_name);
        let mut by_path: BTreeMap<String, Vec<&Dataset>> = BTreeMap::new();
        for other in others {
            for dataset in other.datasets.values() {
                by_path.entry(dataset.zfs_path.clone()).or_default().push(dataset);
            }
        }
        for dataset in by_path.values() {
            let dataset_name = &dataset[0].dataset_name;
            let merged_dataset = Dataset::merge(pool_name, dataset_name, dataset.iter().copied())?;
            merged.add_dataset(merged_dataset).map_err(|e| {
                PlanError::Invariant(format!("duplicate dataset during merge: {}", e))
            })?;
        }
        Ok(merged)
    }
}

impl SetOps for Pool {
    fn difference<'a>(&self, others: impl IntoIterator<Item = &'a Pool>) -> Pool
    where
        Pool: 'a,
    {
        let others: Vec<&Pool> = others.into_iter().collect();
        let mut result = self.view();
        let paths: Vec<String> = result.datasets.keys().cloned().collect();
        for path in paths {
            let present_elsewhere: Vec<&Dataset> = others.iter().filter_map(|o| o.get_dataset(&path)).collect();
            if present_elsewhere.is_empty() {
                continue; // dataset present only in self: kept whole
            }
            let dataset = result.get_dataset(&path).expect("path from result").clone();
            let diffed = dataset.difference(present_elsewhere);
            if diffed.has_snapshots() {
                result.datasets.insert(path, diffed);
            } else {
                result.datasets.remove(&path);
            }
        }
        result
    }

    fn intersection<'a>(&self, others: impl IntoIterator<Item = &'a Pool>) -> Pool
    where
        Pool: 'a,
    {
        let mut base = self.view();
        for other in others {
            let mut next = self.copy();
            let shared_paths: Vec<String> = base
                .datasets
                .keys()
                .filter(|p| other.contains(p))
                .cloned()
                .collect();
            for path in shared_paths {
                let a = base.get_dataset(&path).expect("path from base");
                let b = other.get_dataset(&path).expect("checked contains");
                next.add_dataset(a.intersection([b])).expect("unreachable");
            }
            base = next.view();
        }
        base
    }
}

impl PartialEq for Pool {
    fn eq(&self, other: &Self) -> bool {
        self.pool_name == other.pool_name && self.datasets == other.datasets
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::snapshot::Snapshot;

    fn pool_with(dataset_names: &[&str], snapshot_names: &[&str]) -> Pool {
        let mut pool = Pool::new("tank");
        for dataset_name in dataset_names {
            let mut d = Dataset::new("tank", *dataset_name);
            for snapshot_name in snapshot_names {
                d.add_snapshot(Snapshot::new("tank", *dataset_name, *snapshot_name)).unwrap();
            }
            pool.add_dataset(d).unwrap();
        }
        pool
    }

    #[test]
    fn difference_drops_fully_shared_dataset() {
        let a = pool_with(&["home"], &["p_initial", "p_1"]);
        let b = pool_with(&["home"], &["p_initial", "p_1"]);
        let diff = a.difference([&b]);
        assert!(!diff.contains("tank/home"));
    }

    #[test]
    fn difference_keeps_dataset_present_only_in_self() {
        let a = pool_with(&["home", "var"], &["p_initial"]);
        let b = pool_with(&["home"], &["p_initial"]);
        let diff = a.difference([&b]);
        assert!(!diff.contains("tank/home"));
        assert!(diff.contains("tank/var"));
    }

    #[test]
    fn intersection_is_commutative_as_snapshot_sets() {
        let a = pool_with(&["home"], &["p_initial", "p_1"]);
        let b = pool_with(&["home"], &["p_1", "p_2"]);
        let ab: Vec<String> = a.intersection([&b]).iter_snapshots().map(|s| s.zfs_path.clone()).collect();
        let ba: Vec<String> = b.intersection([&a]).iter_snapshots().map(|s| s.zfs_path.clone()).collect();
        assert_eq!(ab, ba);
    }
}
