// SPDX-License-Identifier: Apache-2.0
//! `PoolList`: the top-level container, a `pool_name -> Pool` mapping
//! with unique pool names. Every planner API consumes/produces this type.

use std::collections::BTreeMap;

use super::dataset::Dataset;
use super::pool::Pool;
use super::set_ops::SetOps;
use super::snapshot::Snapshot;
use crate::error::PlanError;

#[derive(Debug, Clone, Default)]
pub struct PoolList {
    pub pools: BTreeMap<String, Pool>,
}

impl PoolList {
    pub fn new() -> PoolList {
        PoolList { pools: BTreeMap::new() }
    }

    pub fn add_pool(&mut self, pool: Pool) -> Result<(), PlanError> {
        if self.pools.contains_key(&pool.pool_name) {
            return Err(PlanError::Add(
                pool.pool_name.clone(),
                "already present in pool list".to_string(),
            ));
        }
        self.pools.insert(pool.pool_name.clone(), pool);
        Ok(())
    }

    /// Add `dataset`, creating its pool if necessary, or merging it into
    /// the pool's existing dataset of the same path if one is already
    /// present.
    pub fn add_dataset(&mut self, dataset: Dataset) -> Result<(), PlanError> {
        if !self.pools.contains_key(&dataset.pool_name) {
            self.pools.insert(dataset.pool_name.clone(), Pool::new(&dataset.pool_name));
        }
        let pool = self.pools.get_mut(&dataset.pool_name).expect("just inserted");
        if let Some(existing) = pool.get_dataset(&dataset.zfs_path) {
            let merged = Dataset::merge(&dataset.pool_name, &dataset.dataset_name, [existing, &dataset])?;
            pool.remove_dataset(&dataset.zfs_path)?;
            pool.add_dataset(merged)?;
        } else {
            pool.add_dataset(dataset)?;
        }
        Ok(())
    }

    pub fn remove_pool(&mut self, pool_name: &str) -> Result<Pool, PlanError> {
        self.pools
            .remove(pool_name)
            .ok_or_else(|| PlanError::Resolve(pool_name.to_string()))
    }

    pub fn contains(&self, pool_name: &str) -> bool {
        self.pools.contains_key(pool_name)
    }

    pub fn get_pool(&self, pool_name: &str) -> Option<&Pool> {
        self.pools.get(pool_name)
    }

    pub fn get_dataset_by_path(&self, zfs_path: &str) -> Result<&Dataset, PlanError> {
        let pool_name = zfs_path.split('/').next().unwrap_or(zfs_path);
        self.pools
            .get(pool_name)
            .ok_or_else(|| PlanError::Resolve(zfs_path.to_string()))?
            .get_dataset(zfs_path)
            .ok_or_else(|| PlanError::Resolve(zfs_path.to_string()))
    }

    pub fn iter_pools(&self) -> impl Iterator<Item = &Pool> {
        self.pools.values()
    }

    pub fn iter_datasets(&self) -> impl Iterator<Item = &Dataset> {
        self.pools.values().flat_map(|p| p.iter_datasets())
    }

    pub fn iter_snapshots(&self) -> impl Iterator<Item = &Snapshot> + '_ {
        self.pools.values().flat_map(|p| p.iter_snapshots())
    }

    pub fn has_snapshots(&self) -> bool {
        self.pools.values().any(|p| p.has_snapshots())
    }

    pub fn view(&self) -> PoolList {
        let mut view = PoolList::new();
        for pool in self.pools.values() {
            view.add_pool(pool.view()).expect("unreachable");
        }
        view
    }

    pub fn drop_snapshots(&mut self) {
        for pool in self.pools.values_mut() {
            pool.drop_snapshots();
        }
    }

    pub fn drop_empty_datasets(&mut self) {
        for pool in self.pools.values_mut() {
            pool.drop_empty_datasets();
        }
    }

    pub fn build_incremental_snapshot_refs(&mut self) {
        for pool in self.pools.values_mut() {
            pool.build_incremental_snapshot_refs();
        }
    }

    pub fn merge<'a>(others: impl IntoIterator<Item = &'a PoolList>) -> Result<PoolList, PlanError> {
        let mut by_name: BTreeMap<String, Vec<&Pool>> = BTreeMap::new();
        for other in others {
            for pool in other.pools.values() {
                by_name.entry(pool.pool_name.clone()).or_default().push(pool);
            }
        }
        let mut merged = PoolList::new();
        for (pool_name, pools) in &by_name {
            merged.add_pool(Pool::merge(pool_name, pools.iter().copied())?)?;
        }
        Ok(merged)
    }
}

impl SetOps for PoolList {
    fn difference<'a>(&self, others: impl IntoIterator<Item = &'a PoolList>) -> PoolList
    where
        PoolList: 'a,
    {
        let others: Vec<&PoolList> = others.into_iter().collect();
        let mut result = PoolList::new();
        for pool in self.pools.values() {
            let others_with_same_name: Vec<&Pool> = others.iter().filter_map(|o| o.get_pool(&pool.pool_name)).collect();
            let diffed = pool.difference(others_with_same_name);
            if diffed.has_datasets() {
                result.add_pool(diffed).expect("unique pool names");
            }
        }
        result
    }

    fn intersection<'a>(&self, others: impl IntoIterator<Item = &'a PoolList>) -> PoolList
    where
        PoolList: 'a,
    {
        let others: Vec<&PoolList> = others.into_iter().collect();
        let mut result = PoolList::new();
        for pool in self.pools.values() {
            let others_with_same_name: Vec<&Pool> = others.iter().filter_map(|o| o.get_pool(&pool.pool_name)).collect();
            if others_with_same_name.len() != others.len() {
                continue; // pool must exist in every other list
            }
            let intersected = pool.intersection(others_with_same_name);
            if intersected.has_datasets() {
                result.add_pool(intersected).expect("unique pool names");
            }
        }
        result
    }
}

impl PartialEq for PoolList {
    fn eq(&self, other: &Self) -> bool {
        self.pools == other.pools
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::tests_support::{make_dataset, make_pool_list, pop_random_snapshot};

    #[test]
    fn difference_and_intersection_partition_snapshots() {
        let a = make_pool_list(2, 2, 5);
        let mut b = a.clone();
        pop_random_snapshot(&mut b);

        let diff = a.difference([&b]);
        let inter = a.intersection([&b]);

        let diff_paths: std::collections::BTreeSet<_> = diff.iter_snapshots().map(|s| s.zfs_path.clone()).collect();
        let inter_paths: std::collections::BTreeSet<_> = inter.iter_snapshots().map(|s| s.zfs_path.clone()).collect();
        let all_paths: std::collections::BTreeSet<_> = a.iter_snapshots().map(|s| s.zfs_path.clone()).collect();

        assert!(diff_paths.is_disjoint(&inter_paths));
        let union: std::collections::BTreeSet<_> = diff_paths.union(&inter_paths).cloned().collect();
        assert_eq!(union, all_paths);
    }

    #[test]
    fn view_allocates_fresh_snapshots() {
        let a = make_dataset("tank", "home", 3);
        let mut list = PoolList::new();
        list.add_dataset(a).unwrap();
        let view = list.view();
        assert_eq!(view, list);
    }
}
