// SPDX-License-Identifier: Apache-2.0
//! Randomized dataset/pool-list builders shared by the core module's unit
//! tests. Mirrors the fixtures the legacy Python test suite built by hand.

use rand::seq::IteratorRandom;
use rand::Rng;

use super::dataset::Dataset;
use super::pool::Pool;
use super::poollist::PoolList;
use super::snapshot::Snapshot;

/// A dataset `{pool_name}/{dataset_name}` with `snapshot_count` snapshots
/// named `p_initial`, `p_1`, ... `p_{n-1}`, chained in order.
pub fn make_dataset(pool_name: &str, dataset_name: &str, snapshot_count: u64) -> Dataset {
    let mut dataset = Dataset::new(pool_name, dataset_name);
    let mut previous: Option<Snapshot> = None;
    for index in 0..snapshot_count {
        let mut snapshot = Snapshot::new(pool_name, dataset_name, super::names::format_backup_snapshot("p", index));
        if let Some(base) = &previous {
            snapshot.set_incremental_base(base.clone());
        }
        previous = Some(snapshot.clone());
        dataset.add_snapshot(snapshot).expect("unique by construction");
    }
    dataset
}

/// A pool named `pool_name` with `dataset_count` datasets, each built by
/// [`make_dataset`].
pub fn make_pool(pool_name: &str, dataset_count: u64, snapshot_count: u64) -> Pool {
    let mut pool = Pool::new(pool_name);
    for i in 0..dataset_count {
        pool.add_dataset(make_dataset(pool_name, &format!("dataset{}", i), snapshot_count))
            .expect("unique by construction");
    }
    pool
}

/// A pool list with `pool_count` pools, each built by [`make_pool`].
pub fn make_pool_list(pool_count: u64, dataset_count: u64, snapshot_count: u64) -> PoolList {
    let mut pool_list = PoolList::new();
    for i in 0..pool_count {
        pool_list
            .add_pool(make_pool(&format!("pool{}", i), dataset_count, snapshot_count))
            .expect("unique by construction");
    }
    pool_list
}

/// Remove a uniformly random snapshot from a uniformly random non-empty
/// dataset in `pool_list`, returning it. Used to build an "almost
/// identical" counterpart for difference/intersection property tests.
pub fn pop_random_snapshot(pool_list: &mut PoolList) -> Snapshot {
    let mut rng = rand::thread_rng();
    let dataset_path = pool_list
        .iter_datasets()
        .filter(|d| d.has_snapshots())
        .map(|d| d.zfs_path.clone())
        .choose(&mut rng)
        .expect("pool list has at least one non-empty dataset");

    let pool_name = dataset_path.split('/').next().unwrap().to_string();
    let pool = pool_list.pools.get_mut(&pool_name).expect("just read");
    let dataset = pool.datasets.get_mut(&dataset_path).expect("just read");

    let snapshot_path = dataset.snapshots.keys().choose(&mut rng).cloned().expect("has_snapshots");
    dataset.remove_snapshot(&snapshot_path).expect("path came from this dataset")
}

/// A uniformly random u64 in `0..bound`, used where the Python fixtures
/// picked a random index.
pub fn random_index(bound: u64) -> u64 {
    rand::thread_rng().gen_range(0..bound)
}
