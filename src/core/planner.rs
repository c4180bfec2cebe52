// SPDX-License-Identifier: Apache-2.0
//! The planner (§4.7): pure transformations over already-scanned
//! `PoolList`s. Never talks to the command or filesystem layers.

use std::collections::BTreeMap;

use super::chain::{build_incremental_snapshot_refs, find_snapshot_holes_of_dataset, get_incremental_children};
use super::dataset::Dataset;
use super::names;
use super::pool::Pool;
use super::poollist::PoolList;
use super::set_ops::SetOps;
use super::snapshot::Snapshot;
use crate::error::PlanError;
use crate::targetfs::TargetHandle;

/// The next snapshot in `prefix`'s managed chain for a single dataset.
pub fn next_backup_snapshot_for_dataset(dataset: &Dataset, prefix: &str) -> Snapshot {
    let mut backups: Vec<&Snapshot> = dataset
        .snapshots
        .values()
        .filter(|s| names::parse_backup_snapshot(&s.snapshot_name).map(|(p, _)| p == prefix).unwrap_or(false))
        .collect();

    if backups.is_empty() {
        return Snapshot::new(&dataset.pool_name, &dataset.dataset_name, names::format_backup_snapshot(prefix, 0));
    }

    backups = Dataset::sort_snapshots(backups);
    let last = backups.last().expect("non-empty");
    let (_, last_index) = names::parse_backup_snapshot(&last.snapshot_name).expect("filtered to managed names");

    let mut next = Snapshot::new(&dataset.pool_name, &dataset.dataset_name, names::format_backup_snapshot(prefix, last_index + 1));
    next.set_incremental_base((*last).clone());
    next
}

/// Produce, for each dataset in `source`, the single next snapshot in
/// the managed chain for `prefix`. A dataset is omitted entirely if the
/// same dataset in `skip` has any snapshots (a repair is already pending
/// for it).
pub fn next_backup_view(source: &PoolList, prefix: &str, skip: Option<&PoolList>) -> Result<PoolList, PlanError> {
    let mut backup_view = PoolList::new();
    for dataset in source.iter_datasets() {
        if let Some(skip) = skip {
            if let Ok(skip_dataset) = skip.get_dataset_by_path(&dataset.zfs_path) {
                if skip_dataset.has_snapshots() {
                    continue;
                }
            }
        }
        let next = next_backup_snapshot_for_dataset(dataset, prefix);
        backup_view.add_dataset({
            let mut d = Dataset::new(&dataset.pool_name, &dataset.dataset_name);
            d.add_snapshot(next)?;
            d
        })?;
    }
    backup_view.drop_empty_datasets();
    Ok(backup_view)
}

/// Compute the snapshots missing on `target_pools` relative to
/// `source_pools`, including child snapshots that would have to be
/// deleted first to restore a missing base. In incremental-only mode,
/// trims to just the last missing snapshot per dataset when the target
/// already has a snapshot that is an incremental child of it.
pub fn find_repairable_snapshots(source_pools: &PoolList, target_pools: &PoolList, incremental_only: bool) -> Result<PoolList, PlanError> {
    let mut repair_diff = source_pools.difference([target_pools]);

    if incremental_only {
        for pool in repair_diff.pools.values_mut() {
            for dataset in pool.datasets.values_mut() {
                let ordered: Vec<String> = dataset.iter_snapshots().map(|s| s.zfs_path.clone()).collect();
                let last_path = match ordered.last() {
                    Some(p) => p.clone(),
                    None => continue,
                };
                for path in &ordered[..ordered.len() - 1] {
                    dataset.remove_snapshot(path)?;
                }
                let last_snapshot = dataset.get_snapshot(&last_path).expect("just kept").clone();

                if let Ok(target_dataset) = target_pools.get_dataset_by_path(&dataset.zfs_path) {
                    let mut combined = Dataset::merge(&dataset.pool_name, &dataset.dataset_name, [&*dataset, target_dataset])?;
                    build_incremental_snapshot_refs(&mut combined);
                    let logical_children = get_incremental_children(&combined, &last_snapshot);
                    let existing_children = target_dataset.intersection([&logical_children]);
                    if existing_children.has_snapshots() {
                        dataset.remove_snapshot(&last_path)?;
                    }
                }
            }
        }
    }

    let mut full_repair = PoolList::new();
    for pool in repair_diff.pools.values() {
        let mut full_pool = Pool::new(&pool.pool_name);
        for dataset in pool.datasets.values() {
            if !dataset.has_snapshots() {
                full_pool.add_dataset(dataset.copy())?;
                continue;
            }
            let last_path = dataset.iter_snapshots().last().expect("has_snapshots").zfs_path.clone();
            let last_snapshot = dataset.get_snapshot(&last_path).expect("just read").clone();

            match target_pools.get_dataset_by_path(&dataset.zfs_path) {
                Ok(target_dataset) => {
                    let incremental_children = get_incremental_children(target_dataset, &last_snapshot);
                    let merged = Dataset::merge(&dataset.pool_name, &dataset.dataset_name, [dataset, &incremental_children])?;
                    full_pool.add_dataset(merged)?;
                }
                Err(_) => {
                    full_pool.add_dataset(dataset.clone())?;
                }
            }
        }
        full_repair.add_pool(full_pool)?;
    }
    full_repair.build_incremental_snapshot_refs();
    Ok(full_repair)
}

/// For every dataset in `repair` whose first (chain-order) snapshot is
/// not an `initial`, the snapshots on `complete_target` between that
/// snapshot's incremental base and the chain's end — these would make
/// `recv` either abort or silently skip the restore.
///
/// `complete_target` must carry a `creation_time` on every snapshot
/// unless `skip_sortability` is set (e.g. filesystem-based storage that
/// cannot supply one).
pub fn find_conflicting_intermediate_snapshots(repair: &PoolList, complete_target: &PoolList, skip_sortability: bool) -> Result<PoolList, PlanError> {
    if !skip_sortability && !complete_target.iter_snapshots().all(|s| s.has_creation_time()) {
        return Err(PlanError::Invariant("all snapshots must have a creation time".to_string()));
    }

    let mut conflicting = PoolList::new();
    for dataset in repair.iter_datasets() {
        let target_dataset = match complete_target.get_dataset_by_path(&dataset.zfs_path) {
            Ok(d) => d,
            Err(_) => continue,
        };
        let first = match dataset.iter_snapshots().next() {
            Some(s) => s,
            None => continue,
        };
        if names::is_initial(&first.snapshot_name) {
            // No incremental base to anchor on; see find_initial_conflicting_snapshots.
            continue;
        }
        let base = first.get_incremental_base().ok_or_else(|| {
            PlanError::Invariant(format!("non-initial repair snapshot '{}' has no incremental base", first.zfs_path))
        })?;
        let potential = get_incremental_children(target_dataset, base);
        conflicting.add_dataset(potential)?;
    }
    Ok(conflicting)
}

/// Target datasets that already exist where an initial-snapshot restore
/// would land: hard conflicts requiring a whole-dataset rename/delete.
pub fn find_initial_conflicting_snapshots(repair: &PoolList, complete_target: &PoolList) -> Result<PoolList, PlanError> {
    let mut hard_conflicts = PoolList::new();
    for snapshot in repair.iter_snapshots() {
        if !names::is_initial(&snapshot.snapshot_name) {
            continue;
        }
        if let Ok(target_dataset) = complete_target.get_dataset_by_path(&snapshot.dataset_zfs_path) {
            hard_conflicts.add_dataset(target_dataset.clone())?;
        }
    }
    Ok(hard_conflicts)
}

/// Datasets in `restore_source` whose `prefix` chain has a gap: these
/// cannot be restored because the full A->B->C chain is unavailable.
pub fn find_restore_chain_holes(restore_source: &PoolList, prefix: &str) -> Result<PoolList, PlanError> {
    let mut holes = PoolList::new();
    for dataset in restore_source.iter_datasets() {
        holes.add_dataset(find_snapshot_holes_of_dataset(dataset, prefix))?;
    }
    holes.drop_empty_datasets();
    Ok(holes)
}

/// Enumerate each needed snapshot of `logical_pools` in chain order,
/// paired with the list of `(host, target_path)` candidates it can be
/// streamed from. Fails with [`PlanError::Planning`] if any snapshot has
/// no candidate source.
pub fn map_snapshots_to_data_sources<'a>(
    logical_pools: &PoolList,
    data_sources: &'a BTreeMap<TargetHandle, PoolList>,
) -> Result<Vec<(Snapshot, Vec<&'a TargetHandle>)>, PlanError> {
    let mut mapping = Vec::new();
    for dataset in logical_pools.iter_datasets() {
        let mut sources_by_path: BTreeMap<String, Vec<&TargetHandle>> = BTreeMap::new();
        for (handle, remote_pools) in data_sources {
            let remote_dataset = match remote_pools.get_dataset_by_path(&dataset.zfs_path) {
                Ok(d) => d,
                Err(_) => continue,
            };
            for snapshot in remote_dataset.intersection([dataset]).snapshots.values() {
                sources_by_path.entry(snapshot.zfs_path.clone()).or_default().push(handle);
            }
        }
        for snapshot in dataset.iter_snapshots() {
            let sources = sources_by_path.remove(&snapshot.zfs_path).unwrap_or_default();
            if sources.is_empty() {
                return Err(PlanError::Planning(format!(
                    "snapshot '{}' missing on remote side; repair remote before restoring",
                    snapshot.zfs_path
                )));
            }
            mapping.push((snapshot.clone(), sources));
        }
    }
    Ok(mapping)
}

/// Result of [`plan_restore`].
pub struct RestorePlan<'a> {
    /// The de-shifted, conflict-closed set of snapshots that must be
    /// received, targeted at the original (remote) paths.
    pub repair: PoolList,
    /// Snapshots blocking the restore unless `force` is set.
    pub conflicting: PoolList,
    /// Each needed snapshot mapped to its candidate data sources.
    pub sources: Vec<(Snapshot, Vec<&'a TargetHandle>)>,
}

/// Compose a conflict-free restore plan.
///
/// 1. `expected` = every remote source merged, then shifted under
///    `restore_prefix`.
/// 2. `repair` = what's missing locally under the restore target.
/// 3. `find_initial_conflicting_snapshots` against `local` first: a
///    dataset already sitting where an initial restore would land is a
///    hard conflict no amount of `force` can resolve by deleting
///    snapshots, so this aborts unconditionally.
/// 4. For each dataset in `repair`, the anchor is its first snapshot;
///    merge it with the fully-available remote dataset *and* whatever
///    `local` already holds at that path (three-way, matching the
///    original tool's `DataSet.merge(fully_available, current_local)`),
///    rebuild incremental-base links over the merge (merging strips
///    them), and take the anchor's incremental children from that.
/// 5. `find_conflicting_intermediate_snapshots` against each dataset's
///    resolved anchor and `local` finds any of those children (managed
///    or foreign) already sitting locally; `force` decides whether
///    they're scheduled for deletion (returned to the caller, never
///    deleted here) or whether planning aborts.
/// 6. Combine `repair` with the children closure, de-shift back to the
///    original paths, and map each snapshot to its candidate sources.
pub fn plan_restore<'a>(
    remote_sources: &'a BTreeMap<TargetHandle, PoolList>,
    local: &PoolList,
    restore_prefix: &str,
    force: bool,
) -> Result<RestorePlan<'a>, PlanError> {
    let all_remote = PoolList::merge(remote_sources.values())?;
    let expected = shift_pool_list(&all_remote, restore_prefix, false);

    let merged = PoolList::merge([local, &expected])?;
    let repair = merged.difference([local]);

    let initial_conflicts = find_initial_conflicting_snapshots(&repair, local)?;
    if initial_conflicts.has_snapshots() {
        return Err(PlanError::Conflict(format!(
            "{} dataset(s) already exist where an initial-snapshot restore would land; rename or remove them first",
            initial_conflicts.iter_datasets().count()
        )));
    }

    let mut closure = PoolList::new();
    let mut anchored_repair = PoolList::new();
    for dataset in repair.iter_datasets() {
        let anchor = match dataset.iter_snapshots().next() {
            Some(s) => s.clone(),
            None => continue,
        };
        let available = expected.get_dataset_by_path(&dataset.zfs_path).map_err(|_| {
            PlanError::Planning(format!("dataset '{}' not available from any remote source", dataset.zfs_path))
        })?;
        let local_dataset = local.get_dataset_by_path(&dataset.zfs_path).ok();
        let mut combined = match local_dataset {
            Some(ld) => Dataset::merge(&dataset.pool_name, &dataset.dataset_name, [dataset, available, ld])?,
            None => Dataset::merge(&dataset.pool_name, &dataset.dataset_name, [dataset, available])?,
        };
        build_incremental_snapshot_refs(&mut combined);
        let anchor = combined.get_snapshot(&anchor.zfs_path).cloned().unwrap_or(anchor);
        let children = get_incremental_children(&combined, &anchor);

        // every needed intermediate snapshot must exist remotely
        for snapshot in children.iter_snapshots() {
            if available.get_snapshot(&snapshot.zfs_path).is_none() && snapshot.zfs_path != anchor.zfs_path {
                return Err(PlanError::Planning(format!(
                    "snapshot '{}' needed to restore '{}' is not available remotely",
                    snapshot.zfs_path, dataset.zfs_path
                )));
            }
        }

        closure.add_dataset(children)?;

        if !names::is_initial(&anchor.snapshot_name) {
            let mut anchor_only = Dataset::new(&dataset.pool_name, &dataset.dataset_name);
            anchor_only.add_snapshot(anchor)?;
            anchored_repair.add_dataset(anchor_only)?;
        }
    }

    let intermediate_conflicts = find_conflicting_intermediate_snapshots(&anchored_repair, local, true)?;
    let mut conflicting = PoolList::new();
    if intermediate_conflicts.has_snapshots() {
        if !force {
            return Err(PlanError::Conflict(format!(
                "{} snapshot(s) already exist locally in the restore path; pass force to delete them",
                intermediate_conflicts.iter_snapshots().count()
            )));
        }
        conflicting = intermediate_conflicts;
    }

    let combined_repair = PoolList::merge([&repair, &closure])?;
    let deshifted = shift_pool_list(&combined_repair, restore_prefix, true);
    let sources = map_snapshots_to_data_sources(&deshifted, remote_sources)?;

    Ok(RestorePlan { repair: deshifted, conflicting, sources })
}

fn shift_pool_list(pools: &PoolList, prefix: &str, deshift: bool) -> PoolList {
    let mut shifted = PoolList::new();
    for pool in pools.pools.values() {
        for dataset in pool.datasets.values() {
            // unreachable: zfs_path uniqueness preserved by construction
            shifted.add_dataset(dataset.prefixed_view(prefix, deshift)).expect("unreachable");
        }
    }
    shifted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::tests_support::make_dataset;
    use chrono::{TimeZone, Utc};

    #[test]
    fn next_backup_is_initial_for_empty_dataset() {
        let d = Dataset::new("tank", "home");
        let next = next_backup_snapshot_for_dataset(&d, "nightly");
        assert_eq!(next.snapshot_name, "nightly_initial");
        assert!(!next.has_incremental_base());
    }

    #[test]
    fn next_backup_chains_from_last() {
        let mut d = Dataset::new("tank", "home");
        d.add_snapshot(Snapshot::new("tank", "home", "nightly_initial")).unwrap();
        d.add_snapshot(Snapshot::new("tank", "home", "nightly_1")).unwrap();
        let next = next_backup_snapshot_for_dataset(&d, "nightly");
        assert_eq!(next.snapshot_name, "nightly_2");
        assert_eq!(next.get_incremental_base().unwrap().snapshot_name, "nightly_1");
    }

    // S5: next-backup skip.
    #[test]
    fn next_backup_view_skips_dataset_pending_repair() {
        let mut source = PoolList::new();
        source.add_dataset(make_dataset_with_chain("tank", "one", 2)).unwrap();
        source.add_dataset(make_dataset_with_chain("tank", "two", 2)).unwrap();

        let mut skip = PoolList::new();
        let mut skip_dataset = Dataset::new("tank", "one");
        skip_dataset.add_snapshot(Snapshot::new("tank", "one", "p_3")).unwrap();
        skip.add_dataset(skip_dataset).unwrap();

        let view = next_backup_view(&source, "p", Some(&skip)).unwrap();
        assert!(view.get_dataset_by_path("tank/one").is_err());
        let two = view.get_dataset_by_path("tank/two").unwrap();
        let next = two.iter_snapshots().next().unwrap();
        assert_eq!(next.snapshot_name, "p_3");
        assert_eq!(next.get_incremental_base().unwrap().snapshot_name, "p_2");
    }

    fn make_dataset_with_chain(pool: &str, dataset: &str, last_index: u64) -> Dataset {
        let mut d = Dataset::new(pool, dataset);
        for i in 0..=last_index {
            d.add_snapshot(Snapshot::new(pool, dataset, names::format_backup_snapshot("p", i))).unwrap();
        }
        d
    }

    #[test]
    fn repairable_snapshots_is_the_missing_diff() {
        let mut source = PoolList::new();
        source.add_dataset(make_dataset_with_chain("tank", "home", 2)).unwrap();

        let mut target = PoolList::new();
        let mut target_dataset = Dataset::new("tank", "home");
        target_dataset.add_snapshot(Snapshot::new("tank", "home", "p_initial")).unwrap();
        target.add_dataset(target_dataset).unwrap();

        let repair = find_repairable_snapshots(&source, &target, false).unwrap();
        let names: Vec<_> = repair.get_dataset_by_path("tank/home").unwrap().iter_snapshots().map(|s| s.snapshot_name.clone()).collect();
        assert_eq!(names, vec!["p_1", "p_2"]);
    }

    #[test]
    fn dataset_helper_is_usable_from_tests_support() {
        let d = make_dataset("tank", "home", 3);
        assert_eq!(d.snapshots.len(), 3);
    }

    fn remote_with_chain(last_index: u64) -> BTreeMap<TargetHandle, PoolList> {
        let mut remote = PoolList::new();
        remote.add_dataset(make_dataset_with_chain("tank", "home", last_index)).unwrap();
        remote.build_incremental_snapshot_refs();
        let mut sources = BTreeMap::new();
        sources.insert(TargetHandle::new(None, "/backups"), remote);
        sources
    }

    // S6: restore planning, no conflicts. Local already holds p_initial
    // and p_1 under the restore prefix; only p_2 is missing.
    #[test]
    fn plan_restore_pulls_only_the_missing_snapshot() {
        let remote_sources = remote_with_chain(2);

        let mut local = PoolList::new();
        let mut restored_home = Dataset::new("restored", "tank/home");
        restored_home.add_snapshot(Snapshot::new("restored", "tank/home", "p_initial")).unwrap();
        let mut p1 = Snapshot::new("restored", "tank/home", "p_1");
        p1.set_incremental_base(Snapshot::new("restored", "tank/home", "p_initial"));
        restored_home.add_snapshot(p1).unwrap();
        local.add_dataset(restored_home).unwrap();

        let plan = plan_restore(&remote_sources, &local, "restored/", false).unwrap();

        let names: Vec<_> = plan.repair.iter_snapshots().map(|s| s.zfs_path.clone()).collect();
        assert_eq!(names, vec!["tank/home@p_2"]);
        assert!(!plan.conflicting.has_snapshots());
        assert_eq!(plan.sources.len(), 1);
        assert_eq!(plan.sources[0].0.zfs_path, "tank/home@p_2");
        assert_eq!(plan.sources[0].1, vec![&TargetHandle::new(None, "/backups")]);
    }

    // S6: a foreign snapshot created between p_1 and p_2 is an
    // incremental child of the repair anchor's base and so would block a
    // raw `zfs receive` of the repair chain.
    #[test]
    fn conflicting_intermediate_snapshots_finds_foreign_snapshot_between_base_and_now() {
        let mut repair = PoolList::new();
        let mut repair_home = Dataset::new("tank", "home");
        let mut p2 = Snapshot::new("tank", "home", "p_2");
        p2.set_incremental_base(Snapshot::new("tank", "home", "p_1"));
        repair_home.add_snapshot(p2).unwrap();
        repair.add_dataset(repair_home).unwrap();

        let mut target = PoolList::new();
        let mut target_home = Dataset::new("tank", "home");
        target_home
            .add_snapshot(Snapshot::new("tank", "home", "p_initial").with_creation_time(Utc.timestamp_opt(1_000, 0).unwrap()))
            .unwrap();
        target_home
            .add_snapshot(Snapshot::new("tank", "home", "p_1").with_creation_time(Utc.timestamp_opt(2_000, 0).unwrap()))
            .unwrap();
        target_home
            .add_snapshot(Snapshot::new("tank", "home", "X").with_creation_time(Utc.timestamp_opt(2_500, 0).unwrap()))
            .unwrap();
        target.add_dataset(target_home).unwrap();

        let conflicting = find_conflicting_intermediate_snapshots(&repair, &target, false).unwrap();
        let names: Vec<_> = conflicting.get_dataset_by_path("tank/home").unwrap().iter_snapshots().map(|s| s.snapshot_name.clone()).collect();
        assert_eq!(names, vec!["X"]);
    }

    #[test]
    fn initial_conflicting_snapshots_flags_dataset_already_present() {
        let mut repair = PoolList::new();
        let mut repair_home = Dataset::new("tank", "home");
        repair_home.add_snapshot(Snapshot::new("tank", "home", "p_initial")).unwrap();
        repair.add_dataset(repair_home).unwrap();

        let mut target = PoolList::new();
        target.add_dataset(make_dataset_with_chain("tank", "home", 1)).unwrap();

        let hard_conflicts = find_initial_conflicting_snapshots(&repair, &target).unwrap();
        assert!(hard_conflicts.get_dataset_by_path("tank/home").is_ok());
    }

    // S6: local holds a foreign snapshot X between p_1 and p_2 (by
    // creation_time); plan_restore itself must flag it as conflicting,
    // not just the standalone find_conflicting_intermediate_snapshots.
    #[test]
    fn plan_restore_flags_foreign_local_snapshot_as_conflicting() {
        let remote_sources = remote_with_chain(2);

        let mut local = PoolList::new();
        let mut restored_home = Dataset::new("restored", "tank/home");
        restored_home
            .add_snapshot(Snapshot::new("restored", "tank/home", "p_initial").with_creation_time(Utc.timestamp_opt(1_000, 0).unwrap()))
            .unwrap();
        restored_home
            .add_snapshot(Snapshot::new("restored", "tank/home", "p_1").with_creation_time(Utc.timestamp_opt(2_000, 0).unwrap()))
            .unwrap();
        restored_home
            .add_snapshot(Snapshot::new("restored", "tank/home", "X").with_creation_time(Utc.timestamp_opt(2_500, 0).unwrap()))
            .unwrap();
        local.add_dataset(restored_home).unwrap();

        let err = plan_restore(&remote_sources, &local, "restored/", false).unwrap_err();
        assert!(matches!(err, PlanError::Conflict(_)));

        let plan = plan_restore(&remote_sources, &local, "restored/", true).unwrap();
        let conflict_names: Vec<_> = plan.conflicting.iter_snapshots().map(|s| s.snapshot_name.clone()).collect();
        assert_eq!(conflict_names, vec!["X"]);
    }

    // An initial-snapshot restore landing on a dataset that already
    // exists locally (even with unrelated content) is a hard conflict:
    // no amount of `force` resolves it by deleting individual snapshots.
    #[test]
    fn plan_restore_aborts_on_initial_restore_into_existing_dataset() {
        let remote_sources = remote_with_chain(1);

        let mut local = PoolList::new();
        let mut restored_home = Dataset::new("restored", "tank/home");
        restored_home.add_snapshot(Snapshot::new("restored", "tank/home", "Y")).unwrap();
        local.add_dataset(restored_home).unwrap();

        let err = plan_restore(&remote_sources, &local, "restored/", true).unwrap_err();
        assert!(matches!(err, PlanError::Conflict(_)));
    }
}
