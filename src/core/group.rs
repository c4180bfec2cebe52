// SPDX-License-Identifier: Apache-2.0
//! Target grouper (§4.8): given a per-target map of what each destination
//! needs, partition the needed snapshots so that destinations sharing an
//! identical sub-payload are grouped together — a single outgoing stream
//! can then be `tee`d to every destination in a group instead of
//! re-reading the source once per destination.
//!
//! Single pass, target-sorted, greedy (open question (c) in DESIGN.md):
//! a remainder emitted back into the working set is not re-iterated
//! against groups formed earlier in the same pass. That is the legacy
//! behavior this was distilled from, not the stricter "maximal sharing"
//! packing a second pass would produce.

use super::poollist::PoolList;
use super::set_ops::SetOps;

/// One partition of the grouping: the destinations that share this exact
/// sub-payload, and the payload itself.
pub struct TargetGroup<H> {
    pub targets: Vec<H>,
    pub pools: PoolList,
}

/// Partition `targets` (a target identifier paired with the `PoolList` it
/// needs) so that every snapshot ends up in exactly one group, keyed by
/// the set of destinations that need it.
///
/// Callers that need deterministic output should pass `targets` already
/// sorted by `H` — every production call site keys by `TargetHandle`
/// (`Ord`), so this is simply "iterate a `BTreeMap`".
pub fn group_target_paths<H: Clone>(targets: &[(H, PoolList)]) -> Vec<TargetGroup<H>> {
    let mut groups: Vec<TargetGroup<H>> = Vec::new();

    for (handle, pools) in targets {
        let mut remaining = pools.clone();
        let mut new_groups: Vec<TargetGroup<H>> = Vec::new();

        for mut group in groups.drain(..) {
            let shared = group.pools.intersection([&remaining]);
            if !shared.has_snapshots() {
                new_groups.push(group);
                continue;
            }
            remaining = remaining.difference([&shared]);
            let leftover = group.pools.difference([&shared]);
            if leftover.has_snapshots() {
                new_groups.push(TargetGroup { targets: group.targets.clone(), pools: leftover });
            }
            group.targets.push(handle.clone());
            new_groups.push(TargetGroup { targets: group.targets, pools: shared });
        }
        groups = new_groups;

        if remaining.has_snapshots() {
            groups.push(TargetGroup { targets: vec![handle.clone()], pools: remaining });
        }
    }

    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::tests_support::make_dataset;
    use crate::core::Dataset;

    fn pools_from(datasets: Vec<Dataset>) -> PoolList {
        let mut pools = PoolList::new();
        for dataset in datasets {
            pools.add_dataset(dataset).unwrap();
        }
        pools
    }

    #[test]
    fn disjoint_payloads_stay_in_separate_groups() {
        let a = pools_from(vec![make_dataset("tank", "home", 2)]);
        let b = pools_from(vec![make_dataset("tank", "var", 2)]);
        let groups = group_target_paths(&[("a", a), ("b", b)]);
        assert_eq!(groups.len(), 2);
    }

    #[test]
    fn identical_payloads_collapse_into_one_group() {
        let a = pools_from(vec![make_dataset("tank", "home", 2)]);
        let b = a.clone();
        let groups = group_target_paths(&[("a", a), ("b", b)]);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].targets.len(), 2);
    }

    #[test]
    fn partial_overlap_splits_into_shared_and_exclusive_groups() {
        // a needs {p_initial, p_1}, b needs {p_initial} only: shared =
        // {p_initial} (both), a keeps its exclusive p_1.
        let a_full = make_dataset("tank", "home", 2);
        let mut b_dataset = Dataset::new("tank", "home");
        b_dataset.add_snapshot(a_full.get_snapshot("tank/home@p_initial").unwrap().clone()).unwrap();

        let groups = group_target_paths(&[("a", pools_from(vec![a_full])), ("b", pools_from(vec![b_dataset]))]);

        let mut seen = std::collections::BTreeSet::new();
        for group in &groups {
            for snapshot in group.pools.iter_snapshots() {
                assert!(seen.insert(snapshot.zfs_path.clone()), "snapshot in more than one group");
            }
        }
        assert!(seen.contains("tank/home@p_initial"));
        assert!(seen.contains("tank/home@p_1"));

        let p1_group = groups.iter().find(|g| g.pools.iter_snapshots().any(|s| s.snapshot_name == "p_1")).unwrap();
        assert_eq!(p1_group.targets, vec!["a"]);
        let initial_group = groups.iter().find(|g| g.pools.iter_snapshots().any(|s| s.snapshot_name == "p_initial")).unwrap();
        assert_eq!(initial_group.targets.len(), 2);
    }

    #[test]
    fn every_snapshot_belongs_to_exactly_one_group() {
        let a = pools_from(vec![make_dataset("tank", "home", 3)]);
        let mut b = a.clone();
        b.pools.get_mut("tank").unwrap().datasets.get_mut("tank/home").unwrap().remove_snapshot("tank/home@p_2").unwrap();
        let c = pools_from(vec![make_dataset("tank", "var", 1)]);

        let groups = group_target_paths(&[("a", a.clone()), ("b", b), ("c", c)]);

        let mut seen = std::collections::BTreeSet::new();
        for group in &groups {
            for snapshot in group.pools.iter_snapshots() {
                assert!(seen.insert(snapshot.zfs_path.clone()));
            }
        }
        let all: std::collections::BTreeSet<_> = a.iter_snapshots().map(|s| s.zfs_path.clone()).collect();
        for path in &all {
            assert!(seen.contains(path));
        }
    }
}
