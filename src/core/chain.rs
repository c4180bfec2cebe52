// SPDX-License-Identifier: Apache-2.0
//! Chain builder (§4.4), hole finder (§4.5), and incremental-children
//! (§4.6): the three operations that reason about a dataset's forest of
//! incremental-base links.

use std::collections::BTreeSet;

use super::dataset::Dataset;
use super::names;
use super::snapshot::Snapshot;

/// Assign `incremental_base` links in place, one pass over chain order
/// per distinct prefix.
///
/// A hole at index `k` leaves the snapshot at `k+1` baseless until the
/// hole is filled and this is rerun. A lone `p_1` with no `p_initial`
/// stays baseless forever — chains are rooted by `initial` only (see
/// DESIGN.md, open question (a)).
pub fn build_incremental_snapshot_refs(dataset: &mut Dataset) {
    let ordered_paths: Vec<String> = Dataset::sort_snapshots(dataset.snapshots.values().collect())
        .into_iter()
        .map(|s| s.zfs_path.clone())
        .collect();

    let prefixes: BTreeSet<String> = ordered_paths
        .iter()
        .filter_map(|path| {
            let name = &dataset.snapshots[path].snapshot_name;
            names::parse_backup_snapshot(name).ok().map(|(prefix, _)| prefix)
        })
        .collect();

    for prefix in prefixes {
        let mut candidate_base: Option<(String, u64)> = None; // (zfs_path, index)
        for path in &ordered_paths {
            let snapshot = &dataset.snapshots[path];
            let (snap_prefix, index) = match names::parse_backup_snapshot(&snapshot.snapshot_name) {
                Ok(parsed) if parsed.0 == prefix => parsed,
                _ => continue,
            };
            if let Some((base_path, base_index)) = candidate_base.clone() {
                if base_index + 1 == index {
                    let base = dataset.snapshots[&base_path].clone();
                    dataset
                        .snapshots
                        .get_mut(path)
                        .expect("path came from this dataset")
                        .set_incremental_base(base);
                }
            }
            candidate_base = Some((path.clone(), index));
        }
    }
}

/// Holes in `prefix`'s numeric sequence: the gap between the minimum and
/// maximum present index, minus the indices actually present. Returns an
/// empty dataset if no managed snapshot of `prefix` exists at all (open
/// question (b): distinct from "no chain", but treated the same by
/// callers that only ask `has_snapshots()`).
pub fn find_snapshot_holes_of_dataset(dataset: &Dataset, prefix: &str) -> Dataset {
    let mut indices: Vec<u64> = dataset
        .snapshots
        .values()
        .filter_map(|s| names::parse_backup_snapshot(&s.snapshot_name).ok())
        .filter(|(p, _)| p == prefix)
        .map(|(_, i)| i)
        .collect();
    indices.sort_unstable();

    let mut holes = dataset.copy();
    let (lo, hi) = match (indices.first(), indices.last()) {
        (Some(lo), Some(hi)) => (*lo, *hi),
        _ => return holes,
    };
    let present: BTreeSet<u64> = indices.into_iter().collect();
    for index in lo..=hi {
        if !present.contains(&index) {
            holes
                .add_snapshot(Snapshot::new(&dataset.pool_name, &dataset.dataset_name, names::format_backup_snapshot(prefix, index)))
                .expect("synthetic snapshot is unique");
        }
    }
    holes
}

/// The sub-chain reachable from `parent`, forward: build a view, inject
/// `parent` if missing (rebuilding links), then keep only snapshots
/// strictly after `parent` whose base chain leads back to it — plus
/// `parent` itself, included so candidate/overwrite checks can see the
/// anchor.
pub fn get_incremental_children(dataset: &Dataset, parent: &Snapshot) -> Dataset {
    let mut view = dataset.view();
    if !view.contains(&parent.zfs_path) {
        view.add_snapshot(parent.view()).expect("parent not yet present");
        build_incremental_snapshot_refs(&mut view);
    }

    let ordered_paths: Vec<String> = Dataset::sort_snapshots(view.snapshots.values().collect())
        .into_iter()
        .map(|s| s.zfs_path.clone())
        .collect();

    let mut seen_parent = false;
    for path in ordered_paths {
        if !seen_parent {
            if path == parent.zfs_path {
                seen_parent = true;
            }
            view.remove_snapshot(&path).expect("path came from this view");
        }
    }
    view
}
