// SPDX-License-Identifier: Apache-2.0
//! The pure planning core (§3-§4 & §7-§8): entity model, set algebra,
//! chain/hole/children algorithms, the target grouper, and the planner
//! built on top of them. Nothing in this module touches a process, a
//! filesystem, or the network — see `crate::volume` and
//! `crate::targetfs` for the boundary traits that feed it real data.

mod chain;
mod dataset;
mod group;
mod names;
mod planner;
mod pool;
mod poollist;
mod set_ops;
mod snapshot;

#[cfg(test)]
mod tests_support;

pub use chain::{build_incremental_snapshot_refs, find_snapshot_holes_of_dataset, get_incremental_children};
pub use dataset::Dataset;
pub use group::{group_target_paths, TargetGroup};
pub use names::{format_backup_snapshot, is_initial, parse_backup_snapshot};
pub use planner::{
    find_conflicting_intermediate_snapshots, find_initial_conflicting_snapshots, find_repairable_snapshots,
    find_restore_chain_holes, map_snapshots_to_data_sources, next_backup_snapshot_for_dataset, next_backup_view,
    plan_restore, RestorePlan,
};
pub use pool::Pool;
pub use poollist::PoolList;
pub use set_ops::SetOps;
pub use snapshot::Snapshot;
