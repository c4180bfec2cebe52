// SPDX-License-Identifier: Apache-2.0
//! Structured errors for the planning core.
//!
//! Command-layer and filesystem-layer failures are surfaced verbatim via
//! `anyhow`; the planner itself returns one of these so callers can match
//! on the semantic kind instead of parsing a message.

use thiserror::Error;

/// The kinds of failure the planning core can report.
#[derive(Debug, Error)]
pub enum PlanError {
    /// A snapshot name could not be decoded under the managed naming
    /// scheme. Normally swallowed by the planner (foreign snapshots are
    /// just ignored), surfaced only where parsing was explicitly
    /// requested.
    #[error("cannot parse snapshot name '{0}' as a managed backup snapshot")]
    Parse(String),

    /// A zfs-path lookup (pool, dataset, snapshot) missed.
    #[error("'{0}' not found")]
    Resolve(String),

    /// Attempted to add a child whose identity already exists, or whose
    /// pool/dataset does not match the container it is being added to.
    #[error("cannot add '{0}': {1}")]
    Add(String, String),

    /// An invariant the core relies on does not hold: creation times
    /// required but absent, a merge of differently-named entities, or
    /// (should it ever happen) a cycle in the incremental-base chain.
    #[error("invariant violated: {0}")]
    Invariant(String),

    /// A restore needs a snapshot that no candidate data source has.
    #[error("restore planning failed: {0}")]
    Planning(String),

    /// Local or remote state would make an operation destructive or
    /// infeasible without explicit confirmation (`force`).
    #[error("conflict: {0}")]
    Conflict(String),
}

pub type PlanResult<T> = Result<T, PlanError>;
