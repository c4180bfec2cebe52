// SPDX-License-Identifier: Apache-2.0
//! Incremental backup/restore planning for copy-on-write snapshot
//! datasets: a pure planning core plus the orchestration layer that
//! drives it against a real (or faked) volume manager and target
//! filesystem.

pub use anyhow::Result;

pub use config::ConfigFile;
pub use error::{PlanError, PlanResult};
pub use orchestrator::Orchestrator;
pub use targetfs::{ShellTargetFs, TargetFs, TargetHandle};
pub use volume::{ByteStream, SshZfsVolumeManager, VolumeManager};

pub mod checked;
pub mod config;
pub mod core;
mod error;
mod orchestrator;
mod targetfs;
mod volume;
