// SPDX-License-Identifier: Apache-2.0
//! Configuration: the snapshot prefix, the source pool to back up, and
//! the list of targets to back up to.

use std::fs::File;
use std::path::Path;

use anyhow::Result;
use serde::Deserialize;

use crate::orchestrator::Orchestrator;
use crate::targetfs::{ShellTargetFs, TargetFs, TargetHandle};
use crate::volume::{SshZfsVolumeManager, VolumeManager};

#[derive(Debug, Deserialize)]
pub struct ConfigFile {
    /// Prefix every managed snapshot name carries, e.g. `"p"` for
    /// `p_initial`, `p_1`, `p_2`, ...
    pub prefix: String,
    pub source: SourceConfig,
    pub targets: Vec<TargetConfig>,
}

#[derive(Debug, Deserialize)]
pub struct SourceConfig {
    /// `None` for the local machine, `Some(host)` to scan and send over
    /// ssh to `host`.
    pub host: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TargetConfig {
    pub host: Option<String>,
    pub path: String,
}

impl ConfigFile {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<ConfigFile> {
        Ok(serde_yaml::from_reader(File::open(path)?)?)
    }

    /// Build the orchestrator this config describes: one volume manager
    /// for the source, one target filesystem per configured target.
    pub fn build_orchestrator(&self) -> Result<Orchestrator> {
        let volumes: Box<dyn VolumeManager> = Box::new(SshZfsVolumeManager::new(self.source.host.clone()));

        let targets: Vec<Box<dyn TargetFs>> = self
            .targets
            .iter()
            .map(|t| {
                let handle = TargetHandle::new(t.host.clone(), t.path.clone());
                Box::new(ShellTargetFs::new(handle)) as Box<dyn TargetFs>
            })
            .collect();

        Ok(Orchestrator::new(volumes, targets, self.prefix.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_minimal_config() {
        let yaml = "
prefix: p
source:
  host: null
targets:
  - host: backup-host
    path: /backups/tank
  - host: null
    path: /mnt/second
";
        let config: ConfigFile = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.prefix, "p");
        assert_eq!(config.source.host, None);
        assert_eq!(config.targets.len(), 2);
        assert_eq!(config.targets[0].host.as_deref(), Some("backup-host"));
        assert_eq!(config.targets[1].host, None);
    }
}
