// SPDX-License-Identifier: Apache-2.0
//! `TargetFs`: the boundary between the orchestrator and a backup
//! target's storage — a local directory or an ssh-reachable host,
//! addressed uniformly by a `TargetHandle`.

use std::process::Stdio;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::checked::{host_command, CheckedExt};
use crate::volume::ByteStream;

/// Identifies one backup target: an optional ssh host plus the
/// filesystem path under it. Used as a `BTreeMap` key, so target lists
/// stay in deterministic, sorted order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct TargetHandle {
    pub host: Option<String>,
    pub path: String,
}

impl TargetHandle {
    pub fn new(host: Option<String>, path: impl Into<String>) -> TargetHandle {
        TargetHandle { host, path: path.into() }
    }
}

impl std::fmt::Display for TargetHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.host {
            Some(host) => write!(f, "{}:{}", host, self.path),
            None => write!(f, "{}", self.path),
        }
    }
}

/// The persisted layout's in-flight/final checksum filename suffixes. A
/// snapshot is *stored* only once `FINAL_DIGEST_SUFFIX` exists; until
/// then, a present `EXPECTED_DIGEST_SUFFIX` file marks it *in-flight* and
/// the next backup attempt resumes its checksum phase rather than
/// re-sending it (§6).
pub const STREAM_SUFFIX: &str = ".zstream";
pub const FINAL_DIGEST_SUFFIX: &str = ".zstream.sha256";
pub const EXPECTED_DIGEST_SUFFIX: &str = ".zstream.expected_sha256";
pub const INITIALIZED_SENTINEL: &str = "INITIALIZED";

/// Filesystem primitives the orchestrator needs against a target,
/// independent of whether the target is local or remote.
#[async_trait]
pub trait TargetFs: Send + Sync {
    fn handle(&self) -> &TargetHandle;

    async fn mkdir_p(&self, relative_path: &str) -> Result<()>;
    async fn remove_file(&self, relative_path: &str) -> Result<()>;
    async fn file_exists(&self, relative_path: &str) -> Result<bool>;
    async fn dir_exists(&self, relative_path: &str) -> Result<bool>;
    async fn list_dir(&self, relative_path: &str) -> Result<Vec<String>>;
    async fn write_small_text(&self, relative_path: &str, contents: &str) -> Result<()>;
    async fn read_small_text(&self, relative_path: &str) -> Result<String>;

    /// Stream `data` to `relative_path`, computing its SHA-256 digest as
    /// it is written (one pass, so large `.zstream` files are never read
    /// back just to verify themselves).
    async fn stream_digest(&self, relative_path: &str, data: ByteStream) -> Result<String>;

    /// Open `relative_path` for streaming reads, for restores and
    /// re-verification.
    async fn open_stream(&self, relative_path: &str) -> Result<ByteStream>;
}

/// A target addressed like the legacy scanner addressed a ZFS host:
/// direct filesystem calls when `handle.host` is `None`, ssh-wrapped
/// shell commands otherwise.
pub struct ShellTargetFs {
    handle: TargetHandle,
}

impl ShellTargetFs {
    pub fn new(handle: TargetHandle) -> ShellTargetFs {
        ShellTargetFs { handle }
    }

    fn full_path(&self, relative_path: &str) -> String {
        format!("{}/{}", self.handle.path.trim_end_matches('/'), relative_path)
    }

    async fn run(&self, args: &[&str]) -> Result<()> {
        host_command(self.handle.host.as_deref(), args).stderr(Stdio::inherit()).checked_run().await
    }

    async fn run_output(&self, args: &[&str]) -> Result<std::process::Output> {
        host_command(self.handle.host.as_deref(), args).stderr(Stdio::inherit()).checked_output().await
    }
}

#[async_trait]
impl TargetFs for ShellTargetFs {
    fn handle(&self) -> &TargetHandle {
        &self.handle
    }

    async fn mkdir_p(&self, relative_path: &str) -> Result<()> {
        let path = self.full_path(relative_path);
        match &self.handle.host {
            None => fs::create_dir_all(&path).await.with_context(|| format!("mkdir -p {}", path)),
            Some(_) => self.run(&["mkdir", "-p", path.as_str()]).await,
        }
    }

    async fn remove_file(&self, relative_path: &str) -> Result<()> {
        let path = self.full_path(relative_path);
        match &self.handle.host {
            None => fs::remove_file(&path).await.with_context(|| format!("rm {}", path)),
            Some(_) => self.run(&["rm", "-f", path.as_str()]).await,
        }
    }

    async fn file_exists(&self, relative_path: &str) -> Result<bool> {
        let path = self.full_path(relative_path);
        match &self.handle.host {
            None => Ok(fs::metadata(&path).await.map(|m| m.is_file()).unwrap_or(false)),
            Some(host) => {
                let status = host_command(Some(host), &["test", "-f", path.as_str()]).status().await?;
                Ok(status.success())
            }
        }
    }

    async fn dir_exists(&self, relative_path: &str) -> Result<bool> {
        let path = self.full_path(relative_path);
        match &self.handle.host {
            None => Ok(fs::metadata(&path).await.map(|m| m.is_dir()).unwrap_or(false)),
            Some(host) => {
                let status = host_command(Some(host), &["test", "-d", path.as_str()]).status().await?;
                Ok(status.success())
            }
        }
    }

    async fn list_dir(&self, relative_path: &str) -> Result<Vec<String>> {
        let path = self.full_path(relative_path);
        match &self.handle.host {
            None => {
                let mut entries = fs::read_dir(&path).await.with_context(|| format!("readdir {}", path))?;
                let mut names = Vec::new();
                while let Some(entry) = entries.next_entry().await? {
                    names.push(entry.file_name().to_string_lossy().into_owned());
                }
                names.sort();
                Ok(names)
            }
            Some(_) => {
                let out = self.run_output(&["ls", "-1", path.as_str()]).await?;
                let mut names: Vec<String> = String::from_utf8_lossy(&out.stdout).lines().map(|l| l.to_string()).collect();
                names.sort();
                Ok(names)
            }
        }
    }

    async fn write_small_text(&self, relative_path: &str, contents: &str) -> Result<()> {
        let path = self.full_path(relative_path);
        match &self.handle.host {
            None => fs::write(&path, contents).await.with_context(|| format!("write {}", path)),
            Some(host) => {
                let mut cmd = host_command(Some(host), &["tee", path.as_str()]);
                cmd.stdin(Stdio::piped()).stdout(Stdio::null()).stderr(Stdio::inherit());
                let mut child = cmd.spawn()?;
                let mut stdin = child.stdin.take().ok_or_else(|| anyhow!("tee produced no stdin pipe"))?;
                stdin.write_all(contents.as_bytes()).await?;
                drop(stdin);
                let status = child.wait().await?;
                if !status.success() {
                    return Err(anyhow!("writing {} failed: {:?}", path, status));
                }
                Ok(())
            }
        }
    }

    async fn read_small_text(&self, relative_path: &str) -> Result<String> {
        let path = self.full_path(relative_path);
        match &self.handle.host {
            None => fs::read_to_string(&path).await.with_context(|| format!("read {}", path)),
            Some(host) => {
                let out = host_command(Some(host), &["cat", path.as_str()]).stderr(Stdio::inherit()).checked_output().await?;
                Ok(String::from_utf8_lossy(&out.stdout).into_owned())
            }
        }
    }

    async fn stream_digest(&self, relative_path: &str, mut data: ByteStream) -> Result<String> {
        let path = self.full_path(relative_path);
        let mut hasher = Sha256::new();
        let mut buffer = vec![0u8; 64 * 1024];

        match &self.handle.host {
            None => {
                let mut file = fs::File::create(&path).await.with_context(|| format!("create {}", path))?;
                loop {
                    let read = data.read(&mut buffer).await?;
                    if read == 0 {
                        break;
                    }
                    hasher.update(&buffer[..read]);
                    file.write_all(&buffer[..read]).await?;
                }
                file.flush().await?;
            }
            Some(host) => {
                let mut cmd = host_command(Some(host), &["tee", path.as_str()]);
                cmd.stdin(Stdio::piped()).stdout(Stdio::null()).stderr(Stdio::inherit());
                let mut child = cmd.spawn()?;
                let mut stdin = child.stdin.take().ok_or_else(|| anyhow!("tee produced no stdin pipe"))?;
                loop {
                    let read = data.read(&mut buffer).await?;
                    if read == 0 {
                        break;
                    }
                    hasher.update(&buffer[..read]);
                    stdin.write_all(&buffer[..read]).await?;
                }
                drop(stdin);
                let status = child.wait().await?;
                if !status.success() {
                    return Err(anyhow!("streaming to {} failed: {:?}", path, status));
                }
            }
        }

        Ok(format!("{:x}", hasher.finalize()))
    }

    async fn open_stream(&self, relative_path: &str) -> Result<ByteStream> {
        let path = self.full_path(relative_path);
        match &self.handle.host {
            None => {
                let file = fs::File::open(&path).await.with_context(|| format!("open {}", path))?;
                Ok(Box::pin(file))
            }
            Some(host) => {
                let mut cmd = host_command(Some(host), &["cat", path.as_str()]);
                cmd.stdout(Stdio::piped()).stderr(Stdio::inherit());
                let mut child = cmd.spawn().with_context(|| format!("cat {}", path))?;
                let stdout = child.stdout.take().ok_or_else(|| anyhow!("cat produced no stdout pipe"))?;
                tokio::spawn(async move {
                    let _ = child.wait().await;
                });
                Ok(Box::pin(stdout))
            }
        }
    }
}
