//! Persisted control policy.
//!
//! The active [`ControlPolicy`] is written as TOML after every accepted
//! change and read back once at startup. Writes go to a sibling temp file
//! that is flushed to disk and then renamed over the target, so neither a
//! crash nor a power loss leaves a truncated policy behind.

use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::ConfigError;
use crate::policy::ControlPolicy;

/// File-backed store for the active policy.
#[derive(Debug, Clone)]
pub struct PolicyStore {
    path: PathBuf,
}

impl PolicyStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the stored policy. `Ok(None)` when nothing has been stored yet.
    pub async fn load(&self) -> Result<Option<ControlPolicy>, ConfigError> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(ConfigError::Io(e)),
        };
        ControlPolicy::parse_toml(&content).map(Some)
    }

    /// Read the stored policy, substituting `fallback` when the file is
    /// missing or unusable.
    pub async fn load_or(&self, fallback: ControlPolicy) -> ControlPolicy {
        match self.load().await {
            Ok(Some(policy)) => {
                info!(path = %self.path.display(), "Loaded persisted policy");
                policy
            }
            Ok(None) => {
                info!(path = %self.path.display(), "No persisted policy, using safe default");
                fallback
            }
            Err(e) => {
                warn!(
                    path = %self.path.display(),
                    error = %e,
                    "Persisted policy is unusable, using safe default"
                );
                fallback
            }
        }
    }

    /// Atomically replace the stored policy.
    pub async fn save(&self, policy: &ControlPolicy) -> Result<(), ConfigError> {
        let body = toml::to_string_pretty(policy)?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let tmp = self.temp_path();
        let written = match write_synced(&tmp, body.as_bytes()).await {
            Ok(()) => tokio::fs::rename(&tmp, &self.path).await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            tokio::fs::remove_file(&tmp).await.ok();
            return Err(ConfigError::Io(e));
        }
        self.sync_parent().await;

        debug!(path = %self.path.display(), "Policy persisted");
        Ok(())
    }

    /// Flush the rename itself. Failure only weakens durability.
    async fn sync_parent(&self) {
        let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) else {
            return;
        };
        let synced = match tokio::fs::File::open(parent).await {
            Ok(dir) => dir.sync_all().await,
            Err(e) => Err(e),
        };
        if let Err(e) = synced {
            debug!(dir = %parent.display(), error = %e, "Could not sync policy directory");
        }
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "policy.toml".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

/// Write `body` to a fresh file at `path` and wait for it to reach the disk.
async fn write_synced(path: &Path, body: &[u8]) -> std::io::Result<()> {
    use tokio::io::AsyncWriteExt;

    let mut file = tokio::fs::File::create(path).await?;
    file.write_all(body).await?;
    file.sync_all().await
}
