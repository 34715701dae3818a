//! Snapshot file backing the CLI.

use anyhow::{Context, Result};
use fairdraw_core::{EntropySource, Registry, Snapshot};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// A JSON snapshot on disk. Writes go to a sibling temp file that is then
/// renamed over the snapshot, so a crash never leaves a half-written ledger.
#[derive(Clone, Debug)]
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the registry, or start an empty one if no snapshot exists yet.
    pub async fn load(&self, entropy: Arc<dyn EntropySource>) -> Result<Registry> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                info!("No snapshot at {}, starting an empty ledger", self.path.display());
                return Ok(Registry::new(entropy));
            }
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to read snapshot {}", self.path.display()));
            }
        };

        let snapshot = Snapshot::from_json(&bytes)
            .with_context(|| format!("Invalid snapshot {}", self.path.display()))?;
        debug!(
            operators = snapshot.operators.len(),
            path = %self.path.display(),
            "snapshot loaded"
        );
        Ok(Registry::from_snapshot(snapshot, entropy))
    }

    pub async fn save(&self, registry: &Registry) -> Result<()> {
        let bytes = registry.export().to_json()?;

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let tmp = self.temp_path();
        tokio::fs::write(&tmp, &bytes)
            .await
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("Failed to replace {}", self.path.display()))?;

        debug!(bytes = bytes.len(), path = %self.path.display(), "snapshot saved");
        Ok(())
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "ledger.json".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}
