//! Volume metadata persistence.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use lvmvol_common::{LvmPaths, VolumeError, VolumeResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Persisted volume table, keyed by name.
pub type VolumeTable = BTreeMap<String, Volume>;

/// Persisted mount reference counts, keyed by volume name.
pub type CountTable = BTreeMap<String, u64>;

/// How a volume was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VolumeKind {
    /// Fully or thinly allocated volume of its own.
    #[default]
    Plain,
    /// Snapshot of another volume.
    Snapshot,
}

/// A volume record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    /// Volume name, also the logical volume name.
    pub name: String,
    /// Volume group the logical volume lives in. Empty in tables written
    /// before the group was recorded.
    #[serde(default)]
    pub vg: String,
    /// Where the volume is mounted.
    pub mountpoint: PathBuf,
    /// Plain volume or snapshot.
    #[serde(default)]
    pub kind: VolumeKind,
    /// Origin volume of a snapshot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Key file of an encrypted volume.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keyfile: Option<PathBuf>,
}

impl Volume {
    /// Whether this volume is a snapshot of `origin`.
    #[must_use]
    pub fn is_snapshot_of(&self, origin: &str) -> bool {
        self.kind == VolumeKind::Snapshot && self.source.as_deref() == Some(origin)
    }
}

/// Reads and writes the volume and count tables under the plugin home.
#[derive(Debug, Clone)]
pub struct MetadataStore {
    volumes_file: PathBuf,
    counts_file: PathBuf,
}

impl MetadataStore {
    /// Create a store for the given paths.
    #[must_use]
    pub fn new(paths: &LvmPaths) -> Self {
        Self {
            volumes_file: paths.volumes_file(),
            counts_file: paths.counts_file(),
        }
    }

    /// Load both tables. Missing files are empty tables.
    ///
    /// Every volume gets a count, and counts for unknown volumes are
    /// dropped.
    ///
    /// # Errors
    ///
    /// Returns an error if a file exists but cannot be read or parsed.
    pub fn load(&self) -> VolumeResult<(VolumeTable, CountTable)> {
        let volumes: VolumeTable = read_table(&self.volumes_file)?;
        let mut counts: CountTable = read_table(&self.counts_file)?;

        counts.retain(|name, count| {
            let known = volumes.contains_key(name);
            if !known {
                tracing::warn!(volume = %name, count = *count, "Dropping mount count for unknown volume");
            }
            known
        });
        for name in volumes.keys() {
            counts.entry(name.clone()).or_insert(0);
        }

        tracing::debug!(
            volumes = volumes.len(),
            path = %self.volumes_file.display(),
            "Loaded volume metadata"
        );
        Ok((volumes, counts))
    }

    /// Rewrite both tables.
    ///
    /// # Errors
    ///
    /// Returns [`VolumeError::Persistence`] if either file cannot be written.
    pub fn save(&self, volumes: &VolumeTable, counts: &CountTable) -> VolumeResult<()> {
        write_table(&self.volumes_file, volumes)
            .and_then(|()| write_table(&self.counts_file, counts))
            .map_err(|e| {
                tracing::error!(error = %e, "Failed to persist volume metadata");
                VolumeError::Persistence {
                    message: e.to_string(),
                }
            })?;

        tracing::trace!(volumes = volumes.len(), "Saved volume metadata");
        Ok(())
    }
}

fn read_table<T: DeserializeOwned + Default>(path: &Path) -> VolumeResult<T> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
        Err(e) => Err(e.into()),
    }
}

/// Write `value` next to `path` and rename it into place.
fn write_table<T: Serialize>(path: &Path, value: &T) -> VolumeResult<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut file = tempfile::NamedTempFile::new_in(dir)?;
    serde_json::to_writer(&mut file, value)?;
    file.flush()?;
    file.as_file().sync_all()?;
    file.persist(path).map_err(|e| VolumeError::Io(e.error))?;
    Ok(())
}
