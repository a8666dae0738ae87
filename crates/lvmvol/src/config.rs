//! Driver configuration and volume group resolution.

use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use lvmvol_common::{LvmPaths, VolumeError, VolumeResult};

/// Keys accepted in the volume group configuration file.
const ALLOWED_KEYS: &[&str] = &["VOLUME_GROUP"];

/// Driver configuration options.
#[derive(Debug, Clone, Default)]
pub struct DriverConfig {
    /// Paths for plugin data.
    pub paths: LvmPaths,
}

impl DriverConfig {
    /// Set the home directory.
    #[must_use]
    pub fn with_home(mut self, home: impl Into<PathBuf>) -> Self {
        self.paths.home = home.into();
        self
    }

    /// Set the volume group configuration file.
    #[must_use]
    pub fn with_vg_config(mut self, path: impl Into<PathBuf>) -> Self {
        self.paths.vg_config = path.into();
        self
    }

    /// Resolver reading the configured volume group file.
    #[must_use]
    pub fn resolver(&self) -> VolumeGroupResolver {
        VolumeGroupResolver::new(&self.paths.vg_config)
    }
}

/// Resolves the volume group new logical volumes are allocated from.
///
/// The configuration file holds `KEY=VALUE` lines; lines starting with `#`
/// are comments and the first `VOLUME_GROUP` entry wins.
#[derive(Debug, Clone)]
pub struct VolumeGroupResolver {
    config: PathBuf,
}

impl VolumeGroupResolver {
    /// Create a resolver for a configuration file.
    pub fn new(config: impl AsRef<Path>) -> Self {
        Self {
            config: config.as_ref().to_path_buf(),
        }
    }

    /// Resolve the volume group, preferring a per-request override.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration file cannot be read or holds
    /// no volume group.
    pub fn resolve(&self, requested: Option<&str>) -> VolumeResult<String> {
        if let Some(vg) = requested.map(str::trim).filter(|vg| !vg.is_empty()) {
            return Ok(vg.to_string());
        }
        self.configured()
    }

    /// Read the volume group from the configuration file.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration file cannot be read or holds
    /// no volume group.
    pub fn configured(&self) -> VolumeResult<String> {
        let file = std::fs::File::open(&self.config)?;

        let mut vg = String::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            if !ALLOWED_KEYS.contains(&key) {
                continue;
            }
            vg = value.trim().to_string();
            break;
        }

        if vg.is_empty() {
            return Err(VolumeError::Config {
                message: format!(
                    "Volume group name must be provided for volume creation. Please update the config file {} with volume group name.",
                    self.config.display()
                ),
            });
        }

        tracing::trace!(vg = %vg, config = %self.config.display(), "Resolved volume group");
        Ok(vg)
    }
}
