//! Standard filesystem paths for the plugin.

use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;

/// File holding the persisted volume table.
pub const VOLUMES_FILE: &str = "lvmVolumesConfig.json";

/// File holding the persisted mount reference counts.
pub const COUNTS_FILE: &str = "lvmCountConfig.json";

/// Default plugin home, parent of every volume mountpoint.
pub static LVM_HOME: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var("LVM_PLUGIN_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/var/lib/docker-lvm-plugin"))
});

/// Default volume-group configuration file.
pub static LVM_VG_CONFIG: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var("LVM_PLUGIN_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/etc/docker/docker-lvm-plugin"))
});

/// Default socket the container runtime discovers plugins on.
pub const DEFAULT_SOCKET: &str = "/run/docker/plugins/lvm.sock";

/// Standard paths used by the plugin.
#[derive(Debug, Clone)]
pub struct LvmPaths {
    /// Home directory (default: /var/lib/docker-lvm-plugin).
    pub home: PathBuf,
    /// Volume-group configuration file (default: /etc/docker/docker-lvm-plugin).
    pub vg_config: PathBuf,
}

impl LvmPaths {
    /// Create paths with default locations.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create paths with a custom home directory.
    #[must_use]
    pub fn with_home(home: impl Into<PathBuf>) -> Self {
        Self {
            home: home.into(),
            vg_config: LVM_VG_CONFIG.clone(),
        }
    }

    /// Mountpoint of a volume.
    #[must_use]
    pub fn mountpoint(&self, name: &str) -> PathBuf {
        self.home.join(name)
    }

    /// Persisted volume table.
    #[must_use]
    pub fn volumes_file(&self) -> PathBuf {
        self.home.join(VOLUMES_FILE)
    }

    /// Persisted mount counts.
    #[must_use]
    pub fn counts_file(&self) -> PathBuf {
        self.home.join(COUNTS_FILE)
    }

    /// Create the home directory, readable only by its owner.
    ///
    /// # Errors
    ///
    /// Returns an error if directory creation fails.
    pub fn create_dirs(&self) -> std::io::Result<()> {
        create_private_dir(&self.home)
    }
}

impl Default for LvmPaths {
    fn default() -> Self {
        Self {
            home: LVM_HOME.clone(),
            vg_config: LVM_VG_CONFIG.clone(),
        }
    }
}

/// Create `path` and missing parents with mode 0700.
///
/// # Errors
///
/// Returns an error if directory creation fails.
pub fn create_private_dir(path: &Path) -> std::io::Result<()> {
    let mut builder = std::fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o700);
    }
    builder.create(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn custom_home() {
        let paths = LvmPaths::with_home("/tmp/lvm-test");
        assert_eq!(paths.mountpoint("v1"), PathBuf::from("/tmp/lvm-test/v1"));
        assert_eq!(
            paths.volumes_file(),
            PathBuf::from("/tmp/lvm-test/lvmVolumesConfig.json")
        );
        assert_eq!(
            paths.counts_file(),
            PathBuf::from("/tmp/lvm-test/lvmCountConfig.json")
        );
    }

    #[cfg(unix)]
    #[test]
    fn private_dir_mode() {
        use std::os::unix::fs::PermissionsExt;

        let temp = tempfile::tempdir().unwrap();
        let nested = temp.path().join("a").join("b");
        create_private_dir(&nested).unwrap();
        let mode = std::fs::metadata(&nested).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
    }
}
