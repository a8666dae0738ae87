//! LUKS encryption via `cryptsetup`.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use lvmvol_common::VolumeResult;

use super::Encryption;
use super::command::{available, run};

/// Encrypted mappings managed with `cryptsetup`.
#[derive(Debug, Clone)]
pub struct Cryptsetup {
    /// Directory device-mapper nodes appear in.
    mapper_dir: PathBuf,
}

impl Default for Cryptsetup {
    fn default() -> Self {
        Self {
            mapper_dir: PathBuf::from("/dev/mapper"),
        }
    }
}

impl Encryption for Cryptsetup {
    fn encryption_available(&self) -> bool {
        available("cryptsetup", "--version")
    }

    fn luks_format(&self, device: &Path, keyfile: &Path) -> VolumeResult<()> {
        let args = [
            OsStr::new("-q"),
            OsStr::new("-d"),
            keyfile.as_os_str(),
            OsStr::new("luksFormat"),
            device.as_os_str(),
        ];
        run("cryptsetup", args)?;
        tracing::debug!(device = %device.display(), "Device formatted for encryption");
        Ok(())
    }

    fn luks_open(&self, device: &Path, mapping: &str, keyfile: &Path) -> VolumeResult<()> {
        let args = [
            OsStr::new("-d"),
            keyfile.as_os_str(),
            OsStr::new("luksOpen"),
            device.as_os_str(),
            OsStr::new(mapping),
        ];
        run("cryptsetup", args)?;
        tracing::debug!(device = %device.display(), mapping, "Encrypted mapping opened");
        Ok(())
    }

    fn luks_close(&self, mapping: &str) -> VolumeResult<()> {
        run("cryptsetup", ["luksClose", mapping])?;
        tracing::debug!(mapping, "Encrypted mapping closed");
        Ok(())
    }

    fn mapping_open(&self, mapping: &str) -> bool {
        self.mapper_dir.join(mapping).exists()
    }
}
