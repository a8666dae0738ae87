//! Gateway backed by the host's LVM, xfsprogs and cryptsetup tools.

use std::path::Path;

use lvmvol_common::VolumeResult;

use super::command::{available, run};
use super::{
    Cryptsetup, Encryption, FILESYSTEM, Filesystems, LogicalVolumes, LvInfo, LvSpec, Lvm,
    MountOptions, Mounter, Mounts,
};

/// Gateway that changes real block devices.
#[derive(Debug, Clone, Default)]
pub struct SystemGateway {
    lvm: Lvm,
    crypt: Cryptsetup,
    mounter: Mounter,
}

impl SystemGateway {
    /// Create a gateway using the standard device and mount table paths.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the filesystem formatting tool is installed.
    #[must_use]
    pub fn mkfs_available() -> bool {
        available(&format!("mkfs.{FILESYSTEM}"), "-V")
    }
}

impl LogicalVolumes for SystemGateway {
    fn create_lv(&self, vg: &str, name: &str, spec: &LvSpec) -> VolumeResult<()> {
        self.lvm.create_lv(vg, name, spec)
    }

    fn remove_lv(&self, vg: &str, name: &str) -> VolumeResult<()> {
        self.lvm.remove_lv(vg, name)
    }

    fn inspect_lv(&self, vg: &str, name: &str) -> VolumeResult<LvInfo> {
        self.lvm.inspect_lv(vg, name)
    }
}

impl Filesystems for SystemGateway {
    fn make_filesystem(&self, device: &Path) -> VolumeResult<()> {
        run(&format!("mkfs.{FILESYSTEM}"), [device])?;
        tracing::debug!(device = %device.display(), fs = FILESYSTEM, "Filesystem created");
        Ok(())
    }
}

impl Encryption for SystemGateway {
    fn encryption_available(&self) -> bool {
        self.crypt.encryption_available()
    }

    fn luks_format(&self, device: &Path, keyfile: &Path) -> VolumeResult<()> {
        self.crypt.luks_format(device, keyfile)
    }

    fn luks_open(&self, device: &Path, mapping: &str, keyfile: &Path) -> VolumeResult<()> {
        self.crypt.luks_open(device, mapping, keyfile)
    }

    fn luks_close(&self, mapping: &str) -> VolumeResult<()> {
        self.crypt.luks_close(mapping)
    }

    fn mapping_open(&self, mapping: &str) -> bool {
        self.crypt.mapping_open(mapping)
    }
}

impl Mounts for SystemGateway {
    fn mount(&self, device: &Path, target: &Path, options: MountOptions) -> VolumeResult<()> {
        self.mounter.mount(device, target, options)
    }

    fn unmount(&self, target: &Path) -> VolumeResult<()> {
        self.mounter.unmount(target)
    }

    fn is_mounted(&self, target: &Path) -> VolumeResult<bool> {
        self.mounter.is_mounted(target)
    }
}
