//! Block device gateway.
//!
//! The lifecycle manager drives logical volumes, filesystems, encrypted
//! mappings and mounts through the capability traits defined here. Two
//! implementations exist:
//! - [`SystemGateway`] runs the LVM, xfsprogs and cryptsetup tools
//! - [`MemoryGateway`] keeps everything in memory, with failure injection

mod command;
mod crypt;
mod lvm;
mod memory;
mod mount;
mod system;

use std::path::{Path, PathBuf};

use chrono::{DateTime, FixedOffset};
use lvmvol_common::{VolumeResult, VolumeSize};

pub use crypt::Cryptsetup;
pub use lvm::{Lvm, parse_lvdisplay};
pub use memory::{MemoryGateway, Step};
pub use mount::{Mounter, mountinfo_contains};
pub use system::SystemGateway;

/// Filesystem every volume is formatted with.
pub const FILESYSTEM: &str = "xfs";

/// How a logical volume is allocated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LvSpec {
    /// Fully allocated volume of a fixed size.
    Linear {
        /// Volume size.
        size: VolumeSize,
    },
    /// Thin volume with a virtual size inside a thin pool.
    Thin {
        /// Virtual size.
        virtual_size: VolumeSize,
        /// Thin pool in the same volume group.
        pool: String,
    },
    /// Snapshot of another logical volume.
    Snapshot {
        /// Origin volume in the same volume group.
        origin: String,
        /// COW size; `None` for thin snapshots.
        size: Option<VolumeSize>,
    },
}

/// What the device reports about a logical volume.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LvInfo {
    /// Backed by a thin pool.
    pub thin: bool,
    /// Is a snapshot of another volume.
    pub snapshot: bool,
    /// Has snapshots of its own.
    pub origin: bool,
    /// Creation time as reported by LVM.
    pub created: Option<DateTime<FixedOffset>>,
}

/// Options for mounting a volume device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MountOptions {
    /// Skip the duplicate filesystem UUID check. Snapshots share the UUID
    /// of their origin.
    pub nouuid: bool,
}

/// Logical volume allocation and inspection.
pub trait LogicalVolumes {
    /// Allocate `name` in `vg`.
    ///
    /// # Errors
    ///
    /// Returns an error if the allocation fails.
    fn create_lv(&self, vg: &str, name: &str, spec: &LvSpec) -> VolumeResult<()>;

    /// Deallocate `name` from `vg`.
    ///
    /// # Errors
    ///
    /// Returns an error if the removal fails.
    fn remove_lv(&self, vg: &str, name: &str) -> VolumeResult<()>;

    /// Inspect `name` in `vg`.
    ///
    /// # Errors
    ///
    /// Returns an error if the volume cannot be inspected.
    fn inspect_lv(&self, vg: &str, name: &str) -> VolumeResult<LvInfo>;
}

/// Filesystem creation and mountpoint directories.
pub trait Filesystems {
    /// Create a filesystem on `device`.
    ///
    /// # Errors
    ///
    /// Returns an error if formatting fails.
    fn make_filesystem(&self, device: &Path) -> VolumeResult<()>;

    /// Create a mountpoint directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    fn create_dir(&self, path: &Path) -> VolumeResult<()> {
        lvmvol_common::paths::create_private_dir(path)?;
        Ok(())
    }

    /// Remove a mountpoint directory. A missing directory is not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory exists and cannot be removed.
    fn remove_dir(&self, path: &Path) -> VolumeResult<()> {
        match std::fs::remove_dir_all(path) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}

/// LUKS encryption of volume devices.
pub trait Encryption {
    /// Whether the encryption tool is installed.
    fn encryption_available(&self) -> bool;

    /// Format `device` for encryption with `keyfile`.
    ///
    /// # Errors
    ///
    /// Returns an error if formatting fails.
    fn luks_format(&self, device: &Path, keyfile: &Path) -> VolumeResult<()>;

    /// Open `device` as mapping `mapping`.
    ///
    /// # Errors
    ///
    /// Returns an error if the mapping cannot be opened.
    fn luks_open(&self, device: &Path, mapping: &str, keyfile: &Path) -> VolumeResult<()>;

    /// Close mapping `mapping`.
    ///
    /// # Errors
    ///
    /// Returns an error if the mapping cannot be closed.
    fn luks_close(&self, mapping: &str) -> VolumeResult<()>;

    /// Whether mapping `mapping` is currently open.
    fn mapping_open(&self, mapping: &str) -> bool;
}

/// Mounting volume devices.
pub trait Mounts {
    /// Mount `device` at `target`.
    ///
    /// # Errors
    ///
    /// Returns an error if the mount fails.
    fn mount(&self, device: &Path, target: &Path, options: MountOptions) -> VolumeResult<()>;

    /// Unmount `target`.
    ///
    /// # Errors
    ///
    /// Returns an error if the unmount fails.
    fn unmount(&self, target: &Path) -> VolumeResult<()>;

    /// Whether something is mounted at `target`.
    ///
    /// # Errors
    ///
    /// Returns an error if the mount table cannot be read.
    fn is_mounted(&self, target: &Path) -> VolumeResult<bool>;
}

/// Everything the lifecycle manager needs from the host.
pub trait DeviceGateway: LogicalVolumes + Filesystems + Encryption + Mounts + Send + Sync {}

impl<T> DeviceGateway for T where T: LogicalVolumes + Filesystems + Encryption + Mounts + Send + Sync {}

/// Raw device node of a logical volume.
#[must_use]
pub fn logical_device(vg: &str, name: &str) -> PathBuf {
    PathBuf::from(format!("/dev/{vg}/{name}"))
}

/// Name of the encrypted mapping for a volume.
#[must_use]
pub fn luks_mapping_name(name: &str) -> String {
    format!("luks-{name}")
}

/// Device node of the encrypted mapping for a volume.
#[must_use]
pub fn luks_device(name: &str) -> PathBuf {
    PathBuf::from("/dev/mapper").join(luks_mapping_name(name))
}
