//! Mount operations.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use lvmvol_common::{VolumeError, VolumeResult};

use super::command::run;
use super::{MountOptions, Mounts};

/// Mounts volume devices with `mount(8)` and unmounts them with `umount(2)`.
#[derive(Debug, Clone)]
pub struct Mounter {
    /// Mount table consulted by [`Mounts::is_mounted`].
    mountinfo: PathBuf,
}

impl Default for Mounter {
    fn default() -> Self {
        Self {
            mountinfo: PathBuf::from("/proc/self/mountinfo"),
        }
    }
}

impl Mounts for Mounter {
    fn mount(&self, device: &Path, target: &Path, options: MountOptions) -> VolumeResult<()> {
        tracing::debug!(
            device = %device.display(),
            target = %target.display(),
            ?options,
            "Mounting volume"
        );

        let mut args: Vec<OsString> = Vec::with_capacity(4);
        if options.nouuid {
            args.extend(["-o".into(), "nouuid".into()]);
        }
        args.extend([device.as_os_str().to_owned(), target.as_os_str().to_owned()]);
        run("mount", args)?;
        Ok(())
    }

    #[cfg(target_os = "linux")]
    fn unmount(&self, target: &Path) -> VolumeResult<()> {
        use rustix::mount::{UnmountFlags, unmount};

        tracing::debug!(target = %target.display(), "Unmounting volume");

        unmount(target, UnmountFlags::empty()).map_err(|e| {
            tracing::error!(target = %target.display(), error = %e, "umount failed");
            VolumeError::Io(e.into())
        })
    }

    #[cfg(not(target_os = "linux"))]
    fn unmount(&self, _target: &Path) -> VolumeResult<()> {
        Err(VolumeError::Unsupported {
            feature: "unmount".to_string(),
        })
    }

    fn is_mounted(&self, target: &Path) -> VolumeResult<bool> {
        let table = std::fs::read_to_string(&self.mountinfo)?;
        let target = std::fs::canonicalize(target).unwrap_or_else(|_| target.to_path_buf());
        Ok(mountinfo_contains(&table, &target))
    }
}

/// Whether a `/proc/<pid>/mountinfo` table has a mount at `target`.
#[must_use]
pub fn mountinfo_contains(table: &str, target: &Path) -> bool {
    table
        .lines()
        .filter_map(|line| line.split_whitespace().nth(4))
        .any(|mount_point| Path::new(&unescape(mount_point)) == target)
}

/// Undo the octal escaping the kernel applies to whitespace and backslashes.
fn unescape(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    let mut rest = field;
    while let Some(pos) = rest.find('\\') {
        out.push_str(&rest[..pos]);
        let escaped = rest.get(pos + 1..pos + 4);
        match escaped.and_then(|digits| u8::from_str_radix(digits, 8).ok()) {
            Some(byte) => {
                out.push(char::from(byte));
                rest = &rest[pos + 4..];
            }
            None => {
                out.push('\\');
                rest = &rest[pos + 1..];
            }
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const TABLE: &str = "\
22 1 8:1 / / rw,relatime shared:1 - ext4 /dev/sda1 rw
98 22 253:3 / /var/lib/docker-lvm-plugin/v1 rw,relatime shared:50 - xfs /dev/mapper/vg0-v1 rw,attr2
99 22 253:4 / /var/lib/docker-lvm-plugin/with\\040space rw,relatime - xfs /dev/mapper/vg0-x rw
";

    #[test]
    fn finds_mounted_volume() {
        assert!(mountinfo_contains(
            TABLE,
            Path::new("/var/lib/docker-lvm-plugin/v1")
        ));
        assert!(!mountinfo_contains(
            TABLE,
            Path::new("/var/lib/docker-lvm-plugin/v2")
        ));
        assert!(!mountinfo_contains(TABLE, Path::new("/var/lib")));
    }

    #[test]
    fn decodes_escaped_mount_points() {
        assert!(mountinfo_contains(
            TABLE,
            Path::new("/var/lib/docker-lvm-plugin/with space")
        ));
        assert_eq!(unescape("a\\134b"), "a\\b");
        assert_eq!(unescape("trailing\\"), "trailing\\");
    }

    #[test]
    fn reads_mount_table_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let mountinfo = dir.path().join("mountinfo");
        std::fs::write(&mountinfo, TABLE).unwrap();

        let mounter = Mounter { mountinfo };
        assert!(
            mounter
                .is_mounted(Path::new("/var/lib/docker-lvm-plugin/v1"))
                .unwrap()
        );
        assert!(!mounter.is_mounted(dir.path()).unwrap());
    }
}
