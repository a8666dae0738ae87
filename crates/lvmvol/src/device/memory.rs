//! In-memory gateway for dry runs and tests.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use chrono::{DateTime, FixedOffset, Utc};
use lvmvol_common::{VolumeError, VolumeResult};
use parking_lot::Mutex;

use super::{
    Encryption, Filesystems, LogicalVolumes, LvInfo, LvSpec, MountOptions, Mounts, logical_device,
};

/// A gateway operation that can be made to fail.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Step {
    CreateLv,
    RemoveLv,
    InspectLv,
    MakeFilesystem,
    CreateDir,
    LuksFormat,
    LuksOpen,
    LuksClose,
    Mount,
    Unmount,
}

#[derive(Debug, Clone)]
struct MemLv {
    thin: bool,
    origin: Option<String>,
    created: DateTime<FixedOffset>,
}

#[derive(Debug)]
struct State {
    lvs: BTreeMap<(String, String), MemLv>,
    filesystems: BTreeSet<PathBuf>,
    mappings: BTreeMap<String, PathBuf>,
    mounts: BTreeMap<PathBuf, (PathBuf, MountOptions)>,
    failures: BTreeSet<Step>,
    encryption: bool,
    mount_calls: usize,
    unmount_calls: usize,
}

/// Gateway that simulates LVM, encryption and mounts in memory.
///
/// Mountpoint directories are still created on the real filesystem, so
/// point the driver's home at a scratch directory.
#[derive(Debug)]
pub struct MemoryGateway {
    state: Mutex<State>,
}

impl Default for MemoryGateway {
    fn default() -> Self {
        Self {
            state: Mutex::new(State {
                lvs: BTreeMap::new(),
                filesystems: BTreeSet::new(),
                mappings: BTreeMap::new(),
                mounts: BTreeMap::new(),
                failures: BTreeSet::new(),
                encryption: true,
                mount_calls: 0,
                unmount_calls: 0,
            }),
        }
    }
}

fn failed(step: Step, detail: impl Into<String>) -> VolumeError {
    VolumeError::Command {
        program: format!("{step:?}"),
        detail: detail.into(),
    }
}

impl MemoryGateway {
    /// Create an empty gateway with encryption available.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every future `step` fail until [`MemoryGateway::succeed`].
    pub fn fail(&self, step: Step) {
        self.state.lock().failures.insert(step);
    }

    /// Let `step` succeed again.
    pub fn succeed(&self, step: Step) {
        self.state.lock().failures.remove(&step);
    }

    /// Pretend the encryption tool is (un)installed.
    pub fn set_encryption_available(&self, available: bool) {
        self.state.lock().encryption = available;
    }

    /// Whether logical volume `name` exists in `vg`.
    #[must_use]
    pub fn has_lv(&self, vg: &str, name: &str) -> bool {
        self.state
            .lock()
            .lvs
            .contains_key(&(vg.to_string(), name.to_string()))
    }

    /// Number of logical volumes across all volume groups.
    #[must_use]
    pub fn lv_count(&self) -> usize {
        self.state.lock().lvs.len()
    }

    /// Whether a filesystem was created on `device`.
    #[must_use]
    pub fn has_filesystem(&self, device: &Path) -> bool {
        self.state.lock().filesystems.contains(device)
    }

    /// Names of the open encrypted mappings.
    #[must_use]
    pub fn open_mappings(&self) -> Vec<String> {
        self.state.lock().mappings.keys().cloned().collect()
    }

    /// Device and options mounted at `target`, if any.
    #[must_use]
    pub fn mounted(&self, target: &Path) -> Option<(PathBuf, MountOptions)> {
        self.state.lock().mounts.get(target).cloned()
    }

    /// Physical mounts performed so far.
    #[must_use]
    pub fn mount_calls(&self) -> usize {
        self.state.lock().mount_calls
    }

    /// Physical unmounts performed so far.
    #[must_use]
    pub fn unmount_calls(&self) -> usize {
        self.state.lock().unmount_calls
    }

    /// Physical mounts not yet matched by an unmount, read under one lock.
    #[must_use]
    pub fn outstanding_mounts(&self) -> usize {
        let state = self.state.lock();
        state.mount_calls.saturating_sub(state.unmount_calls)
    }

    /// Drop a mount behind the driver's back, as an administrator running
    /// `umount` by hand would.
    pub fn unmount_externally(&self, target: &Path) {
        self.state.lock().mounts.remove(target);
    }

    fn check(state: &State, step: Step) -> VolumeResult<()> {
        if state.failures.contains(&step) {
            tracing::debug!(?step, "Injected failure");
            return Err(failed(step, "injected failure"));
        }
        Ok(())
    }

    fn device_exists(state: &State, device: &Path) -> bool {
        state.mappings.contains_key(
            device
                .strip_prefix("/dev/mapper")
                .ok()
                .and_then(|p| p.to_str())
                .unwrap_or_default(),
        ) || state
            .lvs
            .keys()
            .any(|(vg, name)| logical_device(vg, name) == device)
    }
}

impl LogicalVolumes for MemoryGateway {
    fn create_lv(&self, vg: &str, name: &str, spec: &LvSpec) -> VolumeResult<()> {
        let mut state = self.state.lock();
        Self::check(&state, Step::CreateLv)?;

        let key = (vg.to_string(), name.to_string());
        if state.lvs.contains_key(&key) {
            return Err(failed(Step::CreateLv, format!("{vg}/{name} already exists")));
        }

        let lv = match spec {
            LvSpec::Linear { .. } => MemLv {
                thin: false,
                origin: None,
                created: Utc::now().fixed_offset(),
            },
            LvSpec::Thin { .. } => MemLv {
                thin: true,
                origin: None,
                created: Utc::now().fixed_offset(),
            },
            LvSpec::Snapshot { origin, size } => {
                let source = state
                    .lvs
                    .get(&(vg.to_string(), origin.clone()))
                    .ok_or_else(|| failed(Step::CreateLv, format!("{vg}/{origin} not found")))?;
                if size.is_none() && !source.thin {
                    return Err(failed(Step::CreateLv, "snapshot of thick volume needs a size"));
                }
                MemLv {
                    thin: source.thin && size.is_none(),
                    origin: Some(origin.clone()),
                    created: Utc::now().fixed_offset(),
                }
            }
        };

        state.lvs.insert(key, lv);
        Ok(())
    }

    fn remove_lv(&self, vg: &str, name: &str) -> VolumeResult<()> {
        let mut state = self.state.lock();
        Self::check(&state, Step::RemoveLv)?;

        if state
            .lvs
            .iter()
            .any(|((v, _), lv)| v == vg && lv.origin.as_deref() == Some(name))
        {
            return Err(failed(Step::RemoveLv, format!("{vg}/{name} has snapshots")));
        }
        state
            .lvs
            .remove(&(vg.to_string(), name.to_string()))
            .ok_or_else(|| failed(Step::RemoveLv, format!("{vg}/{name} not found")))?;
        state.filesystems.remove(&logical_device(vg, name));
        Ok(())
    }

    fn inspect_lv(&self, vg: &str, name: &str) -> VolumeResult<LvInfo> {
        let state = self.state.lock();
        Self::check(&state, Step::InspectLv)?;

        let lv = state
            .lvs
            .get(&(vg.to_string(), name.to_string()))
            .ok_or_else(|| failed(Step::InspectLv, format!("{vg}/{name} not found")))?;
        let origin = state
            .lvs
            .iter()
            .any(|((v, _), other)| v == vg && other.origin.as_deref() == Some(name));

        Ok(LvInfo {
            thin: lv.thin,
            snapshot: lv.origin.is_some(),
            origin,
            created: Some(lv.created),
        })
    }
}

impl Filesystems for MemoryGateway {
    fn make_filesystem(&self, device: &Path) -> VolumeResult<()> {
        let mut state = self.state.lock();
        Self::check(&state, Step::MakeFilesystem)?;
        if !Self::device_exists(&state, device) {
            return Err(failed(
                Step::MakeFilesystem,
                format!("{} does not exist", device.display()),
            ));
        }
        state.filesystems.insert(device.to_path_buf());
        Ok(())
    }

    fn create_dir(&self, path: &Path) -> VolumeResult<()> {
        Self::check(&self.state.lock(), Step::CreateDir)?;
        lvmvol_common::paths::create_private_dir(path)?;
        Ok(())
    }
}

impl Encryption for MemoryGateway {
    fn encryption_available(&self) -> bool {
        self.state.lock().encryption
    }

    fn luks_format(&self, device: &Path, _keyfile: &Path) -> VolumeResult<()> {
        let state = self.state.lock();
        Self::check(&state, Step::LuksFormat)?;
        if !Self::device_exists(&state, device) {
            return Err(failed(
                Step::LuksFormat,
                format!("{} does not exist", device.display()),
            ));
        }
        Ok(())
    }

    fn luks_open(&self, device: &Path, mapping: &str, _keyfile: &Path) -> VolumeResult<()> {
        let mut state = self.state.lock();
        Self::check(&state, Step::LuksOpen)?;
        if state.mappings.contains_key(mapping) {
            return Err(failed(Step::LuksOpen, format!("{mapping} already open")));
        }
        state
            .mappings
            .insert(mapping.to_string(), device.to_path_buf());
        Ok(())
    }

    fn luks_close(&self, mapping: &str) -> VolumeResult<()> {
        let mut state = self.state.lock();
        Self::check(&state, Step::LuksClose)?;
        state
            .mappings
            .remove(mapping)
            .map(|_| ())
            .ok_or_else(|| failed(Step::LuksClose, format!("{mapping} is not open")))
    }

    fn mapping_open(&self, mapping: &str) -> bool {
        self.state.lock().mappings.contains_key(mapping)
    }
}

impl Mounts for MemoryGateway {
    fn mount(&self, device: &Path, target: &Path, options: MountOptions) -> VolumeResult<()> {
        let mut state = self.state.lock();
        Self::check(&state, Step::Mount)?;
        if !Self::device_exists(&state, device) {
            return Err(failed(
                Step::Mount,
                format!("{} does not exist", device.display()),
            ));
        }
        if state.mounts.contains_key(target) {
            return Err(failed(
                Step::Mount,
                format!("{} is already mounted", target.display()),
            ));
        }
        state
            .mounts
            .insert(target.to_path_buf(), (device.to_path_buf(), options));
        state.mount_calls += 1;
        Ok(())
    }

    fn unmount(&self, target: &Path) -> VolumeResult<()> {
        let mut state = self.state.lock();
        Self::check(&state, Step::Unmount)?;
        if state.mounts.remove(target).is_none() {
            return Err(failed(
                Step::Unmount,
                format!("{} is not mounted", target.display()),
            ));
        }
        state.unmount_calls += 1;
        Ok(())
    }

    fn is_mounted(&self, target: &Path) -> VolumeResult<bool> {
        Ok(self.state.lock().mounts.contains_key(target))
    }
}
