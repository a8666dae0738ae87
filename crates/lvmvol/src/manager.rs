//! Volume lifecycle management.
//!
//! [`VolumeDriver`] owns the volume and mount count tables behind one
//! reader-writer lock. Mutating operations hold the write lock for their
//! whole duration, including the external commands they run, so at most
//! one create, remove, mount or unmount is in flight at a time.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, FixedOffset};
use lvmvol_common::{LvmPaths, VolumeError, VolumeName, VolumeResult};
use parking_lot::RwLock;
use serde::Serialize;

use crate::config::{DriverConfig, VolumeGroupResolver};
use crate::device::{
    DeviceGateway, MountOptions, logical_device, luks_device, luks_mapping_name,
};
use crate::policy::{self, CreatePlan, CreateRequest, effective_device, snapshot_spec};
use crate::store::{CountTable, MetadataStore, Volume, VolumeKind, VolumeTable};

/// Volume and count tables, always mutated together.
#[derive(Debug, Default)]
struct Tables {
    volumes: VolumeTable,
    counts: CountTable,
}

/// A volume as reported to callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeInfo {
    /// Volume name.
    pub name: String,
    /// Mountpoint.
    pub mountpoint: PathBuf,
    /// Creation time reported by LVM, when it could be read.
    pub created_at: Option<DateTime<FixedOffset>>,
}

/// Whether volumes are visible to one host or the whole cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    /// Volumes exist on this host only.
    Local,
}

/// Driver capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// Volume visibility.
    pub scope: Scope,
}

/// A create step to undo if a later step fails.
#[derive(Debug)]
enum Undo {
    RemoveLv { vg: String, name: String },
    RemoveDir(PathBuf),
    CloseMapping(String),
}

/// Map a gateway failure to the message shown to callers. The gateway has
/// already logged the command output.
fn device_error(action: &'static str) -> impl FnOnce(VolumeError) -> VolumeError {
    move |e| {
        tracing::debug!(error = %e, action, "Device step failed");
        VolumeError::Device { action }
    }
}

/// LVM volume driver.
pub struct VolumeDriver {
    paths: LvmPaths,
    resolver: VolumeGroupResolver,
    gateway: Arc<dyn DeviceGateway>,
    store: MetadataStore,
    tables: RwLock<Tables>,
}

impl std::fmt::Debug for VolumeDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VolumeDriver")
            .field("paths", &self.paths)
            .field("resolver", &self.resolver)
            .finish_non_exhaustive()
    }
}

impl VolumeDriver {
    /// Create a driver, loading persisted metadata from the home directory.
    ///
    /// # Errors
    ///
    /// Returns an error if persisted metadata exists but cannot be read.
    pub fn open(config: &DriverConfig, gateway: Arc<dyn DeviceGateway>) -> VolumeResult<Self> {
        let store = MetadataStore::new(&config.paths);
        let (volumes, counts) = store.load()?;

        tracing::info!(
            home = %config.paths.home.display(),
            volumes = volumes.len(),
            "Volume driver ready"
        );

        Ok(Self {
            paths: config.paths.clone(),
            resolver: config.resolver(),
            gateway,
            store,
            tables: RwLock::new(Tables { volumes, counts }),
        })
    }

    /// Create a volume and return its mountpoint.
    ///
    /// Creating a name that already exists returns the existing mountpoint
    /// and ignores `options`.
    ///
    /// # Errors
    ///
    /// Returns an error if the options are invalid, a dependency is
    /// missing, a device step fails (after rolling back earlier steps) or
    /// the metadata cannot be persisted.
    pub fn create(&self, name: &str, options: &HashMap<String, String>) -> VolumeResult<PathBuf> {
        let mut tables = self.tables.write();

        if let Some(existing) = tables.volumes.get(name) {
            tracing::debug!(volume = %name, "Volume already exists");
            return Ok(existing.mountpoint.clone());
        }

        let name = VolumeName::new(name)?;
        let request = CreateRequest::from_options(options)?;
        let plan = request.plan()?;

        if let Some(keyfile) = plan.keyfile() {
            policy::check_encryption(keyfile, &*self.gateway)?;
        }

        let source = match &plan {
            CreatePlan::Snapshot { source, .. } => Some(
                tables
                    .volumes
                    .get(source)
                    .ok_or_else(|| VolumeError::SnapshotSourceNotFound {
                        source_name: source.clone(),
                    })?,
            ),
            _ => None,
        };

        let vg = match source {
            Some(source) if request.vg.is_none() => self.volume_group(source)?,
            _ => self.resolver.resolve(request.vg.as_deref())?,
        };

        let mut journal = Vec::new();
        let result = match &plan {
            CreatePlan::Snapshot { source: origin, size } => {
                self.create_snapshot(&name, &vg, origin, *size, &mut journal)
            }
            _ => self.create_volume(&name, &vg, &plan, &mut journal),
        };
        if let Err(e) = result {
            tracing::error!(volume = %name, vg = %vg, error = %e, "Volume creation failed");
            self.rollback(&name, journal);
            return Err(e);
        }

        let volume = Volume {
            name: name.to_string(),
            vg: vg.clone(),
            mountpoint: self.paths.mountpoint(name.as_str()),
            kind: source.map_or(VolumeKind::Plain, |_| VolumeKind::Snapshot),
            source: source.map(|s| s.name.clone()),
            keyfile: source.map_or_else(
                || plan.keyfile().map(Path::to_path_buf),
                |s| s.keyfile.clone(),
            ),
        };
        let mountpoint = volume.mountpoint.clone();

        tables.volumes.insert(volume.name.clone(), volume);
        tables.counts.insert(name.to_string(), 0);
        if let Err(e) = self.persist(&tables) {
            tables.volumes.remove(name.as_str());
            tables.counts.remove(name.as_str());
            self.rollback(&name, journal);
            return Err(e);
        }

        tracing::info!(volume = %name, vg = %vg, mountpoint = %mountpoint.display(), "Volume created");
        Ok(mountpoint)
    }

    fn create_volume(
        &self,
        name: &VolumeName,
        vg: &str,
        plan: &CreatePlan,
        journal: &mut Vec<Undo>,
    ) -> VolumeResult<()> {
        let spec = plan
            .lv_spec()
            .ok_or_else(|| VolumeError::Internal {
                message: "snapshot plan passed to plain create".to_string(),
            })?;
        let name = name.as_str();
        let raw = logical_device(vg, name);

        self.gateway
            .create_lv(vg, name, &spec)
            .map_err(device_error("creating volume"))?;
        journal.push(Undo::RemoveLv {
            vg: vg.to_string(),
            name: name.to_string(),
        });

        match plan.keyfile() {
            Some(keyfile) => {
                let mapping = luks_mapping_name(name);
                self.gateway
                    .luks_format(&raw, keyfile)
                    .map_err(device_error("encrypting volume"))?;
                self.gateway
                    .luks_open(&raw, &mapping, keyfile)
                    .map_err(device_error("opening encrypted volume"))?;
                journal.push(Undo::CloseMapping(mapping.clone()));

                self.gateway
                    .make_filesystem(&luks_device(name))
                    .map_err(device_error("partitioning volume"))?;

                self.gateway
                    .luks_close(&mapping)
                    .map_err(device_error("closing encrypted volume"))?;
                journal.pop();
            }
            None => {
                self.gateway
                    .make_filesystem(&raw)
                    .map_err(device_error("partitioning volume"))?;
            }
        }

        self.create_mountpoint(name, journal)
    }

    fn create_snapshot(
        &self,
        name: &VolumeName,
        vg: &str,
        origin: &str,
        size: Option<lvmvol_common::VolumeSize>,
        journal: &mut Vec<Undo>,
    ) -> VolumeResult<()> {
        let source_thin = match self.gateway.inspect_lv(vg, origin) {
            Ok(info) => info.thin,
            Err(e) => {
                tracing::warn!(
                    volume = %name,
                    source = %origin,
                    error = %e,
                    "Could not check whether snapshot source is thin, proceeding as if it is not"
                );
                false
            }
        };
        let spec = snapshot_spec(origin, size, source_thin)?;
        let name = name.as_str();

        self.gateway
            .create_lv(vg, name, &spec)
            .map_err(device_error("creating volume"))?;
        journal.push(Undo::RemoveLv {
            vg: vg.to_string(),
            name: name.to_string(),
        });

        self.create_mountpoint(name, journal)
    }

    fn create_mountpoint(&self, name: &str, journal: &mut Vec<Undo>) -> VolumeResult<()> {
        let mountpoint = self.paths.mountpoint(name);
        self.gateway.create_dir(&mountpoint)?;
        journal.push(Undo::RemoveDir(mountpoint));
        Ok(())
    }

    /// Undo completed create steps, newest first. Failures are logged and
    /// do not stop the remaining steps.
    fn rollback(&self, name: &VolumeName, journal: Vec<Undo>) {
        for undo in journal.into_iter().rev() {
            let result = match &undo {
                Undo::RemoveLv { vg, name } => self.gateway.remove_lv(vg, name),
                Undo::RemoveDir(path) => self.gateway.remove_dir(path),
                Undo::CloseMapping(mapping) => self.gateway.luks_close(mapping),
            };
            match result {
                Ok(()) => tracing::debug!(volume = %name, step = ?undo, "Rolled back"),
                Err(e) => {
                    tracing::error!(volume = %name, step = ?undo, error = %e, "Rollback step failed");
                }
            }
        }
    }

    /// Remove a volume.
    ///
    /// # Errors
    ///
    /// Returns an error if the volume is unknown, mounted or has
    /// snapshots, if a device step fails or if the metadata cannot be
    /// persisted.
    pub fn remove(&self, name: &str) -> VolumeResult<()> {
        let mut tables = self.tables.write();

        let volume = tables
            .volumes
            .get(name)
            .cloned()
            .ok_or_else(|| VolumeError::VolumeNotFound {
                name: name.to_string(),
            })?;

        if let Some(snapshot) = tables.volumes.values().find(|v| v.is_snapshot_of(name)) {
            tracing::warn!(volume = %name, snapshot = %snapshot.name, "Volume still has snapshots");
            return Err(VolumeError::HasSnapshots {
                name: name.to_string(),
            });
        }
        if tables.counts.get(name).is_some_and(|count| *count > 0) {
            return Err(VolumeError::InUse {
                name: name.to_string(),
            });
        }
        if self.gateway.is_mounted(&volume.mountpoint)? {
            tracing::warn!(
                volume = %name,
                mountpoint = %volume.mountpoint.display(),
                "Volume is mounted with no recorded users"
            );
            return Err(VolumeError::InUse {
                name: name.to_string(),
            });
        }

        let vg = self.volume_group(&volume)?;
        match self.gateway.inspect_lv(&vg, name) {
            Ok(info) if info.origin => {
                tracing::warn!(volume = %name, vg = %vg, "Volume is a snapshot origin on the device");
                return Err(VolumeError::HasSnapshots {
                    name: name.to_string(),
                });
            }
            Ok(_) => {}
            Err(e) => {
                tracing::error!(volume = %name, error = %e, "Could not check whether volume is a snapshot origin");
                return Err(VolumeError::Device {
                    action: "removing volume, unable to determine if volume is a snapshot origin",
                });
            }
        }

        self.gateway.remove_dir(&volume.mountpoint)?;
        self.gateway
            .remove_lv(&vg, name)
            .map_err(device_error("removing volume"))?;

        tables.volumes.remove(name);
        tables.counts.remove(name);
        self.persist(&tables)?;

        tracing::info!(volume = %name, vg = %vg, "Volume removed");
        Ok(())
    }

    /// Mount a volume and return its mountpoint. Only the first of several
    /// concurrent users mounts the device.
    ///
    /// # Errors
    ///
    /// Returns an error if the volume is unknown, the device cannot be
    /// mounted or the metadata cannot be persisted.
    pub fn mount(&self, name: &str) -> VolumeResult<PathBuf> {
        let mut tables = self.tables.write();

        let volume = tables
            .volumes
            .get(name)
            .cloned()
            .ok_or_else(|| VolumeError::VolumeNotFound {
                name: name.to_string(),
            })?;
        let count = tables.counts.get(name).copied().unwrap_or(0);

        if count == 0 {
            self.attach(&volume)?;
        }

        tables.counts.insert(name.to_string(), count + 1);
        self.persist(&tables)?;

        tracing::debug!(volume = %name, count = count + 1, "Volume mounted");
        Ok(volume.mountpoint)
    }

    fn attach(&self, volume: &Volume) -> VolumeResult<()> {
        let name = volume.name.as_str();

        if self.gateway.is_mounted(&volume.mountpoint)? {
            tracing::warn!(
                volume = %name,
                mountpoint = %volume.mountpoint.display(),
                "Volume already mounted with no recorded users, reusing the mount"
            );
            return Ok(());
        }

        let vg = self.volume_group(volume)?;
        let keyfile = volume.keyfile.as_deref();

        let mut opened = None;
        if let Some(keyfile) = keyfile {
            policy::check_encryption(keyfile, &*self.gateway)?;
            let mapping = luks_mapping_name(name);
            if !self.gateway.mapping_open(&mapping) {
                self.gateway
                    .luks_open(&logical_device(&vg, name), &mapping, keyfile)
                    .map_err(device_error("opening encrypted volume"))?;
                opened = Some(mapping);
            }
        }

        let options = MountOptions {
            nouuid: self.is_snapshot(volume, &vg),
        };
        let device = effective_device(&vg, name, keyfile);
        if let Err(e) = self.gateway.mount(&device, &volume.mountpoint, options) {
            if let Some(mapping) = opened {
                if let Err(close) = self.gateway.luks_close(&mapping) {
                    tracing::error!(volume = %name, error = %close, "Failed to close encrypted mapping");
                }
            }
            return Err(device_error("mounting volume")(e));
        }

        tracing::info!(volume = %name, device = %device.display(), "Device mounted");
        Ok(())
    }

    /// Snapshots share their origin's filesystem UUID. Records from older
    /// tables may not say whether they are one, so ask the device too.
    fn is_snapshot(&self, volume: &Volume, vg: &str) -> bool {
        if volume.kind == VolumeKind::Snapshot {
            return true;
        }
        match self.gateway.inspect_lv(vg, &volume.name) {
            Ok(info) => info.snapshot,
            Err(e) => {
                tracing::warn!(
                    volume = %volume.name,
                    error = %e,
                    "Could not check whether volume is a snapshot, mounting without nouuid"
                );
                false
            }
        }
    }

    /// Release one user of a volume. The last user unmounts the device.
    ///
    /// # Errors
    ///
    /// Returns an error if the volume is unknown, the device cannot be
    /// unmounted (the count is left unchanged) or the metadata cannot be
    /// persisted.
    pub fn unmount(&self, name: &str) -> VolumeResult<()> {
        let mut tables = self.tables.write();

        let volume = tables
            .volumes
            .get(name)
            .cloned()
            .ok_or_else(|| VolumeError::VolumeNotFound {
                name: name.to_string(),
            })?;
        let count = tables.counts.get(name).copied().unwrap_or(0);

        match count {
            0 => {
                tracing::warn!(volume = %name, "Unmount of a volume with no recorded users, ignoring");
                return Ok(());
            }
            1 => self.detach(&volume)?,
            _ => {}
        }

        tables.counts.insert(name.to_string(), count - 1);
        self.persist(&tables)?;

        tracing::debug!(volume = %name, count = count - 1, "Volume unmounted");
        Ok(())
    }

    fn detach(&self, volume: &Volume) -> VolumeResult<()> {
        let name = volume.name.as_str();

        if self.gateway.is_mounted(&volume.mountpoint)? {
            self.gateway
                .unmount(&volume.mountpoint)
                .map_err(device_error("unmounting volume"))?;
            tracing::info!(volume = %name, "Device unmounted");
        } else {
            tracing::warn!(
                volume = %name,
                mountpoint = %volume.mountpoint.display(),
                "Volume was not mounted, skipping unmount"
            );
        }

        if volume.keyfile.is_some() {
            let mapping = luks_mapping_name(name);
            if self.gateway.mapping_open(&mapping) {
                if let Err(e) = self.gateway.luks_close(&mapping) {
                    tracing::error!(volume = %name, error = %e, "Failed to close encrypted mapping");
                }
            }
        }
        Ok(())
    }

    /// Mountpoint of a volume.
    ///
    /// # Errors
    ///
    /// Returns an error if the volume is unknown.
    pub fn path(&self, name: &str) -> VolumeResult<PathBuf> {
        self.tables
            .read()
            .volumes
            .get(name)
            .map(|v| v.mountpoint.clone())
            .ok_or_else(|| VolumeError::VolumeNotFound {
                name: name.to_string(),
            })
    }

    /// Describe a volume.
    ///
    /// # Errors
    ///
    /// Returns an error if the volume is unknown.
    pub fn get(&self, name: &str) -> VolumeResult<VolumeInfo> {
        let tables = self.tables.read();
        tables
            .volumes
            .get(name)
            .map(|v| self.describe(v))
            .ok_or_else(|| VolumeError::VolumeNotFound {
                name: name.to_string(),
            })
    }

    /// Describe every volume, ordered by name.
    #[must_use]
    pub fn list(&self) -> Vec<VolumeInfo> {
        let tables = self.tables.read();
        tables.volumes.values().map(|v| self.describe(v)).collect()
    }

    /// Mount reference count of a volume.
    #[must_use]
    pub fn mount_count(&self, name: &str) -> Option<u64> {
        self.tables.read().counts.get(name).copied()
    }

    /// Driver capabilities.
    #[must_use]
    pub const fn capabilities(&self) -> Capabilities {
        Capabilities {
            scope: Scope::Local,
        }
    }

    fn describe(&self, volume: &Volume) -> VolumeInfo {
        let created_at = self
            .volume_group(volume)
            .and_then(|vg| self.gateway.inspect_lv(&vg, &volume.name))
            .map_err(|e| {
                tracing::warn!(volume = %volume.name, error = %e, "Could not read volume creation time");
            })
            .ok()
            .and_then(|info| info.created);

        VolumeInfo {
            name: volume.name.clone(),
            mountpoint: volume.mountpoint.clone(),
            created_at,
        }
    }

    /// Volume group of a volume; records written without one use the
    /// configured group.
    fn volume_group(&self, volume: &Volume) -> VolumeResult<String> {
        if volume.vg.is_empty() {
            self.resolver.configured()
        } else {
            Ok(volume.vg.clone())
        }
    }

    fn persist(&self, tables: &Tables) -> VolumeResult<()> {
        self.store.save(&tables.volumes, &tables.counts)
    }
}
