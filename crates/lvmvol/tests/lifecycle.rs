//! Integration tests for the volume lifecycle against the in-memory gateway.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use lvmvol::device::{MemoryGateway, Step, luks_device};
use lvmvol::{DriverConfig, MetadataStore, VolumeDriver};
use lvmvol_common::{ErrorCategory, VolumeError};
use proptest::prelude::*;
use tempfile::{NamedTempFile, TempDir};

struct Harness {
    home: TempDir,
    _vg_config: NamedTempFile,
    config: DriverConfig,
    gateway: Arc<MemoryGateway>,
    driver: VolumeDriver,
}

impl Harness {
    fn new() -> Self {
        let home = TempDir::new().unwrap();
        let mut vg_config = NamedTempFile::new().unwrap();
        writeln!(vg_config, "# volume group for tests\nVOLUME_GROUP=vg0").unwrap();

        let config = DriverConfig::default()
            .with_home(home.path())
            .with_vg_config(vg_config.path());
        let gateway = Arc::new(MemoryGateway::new());
        let driver = VolumeDriver::open(&config, gateway.clone()).unwrap();

        Self {
            home,
            _vg_config: vg_config,
            config,
            gateway,
            driver,
        }
    }

    /// Simulate a plugin restart on the same host.
    fn reopen(&self) -> VolumeDriver {
        VolumeDriver::open(&self.config, self.gateway.clone()).unwrap()
    }

    fn mountpoint(&self, name: &str) -> PathBuf {
        self.home.path().join(name)
    }

    fn persisted_names(&self) -> (Vec<String>, Vec<String>) {
        let (volumes, counts) = MetadataStore::new(&self.config.paths).load().unwrap();
        (
            volumes.into_keys().collect(),
            counts.into_keys().collect(),
        )
    }
}

fn opts(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
        .collect()
}

#[test]
fn create_then_get() {
    let h = Harness::new();
    let mountpoint = h.driver.create("v1", &opts(&[("size", "20M")])).unwrap();
    assert_eq!(mountpoint, h.mountpoint("v1"));
    assert!(mountpoint.is_dir());

    let info = h.driver.get("v1").unwrap();
    assert_eq!(info.name, "v1");
    assert_eq!(info.mountpoint, h.home.path().join("v1"));
    assert!(info.created_at.is_some());
    assert_eq!(h.driver.path("v1").unwrap(), h.mountpoint("v1"));
    assert_eq!(h.driver.mount_count("v1"), Some(0));

    assert!(h.gateway.has_lv("vg0", "v1"));
    assert!(h.gateway.has_filesystem(Path::new("/dev/vg0/v1")));
}

#[test]
fn create_is_idempotent_by_name() {
    let h = Harness::new();
    let first = h.driver.create("v1", &opts(&[("size", "20M")])).unwrap();
    let second = h
        .driver
        .create("v1", &opts(&[("size", "1G"), ("thinpool", "pool0")]))
        .unwrap();
    assert_eq!(first, second);
    assert_eq!(h.gateway.lv_count(), 1);
}

#[test]
fn list_is_ordered_by_name() {
    let h = Harness::new();
    for name in ["v2", "v1", "v3"] {
        h.driver.create(name, &opts(&[("size", "20M")])).unwrap();
    }
    let names: Vec<_> = h.driver.list().into_iter().map(|v| v.name).collect();
    assert_eq!(names, ["v1", "v2", "v3"]);
}

#[test]
fn thick_snapshot_needs_size() {
    let h = Harness::new();
    h.driver.create("v1", &opts(&[("size", "20M")])).unwrap();

    let err = h
        .driver
        .create("snap1", &opts(&[("snapshot", "v1")]))
        .unwrap_err();
    assert_eq!(err.to_string(), "Please specify a size with --size");
    assert!(!h.gateway.has_lv("vg0", "snap1"));

    h.driver
        .create("snap1", &opts(&[("snapshot", "v1"), ("size", "20M")]))
        .unwrap();
    assert!(h.gateway.has_lv("vg0", "snap1"));
}

#[test]
fn thin_snapshot_takes_no_size() {
    let h = Harness::new();
    h.driver
        .create("v1", &opts(&[("size", "1G"), ("thinpool", "pool0")]))
        .unwrap();

    let err = h
        .driver
        .create("snap1", &opts(&[("snapshot", "v1"), ("size", "20M")]))
        .unwrap_err();
    assert_eq!(err.to_string(), "don't specify size for thin snapshots");
    assert_eq!(err.category(), ErrorCategory::Validation);

    h.driver
        .create("snap1", &opts(&[("snapshot", "v1")]))
        .unwrap();
    assert!(h.gateway.has_lv("vg0", "snap1"));
}

#[test]
fn snapshot_inspection_failure_assumes_thick() {
    let h = Harness::new();
    h.driver
        .create("v1", &opts(&[("size", "1G"), ("thinpool", "pool0")]))
        .unwrap();

    h.gateway.fail(Step::InspectLv);
    let err = h
        .driver
        .create("snap1", &opts(&[("snapshot", "v1")]))
        .unwrap_err();
    assert_eq!(err.to_string(), "Please specify a size with --size");
}

#[test]
fn remove_waits_for_snapshots() {
    let h = Harness::new();
    h.driver.create("v1", &opts(&[("size", "20M")])).unwrap();
    h.driver
        .create("snap1", &opts(&[("snapshot", "v1"), ("size", "20M")]))
        .unwrap();

    let err = h.driver.remove("v1").unwrap_err();
    assert!(matches!(err, VolumeError::HasSnapshots { .. }));
    assert!(h.gateway.has_lv("vg0", "v1"));

    h.driver.remove("snap1").unwrap();
    h.driver.remove("v1").unwrap();

    assert_eq!(h.gateway.lv_count(), 0);
    assert!(!h.mountpoint("v1").exists());
    assert!(h.driver.list().is_empty());
    assert_eq!(h.persisted_names(), (vec![], vec![]));
}

#[test]
fn remove_checks_device_for_snapshots() {
    let h = Harness::new();
    h.driver.create("v1", &opts(&[("size", "20M")])).unwrap();

    // Snapshot made outside the plugin.
    use lvmvol::device::{LogicalVolumes, LvSpec};
    h.gateway
        .create_lv(
            "vg0",
            "manual",
            &LvSpec::Snapshot {
                origin: "v1".to_string(),
                size: Some(lvmvol_common::VolumeSize::mebibytes(20)),
            },
        )
        .unwrap();

    assert!(matches!(
        h.driver.remove("v1"),
        Err(VolumeError::HasSnapshots { .. })
    ));

    h.gateway.fail(Step::InspectLv);
    let err = h.driver.remove("v1").unwrap_err();
    assert_eq!(
        err.to_string(),
        "error removing volume, unable to determine if volume is a snapshot origin"
    );
    assert!(h.driver.get("v1").is_ok());
}

#[test]
fn remove_refuses_mounted_volume_after_count_loss() {
    let h = Harness::new();
    h.driver.create("v1", &opts(&[("size", "20M")])).unwrap();
    h.driver.mount("v1").unwrap();
    let data = h.mountpoint("v1").join("data.txt");
    std::fs::write(&data, b"keep me").unwrap();

    std::fs::remove_file(h.config.paths.counts_file()).unwrap();
    let restarted = h.reopen();
    assert_eq!(restarted.mount_count("v1"), Some(0));

    let err = restarted.remove("v1").unwrap_err();
    assert!(matches!(err, VolumeError::InUse { .. }));
    assert!(data.exists());
    assert!(h.gateway.has_lv("vg0", "v1"));
    assert!(h.gateway.mounted(&h.mountpoint("v1")).is_some());
    assert!(restarted.get("v1").is_ok());
}

#[test]
fn remove_after_last_unmount() {
    let h = Harness::new();
    h.driver.create("v1", &opts(&[("size", "20M")])).unwrap();
    h.driver.mount("v1").unwrap();
    h.driver.unmount("v1").unwrap();
    h.driver.remove("v1").unwrap();
    assert!(!h.gateway.has_lv("vg0", "v1"));
    assert!(!h.mountpoint("v1").exists());
}

#[test_log::test]
fn failed_create_leaves_nothing_behind() {
    for step in [Step::CreateLv, Step::MakeFilesystem, Step::CreateDir] {
        let h = Harness::new();
        h.gateway.fail(step);

        let err = h
            .driver
            .create("v1", &opts(&[("size", "20M")]))
            .unwrap_err();
        assert_eq!(err.category(), ErrorCategory::External, "{step:?}: {err}");
        assert_eq!(h.gateway.lv_count(), 0, "{step:?}");
        assert!(!h.mountpoint("v1").exists(), "{step:?}");
        assert_eq!(h.persisted_names(), (vec![], vec![]), "{step:?}");
        assert!(h.driver.get("v1").is_err(), "{step:?}");
    }
}

#[test_log::test]
fn failed_encrypted_create_closes_mapping() {
    for step in [Step::LuksFormat, Step::LuksOpen, Step::MakeFilesystem] {
        let h = Harness::new();
        let keyfile = NamedTempFile::new().unwrap();
        h.gateway.fail(step);

        let keyfile = keyfile.path().to_str().unwrap();
        assert!(
            h.driver
                .create("v1", &opts(&[("size", "20M"), ("keyfile", keyfile)]))
                .is_err()
        );
        assert_eq!(h.gateway.lv_count(), 0, "{step:?}");
        assert!(h.gateway.open_mappings().is_empty(), "{step:?}");
        assert_eq!(h.persisted_names(), (vec![], vec![]), "{step:?}");
    }
}

#[test]
fn failed_snapshot_create_leaves_nothing_behind() {
    let h = Harness::new();
    h.driver.create("v1", &opts(&[("size", "20M")])).unwrap();
    h.gateway.fail(Step::CreateDir);

    assert!(
        h.driver
            .create("snap1", &opts(&[("snapshot", "v1"), ("size", "20M")]))
            .is_err()
    );
    assert!(!h.gateway.has_lv("vg0", "snap1"));
    assert_eq!(h.persisted_names().0, ["v1"]);
}

#[test]
fn missing_keyfile_fails_before_allocation() {
    let h = Harness::new();
    let err = h
        .driver
        .create(
            "v1",
            &opts(&[("size", "20M"), ("keyfile", "/nonexistent/lvmvol.key")]),
        )
        .unwrap_err();
    assert!(matches!(err, VolumeError::KeyFileNotFound { .. }));
    assert_eq!(h.gateway.lv_count(), 0);
}

#[test]
fn missing_cryptsetup_fails_before_allocation() {
    let h = Harness::new();
    let keyfile = NamedTempFile::new().unwrap();
    h.gateway.set_encryption_available(false);

    let err = h
        .driver
        .create(
            "v1",
            &opts(&[("size", "20M"), ("keyfile", keyfile.path().to_str().unwrap())]),
        )
        .unwrap_err();
    assert_eq!(err.to_string(), "'cryptsetup' executable not found");
    assert_eq!(h.gateway.lv_count(), 0);
}

#[test]
fn encrypted_volume_lifecycle() {
    let h = Harness::new();
    let keyfile = NamedTempFile::new().unwrap();
    let keyfile_arg = keyfile.path().to_str().unwrap();

    h.driver
        .create("v1", &opts(&[("size", "20M"), ("keyfile", keyfile_arg)]))
        .unwrap();
    assert!(h.gateway.has_filesystem(&luks_device("v1")));
    assert!(h.gateway.open_mappings().is_empty());

    let mountpoint = h.driver.mount("v1").unwrap();
    assert_eq!(h.gateway.open_mappings(), ["luks-v1"]);
    let (device, options) = h.gateway.mounted(&mountpoint).unwrap();
    assert_eq!(device, luks_device("v1"));
    assert!(!options.nouuid);

    h.driver.unmount("v1").unwrap();
    assert!(h.gateway.mounted(&mountpoint).is_none());
    assert!(h.gateway.open_mappings().is_empty());
}

#[test]
fn snapshot_inherits_keyfile_and_mounts_nouuid() {
    let h = Harness::new();
    let keyfile = NamedTempFile::new().unwrap();
    h.driver
        .create(
            "v1",
            &opts(&[("size", "20M"), ("keyfile", keyfile.path().to_str().unwrap())]),
        )
        .unwrap();
    h.driver
        .create("snap1", &opts(&[("snapshot", "v1"), ("size", "20M")]))
        .unwrap();

    let mountpoint = h.driver.mount("snap1").unwrap();
    let (device, options) = h.gateway.mounted(&mountpoint).unwrap();
    assert_eq!(device, luks_device("snap1"));
    assert!(options.nouuid);
}

#[test]
fn failed_mount_keeps_count_and_closes_mapping() {
    let h = Harness::new();
    let keyfile = NamedTempFile::new().unwrap();
    h.driver
        .create(
            "v1",
            &opts(&[("size", "20M"), ("keyfile", keyfile.path().to_str().unwrap())]),
        )
        .unwrap();

    h.gateway.fail(Step::Mount);
    let err = h.driver.mount("v1").unwrap_err();
    assert_eq!(err.to_string(), "error mounting volume");
    assert_eq!(h.driver.mount_count("v1"), Some(0));
    assert!(h.gateway.open_mappings().is_empty());

    h.gateway.succeed(Step::Mount);
    h.driver.mount("v1").unwrap();
    assert_eq!(h.driver.mount_count("v1"), Some(1));
}

#[test]
fn failed_unmount_keeps_count() {
    let h = Harness::new();
    h.driver.create("v1", &opts(&[("size", "20M")])).unwrap();
    h.driver.mount("v1").unwrap();

    h.gateway.fail(Step::Unmount);
    let err = h.driver.unmount("v1").unwrap_err();
    assert_eq!(err.to_string(), "error unmounting volume");
    assert_eq!(h.driver.mount_count("v1"), Some(1));
    assert!(h.gateway.mounted(&h.mountpoint("v1")).is_some());

    h.gateway.succeed(Step::Unmount);
    h.driver.unmount("v1").unwrap();
    assert_eq!(h.driver.mount_count("v1"), Some(0));
}

#[test]
fn unmount_tolerates_external_unmount() {
    let h = Harness::new();
    h.driver.create("v1", &opts(&[("size", "20M")])).unwrap();
    h.driver.mount("v1").unwrap();

    h.gateway.unmount_externally(&h.mountpoint("v1"));
    h.driver.unmount("v1").unwrap();
    assert_eq!(h.driver.mount_count("v1"), Some(0));
    assert_eq!(h.gateway.unmount_calls(), 0);
}

#[test]
fn unmount_without_mount_is_ignored() {
    let h = Harness::new();
    h.driver.create("v1", &opts(&[("size", "20M")])).unwrap();
    h.driver.unmount("v1").unwrap();
    assert_eq!(h.driver.mount_count("v1"), Some(0));
    assert_eq!(h.gateway.unmount_calls(), 0);
}

#[test]
fn persistence_failure_is_reported() {
    let h = Harness::new();
    h.driver.create("v1", &opts(&[("size", "20M")])).unwrap();

    let home = h.home.path();
    std::fs::remove_dir_all(home).unwrap();
    std::fs::write(home, b"not a directory").unwrap();

    let err = h.driver.mount("v1").unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Persistence);

    std::fs::remove_file(home).unwrap();
    std::fs::create_dir(home).unwrap();
}

#[test]
fn restart_restores_tables() {
    let h = Harness::new();
    h.driver.create("v1", &opts(&[("size", "20M")])).unwrap();
    h.driver
        .create("snap1", &opts(&[("snapshot", "v1"), ("size", "20M")]))
        .unwrap();
    h.driver.mount("v1").unwrap();
    h.driver.mount("v1").unwrap();
    h.driver.mount("snap1").unwrap();

    let restarted = h.reopen();
    assert_eq!(restarted.list(), h.driver.list());
    assert_eq!(restarted.mount_count("v1"), Some(2));
    assert_eq!(restarted.mount_count("snap1"), Some(1));

    // The restarted driver still knows about the snapshot.
    assert!(matches!(
        restarted.remove("v1"),
        Err(VolumeError::HasSnapshots { .. })
    ));

    restarted.unmount("v1").unwrap();
    restarted.unmount("v1").unwrap();
    assert!(h.gateway.mounted(&h.mountpoint("v1")).is_none());
}

#[test]
fn legacy_snapshot_record_mounts_nouuid() {
    let h = Harness::new();
    h.driver.create("v1", &opts(&[("size", "20M")])).unwrap();

    // Snapshot made by an older plugin that did not record the kind.
    use lvmvol::device::{LogicalVolumes, LvSpec};
    h.gateway
        .create_lv(
            "vg0",
            "snap1",
            &LvSpec::Snapshot {
                origin: "v1".to_string(),
                size: Some(lvmvol_common::VolumeSize::mebibytes(20)),
            },
        )
        .unwrap();
    let snap_mountpoint = h.mountpoint("snap1");
    std::fs::create_dir(&snap_mountpoint).unwrap();
    let table = serde_json::json!({
        "v1": {"name": "v1", "mountpoint": h.mountpoint("v1")},
        "snap1": {"name": "snap1", "mountpoint": snap_mountpoint},
    });
    std::fs::write(h.config.paths.volumes_file(), table.to_string()).unwrap();

    let restarted = h.reopen();
    restarted.mount("snap1").unwrap();
    let (_, options) = h.gateway.mounted(&snap_mountpoint).unwrap();
    assert!(options.nouuid);

    restarted.mount("v1").unwrap();
    let (_, options) = h.gateway.mounted(&h.mountpoint("v1")).unwrap();
    assert!(!options.nouuid);
}

#[test]
fn snapshot_check_failure_falls_back_to_record() {
    let h = Harness::new();
    h.driver.create("v1", &opts(&[("size", "20M")])).unwrap();
    h.driver
        .create("snap1", &opts(&[("snapshot", "v1"), ("size", "20M")]))
        .unwrap();

    h.gateway.fail(Step::InspectLv);
    h.driver.mount("v1").unwrap();
    h.driver.mount("snap1").unwrap();
    assert!(!h.gateway.mounted(&h.mountpoint("v1")).unwrap().1.nouuid);
    assert!(h.gateway.mounted(&h.mountpoint("snap1")).unwrap().1.nouuid);
}

#[test]
fn small_size_on_thin_snapshot() {
    let h = Harness::new();
    h.driver
        .create("v1", &opts(&[("size", "1G"), ("thinpool", "pool0")]))
        .unwrap();
    h.driver.create("v2", &opts(&[("size", "20M")])).unwrap();

    let err = h
        .driver
        .create("snap1", &opts(&[("snapshot", "v1"), ("size", "4M")]))
        .unwrap_err();
    assert_eq!(err.to_string(), "don't specify size for thin snapshots");

    let err = h
        .driver
        .create("snap2", &opts(&[("snapshot", "v2"), ("size", "4M")]))
        .unwrap_err();
    assert!(matches!(err, VolumeError::SizeTooSmall { .. }));
    assert_eq!(h.gateway.lv_count(), 2);
}

#[test]
fn vg_override_beats_snapshot_source() {
    let h = Harness::new();
    h.driver.create("v1", &opts(&[("size", "20M")])).unwrap();
    // The memory gateway only snapshots within one group, so an override
    // pointing elsewhere reaches the device and fails there.
    let err = h
        .driver
        .create(
            "snap1",
            &opts(&[("snapshot", "v1"), ("size", "20M"), ("vg", "other")]),
        )
        .unwrap_err();
    assert_eq!(err.category(), ErrorCategory::External);
    assert!(!h.gateway.has_lv("vg0", "snap1"));
}

#[test]
fn concurrent_mounts_are_serialized() {
    const THREADS: usize = 8;
    const ROUNDS: usize = 20;

    let h = Harness::new();
    h.driver.create("v1", &opts(&[("size", "20M")])).unwrap();
    let driver = Arc::new(h.reopen());
    let gateway = &h.gateway;

    std::thread::scope(|scope| {
        for _ in 0..THREADS {
            let driver = Arc::clone(&driver);
            scope.spawn(move || {
                for round in 0..ROUNDS {
                    driver.mount("v1").unwrap();
                    assert!(gateway.outstanding_mounts() <= 1);
                    if round % 2 == 1 {
                        driver.unmount("v1").unwrap();
                        assert!(gateway.outstanding_mounts() <= 1);
                    }
                }
            });
        }
        let reader = Arc::clone(&driver);
        scope.spawn(move || {
            for _ in 0..ROUNDS {
                assert_eq!(reader.list().len(), 1);
                assert!(reader.get("v1").is_ok());
            }
        });
    });

    let expected = THREADS * ROUNDS - THREADS * (ROUNDS / 2);
    assert_eq!(driver.mount_count("v1"), Some(u64::try_from(expected).unwrap()));
    assert_eq!(h.gateway.mount_calls(), 1);
    assert_eq!(h.gateway.outstanding_mounts(), 1);

    for _ in 0..expected {
        driver.unmount("v1").unwrap();
    }
    assert_eq!(driver.mount_count("v1"), Some(0));
    assert_eq!(h.gateway.outstanding_mounts(), 0);
}

#[test]
fn concurrent_creates_allocate_once() {
    let h = Harness::new();
    let driver = Arc::new(h.reopen());

    let mountpoints: Vec<PathBuf> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let driver = Arc::clone(&driver);
                scope.spawn(move || driver.create("shared", &opts(&[("size", "20M")])).unwrap())
            })
            .collect();
        handles.into_iter().map(|handle| handle.join().unwrap()).collect()
    });

    assert!(mountpoints.iter().all(|m| *m == h.mountpoint("shared")));
    assert_eq!(h.gateway.lv_count(), 1);
    assert_eq!(driver.mount_count("shared"), Some(0));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn reference_counting(ops in prop::collection::vec(any::<bool>(), 1..40)) {
        let h = Harness::new();
        h.driver.create("v1", &opts(&[("size", "20M")])).unwrap();
        let mountpoint = h.mountpoint("v1");

        let mut expected = 0u64;
        let mut mounts = 0usize;
        for mount in ops {
            if mount {
                h.driver.mount("v1").unwrap();
                if expected == 0 {
                    mounts += 1;
                }
                expected += 1;
            } else {
                h.driver.unmount("v1").unwrap();
                expected = expected.saturating_sub(1);
            }

            prop_assert_eq!(h.driver.mount_count("v1"), Some(expected));
            prop_assert_eq!(h.gateway.mounted(&mountpoint).is_some(), expected > 0);
            prop_assert_eq!(h.gateway.mount_calls(), mounts);
            let outstanding = h.gateway.mount_calls() - h.gateway.unmount_calls();
            prop_assert!(outstanding <= 1);
        }
    }
}
