//! LVM logical volume management.

use chrono::DateTime;
use lvmvol_common::VolumeResult;

use super::command::run;
use super::{LogicalVolumes, LvInfo, LvSpec, logical_device};

/// Timestamp layout of `LV Creation host, time`.
const CREATION_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S %z";

/// Logical volumes managed with `lvcreate`, `lvremove` and `lvdisplay`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Lvm;

impl Lvm {
    /// Arguments for `lvcreate`.
    fn create_args(vg: &str, name: &str, spec: &LvSpec) -> Vec<String> {
        let mut args = vec![
            "-n".to_string(),
            name.to_string(),
            "--setactivationskip".to_string(),
            "n".to_string(),
        ];

        match spec {
            LvSpec::Linear { size } => {
                args.extend(["--size".to_string(), size.lvm_arg(), vg.to_string()]);
            }
            LvSpec::Thin { virtual_size, pool } => {
                args.extend([
                    "--virtualsize".to_string(),
                    virtual_size.lvm_arg(),
                    "--thin".to_string(),
                    format!("{vg}/{pool}"),
                ]);
            }
            LvSpec::Snapshot { origin, size } => {
                args.push("--snapshot".to_string());
                if let Some(size) = size {
                    args.extend(["--size".to_string(), size.lvm_arg()]);
                }
                args.push(format!("{vg}/{origin}"));
            }
        }

        args
    }
}

impl LogicalVolumes for Lvm {
    fn create_lv(&self, vg: &str, name: &str, spec: &LvSpec) -> VolumeResult<()> {
        run("lvcreate", Self::create_args(vg, name, spec))?;
        tracing::debug!(vg, name, ?spec, "Logical volume created");
        Ok(())
    }

    fn remove_lv(&self, vg: &str, name: &str) -> VolumeResult<()> {
        run("lvremove", ["--force".to_string(), format!("{vg}/{name}")])?;
        tracing::debug!(vg, name, "Logical volume removed");
        Ok(())
    }

    fn inspect_lv(&self, vg: &str, name: &str) -> VolumeResult<LvInfo> {
        let output = run("lvdisplay", [logical_device(vg, name)])?;
        Ok(parse_lvdisplay(&output))
    }
}

/// Extract the fields the driver cares about from `lvdisplay` output.
///
/// Unparseable creation times are dropped rather than failing the whole
/// inspection.
#[must_use]
pub fn parse_lvdisplay(output: &str) -> LvInfo {
    let mut info = LvInfo::default();

    for line in output.lines().map(str::trim) {
        if line.starts_with("LV Pool") {
            info.thin = true;
        } else if line.starts_with("LV Thin origin") {
            info.snapshot = true;
        } else if let Some(status) = line.strip_prefix("LV snapshot status") {
            if status.contains("destination for") || status.contains("destination of") {
                info.snapshot = true;
            }
            if status.contains("source of") {
                info.origin = true;
            }
        } else if let Some(rest) = line.strip_prefix("LV Creation host, time") {
            let date = rest.rsplit(',').next().unwrap_or_default().trim();
            match DateTime::parse_from_str(date, CREATION_TIME_FORMAT) {
                Ok(created) => info.created = Some(created),
                Err(e) => tracing::warn!(date, error = %e, "Unparseable LV creation time"),
            }
        }
    }

    info
}
