//! Create option validation and device derivation.
//!
//! Nothing here touches a device. [`CreateRequest::plan`] rejects every
//! contradictory combination of options up front so the lifecycle manager
//! only starts allocating once a request is known to be coherent.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use lvmvol_common::{VolumeError, VolumeResult, VolumeSize};

use crate::device::{Encryption, LvSpec, logical_device, luks_device};

/// Option keys accepted by `Create`.
pub const OPTION_KEYS: &[&str] = &["size", "snapshot", "thinpool", "keyfile", "vg"];

const SIZE_REQUIRED: &str = "Please specify a size with --size";

/// Create options as given by the caller. Empty values count as absent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CreateRequest {
    /// Requested size, unparsed.
    pub size: Option<String>,
    /// Source volume to snapshot.
    pub snapshot: Option<String>,
    /// Thin pool to allocate from.
    pub thinpool: Option<String>,
    /// Key file for an encrypted volume.
    pub keyfile: Option<PathBuf>,
    /// Volume group override.
    pub vg: Option<String>,
}

/// What a coherent create request will do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreatePlan {
    /// Fully allocated volume.
    Plain {
        /// Volume size.
        size: VolumeSize,
        /// Key file when encrypted.
        keyfile: Option<PathBuf>,
    },
    /// Thin volume inside a thin pool.
    Thin {
        /// Virtual size.
        virtual_size: VolumeSize,
        /// Thin pool name.
        pool: String,
        /// Key file when encrypted.
        keyfile: Option<PathBuf>,
    },
    /// Snapshot of an existing volume.
    Snapshot {
        /// Source volume.
        source: String,
        /// COW size, if one was given. Not yet checked against the
        /// minimum, see [`snapshot_spec`].
        size: Option<VolumeSize>,
    },
}

impl CreateRequest {
    /// Parse the raw option map.
    ///
    /// # Errors
    ///
    /// Returns a validation error for unknown keys.
    pub fn from_options(options: &HashMap<String, String>) -> VolumeResult<Self> {
        let mut unknown: Vec<&str> = options
            .keys()
            .map(String::as_str)
            .filter(|key| !OPTION_KEYS.contains(key))
            .collect();
        if !unknown.is_empty() {
            unknown.sort_unstable();
            return Err(VolumeError::invalid_option(format!(
                "unknown option: {}",
                unknown.join(", ")
            )));
        }

        let get = |key: &str| {
            options
                .get(key)
                .map(|value| value.trim())
                .filter(|value| !value.is_empty())
                .map(str::to_string)
        };

        Ok(Self {
            size: get("size"),
            snapshot: get("snapshot"),
            thinpool: get("thinpool"),
            keyfile: get("keyfile").map(PathBuf::from),
            vg: get("vg"),
        })
    }

    /// Classify the request and reject contradictory options.
    ///
    /// # Errors
    ///
    /// Returns a validation error if options conflict, a size is missing
    /// or a size is unparseable or too small.
    pub fn plan(&self) -> VolumeResult<CreatePlan> {
        let size = self.size.as_deref().map(VolumeSize::parse).transpose()?;

        if let Some(source) = &self.snapshot {
            if self.keyfile.is_some() {
                return Err(VolumeError::invalid_option(
                    "don't specify keyfile for snapshots, they use the key file of their source",
                ));
            }
            if self.thinpool.is_some() {
                return Err(VolumeError::invalid_option(
                    "don't specify thinpool for snapshots, they are allocated next to their source",
                ));
            }
            return Ok(CreatePlan::Snapshot {
                source: source.clone(),
                size,
            });
        }

        let size = match (size, self.size.as_deref()) {
            (Some(size), Some(raw)) => size.ensure_minimum(raw)?,
            _ => return Err(VolumeError::invalid_option(SIZE_REQUIRED)),
        };
        Ok(match &self.thinpool {
            Some(pool) => CreatePlan::Thin {
                virtual_size: size,
                pool: pool.clone(),
                keyfile: self.keyfile.clone(),
            },
            None => CreatePlan::Plain {
                size,
                keyfile: self.keyfile.clone(),
            },
        })
    }
}

impl CreatePlan {
    /// Key file of a plain or thin volume.
    #[must_use]
    pub fn keyfile(&self) -> Option<&Path> {
        match self {
            Self::Plain { keyfile, .. } | Self::Thin { keyfile, .. } => keyfile.as_deref(),
            Self::Snapshot { .. } => None,
        }
    }

    /// Allocation for a plain or thin volume; `None` for snapshots, see
    /// [`snapshot_spec`].
    #[must_use]
    pub fn lv_spec(&self) -> Option<LvSpec> {
        match self {
            Self::Plain { size, .. } => Some(LvSpec::Linear { size: *size }),
            Self::Thin {
                virtual_size, pool, ..
            } => Some(LvSpec::Thin {
                virtual_size: *virtual_size,
                pool: pool.clone(),
            }),
            Self::Snapshot { .. } => None,
        }
    }
}

/// Allocation for a snapshot once it is known whether the source is thin.
///
/// Thin sources get thin snapshots, which take no size. Anything else
/// needs a COW size of at least the volume minimum.
///
/// # Errors
///
/// Returns a validation error if a size is given for a thin source, or is
/// missing or too small for a thick one.
pub fn snapshot_spec(
    source: &str,
    size: Option<VolumeSize>,
    source_thin: bool,
) -> VolumeResult<LvSpec> {
    let size = match (size, source_thin) {
        (Some(_), true) => {
            return Err(VolumeError::invalid_option(
                "don't specify size for thin snapshots",
            ));
        }
        (None, false) => return Err(VolumeError::invalid_option(SIZE_REQUIRED)),
        (Some(size), false) => Some(size.ensure_minimum(&size.to_string())?),
        (None, true) => None,
    };
    Ok(LvSpec::Snapshot {
        origin: source.to_string(),
        size,
    })
}

/// Check that an encrypted volume can be set up with `keyfile`.
///
/// # Errors
///
/// Returns a dependency error if the key file is missing or the
/// encryption tool is not installed.
pub fn check_encryption<E>(keyfile: &Path, encryption: &E) -> VolumeResult<()>
where
    E: Encryption + ?Sized,
{
    if !keyfile.exists() {
        return Err(VolumeError::KeyFileNotFound {
            path: keyfile.to_path_buf(),
        });
    }
    if !encryption.encryption_available() {
        return Err(VolumeError::EncryptionUnavailable);
    }
    Ok(())
}

/// Device a volume's filesystem lives on: the encrypted mapping when the
/// volume has a key file, the raw logical volume otherwise.
#[must_use]
pub fn effective_device(vg: &str, name: &str, keyfile: Option<&Path>) -> PathBuf {
    match keyfile {
        Some(_) => luks_device(name),
        None => logical_device(vg, name),
    }
}
