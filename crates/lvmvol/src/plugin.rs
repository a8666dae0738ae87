//! Volume plugin protocol payloads.
//!
//! Field names follow the container runtime's capitalized JSON. A response
//! carries either its payload or `Err`, never both.

use std::collections::HashMap;
use std::path::Path;

use lvmvol_common::{VolumeError, VolumeResult};
use serde::{Deserialize, Serialize};

use crate::manager::{Capabilities, Scope, VolumeInfo};

/// Interface announced by `/Plugin.Activate`.
pub const VOLUME_DRIVER: &str = "VolumeDriver";

/// Request naming a volume, with create options.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Request {
    /// Volume name.
    #[serde(default)]
    pub name: String,
    /// Create options; `null` when none were given.
    #[serde(default)]
    pub opts: Option<HashMap<String, String>>,
}

/// Mount or unmount request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MountRequest {
    /// Volume name.
    #[serde(default)]
    pub name: String,
    /// Opaque caller identifier.
    #[serde(default, rename = "ID")]
    pub id: String,
}

/// Response to `/Plugin.Activate`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ActivateResponse {
    /// Implemented plugin interfaces.
    pub implements: Vec<&'static str>,
}

impl Default for ActivateResponse {
    fn default() -> Self {
        Self {
            implements: vec![VOLUME_DRIVER],
        }
    }
}

/// A volume in `Get` and `List` responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct VolumeEntry {
    /// Volume name.
    pub name: String,
    /// Mountpoint.
    pub mountpoint: String,
    /// RFC 3339 creation time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
}

impl From<VolumeInfo> for VolumeEntry {
    fn from(info: VolumeInfo) -> Self {
        Self {
            name: info.name,
            mountpoint: info.mountpoint.display().to_string(),
            created_at: info.created_at.map(|t| t.to_rfc3339()),
        }
    }
}

/// Capabilities payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Capability {
    /// Volume visibility.
    pub scope: Scope,
}

impl From<Capabilities> for Capability {
    fn from(caps: Capabilities) -> Self {
        Self { scope: caps.scope }
    }
}

/// Response to every `/VolumeDriver.*` call.
#[allow(missing_docs)]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Response {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mountpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume: Option<VolumeEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volumes: Option<Vec<VolumeEntry>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<Capability>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub err: Option<String>,
}

impl Response {
    /// Success with no payload.
    #[must_use]
    pub fn ok() -> Self {
        Self::default()
    }

    /// Failure carrying the error message.
    #[must_use]
    pub fn error(err: &VolumeError) -> Self {
        Self {
            err: Some(err.to_string()),
            ..Self::default()
        }
    }

    /// Success carrying a mountpoint.
    #[must_use]
    pub fn mountpoint(path: &Path) -> Self {
        Self {
            mountpoint: Some(path.display().to_string()),
            ..Self::default()
        }
    }

    /// Success carrying one volume.
    #[must_use]
    pub fn volume(info: VolumeInfo) -> Self {
        Self {
            volume: Some(info.into()),
            ..Self::default()
        }
    }

    /// Success carrying every volume.
    #[must_use]
    pub fn volumes(infos: Vec<VolumeInfo>) -> Self {
        Self {
            volumes: Some(infos.into_iter().map(Into::into).collect()),
            ..Self::default()
        }
    }

    /// Success carrying the driver capabilities.
    #[must_use]
    pub fn capabilities(caps: Capabilities) -> Self {
        Self {
            capabilities: Some(caps.into()),
            ..Self::default()
        }
    }

    /// Build a response from an operation result.
    pub fn from_result<T>(result: VolumeResult<T>, payload: impl FnOnce(T) -> Self) -> Self {
        match result {
            Ok(value) => payload(value),
            Err(e) => Self::error(&e),
        }
    }
}
