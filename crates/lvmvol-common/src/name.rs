//! Volume name validation.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{VolumeError, VolumeResult};

/// Prefixes LVM reserves for its own volumes.
const RESERVED_PREFIXES: &[&str] = &["snapshot", "pvmove"];

/// Substrings LVM reserves for hidden sub-volumes.
const RESERVED_SUBSTRINGS: &[&str] = &[
    "_cdata", "_cmeta", "_corig", "_mimage", "_mlog", "_pmspare", "_rimage", "_rmeta", "_tdata",
    "_tmeta", "_vorigin", "_vdata",
];

/// A validated volume name.
///
/// The name doubles as the logical volume name and as the last component
/// of the mountpoint, so it must:
/// - Be 1-127 characters long
/// - Contain only ASCII letters, digits, `+`, `_`, `.` and `-`
/// - Not start with `-`, and not be `.` or `..`
/// - Avoid the prefixes and substrings LVM reserves
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct VolumeName(String);

impl VolumeName {
    /// Maximum length of a volume name.
    pub const MAX_LENGTH: usize = 127;

    /// Create a new volume name, validating the format.
    ///
    /// # Errors
    ///
    /// Returns an error if the name format is invalid.
    pub fn new(name: impl Into<String>) -> VolumeResult<Self> {
        let name = name.into();
        Self::validate(&name)?;
        Ok(Self(name))
    }

    /// Get the name as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn validate(name: &str) -> VolumeResult<()> {
        let invalid = || VolumeError::InvalidName {
            name: name.to_string(),
        };

        if name.is_empty() || name.len() > Self::MAX_LENGTH {
            return Err(invalid());
        }
        if name == "." || name == ".." || name.starts_with('-') {
            return Err(invalid());
        }
        if !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '_' | '.' | '-'))
        {
            return Err(invalid());
        }
        if RESERVED_PREFIXES.iter().any(|p| name.starts_with(p))
            || RESERVED_SUBSTRINGS.iter().any(|s| name.contains(s))
        {
            return Err(invalid());
        }

        Ok(())
    }
}

impl fmt::Display for VolumeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for VolumeName {
    type Err = VolumeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for VolumeName {
    type Error = VolumeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<VolumeName> for String {
    fn from(name: VolumeName) -> Self {
        name.0
    }
}

impl AsRef<str> for VolumeName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
