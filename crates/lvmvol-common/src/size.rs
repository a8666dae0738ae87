//! Volume size parsing and representation.
//!
//! Accepts the size strings `lvcreate --size` understands:
//! - "20M", "20m" -> 20 MiB (LVM units are binary in either case)
//! - "1.5G" -> 1.5 GiB
//! - "2048s" -> 2048 512-byte sectors
//! - "512" -> 512 MiB (no unit means megabytes)

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{VolumeError, VolumeResult};

const KIB: u64 = 1024;
const MIB: u64 = 1024 * KIB;
const GIB: u64 = 1024 * MIB;
const TIB: u64 = 1024 * GIB;
const PIB: u64 = 1024 * TIB;
const EIB: u64 = 1024 * PIB;

/// Smallest logical volume the plugin will allocate.
pub const MIN_VOLUME_SIZE: VolumeSize = VolumeSize::mebibytes(16);

/// A volume size in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VolumeSize(u64);

impl VolumeSize {
    /// Create a size from bytes.
    #[must_use]
    pub const fn bytes(bytes: u64) -> Self {
        Self(bytes)
    }

    /// Create a size from mebibytes (MiB).
    #[must_use]
    pub const fn mebibytes(mib: u64) -> Self {
        Self(mib * MIB)
    }

    /// Create a size from gibibytes (GiB).
    #[must_use]
    pub const fn gibibytes(gib: u64) -> Self {
        Self(gib * GIB)
    }

    /// Size in bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> u64 {
        self.0
    }

    /// Argument form for `lvcreate --size` / `--virtualsize`.
    #[must_use]
    pub fn lvm_arg(&self) -> String {
        format!("{}b", self.0)
    }

    /// Parse an LVM size string.
    ///
    /// # Errors
    ///
    /// Returns [`VolumeError::InvalidSize`] for malformed input or sizes
    /// that overflow 64 bits.
    pub fn parse(s: &str) -> VolumeResult<Self> {
        let s = s.trim();
        let invalid = || VolumeError::InvalidSize {
            value: s.to_string(),
        };

        let split = s
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .unwrap_or(s.len());
        let (number, unit) = s.split_at(split);
        if number.is_empty() {
            return Err(invalid());
        }

        let multiplier = match unit {
            "b" | "B" => 1,
            "s" | "S" => 512,
            "k" | "K" => KIB,
            "" | "m" | "M" => MIB,
            "g" | "G" => GIB,
            "t" | "T" => TIB,
            "p" | "P" => PIB,
            "e" | "E" => EIB,
            _ => return Err(invalid()),
        };

        if number.contains('.') {
            let value: f64 = number.parse().map_err(|_| invalid())?;
            return scale_fraction(value, multiplier).map(Self).ok_or_else(invalid);
        }

        let value: u64 = number.parse().map_err(|_| invalid())?;
        value
            .checked_mul(multiplier)
            .map(Self)
            .ok_or_else(invalid)
    }

    /// Reject sizes below [`MIN_VOLUME_SIZE`].
    ///
    /// # Errors
    ///
    /// Returns [`VolumeError::SizeTooSmall`] naming the original input.
    pub fn ensure_minimum(self, original: &str) -> VolumeResult<Self> {
        if self < MIN_VOLUME_SIZE {
            return Err(VolumeError::SizeTooSmall {
                value: original.trim().to_string(),
                minimum: MIN_VOLUME_SIZE.to_string(),
            });
        }
        Ok(self)
    }
}

#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
fn scale_fraction(value: f64, multiplier: u64) -> Option<u64> {
    let bytes = (value * multiplier as f64).ceil();
    if !bytes.is_finite() || bytes < 0.0 || bytes >= u64::MAX as f64 {
        return None;
    }
    Some(bytes as u64)
}

impl fmt::Display for VolumeSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (unit, scale) in [("TiB", TIB), ("GiB", GIB), ("MiB", MIB), ("KiB", KIB)] {
            if self.0 >= scale && self.0 % scale == 0 {
                return write!(f, "{}{unit}", self.0 / scale);
            }
        }
        write!(f, "{}B", self.0)
    }
}

impl FromStr for VolumeSize {
    type Err = VolumeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn parse_binary_units() {
        assert_eq!(VolumeSize::parse("20M").unwrap(), VolumeSize::mebibytes(20));
        assert_eq!(VolumeSize::parse("20m").unwrap(), VolumeSize::mebibytes(20));
        assert_eq!(VolumeSize::parse("1G").unwrap(), VolumeSize::gibibytes(1));
        assert_eq!(VolumeSize::parse("4k").unwrap().as_bytes(), 4096);
        assert_eq!(VolumeSize::parse("1t").unwrap().as_bytes(), TIB);
    }

    #[test]
    fn parse_sectors_and_bytes() {
        assert_eq!(VolumeSize::parse("2048s").unwrap(), VolumeSize::mebibytes(1));
        assert_eq!(VolumeSize::parse("4096b").unwrap().as_bytes(), 4096);
    }

    #[test]
    fn bare_number_is_megabytes() {
        assert_eq!(VolumeSize::parse("512").unwrap(), VolumeSize::mebibytes(512));
        assert_eq!(VolumeSize::parse(" 64 ").unwrap(), VolumeSize::mebibytes(64));
    }

    #[test]
    fn parse_fractional() {
        assert_eq!(
            VolumeSize::parse("1.5g").unwrap(),
            VolumeSize::mebibytes(1536)
        );
        assert_eq!(VolumeSize::parse("0.5M").unwrap().as_bytes(), MIB / 2);
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(VolumeSize::parse("").is_err());
        assert!(VolumeSize::parse("M").is_err());
        assert!(VolumeSize::parse("20MB").is_err());
        assert!(VolumeSize::parse("20x").is_err());
        assert!(VolumeSize::parse("-20M").is_err());
        assert!(VolumeSize::parse("1.2.3G").is_err());
        assert!(VolumeSize::parse("99999999999E").is_err());
    }

    #[test]
    fn minimum_size() {
        assert!(VolumeSize::parse("16M").unwrap().ensure_minimum("16M").is_ok());
        assert!(VolumeSize::parse("20M").unwrap().ensure_minimum("20M").is_ok());

        let err = VolumeSize::parse("15M")
            .unwrap()
            .ensure_minimum("15M")
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "volume size 15M is below the minimum of 16MiB"
        );
    }

    #[test]
    fn display_size() {
        assert_eq!(VolumeSize::gibibytes(2).to_string(), "2GiB");
        assert_eq!(VolumeSize::mebibytes(20).to_string(), "20MiB");
        assert_eq!(VolumeSize::mebibytes(1536).to_string(), "1536MiB");
        assert_eq!(VolumeSize::bytes(1024).to_string(), "1KiB");
        assert_eq!(VolumeSize::bytes(500).to_string(), "500B");
    }

    #[test]
    fn lvm_arg_is_bytes() {
        assert_eq!(VolumeSize::mebibytes(20).lvm_arg(), "20971520b");
    }

    proptest! {
        #[test]
        fn megabyte_strings_scale(n in 0u64..1_000_000) {
            prop_assert_eq!(VolumeSize::parse(&format!("{n}M")).unwrap(), VolumeSize::mebibytes(n));
            prop_assert_eq!(VolumeSize::parse(&format!("{n}")).unwrap(), VolumeSize::mebibytes(n));
        }
    }
}
