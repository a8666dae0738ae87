//! # lvmvol-common
//!
//! Shared utilities and types for the lvmvol volume plugin.
//!
//! This crate provides common functionality used across all lvmvol crates:
//! - Volume name validation
//! - Standard filesystem paths
//! - LVM size parsing
//! - Common error types

#![warn(missing_docs)]

pub mod error;
pub mod name;
pub mod paths;
pub mod size;

pub use error::{ErrorCategory, VolumeError, VolumeResult};
pub use name::VolumeName;
pub use paths::LvmPaths;
pub use size::{MIN_VOLUME_SIZE, VolumeSize};
