//! # lvmvol
//!
//! LVM-backed volumes for container runtimes.
//!
//! The crate provides:
//! - A volume lifecycle manager with mount reference counting
//! - Plain, thin and snapshot volumes with optional LUKS encryption
//! - Rollback of partially created volumes
//! - JSON metadata persistence under the plugin home
//! - Volume plugin protocol payloads
//!
//! All host interaction goes through the [`device::DeviceGateway`] traits,
//! so the manager can run against the real LVM tools or in memory.

#![warn(missing_docs)]

pub mod config;
pub mod device;
pub mod manager;
pub mod plugin;
pub mod policy;
pub mod store;

pub use config::{DriverConfig, VolumeGroupResolver};
pub use device::{DeviceGateway, MemoryGateway, SystemGateway};
pub use manager::{Capabilities, Scope, VolumeDriver, VolumeInfo};
pub use store::{MetadataStore, Volume, VolumeKind};
