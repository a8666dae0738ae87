//! Common error types for the lvmvol plugin.

use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

/// Result type alias using [`VolumeError`].
pub type VolumeResult<T> = Result<T, VolumeError>;

/// Broad classes of failure, used to pick a log level and to decide
/// whether the on-disk state may have diverged from memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Bad, missing or contradictory request options. No device touched.
    Validation,
    /// Something the request depends on is absent or still referenced.
    Dependency,
    /// An external tool or syscall failed.
    External,
    /// Metadata could not be written; memory and disk have diverged.
    Persistence,
    /// Anything else.
    Internal,
}

/// Errors raised across the lvmvol crates.
#[derive(Error, Diagnostic, Debug)]
pub enum VolumeError {
    /// Volume not found.
    #[error("no such volume: {name}")]
    #[diagnostic(code(lvmvol::volume::not_found))]
    VolumeNotFound {
        /// The volume name that was not found.
        name: String,
    },

    /// Volume is still mounted.
    #[error("volume {name} is in use, unmount it before removing")]
    #[diagnostic(code(lvmvol::volume::in_use))]
    InUse {
        /// The mounted volume.
        name: String,
    },

    /// Invalid volume name.
    #[error("invalid volume name: {name}")]
    #[diagnostic(
        code(lvmvol::volume::invalid_name),
        help("Volume names may contain letters, digits and '+', '_', '.', '-', must not start with '-' and are limited to 127 characters")
    )]
    InvalidName {
        /// The rejected name.
        name: String,
    },

    /// Invalid or contradictory create options.
    #[error("{message}")]
    #[diagnostic(code(lvmvol::options::invalid))]
    InvalidOption {
        /// Human-readable reason.
        message: String,
    },

    /// Size string could not be parsed.
    #[error("invalid volume size: {value}")]
    #[diagnostic(
        code(lvmvol::size::invalid),
        help("Use LVM size units like '20M', '1.5g', '10G'; a bare number is taken as megabytes")
    )]
    InvalidSize {
        /// The invalid value.
        value: String,
    },

    /// Size parsed but is below the allocation floor.
    #[error("volume size {value} is below the minimum of {minimum}")]
    #[diagnostic(code(lvmvol::size::too_small))]
    SizeTooSmall {
        /// The requested size as given.
        value: String,
        /// The minimum accepted size.
        minimum: String,
    },

    /// Snapshot source is not a known volume.
    #[error("snapshot source volume does not exist: {source_name}")]
    #[diagnostic(code(lvmvol::snapshot::source_not_found))]
    SnapshotSourceNotFound {
        /// The missing source volume.
        source_name: String,
    },

    /// Volume still has snapshots depending on it.
    #[error(
        "error removing volume {name}, all snapshot destinations must be removed before removing a volume"
    )]
    #[diagnostic(code(lvmvol::snapshot::has_dependents))]
    HasSnapshots {
        /// The origin volume.
        name: String,
    },

    /// Encryption key file is missing.
    #[error("key file does not exist: {}", path.display())]
    #[diagnostic(code(lvmvol::crypt::keyfile_missing))]
    KeyFileNotFound {
        /// The configured key file.
        path: PathBuf,
    },

    /// The encryption tool is not installed.
    #[error("'cryptsetup' executable not found")]
    #[diagnostic(
        code(lvmvol::crypt::unavailable),
        help("Install cryptsetup to use encrypted volumes")
    )]
    EncryptionUnavailable,

    /// An external command exited unsuccessfully.
    #[error("{program} failed: {detail}")]
    #[diagnostic(code(lvmvol::command))]
    Command {
        /// The program that was run.
        program: String,
        /// Exit status or spawn error.
        detail: String,
    },

    /// A device step failed; the caller-facing, sanitized form of [`VolumeError::Command`].
    #[error("error {action}")]
    #[diagnostic(code(lvmvol::device))]
    Device {
        /// What the driver was doing, e.g. "creating volume".
        action: &'static str,
    },

    /// Volume metadata could not be persisted.
    #[error("failed to persist volume metadata: {message}")]
    #[diagnostic(
        code(lvmvol::metadata::persist),
        help("The in-memory volume table is ahead of the metadata on disk; fix the underlying I/O problem before restarting the plugin")
    )]
    Persistence {
        /// The underlying failure.
        message: String,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    #[diagnostic(code(lvmvol::io))]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    #[diagnostic(code(lvmvol::serialization))]
    Serialization(String),

    /// Feature not supported on this platform.
    #[error("Feature not supported: {feature}")]
    #[diagnostic(code(lvmvol::unsupported), help("lvmvol requires Linux"))]
    Unsupported {
        /// The unsupported feature.
        feature: String,
    },

    /// Configuration error.
    #[error("{message}")]
    #[diagnostic(code(lvmvol::config))]
    Config {
        /// The error message.
        message: String,
    },

    /// Internal error (should not happen).
    #[error("Internal error: {message}")]
    #[diagnostic(code(lvmvol::internal))]
    Internal {
        /// The error message.
        message: String,
    },
}

impl VolumeError {
    /// Shorthand for [`VolumeError::InvalidOption`].
    pub fn invalid_option(message: impl Into<String>) -> Self {
        Self::InvalidOption {
            message: message.into(),
        }
    }

    /// Classify this error.
    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        match self {
            Self::InvalidName { .. }
            | Self::InvalidOption { .. }
            | Self::InvalidSize { .. }
            | Self::SizeTooSmall { .. } => ErrorCategory::Validation,
            Self::VolumeNotFound { .. }
            | Self::InUse { .. }
            | Self::SnapshotSourceNotFound { .. }
            | Self::HasSnapshots { .. }
            | Self::KeyFileNotFound { .. }
            | Self::EncryptionUnavailable
            | Self::Config { .. } => ErrorCategory::Dependency,
            Self::Command { .. } | Self::Device { .. } | Self::Unsupported { .. } => {
                ErrorCategory::External
            }
            Self::Persistence { .. } => ErrorCategory::Persistence,
            Self::Io(_) | Self::Serialization(_) | Self::Internal { .. } => {
                ErrorCategory::Internal
            }
        }
    }
}

impl From<serde_json::Error> for VolumeError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
