// file: src/error.rs
// version: 3.0.0
// guid: 74ab6e3e-5b79-49b0-b445-3228869bf62c

use crate::iso::PlatformKind;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for the application
pub type Result<T> = std::result::Result<T, AutoInstallError>;

/// Broad failure families used to decide how a failure is presented
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Network trouble; the caller may retry the whole run
    TransientNetwork,
    /// Downloaded bytes did not match the published checksum
    IntegrityFailure,
    /// Malformed or unsupported ISO9660 / El Torito layout
    FormatFailure,
    /// Conflicting or invalid user configuration
    ConfigurationConflict,
    /// The rebuilt image does not fit the on-disk size fields
    CapacityFailure,
    /// Local filesystem failure (permissions, disk full, ...)
    Filesystem,
    /// The user stopped the run
    Interrupted,
    /// Anything we did not anticipate
    Unexpected,
}

/// Error types for the autoinstall ISO builder
#[derive(Error, Debug)]
pub enum AutoInstallError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("No entry for {filename} in checksum manifest {manifest_url}")]
    ManifestEntryMissing {
        filename: String,
        manifest_url: String,
    },

    #[error("Checksum mismatch for {}: expected {expected}, got {actual}", path.display())]
    ChecksumMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    #[error("Unsupported image layout: {0}")]
    UnsupportedImageLayout(String),

    #[error("File not found in image: {0}")]
    FileNotFound(String),

    #[error("File already exists in image: {0}")]
    FileExists(String),

    #[error("Invalid image path: {0}")]
    InvalidPath(String),

    #[error("No {0} boot entry in the El Torito catalog")]
    BootEntryNotFound(PlatformKind),

    #[error("Refusing to build an image with both MBR and EFI boot disabled")]
    NoBootEntryRemaining,

    #[error("Image layout needs {required} {unit} but at most {limit} are addressable")]
    LayoutOverflow {
        required: u64,
        limit: u64,
        /// What `required` and `limit` count
        unit: &'static str,
    },

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("YAML error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Build step out of order: {0}")]
    BuilderState(String),

    #[error("Interrupted before the image was complete")]
    Interrupted,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AutoInstallError {
    /// Classify the error into its failure family
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::HttpError(_) | Self::NetworkError(_) => ErrorKind::TransientNetwork,
            Self::ManifestEntryMissing { .. } | Self::ChecksumMismatch { .. } => {
                ErrorKind::IntegrityFailure
            }
            Self::UnsupportedImageLayout(_)
            | Self::FileNotFound(_)
            | Self::FileExists(_)
            | Self::InvalidPath(_)
            | Self::BootEntryNotFound(_) => ErrorKind::FormatFailure,
            Self::NoBootEntryRemaining
            | Self::ConfigError(_)
            | Self::ValidationError(_)
            | Self::YamlError(_) => ErrorKind::ConfigurationConflict,
            Self::LayoutOverflow { .. } => ErrorKind::CapacityFailure,
            Self::IoError(_) => ErrorKind::Filesystem,
            Self::Interrupted => ErrorKind::Interrupted,
            Self::SerializationError(_) | Self::BuilderState(_) | Self::Internal(_) => {
                ErrorKind::Unexpected
            }
        }
    }

    /// Whether this is an ordinary operational failure rather than a bug
    pub fn is_expected(&self) -> bool {
        self.kind() != ErrorKind::Unexpected
    }

    /// Create a new network error
    pub fn network(msg: impl Into<String>) -> Self {
        Self::NetworkError(msg.into())
    }

    /// Create a new unsupported layout error
    pub fn layout(msg: impl Into<String>) -> Self {
        Self::UnsupportedImageLayout(msg.into())
    }

    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::ConfigError(msg.into())
    }

    /// Create a new validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::ValidationError(msg.into())
    }

    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_mismatch_is_integrity_failure() {
        let err = AutoInstallError::ChecksumMismatch {
            path: PathBuf::from("/tmp/x.iso"),
            expected: "aa".to_string(),
            actual: "bb".to_string(),
        };
        assert_eq!(err.kind(), ErrorKind::IntegrityFailure);
        assert!(err.is_expected());
        assert!(err.to_string().contains("/tmp/x.iso"));
    }

    #[test]
    fn test_internal_errors_are_unexpected() {
        let err = AutoInstallError::internal("allocator lost a directory");
        assert_eq!(err.kind(), ErrorKind::Unexpected);
        assert!(!err.is_expected());
    }

    #[test]
    fn test_conflict_and_capacity_kinds() {
        assert_eq!(
            AutoInstallError::NoBootEntryRemaining.kind(),
            ErrorKind::ConfigurationConflict
        );
        let overflow = AutoInstallError::LayoutOverflow {
            required: 1 << 33,
            limit: u32::MAX as u64,
            unit: "bytes in one file",
        };
        assert_eq!(overflow.kind(), ErrorKind::CapacityFailure);
        assert_eq!(
            overflow.to_string(),
            "Image layout needs 8589934592 bytes in one file but at most 4294967295 are addressable"
        );
        assert!(AutoInstallError::Interrupted.is_expected());
    }

    #[test]
    fn test_boot_entry_not_found_message() {
        let err = AutoInstallError::BootEntryNotFound(PlatformKind::Uefi);
        assert_eq!(err.to_string(), "No UEFI boot entry in the El Torito catalog");
    }
}
