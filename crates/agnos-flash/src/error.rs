//! Error types for flashing operations
//!
//! [`ErrorKind`] is the flat taxonomy surfaced to callers. Every other type in
//! this module belongs to a collaborator seam and is mapped onto exactly one
//! [`ErrorKind`] by the stage that observes it.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure reported to the caller of a flashing run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Host lacks USB access or another required capability
    RequirementsNotMet,
    /// The image source ran out of local storage
    StorageSpace,
    /// Storage geometry or capacity did not match a supported device
    UnrecognizedDevice,
    /// The device stopped answering during connect or info read
    LostConnection,
    /// A partition table repair failed
    RepairPartitionTablesFailed,
    /// Erasing a logical unit failed or the layout was unexpected
    EraseFailed,
    /// Writing a system image failed
    FlashSystemFailed,
    /// Activating the boot slot failed
    FinalizingFailed,
    /// Manifest load failure or any unclassified error
    Unknown,
}

impl ErrorKind {
    /// Numeric code, stable across releases.
    pub fn code(self) -> i8 {
        match self {
            ErrorKind::Unknown => -1,
            ErrorKind::RequirementsNotMet => 1,
            ErrorKind::StorageSpace => 2,
            ErrorKind::UnrecognizedDevice => 3,
            ErrorKind::LostConnection => 4,
            ErrorKind::RepairPartitionTablesFailed => 5,
            ErrorKind::EraseFailed => 6,
            ErrorKind::FlashSystemFailed => 7,
            ErrorKind::FinalizingFailed => 8,
        }
    }

    /// Human-readable explanation suitable for an end user.
    pub fn description(self) -> &'static str {
        match self {
            ErrorKind::RequirementsNotMet => {
                "This host cannot access USB devices. Check permissions and drivers."
            }
            ErrorKind::StorageSpace => "Not enough local storage space to hold the images.",
            ErrorKind::UnrecognizedDevice => {
                "The connected device was not recognized. Only supported devices can be flashed."
            }
            ErrorKind::LostConnection => {
                "The connection to the device was lost. Unplug it and try again."
            }
            ErrorKind::RepairPartitionTablesFailed => "Repairing the partition tables failed.",
            ErrorKind::EraseFailed => "Erasing the device failed.",
            ErrorKind::FlashSystemFailed => "Flashing the system images failed.",
            ErrorKind::FinalizingFailed => "Activating the new system failed.",
            ErrorKind::Unknown => "An unexpected error occurred.",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::RequirementsNotMet => "requirements not met",
            ErrorKind::StorageSpace => "storage space",
            ErrorKind::UnrecognizedDevice => "unrecognized device",
            ErrorKind::LostConnection => "lost connection",
            ErrorKind::RepairPartitionTablesFailed => "repair partition tables failed",
            ErrorKind::EraseFailed => "erase failed",
            ErrorKind::FlashSystemFailed => "flash system failed",
            ErrorKind::FinalizingFailed => "finalizing failed",
            ErrorKind::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Device rejected by the storage classifier
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClassifyError {
    /// Fixed geometry parameters do not match the supported family
    #[error(
        "UFS chip parameters mismatch: block_size={block_size}, page_size={page_size}, \
         num_physical={num_physical}, mem_type={mem_type}"
    )]
    GeometryMismatch {
        /// Reported block size in bytes
        block_size: u32,
        /// Reported page size in bytes
        page_size: u32,
        /// Reported logical unit count
        num_physical: u32,
        /// Reported memory type
        mem_type: String,
    },

    /// Geometry is fine but the capacity matches no known variant
    #[error("Could not identify UFS chip with {total_blocks} blocks")]
    UnrecognizedDevice {
        /// Reported block count
        total_blocks: u64,
    },
}

/// Errors raised by a device transport
#[derive(Error, Debug)]
pub enum TransportError {
    /// Operation attempted before a successful connect
    #[error("Device not connected")]
    NotConnected,

    /// Device went away mid-operation
    #[error("Device disconnected: {0}")]
    Disconnected(String),

    /// Device did not answer in time
    #[error("Device timeout during {operation} after {timeout_ms}ms")]
    Timeout {
        /// Operation that timed out
        operation: String,
        /// Timeout in milliseconds
        timeout_ms: u64,
    },

    /// Device answered with something the protocol does not allow
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// I/O error on the underlying channel
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised while acquiring a USB handle
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UsbAccessError {
    /// No matching device is attached
    #[error("No device in download mode found")]
    NoDevice,

    /// The user or the OS refused access
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// The selection prompt was dismissed
    #[error("Device selection cancelled")]
    Cancelled,

    /// The host has no usable USB backend
    #[error("USB access is not supported on this host")]
    Unsupported,
}

/// Errors raised by an image source
#[derive(Error, Debug)]
pub enum ImageSourceError {
    /// Local storage cannot hold the images
    #[error("Not enough storage: {0}")]
    StorageSpace(String),

    /// The image is not available from this source
    #[error("Image not found: {0}")]
    NotFound(String),

    /// The image content does not match the manifest hash
    #[error("Integrity check failed for {image}: expected {expected}, got {actual}")]
    Integrity {
        /// Image name
        image: String,
        /// Hash declared in the manifest
        expected: String,
        /// Hash of the data received
        actual: String,
    },

    /// Network failure while fetching an image
    #[error("Download failed: {0}")]
    Download(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised while fetching or validating a manifest
#[derive(Error, Debug)]
pub enum ManifestError {
    /// The manifest could not be fetched
    #[error("Manifest unavailable: {0}")]
    Unavailable(String),

    /// The manifest lists no images
    #[error("Manifest is empty")]
    Empty,

    /// The manifest failed structural validation
    #[error("Invalid manifest: {0}")]
    Invalid(String),
}

impl From<serde_json::Error> for ManifestError {
    fn from(e: serde_json::Error) -> Self {
        ManifestError::Invalid(e.to_string())
    }
}

/// Errors raised while loading configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Configuration file could not be read
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration could not be parsed
    #[error("Parse error: {0}")]
    Parse(String),

    /// Configuration parsed but is not usable
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl From<serde_json::Error> for ConfigError {
    fn from(e: serde_json::Error) -> Self {
        ConfigError::Parse(e.to_string())
    }
}

impl From<serde_yaml::Error> for ConfigError {
    fn from(e: serde_yaml::Error) -> Self {
        ConfigError::Parse(e.to_string())
    }
}
